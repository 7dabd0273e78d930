//! Wire codec for actor channels between processes (UNIX seqpacket).
//!
//! Every message travels as one fixed-size frame so the reader never has
//! to negotiate lengths. A frame is `MAX_MEMBERS` 64-bit members plus a
//! string buffer of 512 bytes per member (256 for the key, 256 for the
//! value; each is one size byte followed by up to 255 data bytes).
//!
//! A member is a plain IEEE-754 double unless its bit pattern is a
//! *signaling* NaN, in which case the mantissa smuggles a type tag (and,
//! for descriptor-carrying kinds, the slot index into the frame's
//! `SCM_RIGHTS` ancillary payload). Doubles that happen to be signaling
//! NaNs are quieted on encode, preserving the "double unless SNaN"
//! invariant.
//!
//! If `members[0]` is the nil tag the message is *flat*: a sole
//! non-composite value stored at `members[1]` (`members[1]` also nil
//! means an empty map). Otherwise the message is a map keyed by the
//! strings in the members' key slots.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use crate::error::{Error, Result, RuntimeErrorKind};
use crate::fiber::wait::WakeValue;
use crate::reactor::{Interest, Reactor, WatchId};
use crate::stream;
use crate::value::Value;
use crate::vm::{PendingOperation, VmContext};

/// Compile-time bound on the number of members of one frame.
pub const MAX_MEMBERS: usize = 16;

/// Maximum length of a key or string value (one size byte precedes it).
pub const MAX_STRING_LEN: usize = 255;

const STR_SLOT: usize = 512;
const FRAME_LEN: usize = 8 * MAX_MEMBERS + MAX_MEMBERS * STR_SLOT;

const EXPONENT_MASK: u64 = 0x7FF0_0000_0000_0000;
const MANTISSA_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;
const QNAN_BIT: u64 = 0x0008_0000_0000_0000;

const KIND_BOOLEAN_TRUE: u64 = 1;
const KIND_BOOLEAN_FALSE: u64 = 2;
const KIND_STRING: u64 = 3;
const KIND_FILE_DESCRIPTOR: u64 = 4;
const KIND_ACTOR_ADDRESS: u64 = 5;
const KIND_NIL: u64 = 6;

/// The exact signaling-NaN predicate of the wire format.
#[inline]
pub fn is_snan(bits: u64) -> bool {
    (bits & EXPONENT_MASK) == EXPONENT_MASK
        && (bits & MANTISSA_MASK) != 0
        && (bits & QNAN_BIT) == 0
}

#[inline]
fn tag_word(kind: u64, aux: u64) -> u64 {
    debug_assert!(kind != 0 && kind <= KIND_NIL);
    debug_assert!(aux < (1 << 16));
    EXPONENT_MASK | (aux << 8) | kind
}

#[inline]
fn tag_kind(word: u64) -> u64 {
    word & 0xFF
}

#[inline]
fn tag_aux(word: u64) -> u64 {
    (word >> 8) & 0xFFFF
}

////////////////////////////////////////////////////////////////////////////////
// IpcMessage
////////////////////////////////////////////////////////////////////////////////

/// A value representable on the wire.
///
/// `Address` carries the seqpacket endpoint of a remote inbox; addresses
/// compare by the identity of the forwarded endpoint, so decoding yields
/// a descriptor rather than an in-process handle.
#[derive(Debug)]
pub enum IpcValue {
    Bool(bool),
    Number(f64),
    Str(Vec<u8>),
    Fd(OwnedFd),
    Address(OwnedFd),
}

/// One message: a sole flat value or a string-keyed map of values.
#[derive(Debug)]
pub enum IpcMessage {
    Flat(IpcValue),
    Map(Vec<(Vec<u8>, IpcValue)>),
}

////////////////////////////////////////////////////////////////////////////////
// Frame
////////////////////////////////////////////////////////////////////////////////

#[repr(C)]
#[derive(Debug)]
pub struct Frame {
    members: [u64; MAX_MEMBERS],
    strbuf: [u8; MAX_MEMBERS * STR_SLOT],
}

impl Frame {
    fn zeroed() -> Box<Self> {
        // All-nil members are filled in by the encoder.
        let mut frame = Box::new(Frame {
            members: [0; MAX_MEMBERS],
            strbuf: [0; MAX_MEMBERS * STR_SLOT],
        });
        for m in frame.members.iter_mut() {
            *m = tag_word(KIND_NIL, 0);
        }
        frame
    }

    fn as_bytes(&self) -> &[u8] {
        // repr(C), no padding: u64 array followed by a byte array.
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, FRAME_LEN) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self as *mut Self as *mut u8, FRAME_LEN) }
    }

    fn write_str(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if data.len() > MAX_STRING_LEN {
            return Err(Error::errno(libc::EOVERFLOW));
        }
        self.strbuf[offset] = data.len() as u8;
        self.strbuf[offset + 1..offset + 1 + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_str(&self, offset: usize) -> Vec<u8> {
        let len = self.strbuf[offset] as usize;
        self.strbuf[offset + 1..offset + 1 + len].to_vec()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Encode / decode
////////////////////////////////////////////////////////////////////////////////

/// Encodes a message. The returned descriptor list mirrors the slot
/// indices embedded in the frame's member words and must ride the same
/// datagram as one `SCM_RIGHTS` control message.
pub fn encode(msg: &IpcMessage) -> Result<(Box<Frame>, Vec<RawFd>)> {
    let mut frame = Frame::zeroed();
    let mut fds = Vec::new();

    match msg {
        IpcMessage::Flat(value) => {
            encode_member(&mut frame, 1, value, &mut fds)?;
        }
        IpcMessage::Map(entries) => {
            if entries.is_empty() {
                // members[0] == nil and members[1] == nil: empty map.
            } else {
                if entries.len() > MAX_MEMBERS {
                    return Err(Error::errno(libc::EOVERFLOW));
                }
                for (i, (key, value)) in entries.iter().enumerate() {
                    frame.write_str(i * STR_SLOT, key)?;
                    encode_member(&mut frame, i, value, &mut fds)?;
                }
            }
        }
    }
    Ok((frame, fds))
}

fn encode_member(
    frame: &mut Frame,
    i: usize,
    value: &IpcValue,
    fds: &mut Vec<RawFd>,
) -> Result<()> {
    frame.members[i] = match value {
        IpcValue::Bool(true) => tag_word(KIND_BOOLEAN_TRUE, 0),
        IpcValue::Bool(false) => tag_word(KIND_BOOLEAN_FALSE, 0),
        IpcValue::Number(n) => {
            let mut bits = n.to_bits();
            if is_snan(bits) {
                // Quiet it; a signaling payload would decode as a tag.
                bits |= QNAN_BIT;
            }
            bits
        }
        IpcValue::Str(s) => {
            frame.write_str(i * STR_SLOT + 256, s)?;
            tag_word(KIND_STRING, 0)
        }
        IpcValue::Fd(fd) => {
            let slot = fds.len() as u64;
            fds.push(fd.as_raw_fd());
            tag_word(KIND_FILE_DESCRIPTOR, slot)
        }
        IpcValue::Address(fd) => {
            let slot = fds.len() as u64;
            fds.push(fd.as_raw_fd());
            tag_word(KIND_ACTOR_ADDRESS, slot)
        }
    };
    Ok(())
}

/// Decodes a frame together with the descriptors received alongside it.
pub fn decode(frame: &Frame, fds: Vec<OwnedFd>) -> Result<IpcMessage> {
    let mut fds: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();

    let nil0 = is_snan(frame.members[0]) && tag_kind(frame.members[0]) == KIND_NIL;
    if nil0 {
        let nil1 = is_snan(frame.members[1]) && tag_kind(frame.members[1]) == KIND_NIL;
        if nil1 {
            return Ok(IpcMessage::Map(Vec::new()));
        }
        let value = decode_member(frame, 1, &mut fds)?;
        return Ok(IpcMessage::Flat(value));
    }

    let mut entries = Vec::new();
    for i in 0..MAX_MEMBERS {
        let word = frame.members[i];
        if is_snan(word) && tag_kind(word) == KIND_NIL {
            break;
        }
        let key = frame.read_str(i * STR_SLOT);
        let value = decode_member(frame, i, &mut fds)?;
        entries.push((key, value));
    }
    Ok(IpcMessage::Map(entries))
}

fn decode_member(frame: &Frame, i: usize, fds: &mut Vec<Option<OwnedFd>>) -> Result<IpcValue> {
    let word = frame.members[i];
    if !is_snan(word) {
        return Ok(IpcValue::Number(f64::from_bits(word)));
    }
    match tag_kind(word) {
        KIND_BOOLEAN_TRUE => Ok(IpcValue::Bool(true)),
        KIND_BOOLEAN_FALSE => Ok(IpcValue::Bool(false)),
        KIND_STRING => Ok(IpcValue::Str(frame.read_str(i * STR_SLOT + 256))),
        KIND_FILE_DESCRIPTOR | KIND_ACTOR_ADDRESS => {
            let slot = tag_aux(word) as usize;
            let fd = fds
                .get_mut(slot)
                .and_then(Option::take)
                .ok_or_else(|| Error::invalid_argument("frame"))?;
            if tag_kind(word) == KIND_FILE_DESCRIPTOR {
                Ok(IpcValue::Fd(fd))
            } else {
                Ok(IpcValue::Address(fd))
            }
        }
        _ => Err(Error::invalid_argument("frame")),
    }
}

////////////////////////////////////////////////////////////////////////////////
// IpcChannel
////////////////////////////////////////////////////////////////////////////////

/// One endpoint of a seqpacket actor channel.
pub struct IpcChannel {
    fd: OwnedFd,
}

/// Creates a connected seqpacket pair.
pub fn channel_pair() -> Result<(IpcChannel, IpcChannel)> {
    let mut fds = [0 as RawFd; 2];
    let res = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if res == -1 {
        return Err(Error::last_os_error());
    }
    unsafe {
        Ok((
            IpcChannel::from_fd(OwnedFd::from_raw_fd(fds[0])),
            IpcChannel::from_fd(OwnedFd::from_raw_fd(fds[1])),
        ))
    }
}

impl IpcChannel {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Sends a message, blocking until the kernel accepts the datagram.
    pub fn send(&self, msg: &IpcMessage) -> Result<()> {
        let (frame, fds) = encode(msg)?;
        let bytes = frame.as_bytes();

        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let mut control = vec![0u8; unsafe { libc::CMSG_SPACE((fds.len() * 4) as u32) } as usize];
        let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
        if !fds.is_empty() {
            hdr.msg_control = control.as_mut_ptr().cast();
            hdr.msg_controllen = control.len() as _;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&hdr);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * 4) as u32) as _;
                std::ptr::copy_nonoverlapping(
                    fds.as_ptr(),
                    libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                    fds.len(),
                );
            }
        }

        loop {
            let n = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &hdr, 0) };
            if n == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::IO(err));
            }
            return Ok(());
        }
    }

    /// Receives the next message, blocking until one arrives.
    ///
    /// Fails with `channel_closed` when the peer endpoint is gone.
    pub fn recv(&self) -> Result<IpcMessage> {
        self.recv_inner(0)
    }

    /// Receives the next message, parking the current fiber while the
    /// channel is empty.
    pub async fn recv_suspending(&self) -> Result<IpcMessage> {
        loop {
            match self.recv_inner(libc::MSG_DONTWAIT) {
                Err(Error::IO(ref e)) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    stream::fd_readable(self.fd.as_raw_fd()).await?;
                }
                other => return other,
            }
        }
    }

    fn recv_inner(&self, flags: libc::c_int) -> Result<IpcMessage> {
        let mut frame = Frame::zeroed();
        let frame_bytes = frame.as_bytes_mut();
        let mut iov = libc::iovec {
            iov_base: frame_bytes.as_mut_ptr().cast(),
            iov_len: frame_bytes.len(),
        };
        let mut control = vec![0u8; unsafe { libc::CMSG_SPACE((MAX_MEMBERS * 4) as u32) } as usize];
        let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
        hdr.msg_control = control.as_mut_ptr().cast();
        hdr.msg_controllen = control.len() as _;

        let n = loop {
            let n = unsafe {
                libc::recvmsg(self.fd.as_raw_fd(), &mut hdr, flags | libc::MSG_CMSG_CLOEXEC)
            };
            if n == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::IO(err));
            }
            break n;
        };
        if n == 0 {
            return Err(RuntimeErrorKind::ChannelClosed.into());
        }

        let mut fds = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&hdr);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    let count = payload / 4;
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    for k in 0..count {
                        fds.push(OwnedFd::from_raw_fd(*data.add(k)));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
            }
        }

        if n as usize != FRAME_LEN {
            return Err(Error::invalid_argument("frame"));
        }
        decode(&frame, fds)
    }
}

impl AsRawFd for IpcChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for IpcChannel {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

/// Bridges a decoded value into the in-process message type where
/// representable. Descriptor-carrying values have no in-process inbox
/// form and are handed to the embedder as-is.
pub fn to_value(v: &IpcValue) -> Option<Value> {
    match v {
        IpcValue::Bool(b) => Some(Value::Bool(*b)),
        IpcValue::Number(n) => Some(Value::Number(*n)),
        IpcValue::Str(s) => std::str::from_utf8(s).ok().map(|s| Value::Str(s.into())),
        IpcValue::Fd(_) | IpcValue::Address(_) => None,
    }
}

fn message_to_value(msg: &IpcMessage) -> Option<Value> {
    match msg {
        IpcMessage::Flat(v) => to_value(v),
        IpcMessage::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                let key = std::str::from_utf8(key).ok()?;
                map.insert(key.to_string(), to_value(value)?);
            }
            Some(Value::Map(map))
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// InboxBridge
////////////////////////////////////////////////////////////////////////////////

/// Feeds a VM's inbox from a seqpacket endpoint.
///
/// This is what makes a subprocess actor's inbox ordinary: sibling
/// processes write frames into the socket, and a parked receiver is fed
/// from it exactly like from an in-process sender. The bridge only arms
/// a read while a receiver is parked, so backpressure stays in the
/// kernel's socket buffer and remote senders block in their own
/// runtimes.
///
/// Registered as a pending operation: closing the VM withdraws the
/// outstanding watch.
pub struct InboxBridge {
    chan: IpcChannel,
    armed: Cell<Option<WatchId>>,
    /// A frame read for a receiver that got interrupted before it was
    /// fed; handed to the next receiver.
    buffered: RefCell<Option<Result<Value>>>,
}

/// Installs a bridge between `vm`'s inbox and `chan`.
pub fn install_inbox_bridge(vm: &Rc<VmContext>, chan: IpcChannel) -> Result<()> {
    if !vm.is_valid() {
        return Err(Error::VmDead);
    }
    if vm.ipc_bridge.borrow().is_some() {
        return Err(Error::invalid_argument("channel"));
    }
    let bridge = Rc::new(InboxBridge {
        chan,
        armed: Cell::new(None),
        buffered: RefCell::new(None),
    });
    vm.register_pending(bridge.clone());
    *vm.ipc_bridge.borrow_mut() = Some(bridge);
    Ok(())
}

impl PendingOperation for InboxBridge {
    fn cancel(&self) {
        if let Some(id) = self.armed.take() {
            Reactor::with_current(|r| r.cancel_watch(id));
        }
    }
}

impl InboxBridge {
    /// Arms a single read. Called whenever a receiver parks.
    pub(crate) fn arm(self: &Rc<Self>, vm: &Rc<VmContext>) {
        if self.armed.get().is_some() {
            return;
        }

        if let Some(outcome) = self.buffered.borrow_mut().take() {
            vm.strand().post(move |r, vm| {
                let bridge = vm.ipc_bridge.borrow().clone();
                if let Some(bridge) = bridge {
                    bridge.deliver(vm, r, outcome);
                }
            });
            return;
        }

        let id = {
            let bridge = self.clone();
            let vm = vm.clone();
            let fd = self.chan.as_raw_fd();
            Reactor::with_current(move |r| {
                r.add_watch(fd, Interest::READABLE, move |r| {
                    bridge.armed.set(None);
                    bridge.on_readable(&vm, r);
                })
            })
            .expect("inbox bridge armed outside the reactor loop")
        };
        self.armed.set(Some(id));
    }

    fn on_readable(self: &Rc<Self>, vm: &Rc<VmContext>, reactor: &Reactor) {
        if !vm.is_valid() {
            return;
        }
        let outcome = match self.chan.recv_inner(libc::MSG_DONTWAIT) {
            Err(Error::IO(ref e)) if e.raw_os_error() == Some(libc::EAGAIN) => {
                self.arm(vm);
                return;
            }
            Err(e) if e.kind() == Some(RuntimeErrorKind::ChannelClosed) => {
                // The peer endpoint is gone: seal the inbox and report
                // the closure to the parked receiver.
                let receiver = {
                    let mut inbox = vm.inbox.borrow_mut();
                    inbox.open = false;
                    inbox.guard = None;
                    inbox.recv_fiber.take()
                };
                if let Some(fiber) = receiver {
                    vm.set_wake(fiber, Err(RuntimeErrorKind::ChannelClosed.into()));
                    vm.resume(reactor, fiber);
                }
                return;
            }
            Err(e) => Err(e),
            Ok(msg) => match message_to_value(&msg) {
                Some(value) => Ok(value),
                None => {
                    // Descriptor-carrying or non-UTF-8 frames have no
                    // inbox representation.
                    log::warn!("dropping inbox frame with no in-process representation");
                    self.arm(vm);
                    return;
                }
            },
        };
        self.deliver(vm, reactor, outcome);
    }

    fn deliver(self: &Rc<Self>, vm: &Rc<VmContext>, reactor: &Reactor, outcome: Result<Value>) {
        let receiver = {
            let mut inbox = vm.inbox.borrow_mut();
            let fiber = inbox.recv_fiber.take();
            if fiber.is_some() {
                inbox.guard = None;
            }
            fiber
        };
        match receiver {
            Some(fiber) => {
                vm.set_wake(fiber, outcome.map(WakeValue::Message));
                vm.resume(reactor, fiber);
            }
            None => {
                *self.buffered.borrow_mut() = Some(outcome);
            }
        }
    }
}

/// Forks a subprocess actor: the child inherits its endpoint of a fresh
/// seqpacket pair at descriptor slot 3, ours is returned alongside the
/// child handle.
#[cfg(target_os = "linux")]
pub fn spawn_subprocess_actor(
    options: crate::process::SpawnOptions,
) -> Result<(IpcChannel, crate::process::Child)> {
    let (ours, theirs) = channel_pair()?;
    let child = options.extra_fd(3, theirs.as_raw_fd()).spawn()?;
    Ok((ours, child))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snan_mask_is_exact() {
        assert!(!is_snan(0.0f64.to_bits()));
        assert!(!is_snan(1.5f64.to_bits()));
        assert!(!is_snan(f64::INFINITY.to_bits()));
        assert!(!is_snan(f64::NEG_INFINITY.to_bits()));
        // The default NaN is quiet.
        assert!(!is_snan(f64::NAN.to_bits()));
        // Exponent all ones, non-zero mantissa, quiet bit clear.
        assert!(is_snan(EXPONENT_MASK | 1));
        assert!(!is_snan(EXPONENT_MASK | QNAN_BIT | 1));
        // Sign bit does not matter.
        assert!(is_snan(0x8000_0000_0000_0000 | EXPONENT_MASK | 1));
    }

    #[test]
    fn tag_words_are_snans() {
        for kind in [
            KIND_BOOLEAN_TRUE,
            KIND_BOOLEAN_FALSE,
            KIND_STRING,
            KIND_FILE_DESCRIPTOR,
            KIND_ACTOR_ADDRESS,
            KIND_NIL,
        ] {
            let w = tag_word(kind, 3);
            assert!(is_snan(w));
            assert_eq!(tag_kind(w), kind);
            assert_eq!(tag_aux(w), 3);
        }
    }

    #[test]
    fn flat_round_trip() {
        for v in [
            IpcValue::Bool(true),
            IpcValue::Bool(false),
            IpcValue::Number(-12.75),
            IpcValue::Str(b"hello".to_vec()),
        ] {
            let (frame, fds) = encode(&IpcMessage::Flat(v)).unwrap();
            assert!(fds.is_empty());
            match decode(&frame, Vec::new()).unwrap() {
                IpcMessage::Flat(_) => {}
                other => panic!("flat form lost: {:?}", other),
            }
        }

        let (frame, _) = encode(&IpcMessage::Flat(IpcValue::Number(42.0))).unwrap();
        match decode(&frame, Vec::new()).unwrap() {
            IpcMessage::Flat(IpcValue::Number(n)) => assert_eq!(n, 42.0),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn snan_numbers_are_quieted() {
        let snan = f64::from_bits(EXPONENT_MASK | 1);
        let (frame, _) = encode(&IpcMessage::Flat(IpcValue::Number(snan))).unwrap();
        match decode(&frame, Vec::new()).unwrap() {
            IpcMessage::Flat(IpcValue::Number(n)) => assert!(n.is_nan()),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn map_round_trip() {
        let msg = IpcMessage::Map(vec![
            (b"flag".to_vec(), IpcValue::Bool(true)),
            (b"pi".to_vec(), IpcValue::Number(3.125)),
            (b"name".to_vec(), IpcValue::Str(b"wick".to_vec())),
        ]);
        let (frame, fds) = encode(&msg).unwrap();
        assert!(fds.is_empty());
        match decode(&frame, Vec::new()).unwrap() {
            IpcMessage::Map(entries) => {
                assert_eq!(entries.len(), 3);
                assert_eq!(entries[0].0, b"flag");
                assert_eq!(entries[1].0, b"pi");
                match &entries[2].1 {
                    IpcValue::Str(s) => assert_eq!(s, b"wick"),
                    other => panic!("unexpected value: {:?}", other),
                }
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn empty_map_round_trip() {
        let (frame, _) = encode(&IpcMessage::Map(Vec::new())).unwrap();
        match decode(&frame, Vec::new()).unwrap() {
            IpcMessage::Map(entries) => assert!(entries.is_empty()),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn oversized_strings_are_rejected() {
        let long = vec![b'x'; MAX_STRING_LEN + 1];
        let err = encode(&IpcMessage::Flat(IpcValue::Str(long))).unwrap_err();
        assert_eq!(err.os_error(), Some(libc::EOVERFLOW));
    }

    #[test]
    fn socket_round_trip_with_descriptor() {
        let (a, b) = channel_pair().unwrap();

        let mut pipe = [0 as RawFd; 2];
        assert_ne!(unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC) }, -1);
        let pipe_r = unsafe { OwnedFd::from_raw_fd(pipe[0]) };
        let pipe_w = unsafe { OwnedFd::from_raw_fd(pipe[1]) };

        let msg = IpcMessage::Map(vec![
            (b"stream".to_vec(), IpcValue::Fd(pipe_w)),
            (b"label".to_vec(), IpcValue::Str(b"echo".to_vec())),
        ]);
        a.send(&msg).unwrap();
        let received = b.recv().unwrap();

        let fd = match received {
            IpcMessage::Map(mut entries) => match entries.remove(0).1 {
                IpcValue::Fd(fd) => fd,
                other => panic!("unexpected value: {:?}", other),
            },
            other => panic!("unexpected decode: {:?}", other),
        };

        // The forwarded descriptor is the same endpoint: bytes written
        // through it surface on our read end.
        let n = unsafe { libc::write(fd.as_raw_fd(), b"ok".as_ptr().cast(), 2) };
        assert_eq!(n, 2);
        let mut buf = [0u8; 2];
        let n = unsafe { libc::read(pipe_r.as_raw_fd(), buf.as_mut_ptr().cast(), 2) };
        assert_eq!(n, 2);
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn inbox_bridge_feeds_parked_receivers() {
        let (host, vm_end) = channel_pair().unwrap();
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        let inbox = vm.inbox();
        install_inbox_bridge(&vm, vm_end).unwrap();

        host.send(&IpcMessage::Flat(IpcValue::Str(b"ping".to_vec())))
            .unwrap();
        host.send(&IpcMessage::Map(vec![(b"n".to_vec(), IpcValue::Number(4.0))]))
            .unwrap();
        // EOF arrives after the queued frames.
        drop(host);

        vm.spawn(async move {
            assert_eq!(inbox.receive().await.unwrap(), Value::from("ping"));
            match inbox.receive().await.unwrap() {
                Value::Map(m) => assert_eq!(m.get("n"), Some(&Value::from(4.0))),
                other => panic!("unexpected message: {:?}", other),
            }
            let err = inbox.receive().await.unwrap_err();
            assert_eq!(err.kind(), Some(RuntimeErrorKind::ChannelClosed));
            Ok(vec![])
        })
        .unwrap();

        reactor.run();
    }

    #[test]
    fn closed_peer_reports_channel_closed() {
        let (a, b) = channel_pair().unwrap();
        drop(a);
        let err = b.recv().unwrap_err();
        assert_eq!(err.kind(), Some(RuntimeErrorKind::ChannelClosed));
    }
}
