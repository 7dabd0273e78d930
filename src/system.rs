//! Credential and capability propagation to the actor service.
//!
//! The actor service is the sidecar process that spawns subprocess
//! actors on behalf of VMs. For that to stay coherent, privileged
//! process-wide changes made by the master VM must be mirrored into the
//! service: the host applies the change locally first and then sends a
//! typed request over the pre-established seqpacket, with the write end
//! of a fresh reply pipe (and, for variable-length payloads, an
//! anonymous memfd) riding as ancillary data. The host then blocks for
//! the one-byte acknowledgement.
//!
//! A missing acknowledgement is fatal: credentials changed on one side
//! of the pair but not the other cannot be reconciled, and running on
//! with split identities would be worse than dying; failure of
//! setuid-like operations is only safe if atomic. The client therefore
//! SIGKILLs its own process.

use std::ffi::CStr;
use std::io::Write;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Linux securebits.
    pub struct SecureBits: libc::c_ulong {
        const NOROOT = 0x01;
        const NOROOT_LOCKED = 0x02;
        const NO_SETUID_FIXUP = 0x04;
        const NO_SETUID_FIXUP_LOCKED = 0x08;
        const KEEP_CAPS = 0x10;
        const KEEP_CAPS_LOCKED = 0x20;
        const NO_CAP_AMBIENT_RAISE = 0x40;
        const NO_CAP_AMBIENT_RAISE_LOCKED = 0x80;
    }
}

// prctl selectors the libc crate does not export uniformly.
const PR_CAPBSET_DROP: libc::c_int = 24;
const PR_SET_SECUREBITS: libc::c_int = 28;
const PR_CAP_AMBIENT: libc::c_int = 47;
const PR_CAP_AMBIENT_RAISE: libc::c_ulong = 2;
const PR_CAP_AMBIENT_LOWER: libc::c_ulong = 3;
const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_ulong = 4;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

////////////////////////////////////////////////////////////////////////////////
// Wire structs
////////////////////////////////////////////////////////////////////////////////

/// Request discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    CreateProcess = 0,
    Setresuid = 1,
    Setresgid = 2,
    Setgroups = 3,
    CapSetProc = 4,
    CapDropBound = 5,
    CapSetAmbient = 6,
    CapResetAmbient = 7,
    CapSetSecbits = 8,
    Chdir = 9,
    Umask = 10,
}

/// Standard-stream disposition for `CreateProcess` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StdStreamAction {
    CloseFd = 0,
    ShareParent = 1,
    UsePipe = 2,
}

/// The request frame sent to the actor service.
///
/// Fixed-size, native endianness; variable-length payloads travel in a
/// memfd referenced by the size fields.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct StartVmRequest {
    pub action: u8,
    pub stdin_action: u8,
    pub stdout_action: u8,
    pub stderr_action: u8,
    pub stderr_has_color: u8,
    pub has_trace_hook: u8,
    pub clone_flags: i32,
    pub resuid: [libc::uid_t; 3],
    pub resgid: [libc::gid_t; 3],
    pub setgroups_ngroups: i32,
    pub cap_payload_size: i64,
    pub cap_value: i32,
    pub cap_flag_value: i32,
    pub secbits: libc::c_ulong,
    pub chdir_size: u64,
    pub umask_mask: libc::mode_t,
}

impl StartVmRequest {
    pub fn new(action: Action) -> Self {
        let mut req: Self = unsafe { std::mem::zeroed() };
        req.action = action as u8;
        req.stdin_action = StdStreamAction::ShareParent as u8;
        req.stdout_action = StdStreamAction::ShareParent as u8;
        req.stderr_action = StdStreamAction::ShareParent as u8;
        req
    }

    fn as_bytes(&self) -> &[u8] {
        // Created zeroed, so padding carries no uninitialized bytes.
        unsafe {
            std::slice::from_raw_parts(
                self as *const Self as *const u8,
                std::mem::size_of::<Self>(),
            )
        }
    }
}

/// A capability set in the shape `capset(2)` consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Capabilities {
    pub effective: u64,
    pub permitted: u64,
    pub inheritable: u64,
}

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

impl Capabilities {
    /// `capset(2)` for the calling process/thread.
    ///
    /// Async-signal-safe; also used between fork and exec.
    pub(crate) fn raw_apply(&self) -> libc::c_long {
        let header = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let data = [
            CapUserData {
                effective: self.effective as u32,
                permitted: self.permitted as u32,
                inheritable: self.inheritable as u32,
            },
            CapUserData {
                effective: (self.effective >> 32) as u32,
                permitted: (self.permitted >> 32) as u32,
                inheritable: (self.inheritable >> 32) as u32,
            },
        ];
        unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) }
    }

    /// Reads the capability sets of `pid` (0 for the calling process).
    pub fn of_process(pid: libc::pid_t) -> Result<Self> {
        let mut header = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid,
        };
        let mut data = [CapUserData::default(); 2];
        let res = unsafe { libc::syscall(libc::SYS_capget, &mut header, data.as_mut_ptr()) };
        if res == -1 {
            return Err(Error::last_os_error());
        }
        Ok(Self {
            effective: data[0].effective as u64 | (data[1].effective as u64) << 32,
            permitted: data[0].permitted as u64 | (data[1].permitted as u64) << 32,
            inheritable: data[0].inheritable as u64 | (data[1].inheritable as u64) << 32,
        })
    }

    fn apply(&self) -> Result<()> {
        if self.raw_apply() == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self as *const Self as *const u8,
                std::mem::size_of::<Self>(),
            )
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// ActorService
////////////////////////////////////////////////////////////////////////////////

/// Client half of the actor-service credential protocol.
pub struct ActorService {
    sock: OwnedFd,
}

impl ActorService {
    pub fn new(sock: OwnedFd) -> Self {
        Self { sock }
    }

    pub fn setresuid(&self, ruid: libc::uid_t, euid: libc::uid_t, suid: libc::uid_t) -> Result<()> {
        if unsafe { libc::setresuid(ruid, euid, suid) } == -1 {
            return Err(Error::last_os_error());
        }
        let mut req = StartVmRequest::new(Action::Setresuid);
        req.resuid = [ruid, euid, suid];
        self.mirror(&req, None)
    }

    pub fn setresgid(&self, rgid: libc::gid_t, egid: libc::gid_t, sgid: libc::gid_t) -> Result<()> {
        if unsafe { libc::setresgid(rgid, egid, sgid) } == -1 {
            return Err(Error::last_os_error());
        }
        let mut req = StartVmRequest::new(Action::Setresgid);
        req.resgid = [rgid, egid, sgid];
        self.mirror(&req, None)
    }

    pub fn setgroups(&self, groups: &[libc::gid_t]) -> Result<()> {
        if unsafe { libc::setgroups(groups.len(), groups.as_ptr()) } == -1 {
            return Err(Error::last_os_error());
        }
        let mut req = StartVmRequest::new(Action::Setgroups);
        req.setgroups_ngroups = groups.len() as i32;
        let payload = unsafe {
            std::slice::from_raw_parts(
                groups.as_ptr().cast::<u8>(),
                groups.len() * std::mem::size_of::<libc::gid_t>(),
            )
        };
        self.mirror(&req, Some(payload))
    }

    pub fn cap_set_proc(&self, caps: &Capabilities) -> Result<()> {
        caps.apply()?;
        let mut req = StartVmRequest::new(Action::CapSetProc);
        req.cap_payload_size = std::mem::size_of::<Capabilities>() as i64;
        self.mirror(&req, Some(caps.as_bytes()))
    }

    pub fn cap_drop_bound(&self, cap: i32) -> Result<()> {
        if unsafe { libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) } == -1 {
            return Err(Error::last_os_error());
        }
        let mut req = StartVmRequest::new(Action::CapDropBound);
        req.cap_value = cap;
        self.mirror(&req, None)
    }

    pub fn cap_set_ambient(&self, cap: i32, raise: bool) -> Result<()> {
        let op = if raise {
            PR_CAP_AMBIENT_RAISE
        } else {
            PR_CAP_AMBIENT_LOWER
        };
        if unsafe { libc::prctl(PR_CAP_AMBIENT, op, cap as libc::c_ulong, 0, 0) } == -1 {
            return Err(Error::last_os_error());
        }
        let mut req = StartVmRequest::new(Action::CapSetAmbient);
        req.cap_value = cap;
        req.cap_flag_value = raise as i32;
        self.mirror(&req, None)
    }

    pub fn cap_reset_ambient(&self) -> Result<()> {
        if unsafe { libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) } == -1 {
            return Err(Error::last_os_error());
        }
        let req = StartVmRequest::new(Action::CapResetAmbient);
        self.mirror(&req, None)
    }

    pub fn cap_set_secbits(&self, bits: SecureBits) -> Result<()> {
        if unsafe { libc::prctl(PR_SET_SECUREBITS, bits.bits(), 0, 0, 0) } == -1 {
            return Err(Error::last_os_error());
        }
        let mut req = StartVmRequest::new(Action::CapSetSecbits);
        req.secbits = bits.bits();
        self.mirror(&req, None)
    }

    pub fn chdir(&self, path: &CStr) -> Result<()> {
        if unsafe { libc::chdir(path.as_ptr()) } == -1 {
            return Err(Error::last_os_error());
        }
        let mut req = StartVmRequest::new(Action::Chdir);
        let payload = path.to_bytes();
        req.chdir_size = payload.len() as u64;
        self.mirror(&req, Some(payload))
    }

    pub fn umask(&self, mask: libc::mode_t) -> Result<()> {
        unsafe { libc::umask(mask) };
        let mut req = StartVmRequest::new(Action::Umask);
        req.umask_mask = mask;
        self.mirror(&req, None)
    }

    /// Sends the request and blocks for the one-byte acknowledgement.
    ///
    /// EOF or a read error means the service and this process now
    /// disagree about process-wide credentials; that state cannot be
    /// repaired, so the process kills itself.
    fn mirror(&self, req: &StartVmRequest, payload: Option<&[u8]>) -> Result<()> {
        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
            return Err(Error::last_os_error());
        }
        let (reply_rx, reply_tx) = unsafe {
            (
                OwnedFd::from_raw_fd(pipe_fds[0]),
                OwnedFd::from_raw_fd(pipe_fds[1]),
            )
        };

        let memfd = match payload {
            Some(data) => Some(make_memfd(data)?),
            None => None,
        };

        let mut fds = [reply_tx.as_raw_fd(), 0];
        let mut nfds = 1;
        if let Some(memfd) = &memfd {
            fds[1] = memfd.as_raw_fd();
            nfds = 2;
        }
        self.sendmsg(req.as_bytes(), &fds[..nfds])?;
        drop(reply_tx);

        let mut ack = [0u8; 1];
        loop {
            let n = unsafe { libc::read(reply_rx.as_raw_fd(), ack.as_mut_ptr().cast(), 1) };
            if n == 1 {
                return Ok(());
            }
            if n == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            // The service did not acknowledge. Half-applied credentials
            // cannot be rolled back across processes.
            unsafe { libc::raise(libc::SIGKILL) };
            return Err(Error::errno(libc::EPIPE));
        }
    }

    fn sendmsg(&self, bytes: &[u8], fds: &[RawFd]) -> Result<()> {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let mut control =
            vec![0u8; unsafe { libc::CMSG_SPACE((fds.len() * 4) as u32) } as usize];
        let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
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
        loop {
            let n = unsafe { libc::sendmsg(self.sock.as_raw_fd(), &hdr, 0) };
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
}

fn make_memfd(data: &[u8]) -> Result<OwnedFd> {
    let name = b"wick-payload\0";
    let fd = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
    if fd == -1 {
        return Err(Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let mut file = unsafe { std::fs::File::from_raw_fd(libc::dup(fd.as_raw_fd())) };
    file.write_all(data).map_err(Error::IO)?;
    drop(file);
    if unsafe { libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_SET) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn socketpair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        let res = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_ne!(res, -1);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    /// Receives one request plus its ancillary descriptors.
    fn recv_request(sock: &OwnedFd) -> (StartVmRequest, Vec<OwnedFd>) {
        let mut req: StartVmRequest = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: (&mut req as *mut StartVmRequest).cast(),
            iov_len: std::mem::size_of::<StartVmRequest>(),
        };
        let mut control = vec![0u8; unsafe { libc::CMSG_SPACE(16) } as usize];
        let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
        hdr.msg_control = control.as_mut_ptr().cast();
        hdr.msg_controllen = control.len() as _;
        let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut hdr, libc::MSG_CMSG_CLOEXEC) };
        assert_eq!(n as usize, std::mem::size_of::<StartVmRequest>());

        let mut fds = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&hdr);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    for k in 0..payload / 4 {
                        fds.push(OwnedFd::from_raw_fd(*data.add(k)));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
            }
        }
        (req, fds)
    }

    #[test]
    fn read_own_capabilities() {
        // capget round-trip: whatever we run with is representable.
        let caps = Capabilities::of_process(0).unwrap();
        assert_eq!(caps, Capabilities::of_process(0).unwrap());
    }

    #[test]
    fn umask_change_is_mirrored_and_acknowledged() {
        let (client_sock, service_sock) = socketpair();
        let service = std::thread::spawn(move || {
            let (req, fds) = recv_request(&service_sock);
            assert_eq!(req.action, Action::Umask as u8);
            let reply = &fds[0];
            let n = unsafe { libc::write(reply.as_raw_fd(), b"\x01".as_ptr().cast(), 1) };
            assert_eq!(n, 1);
            req.umask_mask
        });

        let client = ActorService::new(client_sock);
        let old = unsafe { libc::umask(0o022) };
        unsafe { libc::umask(old) };
        client.umask(old).unwrap();
        assert_eq!(service.join().unwrap(), old);
    }

    #[test]
    fn chdir_payload_travels_in_a_memfd() {
        let (client_sock, service_sock) = socketpair();
        let service = std::thread::spawn(move || {
            let (req, fds) = recv_request(&service_sock);
            assert_eq!(req.action, Action::Chdir as u8);
            assert_eq!(req.chdir_size, 1);
            assert_eq!(fds.len(), 2);
            let mut payload = String::new();
            let mut file =
                unsafe { std::fs::File::from_raw_fd(libc::dup(fds[1].as_raw_fd())) };
            file.read_to_string(&mut payload).unwrap();
            let n = unsafe { libc::write(fds[0].as_raw_fd(), b"\x01".as_ptr().cast(), 1) };
            assert_eq!(n, 1);
            payload
        });

        let client = ActorService::new(client_sock);
        client.chdir(CStr::from_bytes_with_nul(b".\0").unwrap()).unwrap();
        assert_eq!(service.join().unwrap(), ".");
    }
}
