//! The per-VM inbox and the addresses that feed it.
//!
//! Every VM owns one inbox. Sibling VMs obtain an [`ActorAddress`] and
//! post typed [`Value`] messages; the staging always happens on the
//! *destination* strand, so inbox state never needs a lock. A parked
//! receiver is fed directly, bypassing the queue; otherwise the sender
//! parks until its message is consumed or the channel closes.
//!
//! Liveness is tracked by the address count itself: cloning an address
//! bumps the destination's atomic `nsenders`, dropping the last one
//! schedules a re-check on the destination strand (a concurrent clone may
//! have revived the count) and, if it is still zero while a receiver is
//! parked, wakes the receiver with `no_senders`.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::error::{Error, Result, RuntimeErrorKind};
use crate::fiber::wait::{expect_message, expect_unit, park_with, Interrupter, WakeValue};
use crate::fiber::FiberId;
use crate::reactor::WorkGuard;
use crate::value::Value;
use crate::vm::{current_vm, VmContext, VmShared};

pub mod ipc;

////////////////////////////////////////////////////////////////////////////////
// InboxState
////////////////////////////////////////////////////////////////////////////////

/// A sender parked in the destination's queue.
///
/// Dropping a state whose `wake_on_destruct` latch is set resumes the
/// sender with `channel_closed`, so queue teardown can never lose a sender
/// silently.
pub(crate) struct SenderState {
    pub(crate) vm: Arc<VmShared>,
    pub(crate) fiber: FiberId,
    pub(crate) msg: Option<Value>,
    pub(crate) wake_on_destruct: bool,
}

impl SenderState {
    /// Consumes the state, resuming the sender with success.
    fn ack(mut self) {
        self.wake_on_destruct = false;
        let vm = self.vm.clone();
        let fiber = self.fiber;
        drop(self);
        vm.post_resume_with(fiber, Ok(WakeValue::Unit));
    }

    fn is(&self, vm: &Arc<VmShared>, fiber: FiberId) -> bool {
        Arc::ptr_eq(&self.vm, vm) && self.fiber == fiber
    }
}

impl Drop for SenderState {
    fn drop(&mut self) {
        if !self.wake_on_destruct {
            return;
        }
        self.vm
            .post_resume_with(self.fiber, Err(RuntimeErrorKind::ChannelClosed.into()));
    }
}

pub(crate) struct InboxState {
    pub(crate) recv_fiber: Option<FiberId>,
    pub(crate) incoming: VecDeque<SenderState>,
    pub(crate) open: bool,
    pub(crate) imported: bool,
    /// Held while a receiver is parked so the reactor stays alive.
    pub(crate) guard: Option<WorkGuard>,
}

impl InboxState {
    pub(crate) fn new() -> Self {
        Self {
            recv_fiber: None,
            incoming: VecDeque::new(),
            open: true,
            imported: false,
            guard: None,
        }
    }
}

impl VmContext {
    /// Removes a queued sender, if it is still queued.
    ///
    /// `false` means the message was already consumed (or the queue was
    /// torn down), in which case the consumption owns the sender's wake.
    fn remove_queued_sender(&self, sender: &Arc<VmShared>, fiber: FiberId) -> bool {
        let mut inbox = self.inbox.borrow_mut();
        if let Some(pos) = inbox.incoming.iter().position(|s| s.is(sender, fiber)) {
            let state = inbox.incoming.remove(pos);
            drop(inbox);
            drop(state);
            true
        } else {
            false
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// ActorAddress
////////////////////////////////////////////////////////////////////////////////

/// A handle to a sibling VM's inbox.
///
/// Addresses may live on any thread. The address itself keeps the
/// destination's reactor alive (work guard) but not the destination VM:
/// sending to a closed VM fails with `channel_closed`.
pub struct ActorAddress {
    dest: Weak<VmShared>,
    _guard: WorkGuard,
}

impl std::fmt::Debug for ActorAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorAddress").finish_non_exhaustive()
    }
}

impl ActorAddress {
    fn new(vm: &Rc<VmContext>) -> Self {
        vm.shared.nsenders.fetch_add(1, Ordering::SeqCst);
        Self {
            dest: Arc::downgrade(&vm.shared),
            _guard: vm.shared.work_guard(),
        }
    }

    /// Whether two addresses point at the same inbox.
    pub fn same_destination(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.dest, &other.dest)
    }

    /// Sends `msg`, parking the current fiber until the message is
    /// consumed or the destination closes.
    pub async fn send(&self, msg: impl Into<Value>) -> Result<()> {
        let vm = current_vm();
        vm.check_suspend()?;
        let msg = msg.into().checked()?;

        let dest = match self.dest.upgrade() {
            Some(dest) => dest,
            None => return Err(RuntimeErrorKind::ChannelClosed.into()),
        };

        let sender = vm.shared.clone();
        let fiber = vm.current_fiber();
        // Keeps the sender's reactor alive while the send is in flight.
        let _work = vm.shared.work_guard();

        {
            let sender = sender.clone();
            dest.strand().post_with(move |r, dvm| {
                let dvm = match dvm {
                    Some(dvm) => dvm,
                    None => {
                        sender.post_resume_with(
                            fiber,
                            Err(RuntimeErrorKind::ChannelClosed.into()),
                        );
                        return;
                    }
                };
                let mut msg = Some(msg);
                let staged = {
                    let mut inbox = dvm.inbox.borrow_mut();
                    if !inbox.open {
                        Err(())
                    } else {
                        match inbox.recv_fiber.take() {
                            Some(receiver) => {
                                inbox.guard = None;
                                Ok(Some(receiver))
                            }
                            None => {
                                inbox.incoming.push_back(SenderState {
                                    vm: sender.clone(),
                                    fiber,
                                    msg: msg.take(),
                                    wake_on_destruct: false,
                                });
                                Ok(None)
                            }
                        }
                    }
                };
                match staged {
                    Err(()) => {
                        sender.post_resume_with(
                            fiber,
                            Err(RuntimeErrorKind::ChannelClosed.into()),
                        );
                    }
                    Ok(Some(receiver)) => {
                        // A receiver was parked: feed it directly and
                        // complete the send without queueing.
                        let msg = msg.take().expect("message consumed twice");
                        dvm.set_wake(receiver, Ok(WakeValue::Message(msg)));
                        sender.post_resume_with(fiber, Ok(WakeValue::Unit));
                        dvm.resume(r, receiver);
                    }
                    Ok(None) => {}
                }
            });
        }

        let dest_weak = self.dest.clone();
        let wake = park_with(&vm, move || {
            let dest = dest_weak.clone();
            let sender = sender.clone();
            Box::new(move |_: &Rc<VmContext>| {
                if let Some(dest) = dest.upgrade() {
                    dest.strand().post_with(move |_, dvm| {
                        // A dead destination already woke us through the
                        // queue teardown.
                        if let Some(dvm) = dvm {
                            if dvm.remove_queued_sender(&sender, fiber) {
                                sender.post_resume_with(
                                    fiber,
                                    Err(RuntimeErrorKind::Interrupted.into()),
                                );
                            }
                        }
                    });
                }
            }) as Interrupter
        })
        .await;
        expect_unit(wake)
    }
}

impl Clone for ActorAddress {
    fn clone(&self) -> Self {
        if let Some(dest) = self.dest.upgrade() {
            dest.nsenders.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            dest: self.dest.clone(),
            _guard: self._guard.clone(),
        }
    }
}

impl Drop for ActorAddress {
    fn drop(&mut self) {
        let dest = match self.dest.upgrade() {
            Some(dest) => dest,
            None => return,
        };
        if dest.nsenders.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        // Re-read on the strand: a clone may have revived the count
        // between our decrement and the task running.
        let shared = dest.clone();
        dest.strand().post(move |r, dvm| {
            if shared.nsenders.load(Ordering::SeqCst) != 0 {
                return;
            }
            let receiver = {
                let mut inbox = dvm.inbox.borrow_mut();
                if !inbox.open {
                    return;
                }
                inbox.guard = None;
                inbox.recv_fiber.take()
            };
            if let Some(receiver) = receiver {
                dvm.set_wake(receiver, Err(RuntimeErrorKind::NoSenders.into()));
                dvm.resume(r, receiver);
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// Inbox
////////////////////////////////////////////////////////////////////////////////

/// The receiving half of a VM's message queue.
pub struct Inbox {
    vm: Rc<VmContext>,
}

impl VmContext {
    /// Creates an address for this VM's inbox.
    pub fn address(self: &Rc<Self>) -> ActorAddress {
        ActorAddress::new(self)
    }

    /// Imports the inbox.
    ///
    /// Importing marks the inbox as owned by the program: the main fiber
    /// finishing no longer seals it.
    pub fn inbox(self: &Rc<Self>) -> Inbox {
        self.inbox.borrow_mut().imported = true;
        Inbox { vm: self.clone() }
    }
}

impl Inbox {
    /// Receives the next message, parking while the queue is empty.
    ///
    /// Fails with `no_senders` right away when no address to this inbox
    /// exists anymore, and with `channel_closed` once the inbox is closed
    /// and drained. At most one receiver may be parked at a time.
    pub async fn receive(&self) -> Result<Value> {
        let vm = current_vm();
        if !Rc::ptr_eq(&vm, &self.vm) {
            return Err(Error::invalid_argument("inbox"));
        }
        vm.check_suspend()?;
        let fiber = vm.current_fiber();

        {
            let mut inbox = vm.inbox.borrow_mut();
            if !inbox.open {
                return Err(RuntimeErrorKind::ChannelClosed.into());
            }
            if let Some(mut state) = inbox.incoming.pop_front() {
                drop(inbox);
                let msg = state.msg.take().expect("queued sender without message");
                state.ack();
                return Ok(msg);
            }
            let bridged = vm.ipc_bridge.borrow().is_some();
            if vm.shared.nsenders.load(Ordering::SeqCst) == 0 && !bridged {
                return Err(RuntimeErrorKind::NoSenders.into());
            }
            if inbox.recv_fiber.is_some() {
                return Err(Error::errno(libc::EBUSY));
            }
            inbox.recv_fiber = Some(fiber);
            inbox.guard = Some(vm.shared.work_guard());
        }

        let bridge = vm.ipc_bridge.borrow().clone();
        if let Some(bridge) = bridge {
            bridge.arm(&vm);
        }

        let wake = park_with(&vm, move || {
            Box::new(move |vm: &Rc<VmContext>| {
                let unlinked = {
                    let mut inbox = vm.inbox.borrow_mut();
                    if inbox.recv_fiber == Some(fiber) {
                        inbox.recv_fiber = None;
                        inbox.guard = None;
                        true
                    } else {
                        false
                    }
                };
                if unlinked {
                    vm.set_wake(fiber, Err(RuntimeErrorKind::Interrupted.into()));
                    vm.shared.post_resume(fiber);
                }
            }) as Interrupter
        })
        .await;
        expect_message(wake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;

    #[test]
    fn address_count_tracks_clones() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        let a = vm.address();
        assert_eq!(vm.shared.nsenders.load(Ordering::SeqCst), 1);
        let b = a.clone();
        assert_eq!(vm.shared.nsenders.load(Ordering::SeqCst), 2);
        assert!(a.same_destination(&b));
        drop(a);
        drop(b);
        assert_eq!(vm.shared.nsenders.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn receive_without_senders_fails_immediately() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        let inbox = vm.inbox();
        vm.spawn(async move {
            let err = inbox.receive().await.unwrap_err();
            assert_eq!(err.kind(), Some(RuntimeErrorKind::NoSenders));
            Ok(Vec::new())
        })
        .unwrap();
        reactor.run();
    }

    #[test]
    fn send_to_dropped_vm_fails_with_channel_closed() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        let dest = reactor.new_vm();
        let addr = dest.address();
        dest.close();
        vm.spawn(async move {
            let err = addr.send(Value::from("hi")).await.unwrap_err();
            assert_eq!(err.kind(), Some(RuntimeErrorKind::ChannelClosed));
            Ok(Vec::new())
        })
        .unwrap();
        reactor.run();
    }
}
