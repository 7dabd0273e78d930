//! VM context: the unit every fiber, inbox and pending operation belongs
//! to.
//!
//! A [`VmContext`] is strand-local: every mutation of its state happens on
//! the reactor thread it is pinned to, and every cross-thread notification
//! re-enters through a strand post. The cross-thread face of a VM is
//! [`VmShared`], which carries only thread-safe state (the strand handle
//! and the atomic live-sender count of the inbox).
//!
//! Closing a VM is terminal: pending operations are cancelled, the inbox
//! is drained with every queued sender flagged for a closed-channel
//! wakeup, the fiber table is dropped, and no resume may happen
//! afterwards.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::actor::InboxState;
use crate::fiber::{FiberEntry, FiberId};
use crate::log;
use crate::reactor::{ReactorShared, Strand, WorkGuard};

////////////////////////////////////////////////////////////////////////////////
// VmId
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(pub(crate) u64);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// VmShared
////////////////////////////////////////////////////////////////////////////////

/// The part of a VM that may be referenced from arbitrary threads.
pub(crate) struct VmShared {
    pub(crate) id: VmId,
    pub(crate) reactor: Arc<ReactorShared>,
    /// Live actor-address count. Atomic because addresses travel across
    /// reactor threads; every transition to zero is re-checked on the
    /// strand before the receiver is woken with `no_senders`.
    pub(crate) nsenders: AtomicUsize,
}

impl VmShared {
    pub(crate) fn new(id: VmId, reactor: Arc<ReactorShared>) -> Self {
        Self {
            id,
            reactor,
            nsenders: AtomicUsize::new(0),
        }
    }

    pub(crate) fn strand(&self) -> Strand {
        Strand {
            reactor: self.reactor.clone(),
            vm: self.id,
        }
    }

    pub(crate) fn work_guard(&self) -> WorkGuard {
        WorkGuard::new(self.reactor.clone())
    }
}

////////////////////////////////////////////////////////////////////////////////
// PendingOperation
////////////////////////////////////////////////////////////////////////////////

/// A cancellable background resource owned by a VM.
///
/// Registered operations are cancelled en masse when the VM closes. An
/// operation that completes on its own deregisters itself.
pub(crate) trait PendingOperation {
    fn cancel(&self);
}

////////////////////////////////////////////////////////////////////////////////
// VmContext
////////////////////////////////////////////////////////////////////////////////

pub struct VmContext {
    pub(crate) shared: Arc<VmShared>,

    pub(crate) fibers: RefCell<HashMap<FiberId, FiberEntry>>,
    pub(crate) next_fiber: Cell<u64>,
    pub(crate) current: Cell<Option<FiberId>>,
    pub(crate) main: Cell<Option<FiberId>>,

    pub(crate) inbox: RefCell<InboxState>,
    /// Feeds the inbox from a seqpacket endpoint, if this VM is an IPC
    /// actor.
    pub(crate) ipc_bridge: RefCell<Option<Rc<crate::actor::ipc::InboxBridge>>>,

    pending: RefCell<HashMap<u64, Rc<dyn PendingOperation>>>,
    next_pending: Cell<u64>,

    valid: Cell<bool>,
    pub(crate) mem_exhausted: Cell<bool>,
    pub(crate) exit_request: Cell<bool>,
    pub(crate) suppress_tail_errors: Cell<bool>,
    pub(crate) failed_cleanup: Cell<bool>,
    deadlock_errors: RefCell<Vec<String>>,
}

impl VmContext {
    pub(crate) fn new(shared: Arc<VmShared>) -> Rc<Self> {
        Rc::new(Self {
            shared,
            fibers: RefCell::new(HashMap::new()),
            next_fiber: Cell::new(1),
            current: Cell::new(None),
            main: Cell::new(None),
            inbox: RefCell::new(InboxState::new()),
            ipc_bridge: RefCell::new(None),
            pending: RefCell::new(HashMap::new()),
            next_pending: Cell::new(1),
            valid: Cell::new(true),
            mem_exhausted: Cell::new(false),
            exit_request: Cell::new(false),
            suppress_tail_errors: Cell::new(false),
            failed_cleanup: Cell::new(false),
            deadlock_errors: RefCell::new(Vec::new()),
        })
    }

    pub fn id(&self) -> VmId {
        self.shared.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid.get()
    }

    pub(crate) fn strand(&self) -> Strand {
        self.shared.strand()
    }

    /// Latches the memory-exhaustion flag; the next epilogue closes the VM.
    pub fn notify_errmem(&self) {
        self.mem_exhausted.set(true);
    }

    /// Requests cooperative shutdown; honored by the next epilogue.
    pub fn notify_exit_request(&self) {
        self.exit_request.set(true);
    }

    /// Records a possible-deadlock diagnostic printed at close.
    pub fn notify_deadlock(&self, msg: String) {
        self.deadlock_errors.borrow_mut().push(msg);
    }

    /// Records that a cleanup handler raised; the next epilogue closes the
    /// VM after printing a diagnostic.
    pub fn notify_cleanup_error(&self) {
        self.failed_cleanup.set(true);
    }

    pub(crate) fn register_pending(&self, op: Rc<dyn PendingOperation>) -> u64 {
        let id = self.next_pending.get();
        self.next_pending.set(id + 1);
        self.pending.borrow_mut().insert(id, op);
        id
    }

    pub(crate) fn deregister_pending(&self, id: u64) -> Option<Rc<dyn PendingOperation>> {
        self.pending.borrow_mut().remove(&id)
    }

    /// Closes the VM.
    ///
    /// Idempotent. Cancels every pending operation, drains the inbox
    /// (queued senders are woken with `channel_closed`), drops the fiber
    /// table and prints the tail diagnostics unless suppressed.
    pub fn close(&self) {
        if !self.valid.get() {
            return;
        }

        if self.mem_exhausted.get() {
            log::print_vm_errmem(self.shared.id);
            self.suppress_tail_errors.set(true);
        }

        self.valid.set(false);

        // Take the fiber table out before dropping it: fiber bodies own
        // join handles and addresses whose destructors re-enter the
        // registry.
        let fibers = std::mem::take(&mut *self.fibers.borrow_mut());
        drop(fibers);

        {
            let mut inbox = self.inbox.borrow_mut();
            inbox.recv_fiber = None;
            inbox.open = false;
            inbox.guard = None;
            let mut queued = std::mem::take(&mut inbox.incoming);
            drop(inbox);
            for sender in &mut queued {
                sender.wake_on_destruct = true;
            }
            // Dropping the queue posts the closed-channel wakeups.
            drop(queued);
        }

        self.ipc_bridge.borrow_mut().take();

        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        for (_, op) in pending {
            op.cancel();
        }

        if !self.suppress_tail_errors.get() && self.failed_cleanup.get() {
            log::print_cleanup_error(self.shared.id);
            self.suppress_tail_errors.set(true);
        }

        if !self.suppress_tail_errors.get() {
            let errors = std::mem::take(&mut *self.deadlock_errors.borrow_mut());
            if !errors.is_empty() {
                log::print_deadlocks(self.shared.id, &errors);
            }
        }
    }
}

impl Drop for VmContext {
    fn drop(&mut self) {
        if self.valid.get() {
            self.close();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Current VM
////////////////////////////////////////////////////////////////////////////////

thread_local! {
    static CURRENT_VM: RefCell<Option<Rc<VmContext>>> = RefCell::new(None);
}

/// The VM whose fiber is currently being resumed on this thread.
///
/// Panics outside fiber context; the free functions of [`crate::fiber`]
/// and the suspending primitives may only be called from within a fiber.
pub(crate) fn current_vm() -> Rc<VmContext> {
    try_current_vm().expect("not running inside a fiber")
}

pub(crate) fn try_current_vm() -> Option<Rc<VmContext>> {
    CURRENT_VM.with(|c| c.borrow().clone())
}

pub(crate) struct CurrentVmGuard {
    prev: Option<Rc<VmContext>>,
}

impl CurrentVmGuard {
    pub(crate) fn enter(vm: &Rc<VmContext>) -> Self {
        CURRENT_VM.with(|c| Self {
            prev: c.borrow_mut().replace(vm.clone()),
        })
    }
}

impl Drop for CurrentVmGuard {
    fn drop(&mut self) {
        CURRENT_VM.with(|c| *c.borrow_mut() = self.prev.take());
    }
}
