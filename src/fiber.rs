//! Cooperative fiber scheduling.
//!
//! A fiber is a cooperatively scheduled unit of work pinned to its VM's
//! strand. Fibers suspend only at explicit points (`yield`, join, inbox
//! send/receive, mutex lock, future get, stream reads/writes, subprocess
//! wait); between suspension points a fiber owns the VM.
//!
//! Cancellation is cooperative: [`JoinHandle::interrupt`] sets a latch
//! and, if the target is parked, fires its one-shot interrupter. The
//! interrupted fiber observes the latch at its next suspension gate (or is
//! resumed with the `interrupted` error by the interrupter); there is no
//! preemption. Code can partition itself into regions via
//! [`disable_interruption`]/[`restore_interruption`] and
//! [`forbid_suspend`]/[`allow_suspend`].

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result, RuntimeErrorKind};
use crate::log;
use crate::reactor::Reactor;
use crate::value::Value;
use crate::vm::{current_vm, CurrentVmGuard, VmContext, VmShared};

pub mod future;
pub mod mutex;
pub(crate) mod wait;

pub use future::{promise, Future as FutureValue, Promise};
pub use mutex::RecursiveMutex;

use wait::{
    expect_unit, expect_values, park_uninterruptible, park_with, CancelSignal, Interrupter, Wake,
    WakeValue,
};

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// Opaque fiber identity, distinct per spawn within a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Registry
////////////////////////////////////////////////////////////////////////////////

pub(crate) type FiberResult = Result<Vec<Value>>;

type FiberBody = Pin<Box<dyn Future<Output = FiberResult>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Joiner {
    /// A live join handle may still claim the result.
    HandleOwned,
    Detached,
    /// A fiber is parked in `join` on this one.
    Waiting(FiberId),
}

/// Control block of one fiber, owned by the VM's registry.
pub(crate) struct FiberEntry {
    body: Option<FiberBody>,
    completion: Option<FiberResult>,
    joiner: Joiner,
    handle: Option<Rc<HandleState>>,

    interruption_disabled: u32,
    suspension_disallowed: u32,
    interrupted: bool,
    pub(crate) interrupter: Option<Interrupter>,
    cancel: Rc<CancelSignal>,

    pub(crate) wake: Option<Wake>,
    local: Option<HashMap<String, Value>>,
    module_path: Option<PathBuf>,
    stacktrace: Option<String>,
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

impl VmContext {
    /// Spawns a fiber and returns the handle that owns it.
    ///
    /// The body is posted for its initial resume; the spawner keeps
    /// running until its own next suspension point.
    pub fn spawn<F>(self: &Rc<Self>, body: F) -> Result<JoinHandle>
    where
        F: Future<Output = FiberResult> + 'static,
    {
        Ok(self.spawn_inner(Box::pin(body), None, false)?.unwrap())
    }

    /// Spawns the VM's main fiber, detached, carrying its module path.
    pub fn spawn_main<F>(self: &Rc<Self>, module: impl Into<PathBuf>, body: F) -> Result<()>
    where
        F: Future<Output = FiberResult> + 'static,
    {
        self.spawn_inner(Box::pin(body), Some(module.into()), true)?;
        Ok(())
    }

    fn spawn_inner(
        self: &Rc<Self>,
        body: FiberBody,
        module_path: Option<PathBuf>,
        detached: bool,
    ) -> Result<Option<JoinHandle>> {
        if !self.is_valid() {
            return Err(Error::VmDead);
        }

        let id = FiberId(self.next_fiber.get());
        self.next_fiber.set(id.0 + 1);

        let cancel = Rc::new(CancelSignal::new());
        let default_interrupter: Interrupter = {
            let cancel = cancel.clone();
            Box::new(move |_: &Rc<VmContext>| cancel.emit())
        };

        let mut entry = FiberEntry {
            body: Some(body),
            completion: None,
            joiner: if detached {
                Joiner::Detached
            } else {
                Joiner::HandleOwned
            },
            handle: None,
            interruption_disabled: 0,
            suspension_disallowed: 0,
            interrupted: false,
            interrupter: Some(default_interrupter),
            cancel,
            wake: None,
            local: None,
            module_path,
            stacktrace: None,
        };

        let handle = if detached {
            None
        } else {
            let state = Rc::new(HandleState {
                vm: Rc::downgrade(self),
                fiber: Cell::new(Some(id)),
                join_in_progress: Cell::new(false),
                interruption_caught: Cell::new(None),
            });
            entry.handle = Some(state.clone());
            Some(JoinHandle { state })
        };

        if entry.module_path.is_some() {
            self.main.set(Some(id));
        }

        self.fibers.borrow_mut().insert(id, entry);
        self.strand().post(move |r, vm| vm.resume(r, id));
        Ok(handle)
    }

    /// The fiber currently being resumed. Panics outside fiber context.
    pub(crate) fn current_fiber(&self) -> FiberId {
        self.current.get().expect("not running inside a fiber")
    }

    pub(crate) fn current_cancel(&self) -> Rc<CancelSignal> {
        let fibers = self.fibers.borrow();
        fibers[&self.current_fiber()].cancel.clone()
    }

    /// Stages a wake payload for `fiber`. First writer wins: a completion
    /// and an interrupter may both try to deliver, and whichever reaches
    /// the slot first is what the fiber observes.
    pub(crate) fn set_wake(&self, fiber: FiberId, wake: Wake) {
        if let Some(entry) = self.fibers.borrow_mut().get_mut(&fiber) {
            if entry.wake.is_none() {
                entry.wake = Some(wake);
            }
        }
    }

    /// The suspension gate. Every operation that may park calls this
    /// before touching any wait queue.
    pub(crate) fn check_suspend(&self) -> Result<()> {
        let fibers = self.fibers.borrow();
        let entry = &fibers[&self.current_fiber()];
        if entry.suspension_disallowed > 0 {
            return Err(RuntimeErrorKind::ForbidSuspendBlock.into());
        }
        if entry.interruption_disabled == 0 && entry.interrupted {
            return Err(RuntimeErrorKind::Interrupted.into());
        }
        Ok(())
    }

    /// Gate flavor for primitives that never install an interrupter and
    /// are used from regions that run with interruption disabled: the
    /// interruption latch is not consulted, the forbid-suspend counter
    /// still is.
    pub(crate) fn check_suspend_assuming_interruption_disabled(&self) -> Result<()> {
        let fibers = self.fibers.borrow();
        let entry = &fibers[&self.current_fiber()];
        if entry.suspension_disallowed > 0 {
            return Err(RuntimeErrorKind::ForbidSuspendBlock.into());
        }
        Ok(())
    }

    /// Resumes `fiber`: prologue (set current, clear the interrupter),
    /// poll, epilogue. Joiner wakeups are driven iteratively so long
    /// `join` chains cannot grow the native stack.
    pub(crate) fn resume(self: &Rc<Self>, reactor: &Reactor, fiber: FiberId) {
        let mut next = Some(fiber);
        while let Some(fiber) = next.take() {
            if !self.is_valid() {
                return;
            }

            let mut body = {
                let mut fibers = self.fibers.borrow_mut();
                let entry = match fibers.get_mut(&fiber) {
                    Some(entry) => entry,
                    None => return,
                };
                if entry.completion.is_some() {
                    return;
                }
                entry.interrupter = None;
                match entry.body.take() {
                    Some(body) => body,
                    None => return,
                }
            };

            let polled = {
                let _vm_guard = CurrentVmGuard::enter(self);
                self.current.set(Some(fiber));
                let waker = Waker::from(Arc::new(FiberWaker {
                    vm: self.shared.clone(),
                    fiber,
                }));
                let mut cx = Context::from_waker(&waker);
                let polled = body.as_mut().poll(&mut cx);
                self.current.set(None);
                polled
            };

            match polled {
                Poll::Pending => {
                    if !self.is_valid() {
                        return;
                    }
                    if let Some(entry) = self.fibers.borrow_mut().get_mut(&fiber) {
                        entry.body = Some(body);
                    }
                    return;
                }
                Poll::Ready(result) => {
                    drop(body);
                    next = self.epilogue(fiber, result);
                }
            }
        }
    }

    /// Handles a finished fiber: the detach/join/error matrix.
    ///
    /// Returns the joiner to resume next, if any.
    fn epilogue(self: &Rc<Self>, fiber: FiberId, result: FiberResult) -> Option<FiberId> {
        if self.mem_exhausted.get() || self.failed_cleanup.get() || self.exit_request.get() {
            self.close();
            return None;
        }

        let is_main = self.main.get() == Some(fiber);

        let joiner = {
            let mut fibers = self.fibers.borrow_mut();
            let entry = fibers.get_mut(&fiber)?;
            if result.is_err() {
                entry.stacktrace = Some(Backtrace::capture().to_string());
            }
            entry.joiner
        };

        match joiner {
            Joiner::Detached => {
                if is_main {
                    // The main fiber is gone; unless the inbox was imported
                    // nobody can receive anymore, so seal it and wake the
                    // queued senders.
                    let sealed = {
                        let mut inbox = self.inbox.borrow_mut();
                        if inbox.imported {
                            None
                        } else {
                            inbox.open = false;
                            inbox.recv_fiber = None;
                            inbox.guard = None;
                            Some(std::mem::take(&mut inbox.incoming))
                        }
                    };
                    if let Some(mut queued) = sealed {
                        for sender in &mut queued {
                            sender.wake_on_destruct = true;
                        }
                        drop(queued);
                    }
                }

                if let Err(e) = &result {
                    let stacktrace = {
                        let fibers = self.fibers.borrow();
                        fibers.get(&fiber).and_then(|e| e.stacktrace.clone())
                    };
                    if !e.is_interrupted() || is_main {
                        log::print_fiber_panic(fiber, is_main, e, stacktrace.as_deref());
                    }
                    if is_main {
                        self.suppress_tail_errors.set(true);
                        self.close();
                        return None;
                    }
                }

                let removed = self.fibers.borrow_mut().remove(&fiber);
                drop(removed);
                None
            }
            Joiner::Waiting(joiner) => {
                let removed = self.fibers.borrow_mut().remove(&fiber);
                let entry = removed?;
                let handle = entry.handle.clone();

                let wake: Wake = match result {
                    Ok(values) => {
                        if let Some(h) = &handle {
                            h.interruption_caught.set(Some(false));
                        }
                        Ok(WakeValue::Values(values))
                    }
                    Err(e) if e.is_interrupted() => {
                        if let Some(h) = &handle {
                            h.interruption_caught.set(Some(true));
                        }
                        Ok(WakeValue::Values(Vec::new()))
                    }
                    Err(e) => {
                        if let Some(h) = &handle {
                            h.interruption_caught.set(Some(false));
                        }
                        Err(e)
                    }
                };

                if let Some(h) = &handle {
                    h.fiber.set(None);
                    h.join_in_progress.set(false);
                }
                drop(entry);

                self.set_wake(joiner, wake);
                Some(joiner)
            }
            Joiner::HandleOwned => {
                let mut fibers = self.fibers.borrow_mut();
                if let Some(entry) = fibers.get_mut(&fiber) {
                    entry.completion = Some(result);
                }
                None
            }
        }
    }
}

impl VmShared {
    /// Posts a bare resume for `fiber` on its strand.
    pub(crate) fn post_resume(self: &Arc<Self>, fiber: FiberId) {
        self.strand().post(move |r, vm| vm.resume(r, fiber));
    }

    /// Posts a resume that stages `wake` right before polling. Producers
    /// that cannot touch the registry synchronously (they run on another
    /// strand) deliver through this.
    pub(crate) fn post_resume_with(self: &Arc<Self>, fiber: FiberId, wake: Wake) {
        self.strand().post(move |r, vm| {
            vm.set_wake(fiber, wake);
            vm.resume(r, fiber);
        });
    }
}

struct FiberWaker {
    vm: Arc<VmShared>,
    fiber: FiberId,
}

impl std::task::Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.vm.post_resume(self.fiber);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.vm.post_resume(self.fiber);
    }
}

////////////////////////////////////////////////////////////////////////////////
// JoinHandle
////////////////////////////////////////////////////////////////////////////////

struct HandleState {
    vm: Weak<VmContext>,
    fiber: Cell<Option<FiberId>>,
    join_in_progress: Cell<bool>,
    interruption_caught: Cell<Option<bool>>,
}

/// An owned permission to join, detach or interrupt a fiber.
///
/// Dropping a handle whose fiber is still live detaches the fiber; after
/// `join` or `detach` the handle is invalidated and every further
/// operation fails with an argument error.
pub struct JoinHandle {
    state: Rc<HandleState>,
}

impl fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("fiber", &self.state.fiber.get())
            .finish_non_exhaustive()
    }
}

impl JoinHandle {
    fn vm(&self) -> Result<Rc<VmContext>> {
        match self.state.vm.upgrade() {
            Some(vm) if vm.is_valid() => Ok(vm),
            _ => Err(Error::invalid_argument("handle")),
        }
    }

    /// Waits for the fiber to finish and claims its results.
    ///
    /// If the fiber finished by interruption the results are empty, no
    /// error propagates and [`interruption_caught`] reads `true`
    /// afterwards. Any other error re-raises here, at the join site.
    ///
    /// [`interruption_caught`]: Self::interruption_caught
    pub async fn join(&self) -> Result<Vec<Value>> {
        let vm = current_vm();
        vm.check_suspend()?;

        match self.state.vm.upgrade() {
            Some(hvm) if Rc::ptr_eq(&hvm, &vm) => {}
            _ => return Err(Error::invalid_argument("handle")),
        }

        let target = match self.state.fiber.get() {
            Some(target) if !self.state.join_in_progress.get() => target,
            _ => return Err(Error::invalid_argument("handle")),
        };

        let current = vm.current_fiber();
        if target == current {
            return Err(Error::errno(libc::EDEADLK));
        }

        let finished = {
            let fibers = vm.fibers.borrow();
            let entry = fibers
                .get(&target)
                .unwrap_or_else(|| unreachable!("live handle points at a dead fiber"));
            entry.completion.is_some()
        };

        if finished {
            let entry = vm.fibers.borrow_mut().remove(&target);
            let entry = entry.expect("checked above");
            self.state.fiber.set(None);
            return match entry.completion.expect("checked above") {
                Ok(values) => {
                    self.state.interruption_caught.set(Some(false));
                    Ok(values)
                }
                Err(e) if e.is_interrupted() => {
                    self.state.interruption_caught.set(Some(true));
                    Ok(Vec::new())
                }
                Err(e) => {
                    self.state.interruption_caught.set(Some(false));
                    Err(e)
                }
            };
        }

        {
            let mut fibers = vm.fibers.borrow_mut();
            let entry = fibers.get_mut(&target).expect("checked above");
            entry.joiner = Joiner::Waiting(current);
        }
        self.state.join_in_progress.set(true);

        let wake = {
            let state = self.state.clone();
            park_with(&vm, move || {
                let state = state.clone();
                Box::new(move |vm: &Rc<VmContext>| {
                    if let Some(entry) = vm.fibers.borrow_mut().get_mut(&target) {
                        entry.joiner = Joiner::HandleOwned;
                    }
                    state.join_in_progress.set(false);
                    vm.set_wake(current, Err(RuntimeErrorKind::Interrupted.into()));
                    vm.shared.post_resume(current);
                }) as Interrupter
            })
            .await
        };
        self.state.join_in_progress.set(false);
        expect_values(wake)
    }

    /// Detaches the fiber: it keeps running, its eventual result is
    /// dropped, and a non-interruption error panics to the log.
    pub fn detach(&self) -> Result<()> {
        let vm = self.vm()?;
        let target = match self.state.fiber.get() {
            Some(target) if !self.state.join_in_progress.get() => target,
            _ => return Err(Error::invalid_argument("handle")),
        };
        Self::detach_inner(&vm, target);
        self.state.fiber.set(None);
        Ok(())
    }

    fn detach_inner(vm: &Rc<VmContext>, target: FiberId) {
        let finished = {
            let fibers = vm.fibers.borrow();
            match fibers.get(&target) {
                Some(entry) => entry.completion.is_some(),
                None => return,
            }
        };
        if finished {
            let entry = vm.fibers.borrow_mut().remove(&target);
            if let Some(entry) = entry {
                if let Some(Err(e)) = &entry.completion {
                    if !e.is_interrupted() {
                        log::print_fiber_panic(target, false, e, entry.stacktrace.as_deref());
                    }
                }
                drop(entry);
            }
        } else {
            let mut fibers = vm.fibers.borrow_mut();
            if let Some(entry) = fibers.get_mut(&target) {
                entry.joiner = Joiner::Detached;
                entry.handle = None;
            }
        }
    }

    /// Requests cooperative cancellation of the fiber.
    ///
    /// Sets the interruption latch; if the fiber is currently parked its
    /// one-shot interrupter fires (the next suspension installs a fresh
    /// one). Interrupting the calling fiber itself only sets the latch.
    pub fn interrupt(&self) -> Result<()> {
        let vm = match self.state.vm.upgrade() {
            Some(vm) if vm.is_valid() => vm,
            _ => return Ok(()),
        };
        let target = match self.state.fiber.get() {
            Some(target) => target,
            None => return Ok(()),
        };
        let interrupter = {
            let mut fibers = vm.fibers.borrow_mut();
            let entry = match fibers.get_mut(&target) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            entry.interrupted = true;
            if vm.current.get() == Some(target) {
                None
            } else {
                entry.interrupter.take()
            }
        };
        if let Some(interrupter) = interrupter {
            interrupter(&vm);
        }
        Ok(())
    }

    /// Whether the last join observed an interruption.
    ///
    /// Unset until the fiber finishes through this handle.
    pub fn interruption_caught(&self) -> Result<bool> {
        self.state
            .interruption_caught
            .get()
            .ok_or_else(|| Error::invalid_argument("handle"))
    }

    pub fn joinable(&self) -> bool {
        self.state.fiber.get().is_some() && !self.state.join_in_progress.get()
    }
}

impl Drop for JoinHandle {
    fn drop(&mut self) {
        if self.state.join_in_progress.get() {
            // Only reachable while the VM is tearing down mid-join.
            return;
        }
        if let Some(target) = self.state.fiber.get() {
            if let Some(vm) = self.state.vm.upgrade() {
                if vm.is_valid() {
                    Self::detach_inner(&vm, target);
                }
            }
            self.state.fiber.set(None);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// this-fiber operations
////////////////////////////////////////////////////////////////////////////////

/// Spawns a fiber on the current fiber's VM.
pub fn spawn<F>(body: F) -> Result<JoinHandle>
where
    F: Future<Output = FiberResult> + 'static,
{
    current_vm().spawn(body)
}

/// Reschedules the current fiber to the tail of the strand and parks.
///
/// Every fiber that is already runnable gets its turn before this one
/// runs again.
pub async fn yield_now() -> Result<()> {
    let vm = current_vm();
    vm.check_suspend()?;
    let fiber = vm.current_fiber();
    vm.shared.post_resume_with(fiber, Ok(WakeValue::Unit));
    expect_unit(park_uninterruptible(&vm).await)
}

fn with_current_entry<R>(f: impl FnOnce(&mut FiberEntry) -> R) -> R {
    let vm = current_vm();
    let fiber = vm.current_fiber();
    let mut fibers = vm.fibers.borrow_mut();
    f(fibers.get_mut(&fiber).expect("current fiber not registered"))
}

/// Enters a region where the interruption latch is ignored.
pub fn disable_interruption() {
    with_current_entry(|entry| {
        entry.interruption_disabled = entry.interruption_disabled.saturating_add(1);
    })
}

/// Leaves a [`disable_interruption`] region. Unbalanced calls fail.
pub fn restore_interruption() -> Result<()> {
    with_current_entry(|entry| {
        if entry.interruption_disabled == 0 {
            return Err(RuntimeErrorKind::InterruptionAlreadyAllowed.into());
        }
        entry.interruption_disabled -= 1;
        Ok(())
    })
}

/// Enters a region where suspending is a logic error.
pub fn forbid_suspend() {
    with_current_entry(|entry| {
        entry.suspension_disallowed = entry.suspension_disallowed.saturating_add(1);
    })
}

/// Leaves a [`forbid_suspend`] region. Unbalanced calls fail.
pub fn allow_suspend() -> Result<()> {
    with_current_entry(|entry| {
        if entry.suspension_disallowed == 0 {
            return Err(RuntimeErrorKind::SuspensionAlreadyAllowed.into());
        }
        entry.suspension_disallowed -= 1;
        Ok(())
    })
}

/// Stores a value in the current fiber's local storage.
pub fn local_set(key: impl Into<String>, value: Value) {
    with_current_entry(|entry| {
        entry
            .local
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
    })
}

/// Reads a value from the current fiber's local storage.
pub fn local_get(key: &str) -> Option<Value> {
    with_current_entry(|entry| entry.local.as_ref().and_then(|map| map.get(key).cloned()))
}

/// `true` iff the current fiber is its VM's main (module) fiber.
pub fn is_main() -> bool {
    let vm = current_vm();
    vm.main.get() == Some(vm.current_fiber())
}

/// The current fiber's identity.
pub fn id() -> FiberId {
    current_vm().current_fiber()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::cell::RefCell;

    fn run_in_fiber(body: impl Future<Output = FiberResult> + 'static) -> FiberResult {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        let out = Rc::new(RefCell::new(None));
        let out2 = out.clone();
        vm.spawn(async move {
            let r = body.await;
            *out2.borrow_mut() = Some(r);
            Ok(Vec::new())
        })
        .unwrap();
        reactor.run();
        Rc::try_unwrap(out)
            .ok()
            .expect("fiber leaked the result cell")
            .into_inner()
            .expect("fiber never ran")
    }

    #[test]
    fn spawn_join_transfers_values() {
        let result = run_in_fiber(async {
            let h = spawn(async { Ok(vec![Value::from("done"), Value::from(7.0)]) })?;
            h.join().await
        });
        assert_eq!(
            result.unwrap(),
            vec![Value::from("done"), Value::from(7.0)]
        );
    }

    #[test]
    fn join_self_is_a_deadlock_error() {
        let result = run_in_fiber(async {
            // Hand the child its own handle through a shared slot.
            let slot: Rc<RefCell<Option<JoinHandle>>> = Rc::new(RefCell::new(None));
            let slot2 = slot.clone();
            let child = spawn(async move {
                loop {
                    if let Some(own) = slot2.borrow_mut().take() {
                        let err = own.join().await.unwrap_err();
                        assert_eq!(err.os_error(), Some(libc::EDEADLK));
                        return Ok(Vec::new());
                    }
                    yield_now().await?;
                }
            })?;
            *slot.borrow_mut() = Some(child);
            Ok(Vec::new())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn forbid_suspend_blocks_yield() {
        let result = run_in_fiber(async {
            forbid_suspend();
            let err = yield_now().await.unwrap_err();
            assert_eq!(err.kind(), Some(RuntimeErrorKind::ForbidSuspendBlock));
            allow_suspend()?;
            yield_now().await?;
            Ok(Vec::new())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn counters_balance_round_trips() {
        let result = run_in_fiber(async {
            disable_interruption();
            disable_interruption();
            restore_interruption()?;
            restore_interruption()?;
            let err = restore_interruption().unwrap_err();
            assert_eq!(
                err.kind(),
                Some(RuntimeErrorKind::InterruptionAlreadyAllowed)
            );
            let err = allow_suspend().unwrap_err();
            assert_eq!(err.kind(), Some(RuntimeErrorKind::SuspensionAlreadyAllowed));
            Ok(Vec::new())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn local_storage_is_lazy_and_private() {
        let result = run_in_fiber(async {
            assert_eq!(local_get("k"), None);
            local_set("k", Value::from(1.0));
            let h = spawn(async {
                assert_eq!(local_get("k"), None);
                local_set("k", Value::from(2.0));
                Ok(Vec::new())
            })?;
            h.join().await?;
            assert_eq!(local_get("k"), Some(Value::from(1.0)));
            Ok(Vec::new())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn exit_request_closes_the_vm_at_the_next_epilogue() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        let vm2 = vm.clone();
        vm.spawn(async move {
            vm2.notify_exit_request();
            Ok(Vec::new())
        })
        .unwrap();
        reactor.run();
        assert!(!vm.is_valid());
    }

    #[test]
    fn detach_of_finished_ok_fiber_is_silent() {
        let result = run_in_fiber(async {
            let h = spawn(async { Ok(Vec::new()) })?;
            yield_now().await?;
            assert!(h.joinable());
            h.detach()?;
            assert!(!h.joinable());
            assert!(h.detach().is_err());
            Ok(Vec::new())
        });
        assert!(result.is_ok());
    }
}
