//! A recursive mutex for fibers of one VM.
//!
//! Unlike an RAII lock this mirrors the script-facing object: `lock`,
//! `try_lock` and `unlock` are explicit, unlock by a non-owner is an
//! error, and re-locking by the owner nests up to the counter's width.
//!
//! Lock acquisition is deliberately **not** cancellable: no interrupter
//! is installed while parked, so a fiber holding critical invariants is
//! never yanked out of the queue half-way. The suspension gate still
//! applies in its interruption-disabled flavor: parking inside a
//! forbid-suspend region stays a logic error.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::fiber::wait::{expect_unit, park_uninterruptible, WaitQueue, WakeValue};
use crate::fiber::FiberId;
use crate::vm::{current_vm, VmContext};

pub struct RecursiveMutex {
    owner: Cell<Option<FiberId>>,
    depth: Cell<usize>,
    pending: RefCell<WaitQueue>,
    /// The VM the parked waiters belong to; set lazily on first
    /// contention, read for the shutdown deadlock diagnostic.
    vm: RefCell<Option<Weak<VmContext>>>,
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RecursiveMutex {
    pub fn new() -> Self {
        Self {
            owner: Cell::new(None),
            depth: Cell::new(0),
            pending: RefCell::new(WaitQueue::new()),
            vm: RefCell::new(None),
        }
    }

    /// Acquires the mutex, parking the fiber while another one owns it.
    ///
    /// Nested acquisition by the owner increments the depth; overflowing
    /// it fails with `EOVERFLOW`.
    pub async fn lock(&self) -> Result<()> {
        let vm = current_vm();
        vm.check_suspend_assuming_interruption_disabled()?;
        let current = vm.current_fiber();

        match self.owner.get() {
            None => {
                debug_assert_eq!(self.depth.get(), 0);
                self.owner.set(Some(current));
                self.depth.set(1);
                Ok(())
            }
            Some(owner) if owner == current => self.relock(),
            Some(_) => {
                self.pending.borrow_mut().push(current);
                *self.vm.borrow_mut() = Some(Rc::downgrade(&vm));
                // Woken only by `unlock`, which already transferred
                // ownership to us with depth 1.
                expect_unit(park_uninterruptible(&vm).await)
            }
        }
    }

    /// Like [`lock`](Self::lock) but returns `false` instead of parking.
    pub fn try_lock(&self) -> Result<bool> {
        let vm = current_vm();
        let current = vm.current_fiber();
        match self.owner.get() {
            None => {
                debug_assert_eq!(self.depth.get(), 0);
                self.owner.set(Some(current));
                self.depth.set(1);
                Ok(true)
            }
            Some(owner) if owner == current => self.relock().map(|_| true),
            Some(_) => Ok(false),
        }
    }

    fn relock(&self) -> Result<()> {
        let depth = self.depth.get();
        if depth == usize::MAX {
            return Err(Error::errno(libc::EOVERFLOW));
        }
        self.depth.set(depth + 1);
        Ok(())
    }

    /// Releases one level of ownership.
    ///
    /// Only the owner may unlock. Dropping the last level promotes the
    /// head of the wait queue to owner with depth 1 and posts its resume.
    pub fn unlock(&self) -> Result<()> {
        let vm = current_vm();
        let current = vm.current_fiber();

        if self.owner.get() != Some(current) {
            return Err(Error::errno(libc::EPERM));
        }

        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth != 0 {
            return Ok(());
        }

        match self.pending.borrow_mut().pop() {
            Some(next) => {
                self.owner.set(Some(next));
                self.depth.set(1);
                vm.shared.post_resume_with(next, Ok(WakeValue::Unit));
            }
            None => self.owner.set(None),
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.owner.get().is_some()
    }
}

impl Drop for RecursiveMutex {
    fn drop(&mut self) {
        let waiters = self.pending.borrow().len();
        if waiters == 0 {
            return;
        }
        if let Some(vm) = self.vm.borrow().as_ref().and_then(Weak::upgrade) {
            vm.notify_deadlock(format!(
                "recursive mutex destroyed with {} parked waiter(s)",
                waiters
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::{fiber, Value};

    #[test]
    fn owner_depth_invariant_and_foreign_unlock() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        vm.spawn(async {
            let m = Rc::new(RecursiveMutex::new());
            assert!(!m.is_locked());
            m.lock().await?;
            m.lock().await?;
            assert!(m.is_locked());
            m.unlock()?;
            assert!(m.is_locked());

            let m2 = m.clone();
            let h = fiber::spawn(async move {
                // Not the owner: unlocking is not permitted.
                let err = m2.unlock().unwrap_err();
                assert_eq!(err.os_error(), Some(libc::EPERM));
                Ok(Vec::new())
            })?;
            h.join().await?;

            m.unlock()?;
            assert!(!m.is_locked());
            Ok(Vec::<Value>::new())
        })
        .unwrap();
        reactor.run();
    }

    #[test]
    fn try_lock_does_not_park() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        vm.spawn(async {
            let m = Rc::new(RecursiveMutex::new());
            m.lock().await?;

            let m2 = m.clone();
            let h = fiber::spawn(async move {
                assert_eq!(m2.try_lock()?, false);
                Ok(Vec::new())
            })?;
            h.join().await?;

            assert_eq!(m.try_lock()?, true); // recursive
            m.unlock()?;
            m.unlock()?;
            Ok(Vec::new())
        })
        .unwrap();
        reactor.run();
    }
}
