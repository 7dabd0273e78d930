//! Future/promise: a one-shot slot with fiber-parking readers.
//!
//! [`promise`] creates a linked pair sharing one state. Terminal states
//! are sticky: exactly one of `set_value`, `set_error` or breaking the
//! promise (dropping it while empty) decides the outcome, and every
//! `get` thereafter observes the same result. Waiters park with an
//! interrupter that unlinks them from the waiter queue; when the
//! completion races ahead of the interrupter the completion wins.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::error::{Error, Result, RuntimeErrorKind};
use crate::fiber::wait::{expect_unit, park_with, Interrupter, WaitQueue, WakeValue};
use crate::vm::{current_vm, VmContext};

enum State<T> {
    Empty,
    Broken,
    Value(T),
    Error(Arc<Error>),
}

struct Shared<T> {
    state: RefCell<State<T>>,
    waiters: RefCell<WaitQueue>,
    /// The VM of the parked waiters; set on first park, used both for
    /// posting wakeups and for the shutdown deadlock diagnostic.
    vm: RefCell<Option<Weak<VmContext>>>,
}

impl<T> Shared<T> {
    fn wake_all(&self) {
        let vm = match self.vm.borrow().as_ref().and_then(Weak::upgrade) {
            Some(vm) => vm,
            None => return,
        };
        let mut waiters = self.waiters.borrow_mut();
        for fiber in waiters.drain() {
            vm.shared.post_resume_with(fiber, Ok(WakeValue::Unit));
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let waiters = self.waiters.borrow().len();
        if waiters == 0 {
            return;
        }
        // Only reachable while the VM tears down fibers wholesale.
        if let Some(vm) = self.vm.borrow().as_ref().and_then(Weak::upgrade) {
            vm.notify_deadlock(format!(
                "future destroyed with {} parked waiter(s)",
                waiters
            ));
        }
    }
}

/// Creates a linked promise/future pair.
pub fn promise<T>() -> (Promise<T>, Future<T>) {
    let shared = Rc::new(Shared {
        state: RefCell::new(State::Empty),
        waiters: RefCell::new(WaitQueue::new()),
        vm: RefCell::new(None),
    });
    (
        Promise {
            shared: shared.clone(),
        },
        Future { shared },
    )
}

////////////////////////////////////////////////////////////////////////////////
// Promise
////////////////////////////////////////////////////////////////////////////////

/// The producer half. Dropping it while the state is still empty breaks
/// the promise and wakes every waiter with `broken_promise`.
pub struct Promise<T> {
    shared: Rc<Shared<T>>,
}

impl<T> Promise<T> {
    pub fn set_value(&self, value: T) -> Result<()> {
        {
            let mut state = self.shared.state.borrow_mut();
            match &*state {
                State::Empty => *state = State::Value(value),
                _ => return Err(RuntimeErrorKind::PromiseAlreadySatisfied.into()),
            }
        }
        self.shared.wake_all();
        Ok(())
    }

    pub fn set_error(&self, error: Error) -> Result<()> {
        {
            let mut state = self.shared.state.borrow_mut();
            match &*state {
                State::Empty => *state = State::Error(Arc::new(error)),
                _ => return Err(RuntimeErrorKind::PromiseAlreadySatisfied.into()),
            }
        }
        self.shared.wake_all();
        Ok(())
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.borrow_mut();
            match &*state {
                State::Empty => *state = State::Broken,
                _ => return,
            }
        }
        self.shared.wake_all();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Future
////////////////////////////////////////////////////////////////////////////////

/// The consumer half. Clonable; every clone observes the same outcome.
pub struct Future<T> {
    shared: Rc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + 'static> Future<T> {
    /// Waits for the shared state to terminalize.
    ///
    /// Interruptible: the waiter unlinks itself and resumes with
    /// `interrupted`; if the completion raced ahead the completion wins.
    pub async fn get(&self) -> Result<T> {
        let vm = current_vm();
        vm.check_suspend()?;

        loop {
            if let Some(outcome) = self.try_get()? {
                return Ok(outcome);
            }

            let fiber = vm.current_fiber();
            self.shared.waiters.borrow_mut().push(fiber);
            *self.shared.vm.borrow_mut() = Some(Rc::downgrade(&vm));

            let shared = self.shared.clone();
            let wake = park_with(&vm, move || {
                let shared = shared.clone();
                Box::new(move |vm: &Rc<VmContext>| {
                    if shared.waiters.borrow_mut().remove(fiber) {
                        vm.set_wake(fiber, Err(RuntimeErrorKind::Interrupted.into()));
                        vm.shared.post_resume(fiber);
                    }
                }) as Interrupter
            })
            .await;
            expect_unit(wake)?;
        }
    }

    /// Non-parking read: `Ok(None)` while the state is still empty.
    pub fn try_get(&self) -> Result<Option<T>> {
        match &*self.shared.state.borrow() {
            State::Empty => Ok(None),
            State::Broken => Err(RuntimeErrorKind::BrokenPromise.into()),
            State::Value(v) => Ok(Some(v.clone())),
            State::Error(e) => Err(Error::Shared(e.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::{fiber, Value};

    #[test]
    fn terminal_states_are_sticky() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        vm.spawn(async {
            let (p, f) = promise::<Value>();
            p.set_value(Value::from(1.0))?;
            let err = p.set_value(Value::from(2.0)).unwrap_err();
            assert_eq!(err.kind(), Some(RuntimeErrorKind::PromiseAlreadySatisfied));
            let err = p.set_error(Error::invalid_argument("x")).unwrap_err();
            assert_eq!(err.kind(), Some(RuntimeErrorKind::PromiseAlreadySatisfied));
            assert_eq!(f.get().await?, Value::from(1.0));
            assert_eq!(f.get().await?, Value::from(1.0));
            Ok(Vec::new())
        })
        .unwrap();
        reactor.run();
    }

    #[test]
    fn broken_promise_wakes_parked_getter() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        vm.spawn(async {
            let (p, f) = promise::<Value>();
            let f2 = f.clone();
            let h = fiber::spawn(async move {
                let err = f2.get().await.unwrap_err();
                assert_eq!(err.kind(), Some(RuntimeErrorKind::BrokenPromise));
                Ok(Vec::new())
            })?;
            fiber::yield_now().await?; // let the getter park
            drop(p);
            h.join().await?;
            Ok(Vec::new())
        })
        .unwrap();
        reactor.run();
    }

    #[test]
    fn error_payload_is_shared_between_getters() {
        let reactor = Reactor::new().unwrap();
        let vm = reactor.new_vm();
        vm.spawn(async {
            let (p, f) = promise::<Value>();
            p.set_error(Error::errno(libc::ENOENT))?;
            let a = f.get().await.unwrap_err();
            let b = f.get().await.unwrap_err();
            assert_eq!(a.os_error(), Some(libc::ENOENT));
            assert_eq!(b.os_error(), Some(libc::ENOENT));
            Ok(Vec::new())
        })
        .unwrap();
        reactor.run();
    }
}
