//! Parking primitives shared by every suspending operation.
//!
//! The scheduler's wait contract is uniform: an operation that may block
//! stores per-waiter identity somewhere (its own queue, the inbox's
//! receiver slot, a joiner link), installs a one-shot interrupter and
//! parks. The producer side hands the fiber its wake payload through
//! [`crate::vm::VmContext`]'s registry (first writer wins) and posts a
//! resume on the strand. An interrupter unlinks the waiter from its queue
//! *synchronously* (it runs on the strand, so it cannot race the
//! producer) and only then stages the `interrupted` wake; this is what
//! guarantees that a fiber is woken exactly once per suspension.
//!
//! A fiber occupies exactly one suspension point at a time: the wake
//! slot lives in the fiber's control block, so the crate's suspending
//! operations must be awaited directly, never raced through future
//! combinators within one fiber. Concurrency is expressed by spawning
//! fibers, not by joining futures.

use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::FusedFuture;

use crate::error::Error;
use crate::fiber::FiberId;
use crate::value::Value;
use crate::vm::VmContext;

////////////////////////////////////////////////////////////////////////////////
// Wake
////////////////////////////////////////////////////////////////////////////////

/// The payload a parked fiber is resumed with.
#[derive(Debug)]
pub(crate) enum WakeValue {
    Unit,
    Message(Value),
    Values(Vec<Value>),
}

pub(crate) type Wake = std::result::Result<WakeValue, Error>;

pub(crate) fn expect_unit(wake: Wake) -> crate::Result<()> {
    match wake? {
        WakeValue::Unit => Ok(()),
        other => unreachable!("operation parked for a unit wake, got {:?}", other),
    }
}

pub(crate) fn expect_message(wake: Wake) -> crate::Result<Value> {
    match wake? {
        WakeValue::Message(v) => Ok(v),
        other => unreachable!("operation parked for a message wake, got {:?}", other),
    }
}

pub(crate) fn expect_values(wake: Wake) -> crate::Result<Vec<Value>> {
    match wake? {
        WakeValue::Values(v) => Ok(v),
        other => unreachable!("operation parked for a values wake, got {:?}", other),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Interrupter
////////////////////////////////////////////////////////////////////////////////

/// A one-shot closure that cancels whatever the fiber is parked on.
///
/// At most one is installed per suspension point; the scheduler clears it
/// on every resume and the operation that next parks installs a fresh one.
pub(crate) type Interrupter = Box<dyn FnOnce(&Rc<VmContext>)>;

/// The slot composable asynchronous operations bind to.
///
/// The canonical (default) interrupter of a fiber does nothing but fire
/// this signal; an operation that is cancellable through the reactor
/// (readiness wait, subprocess wait) binds a handler that withdraws the
/// outstanding watch and stages the `interrupted` wake.
#[derive(Default)]
pub(crate) struct CancelSignal {
    handler: Cell<Option<Box<dyn FnOnce()>>>,
}

impl CancelSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn emit(&self) {
        if let Some(handler) = self.handler.take() {
            handler();
        }
    }

    pub(crate) fn bind(&self, handler: Box<dyn FnOnce()>) {
        self.handler.set(Some(handler));
    }

    pub(crate) fn clear(&self) {
        self.handler.take();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Park
////////////////////////////////////////////////////////////////////////////////

/// The leaf future of every suspension point.
///
/// Completes once the fiber's wake slot is filled. While pending it
/// (re-)installs the operation's interrupter, which the scheduler clears
/// on each resume, including spurious ones, so the interrupter stays
/// armed for exactly the spans the fiber actually spends parked here.
pub(crate) struct Park<M> {
    vm: Rc<VmContext>,
    fiber: FiberId,
    mk_interrupter: Option<M>,
    done: bool,
}

impl<M> Unpin for Park<M> {}

impl<M> Future for Park<M>
where
    M: Fn() -> Interrupter,
{
    type Output = Wake;

    fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut fibers = this.vm.fibers.borrow_mut();
        let entry = match fibers.get_mut(&this.fiber) {
            Some(entry) => entry,
            // VM is tearing down; the body owning us is about to be
            // dropped, nothing will ever poll again.
            None => return Poll::Pending,
        };
        if let Some(wake) = entry.wake.take() {
            this.done = true;
            return Poll::Ready(wake);
        }
        if let Some(mk) = &this.mk_interrupter {
            entry.interrupter = Some(mk());
        }
        Poll::Pending
    }
}

impl<M> FusedFuture for Park<M>
where
    M: Fn() -> Interrupter,
{
    fn is_terminated(&self) -> bool {
        self.done
    }
}

/// Parks the current fiber with an operation-specific interrupter.
pub(crate) fn park_with<M>(vm: &Rc<VmContext>, mk_interrupter: M) -> Park<M>
where
    M: Fn() -> Interrupter,
{
    Park {
        vm: vm.clone(),
        fiber: vm.current_fiber(),
        mk_interrupter: Some(mk_interrupter),
        done: false,
    }
}

/// Parks the current fiber without installing any interrupter.
///
/// Used by primitives whose acquisition is not cancellable (recursive
/// mutex) and by `yield`, whose resume is already staged.
pub(crate) fn park_uninterruptible(vm: &Rc<VmContext>) -> Park<fn() -> Interrupter> {
    Park {
        vm: vm.clone(),
        fiber: vm.current_fiber(),
        mk_interrupter: None,
        done: false,
    }
}

/// Parks the current fiber with the default emit-signal interrupter.
pub(crate) fn park_default(vm: &Rc<VmContext>) -> Park<impl Fn() -> Interrupter> {
    let cancel = vm.current_cancel();
    Park {
        vm: vm.clone(),
        fiber: vm.current_fiber(),
        mk_interrupter: Some(move || {
            let cancel = cancel.clone();
            Box::new(move |_: &Rc<VmContext>| cancel.emit()) as Interrupter
        }),
        done: false,
    }
}

////////////////////////////////////////////////////////////////////////////////
// WaitQueue
////////////////////////////////////////////////////////////////////////////////

/// FIFO of parked fiber identities.
///
/// The one wait-queue shape shared by the recursive mutex and the future:
/// producers pop from the head and post resumes; interrupters remove their
/// own fiber and report whether it was still queued (a `false` answer
/// means the completion raced ahead and owns the wake).
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    queue: VecDeque<FiberId>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, fiber: FiberId) {
        self.queue.push_back(fiber);
    }

    pub(crate) fn pop(&mut self) -> Option<FiberId> {
        self.queue.pop_front()
    }

    pub(crate) fn remove(&mut self, fiber: FiberId) -> bool {
        if let Some(pos) = self.queue.iter().position(|f| *f == fiber) {
            self.queue.remove(pos);
            true
        } else {
            false
        }
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = FiberId> + '_ {
        self.queue.drain(..)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_queue_is_fifo_and_supports_removal() {
        let mut q = WaitQueue::new();
        q.push(FiberId(1));
        q.push(FiberId(2));
        q.push(FiberId(3));
        assert!(q.remove(FiberId(2)));
        assert!(!q.remove(FiberId(2)));
        assert_eq!(q.pop(), Some(FiberId(1)));
        assert_eq!(q.pop(), Some(FiberId(3)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn cancel_signal_is_one_shot() {
        let hits = Rc::new(Cell::new(0));
        let signal = CancelSignal::new();
        let h = hits.clone();
        signal.bind(Box::new(move || h.set(h.get() + 1)));
        signal.emit();
        signal.emit();
        assert_eq!(hits.get(), 1);
    }
}
