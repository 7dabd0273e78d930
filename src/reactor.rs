//! The per-thread event loop every VM is pinned to.
//!
//! A [`Reactor`] owns three things: a FIFO queue of posted tasks (the
//! backing store of every VM's *strand*), a table of single-shot file
//! descriptor watchers multiplexed through `poll(2)`, and the table of VMs
//! living on this thread. Cross-thread callers (actor addresses, wakers)
//! enqueue tasks through [`ReactorShared`] and kick the loop with a
//! self-pipe write.
//!
//! Ordering contract: tasks posted to the same strand run in post order
//! and never concurrently (trivially, since one thread drains one
//! queue). Yielding fibers re-post themselves through the same queue, so
//! a yield always lets every already-runnable fiber take its turn first.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::vm::{VmContext, VmId, VmShared};

bitflags::bitflags! {
    /// Readiness interest for a watcher.
    pub struct Interest: libc::c_short {
        const READABLE = libc::POLLIN;
        const WRITABLE = libc::POLLOUT;
    }
}

/// A task posted from an arbitrary thread.
pub(crate) type Task = Box<dyn FnOnce(&Reactor) + Send>;

/// A watcher callback; never leaves the reactor thread.
type LocalTask = Box<dyn FnOnce(&Reactor)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WatchId(u64);

struct Watcher {
    fd: RawFd,
    interest: Interest,
    callback: LocalTask,
}

////////////////////////////////////////////////////////////////////////////////
// ReactorShared
////////////////////////////////////////////////////////////////////////////////

/// The cross-thread face of a reactor.
pub(crate) struct ReactorShared {
    queue: Mutex<VecDeque<Task>>,
    wake_tx: OwnedFd,
    work: AtomicUsize,
    next_vm: AtomicU64,
}

impl ReactorShared {
    pub(crate) fn post(&self, task: Task) {
        self.queue.lock().expect("reactor queue poisoned").push_back(task);
        self.wake();
    }

    fn wake(&self) {
        let byte = [1u8];
        // EAGAIN means the loop is already signalled more than enough.
        unsafe { libc::write(self.wake_tx.as_raw_fd(), byte.as_ptr().cast(), 1) };
    }
}

/// Keeps the reactor loop alive while a suspended operation is the only
/// thing referencing it.
pub(crate) struct WorkGuard {
    shared: Arc<ReactorShared>,
}

impl WorkGuard {
    pub(crate) fn new(shared: Arc<ReactorShared>) -> Self {
        shared.work.fetch_add(1, Ordering::Relaxed);
        Self { shared }
    }
}

impl Clone for WorkGuard {
    fn clone(&self) -> Self {
        Self::new(self.shared.clone())
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.shared.work.fetch_sub(1, Ordering::Relaxed) == 1 {
            // The loop may be sleeping on an empty poll set.
            self.shared.wake();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Strand
////////////////////////////////////////////////////////////////////////////////

/// A VM's serial executor: a filter over the owning reactor's queue.
///
/// Handlers posted through the same strand never run concurrently and run
/// in post order. A strand outlives its VM; tasks posted after the VM
/// closed are dropped (no resume may happen past `close`).
#[derive(Clone)]
pub(crate) struct Strand {
    pub(crate) reactor: Arc<ReactorShared>,
    pub(crate) vm: VmId,
}

impl Strand {
    /// Posts a task that runs only if the VM is still alive and valid.
    pub(crate) fn post<F>(&self, f: F)
    where
        F: FnOnce(&Reactor, &Rc<VmContext>) + Send + 'static,
    {
        let id = self.vm;
        self.reactor.post(Box::new(move |r| {
            if let Some(vm) = r.vm(id) {
                if vm.is_valid() {
                    f(r, &vm);
                }
            }
        }));
    }

    /// Posts a task that observes VM death instead of being dropped by it.
    pub(crate) fn post_with<F>(&self, f: F)
    where
        F: FnOnce(&Reactor, Option<Rc<VmContext>>) + Send + 'static,
    {
        let id = self.vm;
        self.reactor.post(Box::new(move |r| {
            let vm = r.vm(id).filter(|vm| vm.is_valid());
            f(r, vm);
        }));
    }
}

////////////////////////////////////////////////////////////////////////////////
// Reactor
////////////////////////////////////////////////////////////////////////////////

thread_local! {
    static ACTIVE: Cell<*const Reactor> = Cell::new(ptr::null());
}

pub struct Reactor {
    shared: Arc<ReactorShared>,
    wake_rx: OwnedFd,
    vms: RefCell<HashMap<VmId, Rc<VmContext>>>,
    watchers: RefCell<HashMap<WatchId, Watcher>>,
    next_watch: Cell<u64>,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } == -1 {
            return Err(crate::error::Error::last_os_error());
        }
        let (wake_rx, wake_tx) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self {
            shared: Arc::new(ReactorShared {
                queue: Mutex::new(VecDeque::new()),
                wake_tx,
                work: AtomicUsize::new(0),
                next_vm: AtomicU64::new(1),
            }),
            wake_rx,
            vms: RefCell::new(HashMap::new()),
            watchers: RefCell::new(HashMap::new()),
            next_watch: Cell::new(1),
        })
    }

    /// Creates a VM pinned to this reactor.
    pub fn new_vm(&self) -> Rc<VmContext> {
        let id = VmId(self.shared.next_vm.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(VmShared::new(id, self.shared.clone()));
        let vm = VmContext::new(shared);
        self.vms.borrow_mut().insert(id, vm.clone());
        vm
    }

    pub(crate) fn vm(&self, id: VmId) -> Option<Rc<VmContext>> {
        self.vms.borrow().get(&id).cloned()
    }

    /// Runs `f` with the reactor driving the current thread, if any.
    ///
    /// Fiber code always runs inside [`Reactor::run`], so primitives use
    /// this to reach the loop they are already being driven by.
    pub(crate) fn with_current<R>(f: impl FnOnce(&Reactor) -> R) -> Option<R> {
        ACTIVE.with(|active| {
            let p = active.get();
            if p.is_null() {
                None
            } else {
                // The pointer is only ever set by `run`, whose frame is
                // live for the whole duration of any callback.
                Some(f(unsafe { &*p }))
            }
        })
    }

    /// Registers a single-shot readiness watcher.
    pub(crate) fn add_watch(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnOnce(&Reactor) + 'static,
    ) -> WatchId {
        let id = WatchId(self.next_watch.get());
        self.next_watch.set(id.0 + 1);
        self.watchers.borrow_mut().insert(
            id,
            Watcher {
                fd,
                interest,
                callback: Box::new(callback),
            },
        );
        id
    }

    /// Cancels a watcher. Returns `false` if it already fired.
    pub(crate) fn cancel_watch(&self, id: WatchId) -> bool {
        self.watchers.borrow_mut().remove(&id).is_some()
    }

    /// Drives the loop until no VM, task, watcher or work guard remains.
    ///
    /// When the loop goes idle, every VM still alive is closed (waking
    /// queued senders and cancelling pending operations) and the resulting
    /// tail of tasks is drained before returning.
    pub fn run(&self) {
        let _enter = EnterGuard::new(self);
        let mut closed_tail = false;
        loop {
            self.drain_tasks();
            if !self.has_work() {
                if closed_tail {
                    break;
                }
                closed_tail = true;
                self.close_all_vms();
                continue;
            }
            self.vms.borrow_mut().retain(|_, vm| vm.is_valid());
            self.poll_wait();
        }
    }

    fn drain_tasks(&self) {
        loop {
            let task = {
                let mut q = self.shared.queue.lock().expect("reactor queue poisoned");
                q.pop_front()
            };
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    fn has_work(&self) -> bool {
        if self.shared.work.load(Ordering::Relaxed) != 0 {
            return true;
        }
        if !self.watchers.borrow().is_empty() {
            return true;
        }
        !self.shared.queue.lock().expect("reactor queue poisoned").is_empty()
    }

    fn close_all_vms(&self) {
        let vms: Vec<_> = self.vms.borrow().values().cloned().collect();
        for vm in vms {
            vm.close();
        }
        self.vms.borrow_mut().clear();
    }

    fn poll_wait(&self) {
        let mut pollfds = Vec::new();
        pollfds.push(libc::pollfd {
            fd: self.wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        let ids: Vec<WatchId> = {
            let watchers = self.watchers.borrow();
            let mut ids = Vec::with_capacity(watchers.len());
            for (id, w) in watchers.iter() {
                pollfds.push(libc::pollfd {
                    fd: w.fd,
                    events: w.interest.bits(),
                    revents: 0,
                });
                ids.push(*id);
            }
            ids
        };

        let res = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if res == -1 {
            // EINTR: just go around.
            return;
        }

        if pollfds[0].revents != 0 {
            self.drain_wake_pipe();
        }

        let mut fired = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let revents = pollfds[i + 1].revents;
            if revents & (pollfds[i + 1].events | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL)
                != 0
            {
                fired.push(*id);
            }
        }
        for id in fired {
            let watcher = self.watchers.borrow_mut().remove(&id);
            if let Some(w) = watcher {
                (w.callback)(self);
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.wake_rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

struct EnterGuard {
    prev: *const Reactor,
}

impl EnterGuard {
    fn new(reactor: &Reactor) -> Self {
        ACTIVE.with(|active| {
            let prev = active.get();
            active.set(reactor as *const Reactor);
            Self { prev }
        })
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.prev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posted_tasks_run_in_post_order() {
        let reactor = Reactor::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = order.clone();
            reactor
                .shared
                .post(Box::new(move |_| order.lock().unwrap().push(i)));
        }
        reactor.run();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn tasks_posted_from_a_task_run_after_already_queued_tasks() {
        let reactor = Reactor::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            reactor.shared.post(Box::new(move |r| {
                let tail = order.clone();
                order.lock().unwrap().push("first");
                r.shared
                    .post(Box::new(move |_| tail.lock().unwrap().push("tail")));
            }));
        }
        {
            let order = order.clone();
            reactor
                .shared
                .post(Box::new(move |_| order.lock().unwrap().push("second")));
        }
        reactor.run();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "tail"]);
    }

    #[test]
    fn watcher_fires_on_readable() {
        let reactor = Reactor::new().unwrap();
        let mut fds = [0 as RawFd; 2];
        assert_ne!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, -1);
        let hit = Rc::new(Cell::new(false));
        {
            let hit = hit.clone();
            reactor.add_watch(fds[0], Interest::READABLE, move |_| hit.set(true));
        }
        unsafe { libc::write(fds[1], b"x".as_ptr().cast(), 1) };
        reactor.run();
        assert!(hit.get());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
