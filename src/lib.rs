//! Fiber scheduler and actor runtime core for a scriptable systems host.
//!
//! This crate contains the concurrency backbone such a host runs on:
//!
//! - [Reactor](reactor): a per-thread event loop with strand (serial
//!   FIFO) execution, readiness watchers and work guards.
//! - [Fibers](fiber): cooperative scheduling with joining, detachment
//!   and cooperative cancellation ("interruption"), plus the
//!   suspend/interrupt gating counters that partition code into
//!   suspendable and non-suspendable regions.
//! - [Actors](actor): one typed inbox per VM, reference-counted
//!   addresses whose count doubles as the liveness signal, and the
//!   fixed-frame seqpacket [codec](actor::ipc) used between processes.
//! - [Sync primitives](fiber): a recursive mutex and a future/promise
//!   pair, both built on the scheduler's wait-queue contract.
//! - [Subprocess spawning](process): fork/exec with a bit-exact pre-exec
//!   sequencer, descriptor-table rewriting and pidfd-based reaping.
//! - [Credential propagation](system): mirroring of setuid-like
//!   operations into the actor-service sidecar.
//!
//! A VM and everything it owns is strand-local; cross-thread
//! notifications always re-enter through a strand post. Cancellation is
//! cooperative everywhere: suspending operations install a one-shot
//! interrupter, and a fiber is woken exactly once per
//! suspension, either by its completion or with the `interrupted`
//! error, never both.
//!
//! ```no_run
//! use wick::{Reactor, Value};
//!
//! let reactor = Reactor::new().unwrap();
//! let vm = reactor.new_vm();
//! let inbox = vm.inbox();
//! let addr = vm.address();
//!
//! let sibling = reactor.new_vm();
//! sibling
//!     .spawn(async move {
//!         addr.send(Value::from("ping")).await?;
//!         Ok(vec![])
//!     })
//!     .unwrap();
//! vm.spawn(async move {
//!     let msg = inbox.receive().await?;
//!     assert_eq!(msg, Value::from("ping"));
//!     Ok(vec![])
//! })
//! .unwrap();
//!
//! reactor.run();
//! ```

#[cfg(not(unix))]
compile_error!("this crate targets UNIX platforms only");

pub mod actor;
pub mod error;
pub mod fiber;
mod log;
#[cfg(target_os = "linux")]
pub mod process;
pub mod reactor;
pub mod stream;
#[cfg(target_os = "linux")]
pub mod system;
pub mod value;
pub mod vm;

pub use actor::{ActorAddress, Inbox};
pub use error::{Error, Result, RuntimeErrorKind};
pub use reactor::Reactor;
pub use value::Value;
pub use vm::VmContext;
