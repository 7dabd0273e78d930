//! Diagnostics printed by the runtime itself.
//!
//! The crate logs through the ["log" facade](https://docs.rs/log/); the
//! embedding application picks the logger implementation. The helpers here
//! format the few messages the scheduler emits on its own: fiber panics
//! (a detached fiber finishing with an error nobody will observe) and
//! forced VM teardown.
//!
//! ANSI styling is applied when stderr is a terminal, so panic lines keep
//! the familiar red/underline/dim layout of the host runtime.

use once_cell::sync::Lazy;

use crate::error::Error;
use crate::fiber::FiberId;
use crate::vm::VmId;

static STDERR_HAS_COLOR: Lazy<bool> = Lazy::new(|| {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if let Some(term) = std::env::var_os("TERM") {
        if term == "dumb" {
            return false;
        }
    }
    (unsafe { libc::isatty(libc::STDERR_FILENO) }) == 1
});

struct Style {
    red: &'static str,
    dim: &'static str,
    underline: &'static str,
    reset_red: &'static str,
    reset_dim: &'static str,
    reset_underline: &'static str,
}

fn style() -> Style {
    if *STDERR_HAS_COLOR {
        Style {
            red: "\x1b[31;1m",
            dim: "\x1b[2m",
            underline: "\x1b[4m",
            reset_red: "\x1b[22;39m",
            reset_dim: "\x1b[22m",
            reset_underline: "\x1b[24m",
        }
    } else {
        Style {
            red: "",
            dim: "",
            underline: "",
            reset_red: "",
            reset_dim: "",
            reset_underline: "",
        }
    }
}

/// A fiber finished with an error that no joiner will ever observe.
pub(crate) fn print_fiber_panic(
    fiber: FiberId,
    is_main: bool,
    error: &Error,
    stacktrace: Option<&str>,
) {
    let s = style();
    let who = if is_main { "Main fiber from VM" } else { "Fiber" };
    log::error!(
        "{}{} {} panicked: '{}{}{}'{}\n{}{}{}",
        s.red,
        who,
        fiber,
        s.underline,
        error,
        s.reset_underline,
        s.reset_red,
        s.dim,
        stacktrace.unwrap_or(""),
        s.reset_dim,
    );
}

/// The VM was force-closed after its memory-exhaustion latch fired.
pub(crate) fn print_vm_errmem(vm: VmId) {
    let s = style();
    log::error!(
        "{}VM {} forcibly closed due to '{}memory exhaustion{}'{}",
        s.red,
        vm,
        s.underline,
        s.reset_underline,
        s.reset_red,
    );
}

/// A cleanup handler itself raised; the VM is force-closed.
pub(crate) fn print_cleanup_error(vm: VmId) {
    let s = style();
    log::error!(
        "{}VM {} forcibly closed due to error raised on cleanup handler{}",
        s.red,
        vm,
        s.reset_red,
    );
}

/// Possible deadlocks were recorded while the VM was shutting down.
pub(crate) fn print_deadlocks(vm: VmId, errors: &[String]) {
    let s = style();
    let mut rendered = String::new();
    for e in errors {
        rendered.push('\t');
        rendered.push_str(e);
        rendered.push('\n');
    }
    log::error!(
        "{}Possible deadlock(s) detected during VM {} shutdown{}:\n{}{}{}",
        s.red,
        vm,
        s.reset_red,
        s.dim,
        rendered,
        s.reset_dim,
    );
}
