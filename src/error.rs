//! Error handling utils.
//!
//! Every fallible routine of the crate returns [`Error`]. Failures come in
//! three categories, mirrored by the variants below:
//!
//! - runtime errors raised by the scheduler and its primitives (the
//!   [`RuntimeErrorKind`] taxonomy),
//! - system errors carrying an `errno` ([`std::io::Error`]),
//! - argument errors with a structured side-channel naming the offending
//!   argument.
//!
//! Errors observed by more than one waiter (a future's error payload is
//! delivered to every `get` caller) are shared behind an [`Arc`].

use std::io;
use std::sync::Arc;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{0}")]
    Runtime(#[from] RuntimeErrorKind),

    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// An argument error together with the name of the argument that was
    /// rejected.
    #[error("invalid argument `{name}`")]
    InvalidArgument { name: &'static str },

    /// An error payload observed through a shared handle (e.g. a future's
    /// error delivered to multiple `get` callers).
    #[error("{0}")]
    Shared(Arc<Error>),

    /// The targeted VM has already been closed.
    #[error("VM is dead")]
    VmDead,
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

impl Error {
    #[inline(always)]
    pub fn invalid_argument(name: &'static str) -> Self {
        Self::InvalidArgument { name }
    }

    #[inline(always)]
    pub(crate) fn errno(code: i32) -> Self {
        Self::IO(io::Error::from_raw_os_error(code))
    }

    #[inline(always)]
    pub(crate) fn last_os_error() -> Self {
        Self::IO(io::Error::last_os_error())
    }

    /// The runtime error kind, if this is (or shares) a runtime error.
    pub fn kind(&self) -> Option<RuntimeErrorKind> {
        match self {
            Self::Runtime(kind) => Some(*kind),
            Self::Shared(inner) => inner.kind(),
            _ => None,
        }
    }

    /// The raw `errno` value, if this is (or shares) a system error.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::IO(e) => e.raw_os_error(),
            Self::Shared(inner) => inner.os_error(),
            _ => None,
        }
    }

    /// `true` if this error is the cooperative-cancellation sentinel.
    ///
    /// Interruption is the only error which is allowed to silently flow
    /// through cleanup scopes; the scheduler epilogue and `join` both
    /// special-case it.
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.kind() == Some(RuntimeErrorKind::Interrupted)
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Runtime(_) => "Runtime",
            Self::IO(_) => "IO",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::Shared(_) => "Shared",
            Self::VmDead => "VmDead",
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::IO(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// RuntimeErrorKind
////////////////////////////////////////////////////////////////////////////////

/// The error taxonomy exposed by the runtime at the script boundary.
///
/// These are the conditions the scheduler, the inbox and the sync
/// primitives raise themselves, as opposed to `errno`-category system
/// errors which are carried by [`Error::IO`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum RuntimeErrorKind {
    #[error("invalid module name")]
    InvalidModuleName,
    #[error("module not found")]
    ModuleNotFound,
    #[error("root scope cannot import parent")]
    RootCannotImportParent,
    #[error("cyclic import")]
    CyclicImport,
    #[error("leaf module cannot import child")]
    LeafCannotImportChild,
    #[error("only main fiber may import modules")]
    OnlyMainFiberMayImport,
    #[error("bad root context")]
    BadRootContext,
    #[error("bad index")]
    BadIndex,
    #[error("bad coroutine")]
    BadCoroutine,
    #[error("suspension already allowed")]
    SuspensionAlreadyAllowed,
    #[error("interruption already allowed")]
    InterruptionAlreadyAllowed,
    #[error("operation would suspend inside a forbid-suspend block")]
    ForbidSuspendBlock,
    #[error("fiber interrupted")]
    Interrupted,
    #[error("unmatched scope cleanup")]
    UnmatchedScopeCleanup,
    #[error("channel closed")]
    ChannelClosed,
    #[error("no senders")]
    NoSenders,
    #[error("internal module")]
    InternalModule,
    #[error("error raised")]
    RaiseError,
    #[error("broken promise")]
    BrokenPromise,
    #[error("promise already satisfied")]
    PromiseAlreadySatisfied,
    #[error("current module not known")]
    CurrentModuleNotKnown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_is_recognized_through_sharing() {
        let e = Error::from(RuntimeErrorKind::Interrupted);
        assert!(e.is_interrupted());
        let shared = Error::Shared(Arc::new(e));
        assert!(shared.is_interrupted());
        assert_eq!(shared.kind(), Some(RuntimeErrorKind::Interrupted));
    }

    #[test]
    fn errno_category_is_preserved() {
        let e = Error::errno(libc::EPERM);
        assert_eq!(e.os_error(), Some(libc::EPERM));
        assert_eq!(e.kind(), None);
    }

    #[test]
    fn argument_side_channel() {
        let e = Error::invalid_argument("stdin");
        assert_eq!(e.to_string(), "invalid argument `stdin`");
        assert_eq!(e.variant_name(), "InvalidArgument");
    }
}
