//! A single error type shared by every backend.
//!
//! The storage contract distinguishes a handful of error kinds (see the
//! module-level docs in `lib.rs`): ordinary not-found results are not errors
//! at all (`Option`/`bool`), fatal programmer errors and corruption abort the
//! process rather than propagate, and only transient remote failures and
//! spec-parse failures are meant to be handled by callers.

use std::fmt;

pub type CResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Wraps the underlying OS error for the embedded log engine.
    Io(std::io::Error),

    /// A retryable failure from the remote document store: a network error,
    /// a query timeout, or a transaction conflict. Callers may retry; the
    /// storage layer itself only retries where the contract says so (scan
    /// restart).
    Transient(String),

    /// Data that could not be decoded: a malformed stored key, a vector
    /// whose byte length isn't a multiple of 4, a document missing an
    /// expected field. Always indicates corruption, not caller error.
    Corrupt(String),

    /// A spec string failed to parse. Carries the original string and the
    /// kind-specific reason so callers can report both.
    SpecParse { spec: String, reason: String },

    /// A non-recoverable error surfaced where the caller opted out of the
    /// fatal-abort path (tests, `catch_unwind` boundaries). Production code
    /// should not see this variant returned from a `Result`; look at
    /// `fatal!` below.
    Fatal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Transient(msg) => write!(f, "transient error: {}", msg),
            Error::Corrupt(msg) => write!(f, "corrupt data: {}", msg),
            Error::SpecParse { spec, reason } => {
                write!(f, "invalid db spec {:?}: {}", spec, reason)
            }
            Error::Fatal(msg) => write!(f, "fatal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// True for errors the remote backend is allowed to retry transparently
/// (currently only the scan/All cursor-restart path does this).
pub fn is_retryable(err: &Error) -> bool {
    matches!(err, Error::Transient(_))
}

/// Logs a structured fatal error and aborts the process.
///
/// Used for programmer errors (empty key on `Set`, `Unlock` of a lock this
/// process doesn't hold) and detected corruption: the spec requires these to
/// be unrecoverable rather than propagated as a normal `Result`, since by the
/// time they're observed the in-memory state and the backing store may
/// already disagree.
///
/// In test builds this panics instead of aborting, so the conformance suite
/// can assert on it with `#[should_panic]` or `std::panic::catch_unwind`.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!(target: "storekit::fatal", "{}", msg);
        if cfg!(test) {
            panic!("{}", msg);
        } else {
            eprintln!("fatal storekit error: {}", msg);
            std::process::abort();
        }
    }};
}

pub(crate) use fatal;
