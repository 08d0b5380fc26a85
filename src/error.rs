//! Error taxonomy (§7) and translation to kernel filesystem status codes.

use std::fmt;

/// Stable, machine-readable error kind. Each variant corresponds to one row
/// of the taxonomy table in spec §7.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,

    #[error("offline")]
    Offline,
    #[error("offline and cold: remote lookup required while disconnected")]
    OfflineAndCold,
    #[error("authentication expired")]
    AuthExpired,
    #[error("transient remote failure: {0}")]
    RemoteTransient(String),
    #[error("terminal remote failure: {0}")]
    RemoteTerminal(String),

    #[error("content cache full")]
    CacheFull,
    #[error("cache corruption detected: {0}")]
    CacheCorruption(String),
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("illegal lifecycle state transition: {from:?} -> {to:?}")]
    IllegalStateTransition { from: String, to: String },
    #[error("conflict detected")]
    Conflict,

    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Context attached to an error as it bubbles up through the component
/// stack: the failing operation's name and, when applicable, the item id
/// it concerned. Matches the propagation policy of spec §7 ("library
/// internal errors bubble up with context (operation, id)").
#[derive(Debug)]
pub struct ErrorContext {
    pub op: &'static str,
    pub id: Option<String>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} (id={id})", self.op),
            None => write!(f, "{}", self.op),
        }
    }
}

/// An [`Error`] together with the [`ErrorContext`] it occurred under.
#[derive(Debug, thiserror::Error)]
#[error("{context}: {source}")]
pub struct ContextError {
    pub context: ErrorContext,
    #[source]
    pub source: Error,
}

impl Error {
    pub fn with_context(self, op: &'static str, id: Option<String>) -> ContextError {
        ContextError {
            context: ErrorContext { op, id },
            source: self,
        }
    }

    /// A minimal, stable, machine-readable code string for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound => "NotFound",
            Error::AlreadyExists => "AlreadyExists",
            Error::NotADirectory => "NotADirectory",
            Error::IsADirectory => "IsADirectory",
            Error::NotEmpty => "NotEmpty",
            Error::Offline => "Offline",
            Error::OfflineAndCold => "OfflineAndCold",
            Error::AuthExpired => "AuthExpired",
            Error::RemoteTransient(_) => "RemoteTransient",
            Error::RemoteTerminal(_) => "RemoteTerminal",
            Error::CacheFull => "CacheFull",
            Error::CacheCorruption(_) => "CacheCorruption",
            Error::IOError(_) => "IOError",
            Error::IllegalStateTransition { .. } => "IllegalStateTransition",
            Error::Conflict => "Conflict",
            Error::Cancelled => "Cancelled",
            Error::Timeout => "Timeout",
            Error::Internal(_) => "Internal",
        }
    }

    /// Whether this error kind is eligible for the manager-layer retry with
    /// exponential backoff (spec §7's retry policy).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteTransient(_) | Error::Timeout)
    }
}

/// Kernel filesystem status codes a facade operation can return (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum KernelStatus {
    OK,
    ENOENT,
    EEXIST,
    ENOTDIR,
    EISDIR,
    ENOTEMPTY,
    EACCES,
    EIO,
    ENOSPC,
    EAGAIN,
    EINTR,
}

/// Translate a library error into the kernel status table of spec §7.
///
/// `writes_allowed` reflects whether the filesystem's offline mode permits
/// writes (`read-write`); this decides whether an `Offline` error on a write
/// path is deferred (`OK`, with the upload queued) or surfaced as `EIO`.
pub fn kernel_status(err: &Error, is_write: bool, writes_allowed_offline: bool) -> KernelStatus {
    match err {
        Error::NotFound => KernelStatus::ENOENT,
        Error::AlreadyExists => KernelStatus::EEXIST,
        Error::NotADirectory => KernelStatus::ENOTDIR,
        Error::IsADirectory => KernelStatus::EISDIR,
        Error::NotEmpty => KernelStatus::ENOTEMPTY,
        Error::Offline => {
            if is_write && writes_allowed_offline {
                KernelStatus::OK
            } else {
                KernelStatus::EIO
            }
        }
        Error::OfflineAndCold => KernelStatus::EIO,
        Error::AuthExpired => KernelStatus::EACCES,
        Error::CacheFull => KernelStatus::ENOSPC,
        Error::Cancelled | Error::Timeout => KernelStatus::EINTR,
        Error::RemoteTransient(_) => KernelStatus::EAGAIN,
        Error::RemoteTerminal(_)
        | Error::CacheCorruption(_)
        | Error::IOError(_)
        | Error::IllegalStateTransition { .. }
        | Error::Conflict
        | Error::Internal(_) => KernelStatus::EIO,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
