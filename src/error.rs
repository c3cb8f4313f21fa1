//! Error types for the ESI middleware core

use thiserror::Error;

/// Result type alias for ESI operations
pub type Result<T> = std::result::Result<T, EsiError>;

/// Error kinds that can occur while parsing tags, fetching resources or
/// injecting content.
///
/// The variants are behavioral kinds rather than per-site types: callers
/// branch on what an error *means* (transient, fatal, bad input) instead of
/// where it was produced.
#[derive(Error, Debug, Clone)]
pub enum EsiError {
    /// Input failed validation (malformed attribute blob, bad duration, ...)
    #[error("not valid: {0}")]
    NotValid(String),

    /// A required value is absent (no `src` attribute, empty URL, ...)
    #[error("required value missing: {0}")]
    Empty(String),

    /// Unknown attribute key or unresolvable URL scheme
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A key/value backend answered but holds no entry for the key
    #[error("not found: {0}")]
    NotFound(String),

    /// A fetch exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// The backend driver or its connection has been shut down
    #[error("already closed: {0}")]
    AlreadyClosed(String),

    /// Recoverable runtime failure; the caller may log it and continue
    #[error("temporary failure: {0}")]
    Temporary(String),

    /// Unrecoverable failure; processing of the affected unit must stop
    #[error("fatal: {0}")]
    Fatal(String),

    /// The downstream byte sink rejected a write
    #[error("write failed: {0}")]
    WriteFailed(String),
}

impl EsiError {
    /// Determine whether this error should be recorded on a resource's
    /// circuit breaker and the next resource in the entity tried.
    ///
    /// Returns true for failures that are tied to one backend attempt:
    /// misses, timeouts, dead connections and other recoverable runtime
    /// errors. Returns false for input errors (which abort parsing), for
    /// `Fatal` (which aborts the whole entity fetch) and for sink errors.
    pub fn is_transient(&self) -> bool {
        match self {
            EsiError::NotFound(_) => true,
            EsiError::Timeout(_) => true,
            EsiError::AlreadyClosed(_) => true,
            EsiError::Temporary(_) => true,

            EsiError::NotValid(_) => false,
            EsiError::Empty(_) => false,
            EsiError::NotSupported(_) => false,
            EsiError::Fatal(_) => false,
            EsiError::WriteFailed(_) => false,
        }
    }

    /// True for `Fatal`, which aborts an entity fetch instead of falling
    /// through to the next resource.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EsiError::Fatal(_))
    }

    /// True for `Temporary`.
    pub fn is_temporary(&self) -> bool {
        matches!(self, EsiError::Temporary(_))
    }

    /// True for `NotValid`.
    pub fn is_not_valid(&self) -> bool {
        matches!(self, EsiError::NotValid(_))
    }

    /// True for `NotSupported`.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, EsiError::NotSupported(_))
    }

    /// True for `Empty`.
    pub fn is_empty(&self) -> bool {
        matches!(self, EsiError::Empty(_))
    }

    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EsiError::NotFound(_))
    }

    /// True for `WriteFailed`.
    pub fn is_write_failed(&self) -> bool {
        matches!(self, EsiError::WriteFailed(_))
    }

    /// Short kind label for log fields and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            EsiError::NotValid(_) => "not_valid",
            EsiError::Empty(_) => "empty",
            EsiError::NotSupported(_) => "not_supported",
            EsiError::NotFound(_) => "not_found",
            EsiError::Timeout(_) => "timeout",
            EsiError::AlreadyClosed(_) => "already_closed",
            EsiError::Temporary(_) => "temporary",
            EsiError::Fatal(_) => "fatal",
            EsiError::WriteFailed(_) => "write_failed",
        }
    }
}
