//! Service-level error model.
//!
//! Every fallible operation exposed by the services resolves to one of the
//! kinds below. The HTTP layer maps kinds to status codes; the worker runtime
//! maps them to ack/requeue decisions. Messages are user-facing and must not
//! carry stack traces or internal identifiers.

use thiserror::Error;

/// Result type used across the service layer.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Stable error taxonomy for the task orchestrator.
///
/// Kinds are deliberately coarse: callers branch on the kind, not on the
/// message. Infrastructure failures (store, broker, cache) all collapse into
/// [`ServiceError::Unavailable`] so that transient outages surface uniformly.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A request field failed validation (length, emptiness, format).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Login failed. Deliberately identical for unknown usernames and
    /// password mismatches so account existence is not leaked.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// A token failed signature, expiry, not-before, or type checks.
    #[error("invalid token")]
    InvalidToken,

    /// The caller is authenticated but does not own the resource.
    #[error("{0}")]
    Forbidden(String),

    /// The named resource does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A uniqueness constraint was violated (duplicate username).
    #[error("{0}")]
    Conflict(String),

    /// The caller's token bucket is empty.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The store, broker, or cache could not be reached in time.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// A bug or unexpected condition; never surfaced verbatim to clients.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
