//! Error taxonomy for the authority core.
//!
//! A single closed enum covers every fallible public operation across the
//! crate (graph building, delegation control, approval routing, token
//! verification, audit tracing). Validation-style APIs that return
//! structured results (§4.5, §4.9) do not use this type for expected
//! outcomes — only for conditions that prevent the operation from
//! completing at all.

use thiserror::Error;

/// Crate-wide result alias, mirroring `rtfs::runtime::error::RuntimeResult`
/// in the teacher codebase.
pub type AuthorityResult<T> = Result<T, AuthorityError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthorityError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("chain broken: {0}")]
    ChainBroken(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),
}

impl AuthorityError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        Self::LimitExceeded(msg.into())
    }

    pub fn authorization_denied(msg: impl Into<String>) -> Self {
        Self::AuthorizationDenied(msg.into())
    }
}
