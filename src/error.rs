use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds surfaced by the execution core. The HTTP layer maps each
/// kind to a status code; the core never matches on message strings.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input.
    #[error("{0}")]
    Invalid(String),

    /// The referenced entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The destination already holds the entity.
    #[error("{0}")]
    Conflict(String),

    /// The target exists, so the update requires its current etag.
    #[error("Etag required for update")]
    PreconditionRequired { current: String },

    /// The supplied etag does not match the stored one.
    #[error("Etag does not match")]
    PreconditionFailed,

    /// Launch or I/O failure.
    #[error("{0}")]
    Internal(#[from] io::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(io::Error::other(msg.into()))
    }
}
