//! Error types.

use thiserror::Error;

use crate::transport::HgError;

/// Errors reported by this library.
///
/// Asynchronous operations report the same taxonomy through their completion
/// callbacks. [`Error::Canceled`] is always kept apart from failures so that
/// callers can tell an explicit abort from a broken operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The substrate failed in a way that has no closer local meaning.
    #[error("transport error: {0}")]
    Transport(HgError),

    #[error("out of memory")]
    OutOfMemory,

    /// An address lookup or a progress wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation canceled")]
    Canceled,

    /// Unregistered opcode, missing handler or unresolved context.
    #[error("no matching entry")]
    NoMatch,

    /// The caller's buffer list is too short.
    #[error("buffer list truncated, {required} entries required")]
    Truncated { required: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport already initialized")]
    AlreadyInitialized,

    #[error("transport not initialized")]
    NotInitialized,

    #[error("permission denied")]
    PermissionDenied,

    /// A payload could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`].
    #[inline]
    pub(crate) fn inval(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Return `true` if this error is a wait expiry.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Return `true` if the operation was canceled rather than failed.
    #[inline]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<HgError> for Error {
    fn from(e: HgError) -> Self {
        match e {
            HgError::Timeout => Self::Timeout("substrate wait expired".into()),
            HgError::Canceled => Self::Canceled,
            HgError::NoMatch => Self::NoMatch,
            HgError::NoMem => Self::OutOfMemory,
            HgError::InvalidArg => Self::inval("rejected by substrate"),
            HgError::Permission => Self::PermissionDenied,
            other => Self::Transport(other),
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Result type of this library.
pub type Result<T> = std::result::Result<T, Error>;
