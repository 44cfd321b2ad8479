//! Image load error types.

use std::time::Duration;

use thiserror::Error;

/// Why a load produced no image.
///
/// Every variant travels through the same completion channel as a success.
/// `Cancelled` never reaches a consumer: cancelled consumers get no call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum LoadError {
    #[error("invalid image identifier: {reason}")]
    InvalidIdentifier { reason: String },

    #[error("image not found: {id}")]
    NotFound { id: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("load timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("load cancelled")]
    Cancelled,

    #[error("io error: {message}")]
    Io { message: String },

    #[error("load worker failed: {message}")]
    Worker { message: String },
}

impl LoadError {
    /// Creates invalid identifier error.
    #[must_use]
    pub fn invalid_identifier(reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            reason: reason.into(),
        }
    }

    /// Creates not found error.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates io error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates worker error.
    #[must_use]
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// Returns whether the load was abandoned by the caller.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns whether the load ran out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns whether re-issuing the same load could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Io { .. } | Self::Worker { .. }
        )
    }
}
