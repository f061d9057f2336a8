//! Pipeline error types.

use thiserror::Error;

use crate::domain::entities::FetchDepth;

/// Result type for pipeline operations.
pub type ImageResult<T> = std::result::Result<T, ImageError>;

/// Failure delivered to callers of the pipeline.
///
/// `Clone` so that one failed execution can be handed to every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum ImageError {
    #[error("no fetcher can resolve {data}")]
    NotFound { data: String },

    #[error("io error: {message}")]
    Io { message: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("transformation {tag} failed: {message}")]
    Transform { tag: String, message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("request depth {allowed} forbids reaching the {required} tier")]
    DepthLimit {
        allowed: FetchDepth,
        required: FetchDepth,
    },
}

impl ImageError {
    /// Creates not-found error.
    #[must_use]
    pub fn not_found(data: impl Into<String>) -> Self {
        Self::NotFound { data: data.into() }
    }

    /// Creates I/O error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
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

    /// Creates transformation error.
    #[must_use]
    pub fn transform(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            tag: tag.into(),
            message: message.into(),
        }
    }

    /// Creates depth-limit error.
    #[must_use]
    pub const fn depth_limit(allowed: FetchDepth, required: FetchDepth) -> Self {
        Self::DepthLimit { allowed, required }
    }

    /// Returns whether the error came from cooperative cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns whether retrying the same request could succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Cancelled)
    }
}

impl From<std::io::Error> for ImageError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}
