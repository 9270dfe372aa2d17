//! Core error types shared across the workspace.

use thiserror::Error;

/// Errors produced by the core codecs and configuration layer.
#[derive(Error, Debug)]
pub enum Error {
    /// A wire frame or field failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// A frame exceeded the configured maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Observed frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
