//! Error types for the live harness.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by line channels and the harness.
#[derive(Error, Debug)]
pub enum LiveError {
    /// Socket failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer did not show up or answer in time.
    #[error("timed out after {}ms waiting for {what}", elapsed.as_millis())]
    Timeout { what: String, elapsed: Duration },

    /// The channel was closed or its peer went away.
    #[error("channel closed: {0}")]
    Closed(String),

    /// The run was cancelled through its shutdown signal.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, LiveError>;
