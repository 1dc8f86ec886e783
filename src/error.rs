//! Error types shared by the network adapters and the frame encoder.
//!
//! Everything in here is absorbed by the owning component: a failed source
//! or endpoint is logged and skipped, never surfaced to the caller of a
//! public operation.

use thiserror::Error;

/// Failure of a single time source or chain endpoint.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The request did not complete within its own timeout.
    #[error("timed out after {0:.1}s")]
    Timeout(f64),

    /// Socket, DNS or connection level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote answered with a non-success HTTP status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// The response arrived but could not be understood or failed validation.
    #[error("invalid response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout(0.0)
        } else if let Some(status) = e.status() {
            SourceError::Status(status.as_u16())
        } else if e.is_decode() {
            SourceError::Parse(e.to_string())
        } else {
            SourceError::Transport(e.to_string())
        }
    }
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Transport(e.to_string())
    }
}

/// Failure of the visual-code frame encoder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// The payload does not fit in a single frame; the caller should chunk it.
    #[error("payload of {size} bytes exceeds single-frame capacity of {capacity} bytes")]
    CapacityExceeded { size: usize, capacity: usize },
}
