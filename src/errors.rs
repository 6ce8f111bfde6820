// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture pipeline

use thiserror::Error;

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Errors surfaced by negotiation, sessions, buses and tracks
///
/// Errors are `Clone` so the capture thread can report an open failure back
/// to the caller over the init channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// No offered capture mode can satisfy the request
    #[error("No compatible capture mode")]
    NoCompatibleMode,
    /// A session is already live with a different configuration
    #[error("Capture session is busy with a different mode")]
    SessionBusy,
    /// The hardware or driver refused to open the device
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The track was released or its session stopped
    #[error("Track has ended")]
    TrackEnded,
    /// The frame bus has been closed
    #[error("Capture session is closed")]
    SessionClosed,
    /// A frame took longer than the hard deadline to process
    ///
    /// Recovered inside the processor; never reaches a consumer.
    #[error("Processing deadline exceeded: {elapsed_ms}ms > {deadline_ms}ms")]
    ProcessingDeadlineExceeded { elapsed_ms: u64, deadline_ms: u64 },
    /// The request has a zero dimension or frame rate
    #[error("Invalid capture request: {0}")]
    InvalidRequest(String),
    /// Configuration could not be read, parsed or validated
    #[error("Configuration error: {0}")]
    Config(String),
    /// A background image could not be loaded
    #[error("Image error: {0}")]
    Image(String),
}

impl CaptureError {
    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaptureError::DeviceUnavailable(_))
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Config(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::Image(err.to_string())
    }
}
