// SPDX-License-Identifier: GPL-3.0-only

//! Media capture core: camera sessions with background blur and replacement
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`negotiation`]: Resolve a requested resolution and frame rate against device modes
//! - [`session`]: Capture session state machine and the [`MediaDevices`] control surface
//! - [`bus`]: Bounded drop-oldest frame distribution to many consumers
//! - [`processing`]: Segmentation, smoothing and background effects
//! - [`track`]: Reference-counted track handles and frame sources
//! - [`backends`]: Capture backend abstraction and the synthetic test-pattern backend
//! - [`media`]: Requests, modes, frames and pixel format conversion
//! - [`config`]: User configuration handling
//!
//! # Example
//!
//! ```no_run
//! use media_capture::backends::SyntheticBackend;
//! use media_capture::{BackgroundMode, CaptureRequest, Config, MediaDevices};
//! use std::sync::Arc;
//!
//! let devices = MediaDevices::new(Arc::new(SyntheticBackend::single()), Config::default());
//! let handle = devices
//!     .get_user_media(CaptureRequest::new(1280, 720, 30, BackgroundMode::Blur))
//!     .unwrap();
//! let source = handle.to_frame_source().unwrap();
//! # drop(source);
//! handle.release().unwrap();
//! ```

pub mod backends;
pub mod bus;
pub mod config;
pub mod constants;
pub mod errors;
pub mod frame_loop;
pub mod media;
pub mod negotiation;
pub mod processing;
pub mod session;
pub mod track;

// Re-export commonly used types
pub use bus::{FrameBus, Poll};
pub use config::Config;
pub use errors::{CaptureError, CaptureResult};
pub use media::{BackgroundMode, CaptureMode, CaptureRequest, Frame, PixelFormat};
pub use processing::BackgroundProcessor;
pub use session::{CaptureSession, MediaDevices, SessionState};
pub use track::{FrameSource, TrackHandle};
