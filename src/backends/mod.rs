// SPDX-License-Identifier: GPL-3.0-only

//! Capture backend abstraction
//!
//! The platform capture layer is reached only through these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │    MediaDevices     │  ← Control surface, one session per device
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │   CaptureSession    │  ← Lifecycle, capture thread, frame buses
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │ CaptureBackend Trait│  ← Capability query + device open
//! └──────────┬──────────┘
//!            │
//!            ▼
//!      ┌───────────┐
//!      │ Synthetic │  ← Built-in test-pattern implementation
//!      └───────────┘
//! ```

pub mod synthetic;

pub use synthetic::{SyntheticBackend, SyntheticDeviceSpec};

use crate::errors::CaptureResult;
use crate::media::{CaptureMode, RawFrame};

/// A capture device known to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Stable identifier used for enumeration and open
    pub id: String,
    /// Human readable name
    pub name: String,
}

/// Platform capture layer: capability query and device open
pub trait CaptureBackend: Send + Sync {
    /// List devices currently present
    fn enumerate_devices(&self) -> Vec<DeviceDescriptor>;

    /// List the capture modes a device supports
    ///
    /// Unknown devices report no modes.
    fn enumerate_modes(&self, device_id: &str) -> Vec<CaptureMode>;

    /// Open a device at a negotiated mode
    ///
    /// # Errors
    /// * `DeviceUnavailable` - the driver refused the open
    fn open(&self, device_id: &str, mode: &CaptureMode) -> CaptureResult<Box<dyn CaptureDevice>>;
}

/// An open device delivering raw frames at the negotiated rate
///
/// Owned by the session's capture thread; never shared.
pub trait CaptureDevice: Send {
    /// Block until the next frame is available
    ///
    /// An error means the device is gone (unplugged, driver reset). The
    /// session does not retry.
    fn blocking_capture(&mut self) -> CaptureResult<RawFrame>;

    /// Release the device; called exactly once
    fn close(&mut self);
}
