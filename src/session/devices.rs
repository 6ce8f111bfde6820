// SPDX-License-Identifier: GPL-3.0-only

//! Control surface over all capture devices
//!
//! Keeps one [`CaptureSession`] per device so repeated requests for the same
//! camera share its track instead of fighting over the hardware.

use super::CaptureSession;
use crate::backends::{CaptureBackend, DeviceDescriptor};
use crate::config::Config;
use crate::errors::{CaptureError, CaptureResult};
use crate::media::{CaptureMode, CaptureRequest};
use crate::track::TrackHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Entry point for requesting camera tracks
///
/// Successful opens are remembered in the config (last device and the
/// request per device); [`config`](Self::config) returns the updated copy
/// for the caller to persist.
pub struct MediaDevices {
    backend: Arc<dyn CaptureBackend>,
    config: Mutex<Config>,
    sessions: Mutex<HashMap<String, CaptureSession>>,
}

impl MediaDevices {
    pub fn new(backend: Arc<dyn CaptureBackend>, config: Config) -> Self {
        info!(devices = backend.enumerate_devices().len(), "Creating media devices");
        Self {
            backend,
            config: Mutex::new(config),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the config including remembered devices and requests
    pub fn config(&self) -> Config {
        self.lock_config().clone()
    }

    /// Request to use for a device when the caller has none
    pub fn request_for(&self, device_id: &str) -> CaptureRequest {
        self.lock_config().request_for(device_id)
    }

    /// Devices currently present
    pub fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        self.backend.enumerate_devices()
    }

    /// Modes a device offers
    ///
    /// # Errors
    /// * `DeviceUnavailable` - no such device
    pub fn supported_modes(&self, device_id: &str) -> CaptureResult<Vec<CaptureMode>> {
        self.ensure_present(device_id)?;
        Ok(self.backend.enumerate_modes(device_id))
    }

    /// Device used when none is named: the last used one if still present,
    /// otherwise the first enumerated
    pub fn default_device(&self) -> CaptureResult<String> {
        let devices = self.backend.enumerate_devices();
        if let Some(last) = self.lock_config().last_device.clone()
            && devices.iter().any(|d| d.id == last)
        {
            return Ok(last);
        }
        devices
            .into_iter()
            .next()
            .map(|d| d.id)
            .ok_or_else(|| CaptureError::DeviceUnavailable("No capture devices found".to_string()))
    }

    /// Open the default device
    pub fn get_user_media(&self, request: CaptureRequest) -> CaptureResult<TrackHandle> {
        let device_id = self.default_device()?;
        self.get_user_media_on(&device_id, request)
    }

    /// Open a specific device
    ///
    /// # Errors
    /// * `DeviceUnavailable` - no such device, or it refused to open
    /// * plus everything [`CaptureSession::start`] returns
    pub fn get_user_media_on(&self, device_id: &str, request: CaptureRequest) -> CaptureResult<TrackHandle> {
        self.ensure_present(device_id)?;
        let session = self.session_for(device_id);
        debug!(device = %device_id, request = %request, "get_user_media");
        let handle = session.start(request)?;
        self.remember(device_id, request);
        Ok(handle)
    }

    /// Stop the session a handle belongs to, ending every handle on it
    ///
    /// Does nothing if that session has already moved on to another track.
    pub fn stop(&self, handle: &TrackHandle) {
        if let Some(session) = self.session(handle.device_id()) {
            session.stop_track(handle);
        }
    }

    /// Stop every session
    pub fn stop_all(&self) {
        let sessions: Vec<CaptureSession> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for session in sessions {
            session.stop();
        }
    }

    /// The session for a device, if one was ever started
    pub fn session(&self, device_id: &str) -> Option<CaptureSession> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    fn remember(&self, device_id: &str, request: CaptureRequest) {
        let mut config = self.lock_config();
        config.last_device = Some(device_id.to_string());
        config.device_requests.insert(device_id.to_string(), request);
    }

    fn lock_config(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_for(&self, device_id: &str) -> CaptureSession {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device_id.to_string())
            .or_insert_with(|| {
                debug!(device = %device_id, "Creating capture session");
                CaptureSession::new(device_id, Arc::clone(&self.backend), self.config())
            })
            .clone()
    }

    fn ensure_present(&self, device_id: &str) -> CaptureResult<()> {
        if self.backend.enumerate_devices().iter().any(|d| d.id == device_id) {
            Ok(())
        } else {
            Err(CaptureError::DeviceUnavailable(format!("No device '{}'", device_id)))
        }
    }
}

impl Drop for MediaDevices {
    fn drop(&mut self) {
        self.stop_all();
    }
}
