// SPDX-License-Identifier: GPL-3.0-only

use crate::constants::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_BLUR_RADIUS, DEFAULT_DEADLINE_FACTOR,
    DEFAULT_KEY_COLOR, DEFAULT_KEY_SOFTNESS, DEFAULT_KEY_TOLERANCE, DEFAULT_QUEUE_DEPTH,
    DEFAULT_SEGMENTATION_INTERVAL, DEFAULT_SMOOTHING_WINDOW, DEFAULT_STOP_TIMEOUT,
};
use crate::errors::{CaptureError, CaptureResult};
use crate::media::CaptureRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Frame distribution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Per-consumer queue depth before the oldest frame is dropped
    pub queue_depth: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Background processing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Number of masks averaged for temporal smoothing
    pub smoothing_window: usize,
    /// Run the segmenter on every N-th frame
    pub segmentation_interval: u32,
    /// Hard deadline as a multiple of the frame interval
    pub deadline_factor: f64,
    pub blur_radius: u32,
    /// Backdrop colour for the chroma-key segmenter
    pub key_color: [u8; 3],
    pub key_tolerance: f32,
    pub key_softness: f32,
    /// Image used by the virtual background (generated gradient if unset)
    pub background_image: Option<PathBuf>,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
            segmentation_interval: DEFAULT_SEGMENTATION_INTERVAL,
            deadline_factor: DEFAULT_DEADLINE_FACTOR,
            blur_radius: DEFAULT_BLUR_RADIUS,
            key_color: DEFAULT_KEY_COLOR,
            key_tolerance: DEFAULT_KEY_TOLERANCE,
            key_softness: DEFAULT_KEY_SOFTNESS,
            background_image: None,
        }
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// How long `stop` waits for the capture thread to release the device
    pub stop_timeout_ms: u64,
}

impl SessionSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Last used capture device
    pub last_device: Option<String>,
    /// Request used when none is given
    pub default_request: CaptureRequest,
    /// Remembered request per device (key = device id)
    pub device_requests: HashMap<String, CaptureRequest>,
    pub bus: BusSettings,
    pub processing: ProcessingSettings,
    pub session: SessionSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            last_device: None,
            default_request: CaptureRequest::default(),
            device_requests: HashMap::new(),
            bus: BusSettings::default(),
            processing: ProcessingSettings::default(),
            session: SessionSettings::default(),
        }
    }
}

impl Config {
    /// Default config file location, if the platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist
    pub fn load() -> CaptureResult<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            Some(path) => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            None => {
                debug!("No config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load and validate a config file
    pub fn load_from(path: &Path) -> CaptureResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Save to the default location
    pub fn save(&self) -> CaptureResult<()> {
        let path = Self::default_path()
            .ok_or_else(|| CaptureError::Config("no config directory on this platform".into()))?;
        self.save_to(&path)
    }

    /// Write pretty JSON, creating parent directories as needed
    pub fn save_to(&self, path: &Path) -> CaptureResult<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Saved config");
        Ok(())
    }

    /// Request to use for a device: remembered one, else the default
    pub fn request_for(&self, device_id: &str) -> CaptureRequest {
        self.device_requests
            .get(device_id)
            .copied()
            .unwrap_or(self.default_request)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> CaptureResult<()> {
        let invalid = |msg: &str| Err(CaptureError::Config(msg.to_string()));

        if self.bus.queue_depth == 0 {
            return invalid("bus.queue_depth must be at least 1");
        }
        if self.processing.smoothing_window == 0 {
            return invalid("processing.smoothing_window must be at least 1");
        }
        if self.processing.segmentation_interval == 0 {
            return invalid("processing.segmentation_interval must be at least 1");
        }
        if !self.processing.deadline_factor.is_finite() || self.processing.deadline_factor <= 0.0 {
            return invalid("processing.deadline_factor must be positive");
        }
        if self.processing.key_tolerance < 0.0 {
            return invalid("processing.key_tolerance must not be negative");
        }
        if self.processing.key_softness <= 0.0 {
            return invalid("processing.key_softness must be positive");
        }
        Ok(())
    }
}
