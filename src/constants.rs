// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline-wide constants

use std::time::Duration;

/// Default per-consumer queue depth on a frame bus
pub const DEFAULT_QUEUE_DEPTH: usize = 2;

/// Number of masks kept for temporal smoothing
pub const DEFAULT_SMOOTHING_WINDOW: usize = 3;

/// Run the segmenter on every Nth frame, reuse the last mask in between
pub const DEFAULT_SEGMENTATION_INTERVAL: u32 = 3;

/// Blur spread in pixels for the blur effect
pub const DEFAULT_BLUR_RADIUS: u32 = 25;

/// Hard processing deadline as a multiple of the inter-frame interval
pub const DEFAULT_DEADLINE_FACTOR: f64 = 2.0;

/// How long `stop()` waits for the capture thread to close the device
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a worker thread blocks on an empty bus before rechecking cancellation
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Device id used when a request does not name one
pub const DEFAULT_DEVICE_ID: &str = "synthetic:0";

/// Chroma key colour (RGB) of the synthetic backdrop
pub const DEFAULT_KEY_COLOR: [u8; 3] = [0, 177, 64];

/// Distance from the key colour (0..=441) below which a pixel is fully background
pub const DEFAULT_KEY_TOLERANCE: f32 = 90.0;

/// Width of the soft edge above the key tolerance
pub const DEFAULT_KEY_SOFTNESS: f32 = 60.0;

/// Background likelihood above which a pixel is replaced entirely
pub const MASK_FULL_BACKGROUND: f32 = 0.9;

/// Background likelihood below which a pixel is kept as foreground
pub const MASK_FOREGROUND_CUTOFF: f32 = 0.2;

/// Linear alpha ramp between the cutoffs: alpha = (SLOPE * b + OFFSET) / 255
pub const MASK_RAMP_SLOPE: f32 = 182.9;
pub const MASK_RAMP_OFFSET: f32 = -36.6;

/// URL scheme for track stream URLs
pub const TRACK_URL_PREFIX: &str = "media-capture://track/";

/// Application directory name under the user config directory
pub const CONFIG_DIR_NAME: &str = "media-capture";

/// Config file name
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Frame interval for a frame rate; zero rates map to one second
pub fn frame_interval(frame_rate: u32) -> Duration {
    if frame_rate == 0 {
        Duration::from_secs(1)
    } else {
        Duration::from_secs_f64(1.0 / frame_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_interval() {
        assert_eq!(frame_interval(0), Duration::from_secs(1));
        let interval = frame_interval(30);
        assert!(interval > Duration::from_millis(33));
        assert!(interval < Duration::from_millis(34));
    }

    #[test]
    fn test_mask_ramp_is_continuous_at_lower_cutoff() {
        let alpha = MASK_RAMP_SLOPE * MASK_FOREGROUND_CUTOFF + MASK_RAMP_OFFSET;
        assert!(alpha.abs() < 0.1);
    }
}
