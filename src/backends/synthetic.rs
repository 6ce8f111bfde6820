// SPDX-License-Identifier: GPL-3.0-only

//! Synthetic capture backend
//!
//! Produces a deterministic test pattern: a chequered key-colour backdrop
//! with a solid subject block moving across the middle of the frame. The
//! backdrop is inside the chroma-key tolerance and the subject is far from
//! it, so the default segmenter separates them cleanly.
//!
//! Counters and failure injection make the backend usable as a test double
//! for the session lifecycle.

use super::{CaptureBackend, CaptureDevice, DeviceDescriptor};
use crate::constants::DEFAULT_KEY_COLOR;
use crate::errors::{CaptureError, CaptureResult};
use crate::media::convert::{rgb_to_yuv, rgba_to_nv21};
use crate::media::{CaptureMode, PixelFormat, RawFrame};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Secondary backdrop colour, within the default key tolerance
const BACKDROP_ALT: [u8; 3] = [20, 150, 80];

/// Subject colour, far from the key colour
const SUBJECT_COLOR: [u8; 3] = [224, 172, 105];

/// Size of the backdrop chequer cells in pixels
const CHECKER_CELL: u32 = 8;

/// Description of one synthetic device
#[derive(Debug, Clone)]
pub struct SyntheticDeviceSpec {
    pub id: String,
    pub name: String,
    pub modes: Vec<CaptureMode>,
    /// Pixel format the device delivers
    pub format: PixelFormat,
    /// Sleep to the mode's frame interval between frames
    pub paced: bool,
    /// Report a device failure after this many frames
    pub fail_after: Option<u64>,
    /// Refuse every open
    pub deny_open: bool,
    /// Block inside `open` for this long
    pub open_delay: Option<Duration>,
}

impl SyntheticDeviceSpec {
    /// A paced RGBA device with common webcam modes
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: format!("Synthetic camera ({})", id),
            id,
            modes: vec![
                CaptureMode::new(1920, 1080, 30),
                CaptureMode::new(1280, 720, 30),
                CaptureMode::new(640, 480, 30),
                CaptureMode::new(640, 480, 15),
                CaptureMode::new(320, 240, 30),
            ],
            format: PixelFormat::Rgba,
            paced: true,
            fail_after: None,
            deny_open: false,
            open_delay: None,
        }
    }

    pub fn with_modes(mut self, modes: Vec<CaptureMode>) -> Self {
        self.modes = modes;
        self
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn denying_open(mut self) -> Self {
        self.deny_open = true;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Test-pattern backend
#[derive(Clone)]
pub struct SyntheticBackend {
    devices: Arc<Mutex<Vec<SyntheticDeviceSpec>>>,
    counters: Arc<Counters>,
}

impl SyntheticBackend {
    pub fn new(devices: Vec<SyntheticDeviceSpec>) -> Self {
        Self {
            devices: Arc::new(Mutex::new(devices)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// One paced RGBA device with the default id
    pub fn single() -> Self {
        Self::new(vec![SyntheticDeviceSpec::new(
            crate::constants::DEFAULT_DEVICE_ID,
        )])
    }

    fn spec(&self, device_id: &str) -> Option<SyntheticDeviceSpec> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
    }

    /// Toggle open refusal for a device (simulates a permission change)
    pub fn set_deny_open(&self, device_id: &str, deny: bool) {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(device) = devices.iter_mut().find(|d| d.id == device_id) {
            device.deny_open = deny;
        }
    }

    /// Number of successful opens so far
    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Number of closes so far
    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::single()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|d| DeviceDescriptor {
                id: d.id.clone(),
                name: d.name.clone(),
            })
            .collect()
    }

    fn enumerate_modes(&self, device_id: &str) -> Vec<CaptureMode> {
        self.spec(device_id).map(|d| d.modes).unwrap_or_default()
    }

    fn open(&self, device_id: &str, mode: &CaptureMode) -> CaptureResult<Box<dyn CaptureDevice>> {
        let spec = self
            .spec(device_id)
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("No device '{}'", device_id)))?;

        if let Some(delay) = spec.open_delay {
            std::thread::sleep(delay);
        }

        if spec.deny_open {
            warn!(device = %device_id, "Synthetic device refused open");
            return Err(CaptureError::DeviceUnavailable(format!(
                "Device '{}' refused open",
                device_id
            )));
        }

        if !spec.modes.contains(mode) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "Device '{}' does not support {}",
                device_id, mode
            )));
        }

        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        info!(device = %device_id, mode = %mode, format = %spec.format, "Synthetic device opened");

        Ok(Box::new(SyntheticDevice {
            id: spec.id,
            mode: *mode,
            format: spec.format,
            paced: spec.paced,
            fail_after: spec.fail_after,
            produced: 0,
            next_due: None,
            closed: false,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct SyntheticDevice {
    id: String,
    mode: CaptureMode,
    format: PixelFormat,
    paced: bool,
    fail_after: Option<u64>,
    produced: u64,
    next_due: Option<Instant>,
    closed: bool,
    counters: Arc<Counters>,
}

impl SyntheticDevice {
    fn wait_for_slot(&mut self) {
        if !self.paced {
            return;
        }
        let interval = self.mode.frame_interval();
        let now = Instant::now();
        match self.next_due {
            Some(due) if due > now => {
                std::thread::sleep(due - now);
                self.next_due = Some(due + interval);
            }
            // First frame, or we fell behind: restart the cadence from now
            _ => self.next_due = Some(now + interval),
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn blocking_capture(&mut self) -> CaptureResult<RawFrame> {
        if self.closed {
            return Err(CaptureError::DeviceUnavailable("Device closed".to_string()));
        }
        if let Some(limit) = self.fail_after
            && self.produced >= limit
        {
            return Err(CaptureError::DeviceUnavailable(format!(
                "Device '{}' disconnected",
                self.id
            )));
        }

        self.wait_for_slot();

        let CaptureMode { width, height, .. } = self.mode;
        let rgba = render_pattern(width, height, self.produced);
        self.produced += 1;

        let (data, stride) = match self.format {
            PixelFormat::Rgba => (rgba, width * 4),
            PixelFormat::Nv21 => (rgba_to_nv21(&rgba, width, height), width),
            PixelFormat::I420 => (rgba_to_i420(&rgba, width, height), width),
            PixelFormat::Gray8 => (
                rgba.chunks_exact(4)
                    .map(|p| rgb_to_yuv(p[0], p[1], p[2]).0)
                    .collect(),
                width,
            ),
        };

        Ok(RawFrame {
            data,
            width,
            height,
            stride,
            format: self.format,
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        debug!(device = %self.id, frames = self.produced, "Synthetic device closed");
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bounds `(x0, y0, x1, y1)` of the subject block for a given frame index
///
/// The subject stays inside the middle half horizontally and the lower two
/// thirds vertically, so the top-left quarter-by-third is always backdrop.
pub fn subject_bounds(width: u32, height: u32, index: u64) -> (u32, u32, u32, u32) {
    let block_w = (width / 4).max(1);
    let travel = (width / 4).max(1) as u64;
    let x0 = width / 4 + ((index * 2) % travel) as u32;
    let y0 = height / 3;
    (x0, y0, (x0 + block_w).min(width), height)
}

/// Render the test pattern as packed RGBA
pub fn render_pattern(width: u32, height: u32, index: u64) -> Vec<u8> {
    let (x0, y0, x1, y1) = subject_bounds(width, height, index);
    let mut rgba = vec![0u8; width as usize * height as usize * 4];

    for y in 0..height {
        for x in 0..width {
            let color = if x >= x0 && x < x1 && y >= y0 && y < y1 {
                SUBJECT_COLOR
            } else if ((x / CHECKER_CELL) + (y / CHECKER_CELL)) % 2 == 0 {
                DEFAULT_KEY_COLOR
            } else {
                BACKDROP_ALT
            };
            let o = (y as usize * width as usize + x as usize) * 4;
            rgba[o..o + 4].copy_from_slice(&[color[0], color[1], color[2], 255]);
        }
    }

    rgba
}

fn rgba_to_i420(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let chroma_w = w.div_ceil(2);
    let chroma_h = h.div_ceil(2);
    let mut out = vec![0u8; PixelFormat::I420.frame_len(width, height)];
    let u_offset = w * h;
    let v_offset = u_offset + chroma_w * chroma_h;

    for y in 0..h {
        for x in 0..w {
            let p = (y * w + x) * 4;
            let (luma, u, v) = rgb_to_yuv(rgba[p], rgba[p + 1], rgba[p + 2]);
            out[y * w + x] = luma;
            if x % 2 == 0 && y % 2 == 0 {
                let c = (y / 2) * chroma_w + x / 2;
                out[u_offset + c] = u;
                out[v_offset + c] = v;
            }
        }
    }

    out
}
