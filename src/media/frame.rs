// SPDX-License-Identifier: GPL-3.0-only

//! Capture requests, capture modes and video frames

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Background treatment requested for a capture
///
/// A single closed enum: blur and virtual background are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMode {
    /// Raw camera frames
    #[default]
    None,
    /// Blur everything outside the segmentation mask
    Blur,
    /// Replace everything outside the segmentation mask with an image
    VirtualBackground,
}

impl std::fmt::Display for BackgroundMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackgroundMode::None => write!(f, "none"),
            BackgroundMode::Blur => write!(f, "blur"),
            BackgroundMode::VirtualBackground => write!(f, "virtual-background"),
        }
    }
}

/// What the caller asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    #[serde(default)]
    pub background_mode: BackgroundMode,
}

impl CaptureRequest {
    pub fn new(width: u32, height: u32, frame_rate: u32, background_mode: BackgroundMode) -> Self {
        Self {
            width,
            height,
            frame_rate,
            background_mode,
        }
    }
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            background_mode: BackgroundMode::None,
        }
    }
}

impl std::fmt::Display for CaptureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} @ {}fps ({})",
            self.width, self.height, self.frame_rate, self.background_mode
        )
    }
}

/// A (resolution, frame rate) combination a device can actually produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureMode {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl CaptureMode {
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_rate,
        }
    }

    /// Total pixel count
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Time between two frames at this mode's rate
    pub fn frame_interval(&self) -> Duration {
        crate::constants::frame_interval(self.frame_rate)
    }
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} @ {}fps", self.width, self.height, self.frame_rate)
    }
}

/// Pixel layout of frame data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// RGBA - 32-bit with alpha, the canonical format after processing
    Rgba,
    /// NV21 - Y plane followed by interleaved VU plane (Android camera default)
    Nv21,
    /// I420 - Y, U and V planes
    I420,
    /// Gray8 - single luma channel
    Gray8,
}

impl PixelFormat {
    /// Minimum buffer length for a tightly packed frame
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        self.required_len(width, height, self.packed_stride(width))
    }

    /// Minimum buffer length for a frame whose first plane uses `stride`
    ///
    /// NV21 chroma rows share the luma stride (rounded up to whole VU pairs);
    /// I420 chroma planes use half the luma stride.
    pub fn required_len(&self, width: u32, height: u32, stride: u32) -> usize {
        let (w, h, stride) = (width as usize, height as usize, stride as usize);
        let chroma_rows = h.div_ceil(2);
        match self {
            PixelFormat::Rgba | PixelFormat::Gray8 => stride * h,
            PixelFormat::Nv21 => stride * h + stride.max(w.div_ceil(2) * 2) * chroma_rows,
            PixelFormat::I420 => stride * h + 2 * stride.div_ceil(2) * chroma_rows,
        }
    }

    /// Row stride of the first plane for a tightly packed frame
    pub fn packed_stride(&self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgba => width * 4,
            _ => width,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Rgba => write!(f, "RGBA"),
            PixelFormat::Nv21 => write!(f, "NV21"),
            PixelFormat::I420 => write!(f, "I420"),
            PixelFormat::Gray8 => write!(f, "GRAY8"),
        }
    }
}

/// Immutable pixel storage
///
/// Cheap to clone: a forwarded frame can reuse the pixels of a previous one
/// without copying.
#[derive(Clone)]
pub struct FrameData(Arc<[u8]>);

impl FrameData {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether two frames share the same pixel buffer
    pub fn ptr_eq(&self, other: &FrameData) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Vec<u8>> for FrameData {
    fn from(data: Vec<u8>) -> Self {
        FrameData(Arc::from(data.into_boxed_slice()))
    }
}

impl std::fmt::Debug for FrameData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FrameData({} bytes)", self.0.len())
    }
}

impl std::ops::Deref for FrameData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for FrameData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Pixels as delivered by a capture device, before the session stamps them
#[derive(Debug)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

/// A single captured or processed video frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: FrameData,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: u32,
    pub format: PixelFormat,
    /// Monotonic time since the session went live
    pub timestamp: Duration,
    /// Strictly increasing per session
    pub sequence: u64,
}

/// A frame that has reached the broadcast stage
pub type SharedFrame = Arc<Frame>;

impl Frame {
    /// Build a tightly packed RGBA frame
    pub fn from_rgba(
        data: Vec<u8>,
        width: u32,
        height: u32,
        timestamp: Duration,
        sequence: u64,
    ) -> Self {
        Self {
            data: FrameData::from(data),
            width,
            height,
            stride: width * 4,
            format: PixelFormat::Rgba,
            timestamp,
            sequence,
        }
    }

    /// Stamp a raw device frame with its session timestamp and sequence
    pub fn from_raw(raw: RawFrame, timestamp: Duration, sequence: u64) -> Self {
        Self {
            data: FrameData::from(raw.data),
            width: raw.width,
            height: raw.height,
            stride: raw.stride,
            format: raw.format,
            timestamp,
            sequence,
        }
    }

    /// Same pixels under a new timestamp and sequence number
    pub fn restamped(&self, timestamp: Duration, sequence: u64) -> Self {
        Self {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
            timestamp,
            sequence,
        }
    }

    /// Whether the buffer is large enough for the declared geometry
    pub fn is_well_formed(&self) -> bool {
        self.stride >= self.format.packed_stride(self.width)
            && self.data.len() >= self.format.required_len(self.width, self.height, self.stride)
    }
}
