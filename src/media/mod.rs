// SPDX-License-Identifier: GPL-3.0-only

//! Frame types and colour conversion
//!
//! # Frames
//!
//! Capture devices hand over a [`RawFrame`]; the session stamps it with a
//! timestamp and sequence number to form a [`Frame`], and the frame bus turns
//! it into a [`SharedFrame`] once it reaches the broadcast stage.
//!
//! # Colour Space Conversion
//!
//! Mobile capture layers usually deliver NV21 or I420. The [`convert`] module
//! turns those into packed RGBA for the background processor and display.

pub mod convert;
pub mod frame;

pub use frame::{
    BackgroundMode, CaptureMode, CaptureRequest, Frame, FrameData, PixelFormat, RawFrame,
    SharedFrame,
};
