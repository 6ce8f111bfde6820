// SPDX-License-Identifier: GPL-3.0-only

//! Capture thread state
//!
//! The capture thread owns the open device. It stamps each raw frame with a
//! session timestamp and sequence number and publishes it on the raw bus.

use super::{SessionState, SessionStatus};
use crate::backends::CaptureDevice;
use crate::bus::FrameBus;
use crate::frame_loop::LoopAction;
use crate::media::Frame;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

pub(super) struct CaptureState {
    device: Box<dyn CaptureDevice>,
    device_id: String,
    bus: FrameBus,
    opened_at: Instant,
    sequence: u64,
    status: Arc<Mutex<SessionStatus>>,
    generation: u64,
}

impl CaptureState {
    pub(super) fn new(
        device: Box<dyn CaptureDevice>,
        device_id: String,
        bus: FrameBus,
        status: Arc<Mutex<SessionStatus>>,
        generation: u64,
    ) -> Self {
        Self {
            device,
            device_id,
            bus,
            opened_at: Instant::now(),
            sequence: 0,
            status,
            generation,
        }
    }

    pub(super) fn step(&mut self) -> LoopAction {
        let raw = match self.device.blocking_capture() {
            Ok(raw) => raw,
            Err(e) => {
                error!(device = %self.device_id, error = %e, "Capture device failed");
                self.fault();
                return LoopAction::Stop;
            }
        };

        self.sequence += 1;
        let frame = Frame::from_raw(raw, self.opened_at.elapsed(), self.sequence);
        if !frame.is_well_formed() {
            warn!(
                device = %self.device_id,
                sequence = frame.sequence,
                len = frame.data.len(),
                format = %frame.format,
                "Discarding malformed frame"
            );
            return LoopAction::Continue;
        }

        trace!(device = %self.device_id, sequence = frame.sequence, "Captured frame");
        match self.bus.publish(frame) {
            Ok(()) => LoopAction::Continue,
            Err(_) => {
                debug!(device = %self.device_id, "Raw bus closed, ending capture");
                LoopAction::Stop
            }
        }
    }

    /// Move a live session straight to Closing and close the raw bus
    fn fault(&self) {
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if status.generation == self.generation
                && matches!(status.state, SessionState::Opening | SessionState::Live)
            {
                status.state = SessionState::Closing;
            }
        }
        self.bus.close();
    }
}

impl Drop for CaptureState {
    fn drop(&mut self) {
        self.device.close();
        debug!(device = %self.device_id, frames = self.sequence, "Capture device closed");
    }
}
