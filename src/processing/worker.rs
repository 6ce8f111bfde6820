// SPDX-License-Identifier: GPL-3.0-only

//! Processing worker thread
//!
//! Pulls raw frames from one bus, runs them through a
//! [`BackgroundProcessor`] and publishes the results on another. A slow
//! processor only ever costs dropped raw frames; capture is never stalled.

use super::{BackgroundProcessor, ProcessorStats};
use crate::bus::{ConsumerId, FrameBus, Poll};
use crate::constants::WORKER_POLL_INTERVAL;
use crate::errors::CaptureResult;
use crate::frame_loop::{CaptureLoopController, LoopAction};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Loop state owned by the worker thread
struct WorkerState {
    processor: BackgroundProcessor,
    input: FrameBus,
    output: FrameBus,
    consumer: ConsumerId,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl WorkerState {
    fn step(&mut self) -> LoopAction {
        let frame = match self.input.poll_timeout(self.consumer, WORKER_POLL_INTERVAL) {
            Poll::Frame(frame) => frame,
            Poll::Empty => return LoopAction::Continue,
            Poll::Closed => return LoopAction::Stop,
        };

        let outcome = self.processor.process(&frame);
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = self.processor.stats();

        match outcome.into_frame() {
            Some(processed) => match self.output.publish(processed) {
                Ok(()) => LoopAction::Continue,
                Err(_) => LoopAction::Stop,
            },
            None => {
                trace!(sequence = frame.sequence, "No processed frame to publish");
                LoopAction::Continue
            }
        }
    }
}

impl Drop for WorkerState {
    fn drop(&mut self) {
        self.input.unsubscribe(self.consumer);
        self.output.close();
        debug!(input = %self.input.name(), output = %self.output.name(), "Processing worker finished");
    }
}

/// Handle to a running processing worker
pub struct ProcessingWorker {
    controller: CaptureLoopController,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl ProcessingWorker {
    /// Subscribe to `input` and start processing into `output`
    ///
    /// The subscription is taken before this returns so no frame published
    /// afterwards is missed. `output` is closed when the worker ends.
    pub fn spawn(
        processor: BackgroundProcessor,
        input: &FrameBus,
        output: &FrameBus,
    ) -> CaptureResult<Self> {
        let consumer = input.subscribe()?;
        let stats = Arc::new(Mutex::new(ProcessorStats::default()));
        let state = WorkerState {
            processor,
            input: input.clone(),
            output: output.clone(),
            consumer,
            stats: Arc::clone(&stats),
        };

        let controller =
            CaptureLoopController::start_with_init("background-processor", move || Ok(state), WorkerState::step)?;

        Ok(Self { controller, stats })
    }

    /// Latest processor counters
    pub fn stats(&self) -> ProcessorStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Stop processing without waiting for the frame in flight
    pub fn cancel(mut self) {
        self.controller.request_stop();
        self.controller.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::synthetic::render_pattern;
    use crate::config::ProcessingSettings;
    use crate::media::{BackgroundMode, Frame};
    use std::time::Duration;

    #[test]
    fn test_worker_forwards_processed_frames() {
        let raw = FrameBus::new("raw", 2);
        let processed = FrameBus::new("processed", 2);
        let consumer = processed.subscribe().unwrap();
        let processor =
            BackgroundProcessor::for_mode(BackgroundMode::Blur, &ProcessingSettings::default(), 30)
                .unwrap()
                .unwrap();
        let worker = ProcessingWorker::spawn(processor, &raw, &processed).unwrap();

        raw.publish(Frame::from_rgba(render_pattern(32, 24, 1), 32, 24, Duration::ZERO, 1))
            .unwrap();
        let frame = processed.poll_timeout(consumer, Duration::from_secs(5)).into_frame().unwrap();
        assert_eq!(frame.sequence, 1);
        assert_eq!(worker.stats().processed, 1);

        worker.cancel();
    }

    #[test]
    fn test_closing_input_closes_output() {
        let raw = FrameBus::new("raw", 2);
        let processed = FrameBus::new("processed", 2);
        let consumer = processed.subscribe().unwrap();
        let processor =
            BackgroundProcessor::for_mode(BackgroundMode::Blur, &ProcessingSettings::default(), 30)
                .unwrap()
                .unwrap();
        let _worker = ProcessingWorker::spawn(processor, &raw, &processed).unwrap();

        raw.close();
        assert!(processed.poll_timeout(consumer, Duration::from_secs(5)).is_closed());
    }
}
