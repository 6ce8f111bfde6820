// SPDX-License-Identifier: GPL-3.0-only

//! Background processing
//!
//! The [`BackgroundProcessor`] sits between the raw and processed frame buses
//! of a session whose request asks for blur or a virtual background:
//!
//! ```text
//! raw bus ──▶ ProcessingWorker ──▶ BackgroundProcessor ──▶ processed bus
//!                                    │
//!                                    ├─ Segmenter (every N-th frame)
//!                                    ├─ SmoothingBuffer → Matte
//!                                    └─ BackgroundEffect + composite
//! ```
//!
//! Each frame gets a hard deadline of `deadline_factor` frame intervals.
//! Rendering runs on its own thread, so a frame that misses the deadline is
//! abandoned as soon as the deadline passes and the previous output is
//! forwarded in its place under the new sequence number.

pub mod effects;
pub mod segmentation;
pub mod worker;

pub use effects::{BackgroundEffect, BlurEffect, VirtualBackgroundEffect};
pub use segmentation::{ChromaKeySegmenter, Mask, Matte, Segmenter, SmoothingBuffer};
pub use worker::ProcessingWorker;

use crate::config::ProcessingSettings;
use crate::constants::frame_interval;
use crate::errors::{CaptureError, CaptureResult};
use crate::media::{BackgroundMode, Frame, convert};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Weight of the newest sample in the moving average of processing time
const AVERAGE_WEIGHT: f64 = 0.1;

/// Counters for one processor
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessorStats {
    /// Frames processed within the deadline
    pub processed: u64,
    /// Frames replaced by the previous output
    pub forwarded: u64,
    /// Frames with no output at all (miss before any success)
    pub dropped: u64,
    pub deadline_misses: u64,
    pub segmentations: u64,
    /// Moving average of processing time
    pub average_time: Duration,
}

/// What happened to one input frame
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// Freshly processed output
    Processed(Frame),
    /// Previous output re-sent because this frame failed or was late
    Forwarded(Frame),
    /// Nothing to send yet
    Dropped,
}

impl ProcessOutcome {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            ProcessOutcome::Processed(frame) | ProcessOutcome::Forwarded(frame) => Some(frame),
            ProcessOutcome::Dropped => None,
        }
    }
}

/// Segmentation and compositing state, owned by the render thread
struct Renderer {
    segmenter: Box<dyn Segmenter>,
    effect: Box<dyn BackgroundEffect>,
    smoothing: SmoothingBuffer,
    matte: Option<Matte>,
    segmentation_interval: u64,
    frames_seen: u64,
}

/// Result of one render job
struct Rendered {
    sequence: u64,
    result: CaptureResult<Frame>,
    elapsed: Duration,
    segmented: bool,
}

impl Renderer {
    fn run(mut self, jobs: Receiver<Frame>, results: Sender<Rendered>) {
        while let Ok(frame) = jobs.recv() {
            let started = Instant::now();
            let mut segmented = false;
            let result = self.render(&frame, &mut segmented);
            let rendered = Rendered {
                sequence: frame.sequence,
                result,
                elapsed: started.elapsed(),
                segmented,
            };
            if results.send(rendered).is_err() {
                break;
            }
        }
        debug!(segmenter = self.segmenter.name(), "Render thread finished");
    }

    fn render(&mut self, frame: &Frame, segmented: &mut bool) -> CaptureResult<Frame> {
        let rgba = convert::to_rgba_image(frame)?;
        let (width, height) = rgba.dimensions();

        let due = self.frames_seen % self.segmentation_interval == 0;
        self.frames_seen += 1;
        let stale = self.matte.as_ref().is_none_or(|m| !m.matches(width, height));

        if due || stale {
            let mask = self.segmenter.segment(&rgba)?;
            let smoothed = self.smoothing.push(mask);
            self.matte = Some(Matte::from_mask(&smoothed, width, height));
            *segmented = true;
        }

        let Some(matte) = &self.matte else {
            return Err(CaptureError::Image("no segmentation mask".into()));
        };
        let background = self.effect.render_background(&rgba)?;
        let output = effects::composite(&rgba, &background, &matte.alpha);

        Ok(Frame::from_rgba(
            output.into_raw(),
            width,
            height,
            frame.timestamp,
            frame.sequence,
        ))
    }
}

/// Segments frames and composites the chosen background effect
///
/// Rendering happens on a dedicated thread. [`process`](Self::process)
/// waits at most the hard deadline for it; a late render is abandoned and
/// its result discarded when it eventually arrives. While a render is still
/// outstanding new frames are answered with the previous output at once.
///
/// Bound to one session; the smoothing state is dropped with it.
pub struct BackgroundProcessor {
    jobs: Sender<Frame>,
    results: Receiver<Rendered>,
    in_flight: Option<u64>,
    budget: Duration,
    deadline: Duration,
    over_budget: bool,
    last_output: Option<Frame>,
    stats: ProcessorStats,
}

impl BackgroundProcessor {
    pub fn new(
        segmenter: Box<dyn Segmenter>,
        effect: Box<dyn BackgroundEffect>,
        settings: &ProcessingSettings,
        frame_rate: u32,
    ) -> CaptureResult<Self> {
        let budget = frame_interval(frame_rate);
        let deadline = budget.mul_f64(settings.deadline_factor.max(1.0));
        debug!(
            segmenter = segmenter.name(),
            effect = effect.name(),
            budget_ms = budget.as_millis() as u64,
            deadline_ms = deadline.as_millis() as u64,
            "Created background processor"
        );

        let renderer = Renderer {
            segmenter,
            effect,
            smoothing: SmoothingBuffer::new(settings.smoothing_window),
            matte: None,
            segmentation_interval: settings.segmentation_interval.max(1) as u64,
            frames_seen: 0,
        };
        let (jobs, job_rx) = mpsc::channel();
        let (result_tx, results) = mpsc::channel();
        thread::Builder::new()
            .name("background-render".into())
            .spawn(move || renderer.run(job_rx, result_tx))
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to spawn background-render: {}", e)))?;

        Ok(Self {
            jobs,
            results,
            in_flight: None,
            budget,
            deadline,
            over_budget: false,
            last_output: None,
            stats: ProcessorStats::default(),
        })
    }

    /// Build the processor a background mode needs, or `None` for raw capture
    ///
    /// Uses the chroma-key segmenter. A virtual background image that fails
    /// to load falls back to the generated gradient.
    pub fn for_mode(
        mode: BackgroundMode,
        settings: &ProcessingSettings,
        frame_rate: u32,
    ) -> CaptureResult<Option<Self>> {
        let effect: Box<dyn BackgroundEffect> = match mode {
            BackgroundMode::None => return Ok(None),
            BackgroundMode::Blur => Box::new(BlurEffect::new(settings.blur_radius)),
            BackgroundMode::VirtualBackground => {
                Box::new(match &settings.background_image {
                    Some(path) => VirtualBackgroundEffect::from_path(path).unwrap_or_else(|e| {
                        warn!(path = %path.display(), error = %e, "Using generated background");
                        VirtualBackgroundEffect::gradient()
                    }),
                    None => VirtualBackgroundEffect::gradient(),
                })
            }
        };
        let segmenter = Box::new(ChromaKeySegmenter::new(
            settings.key_color,
            settings.key_tolerance,
            settings.key_softness,
        ));

        Self::new(segmenter, effect, settings, frame_rate).map(Some)
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }

    /// Process one frame, returning within the hard deadline
    ///
    /// The input is never modified. Output keeps the input's timestamp and
    /// sequence number.
    pub fn process(&mut self, frame: &Frame) -> ProcessOutcome {
        self.collect_late();

        if let Some(busy) = self.in_flight {
            self.stats.deadline_misses += 1;
            debug!(sequence = frame.sequence, busy, "Renderer still busy");
            return self.forward_previous(frame);
        }

        if self.jobs.send(frame.clone()).is_err() {
            warn!(sequence = frame.sequence, "Render thread is gone");
            return self.forward_previous(frame);
        }
        self.in_flight = Some(frame.sequence);

        let started = Instant::now();
        match self.results.recv_timeout(self.deadline) {
            Ok(rendered) => {
                self.in_flight = None;
                self.record(&rendered);
                match rendered.result {
                    Ok(output) => {
                        self.stats.processed += 1;
                        self.last_output = Some(output.clone());
                        trace!(
                            sequence = frame.sequence,
                            elapsed_us = rendered.elapsed.as_micros() as u64,
                            "Processed frame"
                        );
                        ProcessOutcome::Processed(output)
                    }
                    Err(err) => {
                        warn!(sequence = frame.sequence, error = %err, "Background processing failed");
                        self.forward_previous(frame)
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                self.stats.deadline_misses += 1;
                let err = CaptureError::ProcessingDeadlineExceeded {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    deadline_ms: self.deadline.as_millis() as u64,
                };
                warn!(sequence = frame.sequence, error = %err, "Abandoning late frame");
                self.forward_previous(frame)
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.in_flight = None;
                warn!(sequence = frame.sequence, "Render thread is gone");
                self.forward_previous(frame)
            }
        }
    }

    /// Discard results of renders that already missed their deadline
    fn collect_late(&mut self) {
        while let Ok(rendered) = self.results.try_recv() {
            self.in_flight = None;
            self.record(&rendered);
            debug!(
                sequence = rendered.sequence,
                elapsed_ms = rendered.elapsed.as_millis() as u64,
                "Dropped late render"
            );
        }
    }

    fn forward_previous(&mut self, frame: &Frame) -> ProcessOutcome {
        match &self.last_output {
            Some(previous) => {
                self.stats.forwarded += 1;
                ProcessOutcome::Forwarded(previous.restamped(frame.timestamp, frame.sequence))
            }
            None => {
                self.stats.dropped += 1;
                ProcessOutcome::Dropped
            }
        }
    }

    fn record(&mut self, rendered: &Rendered) {
        if rendered.segmented {
            self.stats.segmentations += 1;
        }

        let elapsed = rendered.elapsed;
        let average = if self.stats.average_time.is_zero() {
            elapsed
        } else {
            self.stats
                .average_time
                .mul_f64(1.0 - AVERAGE_WEIGHT)
                .saturating_add(elapsed.mul_f64(AVERAGE_WEIGHT))
        };
        self.stats.average_time = average;

        let over = average > self.budget;
        if over != self.over_budget {
            self.over_budget = over;
            if over {
                warn!(
                    average_ms = average.as_millis() as u64,
                    budget_ms = self.budget.as_millis() as u64,
                    "Background processing slower than frame rate"
                );
            } else {
                debug!("Background processing back within frame budget");
            }
        }
    }
}
