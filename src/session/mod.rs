// SPDX-License-Identifier: GPL-3.0-only

//! Capture session lifecycle
//!
//! A [`CaptureSession`] owns one device. Its state machine is
//!
//! ```text
//!          start                 open ok
//!   Idle ─────────▶ Opening ─────────────▶ Live
//!    ▲                 │ open failed         │ stop / device error
//!    └─────────────────┘                     ▼
//!    ▲                                    Closing
//!    └────────────────────────────────────────┘
//!                 device released
//! ```
//!
//! `start` and `stop` are serialized by one session-wide lock, so a device
//! open never overlaps a close. The track only becomes visible once the open
//! has committed.

mod capture;
pub mod devices;

pub use devices::MediaDevices;

use crate::backends::CaptureBackend;
use crate::bus::{BusStats, FrameBus};
use crate::config::Config;
use crate::errors::{CaptureError, CaptureResult};
use crate::frame_loop::CaptureLoopController;
use crate::media::{CaptureMode, CaptureRequest};
use crate::negotiation;
use crate::processing::{BackgroundProcessor, ProcessingWorker, ProcessorStats};
use crate::track::{Track, TrackHandle};
use capture::CaptureState;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Externally observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Opening,
    Live,
    /// Stopping, or the device failed and the session awaits `stop`
    Closing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Opening => write!(f, "opening"),
            SessionState::Live => write!(f, "live"),
            SessionState::Closing => write!(f, "closing"),
        }
    }
}

/// State shared with the capture thread
///
/// `generation` identifies the pipeline a capture thread belongs to, so a
/// detached thread from an earlier start cannot touch a newer one.
#[derive(Debug, Default)]
pub(crate) struct SessionStatus {
    state: SessionState,
    generation: u64,
}

/// Everything that exists while the device is open
struct ActivePipeline {
    mode: CaptureMode,
    request: CaptureRequest,
    track: Arc<Track>,
    raw_bus: FrameBus,
    output_bus: FrameBus,
    capture: CaptureLoopController,
    worker: Option<ProcessingWorker>,
}

impl ActivePipeline {
    /// Serves `request` as-is when it resolves to the same mode and asks for
    /// the same background treatment
    fn serves(&self, mode: &CaptureMode, request: &CaptureRequest) -> bool {
        self.mode == *mode && self.request.background_mode == request.background_mode
    }
}

#[derive(Default)]
struct Lifecycle {
    active: Option<ActivePipeline>,
    generation: u64,
}

pub(crate) struct SessionInner {
    device_id: String,
    backend: Arc<dyn CaptureBackend>,
    config: Config,
    /// Session-wide lock serializing start and stop
    lifecycle: Mutex<Lifecycle>,
    status: Arc<Mutex<SessionStatus>>,
}

impl SessionInner {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_status(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        let mut status = self.lock_status();
        if status.state != state {
            debug!(device = %self.device_id, from = %status.state, to = %state, "Session state");
            status.state = state;
        }
    }

    fn state(&self) -> SessionState {
        self.lock_status().state
    }

    /// Opening -> Live, unless the device already failed during open
    fn commit_live(&self) -> bool {
        let mut status = self.lock_status();
        if status.state == SessionState::Opening {
            status.state = SessionState::Live;
            true
        } else {
            false
        }
    }

    /// Stop the session if `track` is still its live track and no handle
    /// was handed out again since its count reached zero
    pub(crate) fn release_track(&self, track: &Track) {
        let mut lifecycle = self.lock_lifecycle();
        let current = lifecycle
            .active
            .as_ref()
            .is_some_and(|active| std::ptr::eq(Arc::as_ptr(&active.track), track));

        if !current {
            track.end();
            return;
        }
        if track.ref_count() > 0 {
            debug!(track = %track.id(), "Track re-acquired before release completed");
            return;
        }
        self.stop_locked(&mut lifecycle);
    }

    fn stop_locked(&self, lifecycle: &mut Lifecycle) {
        let Some(active) = lifecycle.active.take() else {
            return;
        };

        self.set_state(SessionState::Closing);
        info!(device = %self.device_id, mode = %active.mode, "Stopping capture session");

        let ActivePipeline {
            track,
            raw_bus,
            output_bus,
            mut capture,
            worker,
            ..
        } = active;

        track.end();
        if let Some(worker) = worker {
            worker.cancel();
        }
        raw_bus.close();
        output_bus.close();

        let timeout = self.config.session.stop_timeout();
        if !capture.stop_with_timeout(timeout) {
            warn!(
                device = %self.device_id,
                timeout_ms = timeout.as_millis() as u64,
                "Capture thread still running, device will close when it exits"
            );
        }

        self.set_state(SessionState::Idle);
        info!(device = %self.device_id, "Capture session stopped");
    }

    fn open_pipeline(
        self: &Arc<Self>,
        generation: u64,
        mode: CaptureMode,
        request: CaptureRequest,
    ) -> CaptureResult<ActivePipeline> {
        let depth = self.config.bus.queue_depth;
        let raw_bus = FrameBus::new(format!("{}/raw", self.device_id), depth);

        let (output_bus, worker) = match BackgroundProcessor::for_mode(
            request.background_mode,
            &self.config.processing,
            mode.frame_rate,
        )? {
            Some(processor) => {
                let output_bus = FrameBus::new(format!("{}/processed", self.device_id), depth);
                let worker = ProcessingWorker::spawn(processor, &raw_bus, &output_bus)?;
                (output_bus, Some(worker))
            }
            None => (raw_bus.clone(), None),
        };

        let backend = Arc::clone(&self.backend);
        let device_id = self.device_id.clone();
        let capture_bus = raw_bus.clone();
        let status = Arc::clone(&self.status);
        let thread_name = format!("capture-{}", self.device_id);

        let capture = CaptureLoopController::start_with_init(
            &thread_name,
            move || {
                let device = backend.open(&device_id, &mode)?;
                Ok(CaptureState::new(device, device_id, capture_bus, status, generation))
            },
            CaptureState::step,
        );

        let capture = match capture {
            Ok(capture) => capture,
            Err(e) => {
                if let Some(worker) = worker {
                    worker.cancel();
                }
                raw_bus.close();
                output_bus.close();
                return Err(e);
            }
        };

        let track = Arc::new(Track::new(
            &self.device_id,
            mode,
            request.background_mode,
            output_bus.clone(),
            Arc::downgrade(self),
        ));

        Ok(ActivePipeline {
            mode,
            request,
            track,
            raw_bus,
            output_bus,
            capture,
            worker,
        })
    }
}

/// Capture lifecycle for one device
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct CaptureSession {
    inner: Arc<SessionInner>,
}

impl CaptureSession {
    pub fn new(device_id: impl Into<String>, backend: Arc<dyn CaptureBackend>, config: Config) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                device_id: device_id.into(),
                backend,
                config,
                lifecycle: Mutex::new(Lifecycle::default()),
                status: Arc::new(Mutex::new(SessionStatus::default())),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Negotiated mode while the device is open
    pub fn mode(&self) -> Option<CaptureMode> {
        self.inner.lock_lifecycle().active.as_ref().map(|active| active.mode)
    }

    /// Open the device and return a handle to its track
    ///
    /// While live, a request resolving to the same mode and background
    /// treatment gets another handle to the existing track.
    ///
    /// # Errors
    /// * `InvalidRequest` - zero width, height or frame rate
    /// * `NoCompatibleMode` - the device offers no modes
    /// * `SessionBusy` - live with a different mode or background
    /// * `DeviceUnavailable` - the device refused to open
    pub fn start(&self, request: CaptureRequest) -> CaptureResult<TrackHandle> {
        negotiation::validate_request(&request)?;
        let mut lifecycle = self.inner.lock_lifecycle();

        if lifecycle.active.is_some() && self.inner.state() == SessionState::Closing {
            debug!(device = %self.inner.device_id, "Finishing teardown of failed session");
            self.inner.stop_locked(&mut lifecycle);
        }

        let modes = self.inner.backend.enumerate_modes(&self.inner.device_id);
        let mode = negotiation::resolve(&request, &modes)?;

        if let Some(active) = &lifecycle.active {
            if active.serves(&mode, &request) {
                debug!(device = %self.inner.device_id, mode = %mode, "Joining live session");
                return Ok(active.track.new_handle());
            }
            warn!(
                device = %self.inner.device_id,
                live = %active.mode,
                requested = %request,
                "Session busy with a different configuration"
            );
            return Err(CaptureError::SessionBusy);
        }

        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        {
            let mut status = self.inner.lock_status();
            status.generation = generation;
        }
        self.inner.set_state(SessionState::Opening);
        info!(device = %self.inner.device_id, request = %request, mode = %mode, "Opening capture device");

        match self.inner.open_pipeline(generation, mode, request) {
            Ok(pipeline) => {
                let handle = pipeline.track.new_handle();
                lifecycle.active = Some(pipeline);
                if self.inner.commit_live() {
                    info!(device = %self.inner.device_id, mode = %mode, track = %handle.id(), "Capture session live");
                } else {
                    warn!(device = %self.inner.device_id, track = %handle.id(), "Device failed right after open");
                }
                Ok(handle)
            }
            Err(e) => {
                self.inner.set_state(SessionState::Idle);
                warn!(device = %self.inner.device_id, error = %e, "Failed to open capture device");
                Err(e)
            }
        }
    }

    /// Stop capture and end the track
    ///
    /// Every outstanding handle fails with `TrackEnded` afterwards. Safe to
    /// call from any thread and any number of times.
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lock_lifecycle();
        self.inner.stop_locked(&mut lifecycle);
    }

    /// Stop only if `handle` belongs to the session's current track
    pub fn stop_track(&self, handle: &TrackHandle) {
        let mut lifecycle = self.inner.lock_lifecycle();
        let current = lifecycle
            .active
            .as_ref()
            .is_some_and(|active| active.track.id() == handle.id());
        if current {
            self.inner.stop_locked(&mut lifecycle);
        }
    }

    /// Counters of the raw capture bus while live
    pub fn capture_stats(&self) -> Option<BusStats> {
        let lifecycle = self.inner.lock_lifecycle();
        lifecycle.active.as_ref().map(|active| active.raw_bus.stats())
    }

    /// Counters of the background processor while live
    pub fn processor_stats(&self) -> Option<ProcessorStats> {
        let lifecycle = self.inner.lock_lifecycle();
        lifecycle
            .active
            .as_ref()
            .and_then(|active| active.worker.as_ref())
            .map(ProcessingWorker::stats)
    }

    /// Whether the capture thread of the live pipeline is still running
    pub fn is_capturing(&self) -> bool {
        let lifecycle = self.inner.lock_lifecycle();
        lifecycle
            .active
            .as_ref()
            .is_some_and(|active| active.capture.is_running())
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device", &self.inner.device_id)
            .field("state", &self.inner.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SyntheticBackend, SyntheticDeviceSpec};
    use crate::bus::Poll;
    use crate::media::BackgroundMode;
    use std::time::Duration;

    fn session(spec: SyntheticDeviceSpec) -> (CaptureSession, SyntheticBackend) {
        let backend = SyntheticBackend::new(vec![spec]);
        let session = CaptureSession::new("cam", Arc::new(backend.clone()), Config::default());
        (session, backend)
    }

    fn request(width: u32, height: u32, fps: u32) -> CaptureRequest {
        CaptureRequest::new(width, height, fps, BackgroundMode::None)
    }

    #[test]
    fn test_start_goes_live() {
        let (session, backend) = session(SyntheticDeviceSpec::new("cam"));
        assert_eq!(session.state(), SessionState::Idle);

        let handle = session.start(request(640, 480, 30)).unwrap();
        assert_eq!(session.state(), SessionState::Live);
        assert_eq!(handle.mode(), CaptureMode::new(640, 480, 30));
        assert_eq!(backend.open_count(), 1);

        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(backend.close_count(), 1);
    }

    #[test]
    fn test_open_failure_returns_to_idle() {
        let (session, _) = session(SyntheticDeviceSpec::new("cam").denying_open());
        let result = session.start(request(640, 480, 30));
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.mode().is_none());
    }

    #[test]
    fn test_busy_with_other_mode() {
        let (session, _) = session(SyntheticDeviceSpec::new("cam"));
        let _handle = session.start(request(640, 480, 30)).unwrap();
        assert_eq!(
            session.start(request(1920, 1080, 30)).unwrap_err(),
            CaptureError::SessionBusy
        );

        let blur = CaptureRequest::new(640, 480, 30, BackgroundMode::Blur);
        assert_eq!(session.start(blur).unwrap_err(), CaptureError::SessionBusy);
        session.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (session, backend) = session(SyntheticDeviceSpec::new("cam"));
        let _handle = session.start(request(640, 480, 30)).unwrap();
        session.stop();
        session.stop();
        assert_eq!(backend.close_count(), 1);
    }

    #[test]
    fn test_device_fault_closes_consumers() {
        let spec = SyntheticDeviceSpec::new("cam").failing_after(5);
        let (session, _) = session(spec);
        let handle = session.start(request(320, 240, 30)).unwrap();
        let source = handle.to_frame_source().unwrap();

        let mut closed = false;
        for _ in 0..100 {
            if let Poll::Closed = source.poll_timeout(Duration::from_millis(50)).unwrap() {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert_eq!(session.state(), SessionState::Closing);

        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(handle.is_ended());
    }

    #[test]
    fn test_restart_after_fault() {
        let spec = SyntheticDeviceSpec::new("cam").unpaced().failing_after(1);
        let (session, backend) = session(spec);
        let first = session.start(request(320, 240, 30)).unwrap();

        for _ in 0..100 {
            if session.state() == SessionState::Closing {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let second = session.start(request(320, 240, 30)).unwrap();
        assert!(first.is_ended());
        assert_ne!(first.id(), second.id());
        assert_eq!(backend.open_count(), 2);
        session.stop();
    }
}
