// SPDX-License-Identifier: GPL-3.0-only

//! Tracks and reference-counted track handles
//!
//! A [`Track`] is the live output of one capture session. Callers hold
//! [`TrackHandle`]s; when the last handle is released the session stops.
//! Frames are read through a [`FrameSource`] taken from a handle.

use crate::bus::{ConsumerId, FrameBus, Poll};
use crate::constants::TRACK_URL_PREFIX;
use crate::errors::{CaptureError, CaptureResult};
use crate::media::{BackgroundMode, CaptureMode, SharedFrame, convert};
use crate::session::SessionInner;
use futures::Stream;
use image::RgbaImage;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Live output of a capture session
pub(crate) struct Track {
    id: Uuid,
    device_id: String,
    mode: CaptureMode,
    background_mode: BackgroundMode,
    bus: FrameBus,
    ended: AtomicBool,
    refs: AtomicUsize,
    session: Weak<SessionInner>,
}

impl Track {
    pub(crate) fn new(
        device_id: &str,
        mode: CaptureMode,
        background_mode: BackgroundMode,
        bus: FrameBus,
        session: Weak<SessionInner>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            mode,
            background_mode,
            bus,
            ended: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
            session,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Mark the track ended; true only for the call that ended it
    pub(crate) fn end(&self) -> bool {
        let first = !self.ended.swap(true, Ordering::SeqCst);
        if first {
            debug!(track = %self.id, "Track ended");
        }
        first
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Hand out another reference to this track
    pub(crate) fn new_handle(self: &Arc<Self>) -> TrackHandle {
        let refs = self.refs.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(track = %self.id, refs, "New track handle");
        TrackHandle {
            track: Arc::clone(self),
            released: AtomicBool::new(false),
        }
    }
}

/// A reference to a live track
///
/// Handles are counted: the session stops when the last one is released.
/// Dropping a handle releases it. Every call on a released handle, or on a
/// handle whose session stopped, fails with `TrackEnded`.
pub struct TrackHandle {
    track: Arc<Track>,
    released: AtomicBool,
}

impl TrackHandle {
    fn ensure_live(&self) -> CaptureResult<()> {
        if self.released.load(Ordering::SeqCst) || self.track.is_ended() {
            return Err(CaptureError::TrackEnded);
        }
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.track.id
    }

    pub fn device_id(&self) -> &str {
        &self.track.device_id
    }

    /// Negotiated capture mode
    pub fn mode(&self) -> CaptureMode {
        self.track.mode
    }

    pub fn background_mode(&self) -> BackgroundMode {
        self.track.background_mode
    }

    /// Whether this handle can no longer be used
    pub fn is_ended(&self) -> bool {
        self.ensure_live().is_err()
    }

    /// Stable URL identifying the track's stream
    pub fn url(&self) -> CaptureResult<String> {
        self.ensure_live()?;
        Ok(format!("{}{}", TRACK_URL_PREFIX, self.track.id))
    }

    /// Another handle to the same track; the device is not reopened
    pub fn share(&self) -> CaptureResult<TrackHandle> {
        self.ensure_live()?;
        Ok(self.track.new_handle())
    }

    /// Subscribe to the track's frames
    ///
    /// # Errors
    /// * `TrackEnded` - the handle was released or the session stopped
    /// * `SessionClosed` - the device failed and the session is closing
    pub fn to_frame_source(&self) -> CaptureResult<FrameSource> {
        self.ensure_live()?;
        let consumer = self.track.bus.subscribe()?;
        Ok(FrameSource {
            track: Arc::clone(&self.track),
            consumer,
        })
    }

    /// The most recent frame as an RGBA image, if one has been captured
    pub fn current_frame_as_displayable(&self) -> CaptureResult<Option<RgbaImage>> {
        self.ensure_live()?;
        self.track
            .bus
            .latest()
            .map(|frame| convert::to_rgba_image(&frame))
            .transpose()
    }

    /// Give up this reference
    ///
    /// Releasing the last handle stops the session.
    pub fn release(&self) -> CaptureResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::TrackEnded);
        }

        let remaining = self.track.refs.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(track = %self.track.id, remaining, "Track handle released");

        if remaining == 0 {
            info!(track = %self.track.id, "Last track handle released");
            match self.track.session.upgrade() {
                Some(session) => session.release_track(&self.track),
                None => {
                    self.track.end();
                }
            }
        }
        Ok(())
    }
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            let _ = self.release();
        }
    }
}

impl std::fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackHandle")
            .field("id", &self.track.id)
            .field("device", &self.track.device_id)
            .field("mode", &self.track.mode)
            .field("background", &self.track.background_mode)
            .field("released", &self.released.load(Ordering::SeqCst))
            .field("ended", &self.track.is_ended())
            .finish()
    }
}

/// One consumer's view of a track's frames
///
/// Unsubscribes from the track when dropped.
pub struct FrameSource {
    track: Arc<Track>,
    consumer: ConsumerId,
}

impl FrameSource {
    fn check(&self) -> CaptureResult<()> {
        if self.track.is_ended() {
            return Err(CaptureError::TrackEnded);
        }
        Ok(())
    }

    /// Take the next frame without waiting
    pub fn poll(&self) -> CaptureResult<Poll> {
        self.check()?;
        Ok(self.track.bus.poll(self.consumer))
    }

    /// Block the calling thread for at most `timeout` waiting for a frame
    pub fn poll_timeout(&self, timeout: Duration) -> CaptureResult<Poll> {
        self.check()?;
        let poll = self.track.bus.poll_timeout(self.consumer, timeout);
        self.check()?;
        Ok(poll)
    }

    /// Wait for the next frame
    ///
    /// `Ok(None)` means the capture closed (device failure) without the
    /// track being stopped.
    pub async fn next_frame(&self) -> CaptureResult<Option<SharedFrame>> {
        self.check()?;
        let frame = self.track.bus.recv(self.consumer).await;
        self.check()?;
        Ok(frame)
    }

    /// Frames this consumer lost to drop-oldest
    pub fn dropped(&self) -> u64 {
        self.track.bus.dropped_for(self.consumer).unwrap_or(0)
    }

    /// Frames as a stream that ends when the track ends or capture closes
    pub fn into_stream(self) -> impl Stream<Item = SharedFrame> + Send {
        async_stream::stream! {
            while let Ok(Some(frame)) = self.next_frame().await {
                yield frame;
            }
        }
    }
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSource")
            .field("track", &self.track.id)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.track.bus.unsubscribe(self.consumer);
    }
}
