// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle management for frame loops
//!
//! The capture thread of a session and the background processing worker
//! both run as a loop on a dedicated OS thread with a shared stop signal.

use crate::errors::{CaptureError, CaptureResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often `join_timeout` checks whether the thread has exited
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Action returned by the loop callback to control loop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Continue running the loop
    Continue,
    /// Stop the loop gracefully
    Stop,
}

/// Controller for a frame loop running in a separate thread
///
/// # Example
///
/// ```ignore
/// let controller = CaptureLoopController::start_with_init(
///     "capture",
///     || backend.open(&device_id, &mode),
///     move |device| match device.blocking_capture() {
///         Ok(raw) => {
///             publish(raw);
///             LoopAction::Continue
///         }
///         Err(_) => LoopAction::Stop,
///     },
/// )?;
///
/// // Later, stop the loop
/// controller.stop_with_timeout(Duration::from_millis(500));
/// ```
pub struct CaptureLoopController {
    /// Thread handle for joining
    thread_handle: Option<JoinHandle<()>>,
    /// Signal to stop the loop
    stop_signal: Arc<AtomicBool>,
    /// Name for logging
    name: String,
}

impl CaptureLoopController {
    /// Start a new loop in a separate thread
    ///
    /// The closure is called repeatedly until it returns `LoopAction::Stop`
    /// or the stop signal is raised.
    pub fn start<F>(name: &str, mut loop_fn: F) -> CaptureResult<Self>
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        Self::start_with_init(name, || Ok(()), move |_: &mut ()| loop_fn())
    }

    /// Start a loop whose state is created on the loop thread
    ///
    /// Blocks until `init_fn` has run. If it fails the thread exits and the
    /// error is returned here; the loop never runs. The state is dropped on
    /// the loop thread when the loop ends.
    pub fn start_with_init<S, I, F>(name: &str, init_fn: I, mut loop_fn: F) -> CaptureResult<Self>
    where
        S: 'static,
        I: FnOnce() -> CaptureResult<S> + Send + 'static,
        F: FnMut(&mut S) -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);
        let name_clone = name.to_string();
        let (init_tx, init_rx) = mpsc::sync_channel::<CaptureResult<()>>(1);

        info!(name = %name, "Starting frame loop");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Loop thread started, initializing...");

                let mut state = match init_fn() {
                    Ok(s) => {
                        let _ = init_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        warn!(name = %name_clone, error = %e, "Initialization failed");
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                loop {
                    if stop_signal_clone.load(Ordering::SeqCst) {
                        debug!(name = %name_clone, "Stop signal received");
                        break;
                    }

                    match loop_fn(&mut state) {
                        LoopAction::Continue => {}
                        LoopAction::Stop => {
                            debug!(name = %name_clone, "Loop requested stop");
                            break;
                        }
                    }
                }

                drop(state);
                info!(name = %name_clone, "Loop thread exiting");
            })
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to spawn {}: {}", name, e)))?;

        let mut controller = Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        };

        match init_rx.recv() {
            Ok(Ok(())) => Ok(controller),
            Ok(Err(e)) => {
                controller.join();
                Err(e)
            }
            Err(_) => {
                controller.join();
                Err(CaptureError::DeviceUnavailable(format!(
                    "{} exited during initialization",
                    name
                )))
            }
        }
    }

    /// Check if the loop is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop to stop (non-blocking)
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting loop stop");
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Signal the loop to stop and wait up to `timeout` for it to exit
    ///
    /// Returns `false` if the thread was still running and got detached.
    pub fn stop_with_timeout(&mut self, timeout: Duration) -> bool {
        self.request_stop();
        self.join_timeout(timeout)
    }

    /// Wait for the thread to finish without sending stop signal
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            debug!(name = %self.name, "Waiting for loop thread to finish");
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Loop thread panicked: {:?}", e);
            } else {
                debug!(name = %self.name, "Loop thread finished");
            }
        }
    }

    /// Wait at most `timeout` for the thread to finish, then detach it
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                warn!(
                    name = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Loop thread did not exit in time, detaching"
                );
                self.detach();
                return false;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }
        self.join();
        true
    }

    /// Let the thread run on without a handle
    pub fn detach(&mut self) {
        if self.thread_handle.take().is_some() {
            debug!(name = %self.name, "Detached loop thread");
        }
    }
}

impl Drop for CaptureLoopController {
    /// Stops the loop without waiting; a loop may drop its own controller
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "Controller dropped, stopping loop");
            self.request_stop();
            self.detach();
        }
    }
}
