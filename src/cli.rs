// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Listing capture devices and ranking their modes
//! - Capturing for a while and reporting frame statistics
//! - Saving a snapshot of the (processed) stream

use chrono::Local;
use futures::StreamExt;
use media_capture::backends::SyntheticBackend;
use media_capture::negotiation;
use media_capture::{
    BackgroundMode, CaptureRequest, CaptureResult, Config, FrameSource, MediaDevices, Poll, TrackHandle,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Default folder name for saving snapshots
const DEFAULT_SAVE_FOLDER: &str = "media-capture";

/// How long a snapshot waits for its first usable frame
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames skipped before a snapshot so smoothing has settled
const SNAPSHOT_WARMUP_FRAMES: u32 = 5;

/// Request fields given on the command line
///
/// Anything left out comes from the remembered request for the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub background_mode: Option<BackgroundMode>,
}

impl RequestOverrides {
    pub fn apply(self, base: CaptureRequest) -> CaptureRequest {
        CaptureRequest {
            width: self.width.unwrap_or(base.width),
            height: self.height.unwrap_or(base.height),
            frame_rate: self.frame_rate.unwrap_or(base.frame_rate),
            background_mode: self.background_mode.unwrap_or(base.background_mode),
        }
    }
}

/// Settings shared by all commands
pub struct Context {
    config: Config,
    config_path: Option<PathBuf>,
    device: Option<String>,
    background_image: Option<PathBuf>,
}

impl Context {
    pub fn load(config_path: Option<PathBuf>, device: Option<String>) -> Result<Self, Box<dyn std::error::Error>> {
        let config = match &config_path {
            Some(path) if path.exists() => Config::load_from(path)?,
            Some(_) => Config::default(),
            None => Config::load()?,
        };
        Ok(Self {
            config,
            config_path,
            device,
            background_image: None,
        })
    }

    /// Use `image` as the virtual background for this run only
    pub fn with_background_image(mut self, image: Option<PathBuf>) -> Self {
        self.background_image = image;
        self
    }

    fn media_devices(&self) -> MediaDevices {
        let mut config = self.config.clone();
        if let Some(image) = &self.background_image {
            config.processing.background_image = Some(image.clone());
        }
        MediaDevices::new(Arc::new(SyntheticBackend::single()), config)
    }

    fn open(&self, devices: &MediaDevices, overrides: RequestOverrides) -> Result<TrackHandle, Box<dyn std::error::Error>> {
        let device_id = match &self.device {
            Some(device) => device.clone(),
            None => devices.default_device()?,
        };
        let request = overrides.apply(devices.request_for(&device_id));
        let handle = devices.get_user_media_on(&device_id, request)?;
        self.remember(devices);

        println!("Device: {}", handle.device_id());
        println!("Mode: {} ({})", handle.mode(), handle.background_mode());
        println!("Stream: {}", handle.url()?);
        Ok(handle)
    }

    /// Persist the device and request that were just opened
    fn remember(&self, devices: &MediaDevices) {
        let opened = devices.config();
        let mut config = self.config.clone();
        config.last_device = opened.last_device;
        config.device_requests = opened.device_requests;

        let saved = match &self.config_path {
            Some(path) => config.save_to(path),
            None => config.save(),
        };
        if let Err(e) = saved {
            warn!(error = %e, "Failed to save config");
        }
    }
}

/// List all devices with their modes, best match for the request first
pub fn list_devices(ctx: &Context, overrides: RequestOverrides) -> Result<(), Box<dyn std::error::Error>> {
    let devices = ctx.media_devices();
    let descriptors = devices.enumerate_devices();

    if descriptors.is_empty() {
        println!("No capture devices found.");
        return Ok(());
    }

    println!("Capture devices:");
    println!();
    for descriptor in descriptors {
        let request = overrides.apply(devices.request_for(&descriptor.id));
        println!("  [{}] {} (ranked for {})", descriptor.id, descriptor.name, request);
        let modes = devices.supported_modes(&descriptor.id)?;
        for (index, ranked) in negotiation::rank(&request, &modes)?.iter().enumerate() {
            let marker = if index == 0 { "*" } else { " " };
            println!("    {} {:<20} distance {:.3}", marker, ranked.mode.to_string(), ranked.distance);
        }
        println!();
    }

    Ok(())
}

/// Capture for `duration` seconds and print frame statistics
pub fn run_capture(ctx: Context, overrides: RequestOverrides, duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    let devices = ctx.media_devices();
    let handle = ctx.open(&devices, overrides)?;
    let source = handle.to_frame_source()?;

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = Arc::clone(&stop_flag);
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    println!();
    println!("Capturing for {} seconds... (press Ctrl+C to stop early)", duration);

    let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
    let target = Duration::from_secs(duration);
    let start = Instant::now();

    let (received, last_sequence) = runtime.block_on(async {
        let mut stream = Box::pin(source.into_stream());
        let mut received = 0u64;
        let mut last_sequence = 0u64;

        while start.elapsed() < target && !stop_flag.load(Ordering::SeqCst) {
            match tokio::time::timeout(Duration::from_millis(200), stream.next()).await {
                Ok(Some(frame)) => {
                    received += 1;
                    last_sequence = frame.sequence;
                    print!("\rFrames: {} (sequence {})", received, last_sequence);
                    let _ = std::io::Write::flush(&mut std::io::stdout());
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        (received, last_sequence)
    });
    println!();

    let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
    println!();
    println!("Received {} frames in {:.1}s ({:.1} fps)", received, elapsed, received as f64 / elapsed);
    if last_sequence > received {
        println!("Skipped {} frames (slow consumer or processing)", last_sequence - received);
    }

    if let Some(session) = devices.session(handle.device_id()) {
        if let Some(stats) = session.capture_stats() {
            println!("Captured: {} published, {} dropped", stats.published, stats.dropped);
        }
        if let Some(stats) = session.processor_stats() {
            println!(
                "Processing: {} processed, {} forwarded, {} deadline misses, avg {:.1}ms",
                stats.processed,
                stats.forwarded,
                stats.deadline_misses,
                stats.average_time.as_secs_f64() * 1000.0
            );
        }
    }

    handle.release()?;
    Ok(())
}

/// Grab one frame after a short warm-up and save it as PNG
pub fn take_snapshot(
    ctx: Context,
    overrides: RequestOverrides,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let devices = ctx.media_devices();
    let handle = ctx.open(&devices, overrides)?;
    let source = handle.to_frame_source()?;

    let output_path = match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            path
        }
        None => {
            let dir = get_default_snapshot_dir();
            std::fs::create_dir_all(&dir)?;
            let timestamp = Local::now().format("%Y%m%d_%H%M%S");
            dir.join(format!("snapshot_{}.png", timestamp))
        }
    };

    println!("Capturing...");
    warm_up(&source, SNAPSHOT_WARMUP_FRAMES, SNAPSHOT_TIMEOUT)?;

    let image = handle
        .current_frame_as_displayable()?
        .ok_or("No frame captured before timeout")?;
    image.save(&output_path)?;
    println!("Snapshot saved: {}", output_path.display());

    handle.release()?;
    Ok(())
}

/// Wait for `frames` frames; stops early at `timeout` or when the stream closes
fn warm_up(source: &FrameSource, frames: u32, timeout: Duration) -> CaptureResult<u32> {
    let start = Instant::now();
    let mut seen = 0;
    while seen < frames && start.elapsed() < timeout {
        match source.poll_timeout(Duration::from_millis(100))? {
            Poll::Frame(_) => seen += 1,
            Poll::Empty => {}
            Poll::Closed => break,
        }
    }
    Ok(seen)
}

/// Get default snapshot directory
fn get_default_snapshot_dir() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(DEFAULT_SAVE_FOLDER)
}
