// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for capture sessions, tracks and the control surface

use media_capture::backends::{SyntheticBackend, SyntheticDeviceSpec};
use media_capture::{
    BackgroundMode, CaptureError, CaptureMode, CaptureRequest, CaptureSession, Config,
    MediaDevices, PixelFormat, Poll, SessionState,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn backend(spec: SyntheticDeviceSpec) -> SyntheticBackend {
    SyntheticBackend::new(vec![spec])
}

fn devices(backend: &SyntheticBackend) -> MediaDevices {
    MediaDevices::new(Arc::new(backend.clone()), Config::default())
}

fn raw(width: u32, height: u32, fps: u32) -> CaptureRequest {
    CaptureRequest::new(width, height, fps, BackgroundMode::None)
}

#[test]
fn test_identical_starts_share_one_open() {
    let backend = backend(SyntheticDeviceSpec::new("cam"));
    let devices = devices(&backend);

    let first = devices.get_user_media(raw(1280, 720, 30)).unwrap();
    let second = devices.get_user_media(raw(1280, 720, 30)).unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(first.url().unwrap(), second.url().unwrap());
    assert_eq!(backend.open_count(), 1);
}

#[test]
fn test_requests_resolving_to_same_mode_share_track() {
    let backend = backend(SyntheticDeviceSpec::new("cam"));
    let devices = devices(&backend);

    let first = devices.get_user_media(raw(1280, 720, 30)).unwrap();
    let second = devices.get_user_media(raw(1270, 715, 29)).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(backend.open_count(), 1);
}

#[test]
fn test_different_mode_is_busy() {
    let backend = backend(SyntheticDeviceSpec::new("cam"));
    let devices = devices(&backend);

    let _live = devices.get_user_media(raw(1280, 720, 30)).unwrap();
    assert_eq!(
        devices.get_user_media(raw(640, 480, 15)).unwrap_err(),
        CaptureError::SessionBusy
    );
}

#[test]
fn test_open_refused_is_unavailable_and_retryable() {
    let backend = backend(SyntheticDeviceSpec::new("cam").denying_open());
    let devices = devices(&backend);

    let err = devices.get_user_media(raw(640, 480, 30)).unwrap_err();
    assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
    assert!(err.is_retryable());

    backend.set_deny_open("cam", false);
    assert!(devices.get_user_media(raw(640, 480, 30)).is_ok());
}

#[test]
fn test_device_without_modes_is_incompatible() {
    let backend = backend(SyntheticDeviceSpec::new("cam").with_modes(Vec::new()));
    let devices = devices(&backend);
    assert_eq!(
        devices.get_user_media(raw(640, 480, 30)).unwrap_err(),
        CaptureError::NoCompatibleMode
    );
}

#[test]
fn test_stop_ends_every_handle() {
    let backend = backend(SyntheticDeviceSpec::new("cam"));
    let devices = devices(&backend);

    let first = devices.get_user_media(raw(640, 480, 30)).unwrap();
    let second = first.share().unwrap();
    let source = first.to_frame_source().unwrap();

    devices.stop(&first);

    for handle in [&first, &second] {
        assert_eq!(handle.url().unwrap_err(), CaptureError::TrackEnded);
        assert_eq!(handle.share().unwrap_err(), CaptureError::TrackEnded);
        assert_eq!(handle.to_frame_source().unwrap_err(), CaptureError::TrackEnded);
        assert_eq!(
            handle.current_frame_as_displayable().unwrap_err(),
            CaptureError::TrackEnded
        );
    }
    assert_eq!(source.poll().unwrap_err(), CaptureError::TrackEnded);
    assert_eq!(backend.close_count(), 1);
}

#[test]
fn test_n_releases_stop_once() {
    let backend = backend(SyntheticDeviceSpec::new("cam"));
    let devices = devices(&backend);

    let a = devices.get_user_media(raw(640, 480, 30)).unwrap();
    let b = devices.get_user_media(raw(640, 480, 30)).unwrap();
    let c = a.share().unwrap();
    let session = devices.session("cam").unwrap();

    a.release().unwrap();
    b.release().unwrap();
    assert_eq!(session.state(), SessionState::Live);
    assert_eq!(backend.close_count(), 0);

    c.release().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(backend.open_count(), 1);
    assert_eq!(backend.close_count(), 1);

    assert_eq!(a.release().unwrap_err(), CaptureError::TrackEnded);
    assert_eq!(backend.close_count(), 1);
}

#[test]
fn test_concurrent_releases_stop_once() {
    for _ in 0..20 {
        let backend = backend(SyntheticDeviceSpec::new("cam"));
        let devices = devices(&backend);

        let first = devices.get_user_media(raw(640, 480, 30)).unwrap();
        let mut handles: Vec<_> = (0..7).map(|_| first.share().unwrap()).collect();
        handles.push(first);

        let barrier = Arc::new(Barrier::new(handles.len()));
        let releasers: Vec<_> = handles
            .into_iter()
            .map(|handle| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    handle.release()
                })
            })
            .collect();
        for releaser in releasers {
            assert!(releaser.join().unwrap().is_ok());
        }

        assert_eq!(devices.session("cam").unwrap().state(), SessionState::Idle);
        assert_eq!(backend.open_count(), 1);
        assert_eq!(backend.close_count(), 1);
    }
}

#[test]
fn test_concurrent_stops_are_idempotent() {
    let backend = backend(SyntheticDeviceSpec::new("cam"));
    let devices = devices(&backend);
    let handle = devices.get_user_media(raw(640, 480, 30)).unwrap();
    let session = devices.session("cam").unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let stoppers: Vec<_> = (0..2)
        .map(|_| {
            let session = session.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                session.stop();
            })
        })
        .collect();
    for stopper in stoppers {
        stopper.join().unwrap();
    }

    assert_eq!(session.state(), SessionState::Idle);
    assert!(handle.is_ended());
    assert_eq!(backend.close_count(), 1);

    session.stop();
    drop(handle);
    assert_eq!(backend.open_count(), 1);
    assert_eq!(backend.close_count(), 1);
}

#[test]
fn test_dropping_last_handle_stops() {
    let backend = backend(SyntheticDeviceSpec::new("cam"));
    let devices = devices(&backend);

    let handle = devices.get_user_media(raw(640, 480, 30)).unwrap();
    drop(handle);

    assert_eq!(devices.session("cam").unwrap().state(), SessionState::Idle);
    assert_eq!(backend.close_count(), 1);
}

#[test]
fn test_restart_after_stop_opens_new_track() {
    let backend = backend(SyntheticDeviceSpec::new("cam"));
    let devices = devices(&backend);

    let first = devices.get_user_media(raw(640, 480, 30)).unwrap();
    let first_id = first.id();
    first.release().unwrap();

    let second = devices.get_user_media(raw(1280, 720, 30)).unwrap();
    assert_ne!(second.id(), first_id);
    assert_eq!(second.mode(), CaptureMode::new(1280, 720, 30));
    assert_eq!(backend.open_count(), 2);
}

#[test]
fn test_stop_during_open_waits_for_commit() {
    let backend = backend(SyntheticDeviceSpec::new("cam").with_open_delay(Duration::from_millis(200)));
    let session = CaptureSession::new("cam", Arc::new(backend.clone()), Config::default());

    let starter = {
        let session = session.clone();
        thread::spawn(move || session.start(raw(640, 480, 30)))
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(session.state(), SessionState::Opening);

    session.stop();
    let handle = starter.join().unwrap().unwrap();

    assert_eq!(session.state(), SessionState::Idle);
    assert!(handle.is_ended());
    assert_eq!(backend.open_count(), 1);
    assert_eq!(backend.close_count(), 1);
}

#[test]
fn test_consumer_sees_increasing_sequences() {
    let backend = backend(SyntheticDeviceSpec::new("cam").unpaced());
    let devices = devices(&backend);
    let handle = devices.get_user_media(raw(320, 240, 30)).unwrap();
    let source = handle.to_frame_source().unwrap();

    let mut last = 0;
    let mut seen = 0;
    while seen < 50 {
        if let Poll::Frame(frame) = source.poll_timeout(Duration::from_secs(1)).unwrap() {
            assert!(frame.sequence > last, "{} after {}", frame.sequence, last);
            assert!(frame.is_well_formed());
            last = frame.sequence;
            seen += 1;
        }
    }
}

#[test]
fn test_idle_consumer_keeps_only_newest_frames() {
    let backend = backend(SyntheticDeviceSpec::new("cam"));
    let devices = devices(&backend);
    let handle = devices.get_user_media(raw(320, 240, 30)).unwrap();
    let source = handle.to_frame_source().unwrap();
    let depth = devices.config().bus.queue_depth;

    // Ten frame intervals at 30 fps
    thread::sleep(Duration::from_millis(340));

    let mut queued = Vec::new();
    while let Poll::Frame(frame) = source.poll().unwrap() {
        queued.push(frame.sequence);
    }
    assert!(!queued.is_empty());
    assert!(queued.len() <= depth);
    assert!(queued.windows(2).all(|w| w[1] == w[0] + 1));
    assert!(source.dropped() > 0);
}

#[test]
fn test_device_fault_closes_frame_source() {
    let backend = backend(SyntheticDeviceSpec::new("cam").failing_after(4));
    let devices = devices(&backend);
    let handle = devices.get_user_media(raw(320, 240, 30)).unwrap();
    let source = handle.to_frame_source().unwrap();

    let mut closed = false;
    for _ in 0..100 {
        if source.poll_timeout(Duration::from_millis(50)).unwrap().is_closed() {
            closed = true;
            break;
        }
    }
    assert!(closed);

    let session = devices.session("cam").unwrap();
    assert_eq!(session.state(), SessionState::Closing);

    // The capture thread releases the device as it exits
    for _ in 0..100 {
        if backend.close_count() == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(backend.close_count(), 1);
    assert!(!session.is_capturing());
}

#[test]
fn test_yuv_device_frames_are_displayable() {
    let backend = backend(
        SyntheticDeviceSpec::new("cam")
            .unpaced()
            .with_format(PixelFormat::Nv21),
    );
    let devices = devices(&backend);
    let handle = devices.get_user_media(raw(320, 240, 30)).unwrap();
    let source = handle.to_frame_source().unwrap();

    let frame = source
        .poll_timeout(Duration::from_secs(2))
        .unwrap()
        .into_frame()
        .unwrap();
    assert_eq!(frame.format, PixelFormat::Nv21);

    let image = handle.current_frame_as_displayable().unwrap().unwrap();
    assert_eq!(image.dimensions(), (320, 240));
}

#[tokio::test]
async fn test_async_frames_and_stream() {
    use futures::StreamExt;

    let backend = backend(SyntheticDeviceSpec::new("cam"));
    let devices = devices(&backend);
    let handle = devices.get_user_media(raw(320, 240, 30)).unwrap();

    let source = handle.to_frame_source().unwrap();
    let frame = source.next_frame().await.unwrap().unwrap();
    assert_eq!((frame.width, frame.height), (320, 240));

    let stream = handle.to_frame_source().unwrap().into_stream();
    let frames: Vec<_> = Box::pin(stream).take(3).collect().await;
    assert_eq!(frames.len(), 3);
    assert!(frames.windows(2).all(|w| w[1].sequence > w[0].sequence));
}
