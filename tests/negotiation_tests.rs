// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for capture mode negotiation

use media_capture::negotiation::{distance, rank, resolve};
use media_capture::{BackgroundMode, CaptureError, CaptureMode, CaptureRequest};

fn modes() -> Vec<CaptureMode> {
    vec![
        CaptureMode::new(1920, 1080, 30),
        CaptureMode::new(1280, 720, 60),
        CaptureMode::new(1280, 720, 30),
        CaptureMode::new(640, 480, 30),
        CaptureMode::new(640, 480, 15),
        CaptureMode::new(320, 240, 30),
    ]
}

#[test]
fn test_exact_request_resolves_to_itself() {
    let request = CaptureRequest::new(1280, 720, 30, BackgroundMode::None);
    let available = vec![CaptureMode::new(1280, 720, 30), CaptureMode::new(640, 480, 15)];
    assert_eq!(
        resolve(&request, &available).unwrap(),
        CaptureMode::new(1280, 720, 30)
    );
}

#[test]
fn test_oversized_request_falls_back_to_only_mode() {
    let request = CaptureRequest::new(1920, 1080, 60, BackgroundMode::Blur);
    let available = vec![CaptureMode::new(1280, 720, 30)];
    assert_eq!(
        resolve(&request, &available).unwrap(),
        CaptureMode::new(1280, 720, 30)
    );
}

#[test]
fn test_no_modes_is_incompatible() {
    let request = CaptureRequest::default();
    assert_eq!(resolve(&request, &[]), Err(CaptureError::NoCompatibleMode));
}

#[test]
fn test_result_is_always_offered_and_minimal() {
    let available = modes();
    for width in [160, 320, 641, 1000, 1280, 2000, 4096] {
        for height in [120, 240, 480, 700, 1080, 2160] {
            for fps in [1, 15, 24, 30, 60, 120] {
                let request = CaptureRequest::new(width, height, fps, BackgroundMode::None);
                let chosen = resolve(&request, &available).unwrap();
                assert!(available.contains(&chosen));

                let best = distance(&request, &chosen);
                for mode in &available {
                    assert!(
                        best <= distance(&request, mode) + 1e-9,
                        "{} chose {} over closer {}",
                        request,
                        chosen,
                        mode
                    );
                }
            }
        }
    }
}

#[test]
fn test_rank_agrees_with_resolve() {
    let available = modes();
    let request = CaptureRequest::new(800, 600, 25, BackgroundMode::None);
    let ranked = rank(&request, &available).unwrap();
    assert_eq!(ranked.len(), available.len());
    assert_eq!(ranked[0].mode, resolve(&request, &available).unwrap());
}

#[test]
fn test_zero_dimension_is_invalid() {
    let request = CaptureRequest::new(0, 720, 30, BackgroundMode::None);
    assert!(matches!(
        resolve(&request, &modes()),
        Err(CaptureError::InvalidRequest(_))
    ));
}
