// SPDX-License-Identifier: GPL-3.0-only

//! Capture mode negotiation
//!
//! Resolves a requested (width, height, frame rate) against the modes a
//! device offers. The distance between a request and a mode is
//!
//! ```text
//! d = |Δwidth| / req.width + |Δheight| / req.height + |Δfps| / req.fps
//! ```
//!
//! The closest mode wins. Ties prefer the higher resolution, then the higher
//! frame rate. Everything here is pure so it can be tested without hardware.

use crate::errors::{CaptureError, CaptureResult};
use crate::media::{CaptureMode, CaptureRequest};
use std::cmp::Ordering;
use tracing::debug;

/// Distances are compared in steps of this size
const DISTANCE_EPSILON: f64 = 1e-9;

/// A candidate mode together with its distance from the request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedMode {
    pub mode: CaptureMode,
    pub distance: f64,
}

/// Check that every requested dimension is positive
pub fn validate_request(request: &CaptureRequest) -> CaptureResult<()> {
    if request.width == 0 || request.height == 0 || request.frame_rate == 0 {
        return Err(CaptureError::InvalidRequest(format!(
            "width, height and frame rate must be positive (got {})",
            request
        )));
    }
    Ok(())
}

/// Weighted distance between a request and a mode
pub fn distance(request: &CaptureRequest, mode: &CaptureMode) -> f64 {
    let relative = |wanted: u32, offered: u32| -> f64 {
        (wanted as f64 - offered as f64).abs() / wanted as f64
    };

    relative(request.width, mode.width)
        + relative(request.height, mode.height)
        + relative(request.frame_rate, mode.frame_rate)
}

/// Distance rounded to a whole number of epsilon steps
///
/// Comparing whole steps keeps the order transitive.
fn distance_key(distance: f64) -> i64 {
    (distance / DISTANCE_EPSILON).round() as i64
}

/// Order two ranked modes: closest first, then higher resolution, then higher fps
fn compare(a: &RankedMode, b: &RankedMode) -> Ordering {
    distance_key(a.distance)
        .cmp(&distance_key(b.distance))
        .then_with(|| b.mode.pixels().cmp(&a.mode.pixels()))
        .then_with(|| b.mode.frame_rate.cmp(&a.mode.frame_rate))
}

/// Rank every available mode against the request, best first
///
/// Duplicate modes are collapsed. The first entry is what [`resolve`] returns.
pub fn rank(request: &CaptureRequest, available: &[CaptureMode]) -> CaptureResult<Vec<RankedMode>> {
    validate_request(request)?;

    let mut ranked: Vec<RankedMode> = Vec::with_capacity(available.len());
    for mode in available {
        if ranked.iter().any(|r| r.mode == *mode) {
            continue;
        }
        ranked.push(RankedMode {
            mode: *mode,
            distance: distance(request, mode),
        });
    }

    ranked.sort_by(compare);
    Ok(ranked)
}

/// Pick the offered mode closest to the request
///
/// # Errors
/// * `NoCompatibleMode` - `available` is empty
/// * `InvalidRequest` - the request has a zero dimension or frame rate
pub fn resolve(request: &CaptureRequest, available: &[CaptureMode]) -> CaptureResult<CaptureMode> {
    validate_request(request)?;

    let best = available
        .iter()
        .map(|mode| RankedMode {
            mode: *mode,
            distance: distance(request, mode),
        })
        .min_by(compare)
        .ok_or(CaptureError::NoCompatibleMode)?;

    debug!(
        request = %request,
        mode = %best.mode,
        distance = best.distance,
        candidates = available.len(),
        "Resolved capture mode"
    );

    Ok(best.mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::BackgroundMode;

    fn request(width: u32, height: u32, fps: u32) -> CaptureRequest {
        CaptureRequest::new(width, height, fps, BackgroundMode::None)
    }

    #[test]
    fn test_exact_match_has_zero_distance() {
        let mode = CaptureMode::new(1280, 720, 30);
        assert_eq!(distance(&request(1280, 720, 30), &mode), 0.0);
    }

    #[test]
    fn test_resolve_prefers_exact_match() {
        let available = vec![CaptureMode::new(640, 480, 15), CaptureMode::new(1280, 720, 30)];
        let mode = resolve(&request(1280, 720, 30), &available).unwrap();
        assert_eq!(mode, CaptureMode::new(1280, 720, 30));
    }

    #[test]
    fn test_resolve_empty_fails() {
        let result = resolve(&request(1280, 720, 30), &[]);
        assert_eq!(result, Err(CaptureError::NoCompatibleMode));
    }

    #[test]
    fn test_resolve_rejects_zero_frame_rate() {
        let available = vec![CaptureMode::new(640, 480, 15)];
        let result = resolve(&request(640, 480, 0), &available);
        assert!(matches!(result, Err(CaptureError::InvalidRequest(_))));
    }

    #[test]
    fn test_tie_prefers_higher_resolution() {
        // Both are exactly 0.5 away on width and height combined
        let req = request(1000, 1000, 30);
        let smaller = CaptureMode::new(750, 1000, 30);
        let larger = CaptureMode::new(1250, 1000, 30);
        assert!((distance(&req, &smaller) - distance(&req, &larger)).abs() < 1e-12);

        let mode = resolve(&req, &[smaller, larger]).unwrap();
        assert_eq!(mode, larger);
        let mode = resolve(&req, &[larger, smaller]).unwrap();
        assert_eq!(mode, larger);
    }

    #[test]
    fn test_tie_then_prefers_higher_frame_rate() {
        let req = request(1280, 720, 30);
        let slow = CaptureMode::new(1280, 720, 15);
        let fast = CaptureMode::new(1280, 720, 45);
        let mode = resolve(&req, &[slow, fast]).unwrap();
        assert_eq!(mode, fast);
    }

    #[test]
    fn test_rank_orders_and_deduplicates() {
        let available = vec![
            CaptureMode::new(640, 480, 15),
            CaptureMode::new(1280, 720, 30),
            CaptureMode::new(640, 480, 15),
            CaptureMode::new(1920, 1080, 30),
        ];
        let req = request(1280, 720, 30);
        let ranked = rank(&req, &available).unwrap();

        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].mode, resolve(&req, &available).unwrap());
        assert!(ranked.windows(2).all(|w| w[0].distance <= w[1].distance + 1e-9));
    }

    #[test]
    fn test_near_ties_order_consistently() {
        let ranked = |width: u32, height: u32, distance: f64| RankedMode {
            mode: CaptureMode::new(width, height, 30),
            distance,
        };
        let a = ranked(320, 240, 0.0);
        let b = ranked(1920, 1080, 0.6 * DISTANCE_EPSILON);
        let c = ranked(1280, 720, 1.2 * DISTANCE_EPSILON);

        let orders = [
            [a, b, c],
            [a, c, b],
            [b, a, c],
            [b, c, a],
            [c, a, b],
            [c, b, a],
        ];
        for order in orders {
            let mut sorted = order.to_vec();
            sorted.sort_by(compare);
            assert_eq!(sorted, vec![a, b, c]);
            assert_eq!(order.iter().copied().min_by(compare), Some(a));
        }
    }
}
