//! Motion gate: a cheap pixel-difference pre-filter in front of the detector.

use image::RgbaImage;
use thiserror::Error;
use tracing::warn;

/// Per-pixel luma delta a pixel must exceed to count as changed.
pub const PIXEL_DIFF_THRESHOLD: u8 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("frame dimensions differ: {left:?} vs {right:?}")]
    DimensionMismatch { left: (u32, u32), right: (u32, u32) },
}

/// Count pixels whose luma differs by more than `threshold` between two frames.
pub fn changed_pixel_count(a: &RgbaImage, b: &RgbaImage, threshold: u8) -> Result<usize, GateError> {
    if a.dimensions() != b.dimensions() {
        return Err(GateError::DimensionMismatch {
            left: a.dimensions(),
            right: b.dimensions(),
        });
    }

    let threshold = u32::from(threshold);
    let changed = a
        .pixels()
        .zip(b.pixels())
        .filter(|(pa, pb)| luma(pa.0).abs_diff(luma(pb.0)) > threshold)
        .count();
    Ok(changed)
}

fn luma([r, g, b, _]: [u8; 4]) -> u32 {
    (299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b)) / 1000
}

/// Remembers the previous frame and decides whether the next one moved enough.
pub struct MotionGate {
    previous: Option<RgbaImage>,
    area_threshold: f64,
}

impl MotionGate {
    pub fn new(area_threshold: f64) -> Self {
        Self {
            previous: None,
            area_threshold,
        }
    }

    /// Changed pixels against the previous frame, or `None` when there is no
    /// comparable previous frame.
    pub fn measure(&self, frame: &RgbaImage) -> Option<usize> {
        let previous = self.previous.as_ref()?;
        match changed_pixel_count(previous, frame, PIXEL_DIFF_THRESHOLD) {
            Ok(count) => Some(count),
            Err(err) => {
                warn!("Motion gate skipped frame: {err}");
                None
            }
        }
    }

    /// Whether `changed` pixels clear the configured area threshold.
    pub fn is_open(&self, changed: Option<usize>) -> bool {
        changed.is_some_and(|count| count as f64 > self.area_threshold)
    }

    /// Replace the reference frame.
    pub fn remember(&mut self, frame: RgbaImage) {
        self.previous = Some(frame);
    }
}
