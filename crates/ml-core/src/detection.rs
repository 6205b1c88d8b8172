use std::{io, time::Duration};

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Single object reported by a detector backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: i64,
    pub class_name: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in frame pixels.
    pub bbox: [f32; 4],
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Detection {
    pub fn new(class_id: i64, class_name: impl Into<String>, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_id,
            class_name: class_name.into(),
            confidence,
            bbox,
            left: bbox[0].floor() as i32,
            top: bbox[1].floor() as i32,
            right: bbox[2].floor() as i32,
            bottom: bbox[3].floor() as i32,
        }
    }
}

/// Detection record as exchanged with an external inference server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireDetection {
    pub object: i64,
    pub class_name: String,
    #[serde(rename = "box")]
    pub bbox: Vec<f32>,
    pub confidence: f32,
}

impl TryFrom<WireDetection> for Detection {
    type Error = DetectorError;

    fn try_from(wire: WireDetection) -> Result<Self, Self::Error> {
        let bbox: [f32; 4] = wire.bbox.as_slice().try_into().map_err(|_| {
            DetectorError::Protocol(format!(
                "box for {:?} has {} values, expected 4",
                wire.class_name,
                wire.bbox.len()
            ))
        })?;
        Ok(Detection::new(wire.object, wire.class_name, wire.confidence, bbox))
    }
}

/// Detections for one frame together with the time the backend needed.
#[derive(Debug, Clone, Default)]
pub struct Prediction {
    pub detections: Vec<Detection>,
    pub took: Duration,
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("detector did not answer within {0:?}")]
    Timeout(Duration),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("malformed detector response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("detector protocol violation: {0}")]
    Protocol(String),
    #[error("wait for detector cancelled")]
    Cancelled,
    #[error(transparent)]
    Model(#[from] anyhow::Error),
}

/// Object detection capability shared by the network client and the
/// in-process model.
pub trait ObjectDetector: Send {
    fn detect(&mut self, frame: &RgbaImage) -> Result<Prediction, DetectorError>;

    /// Short backend name for logs and metric labels.
    fn backend(&self) -> &'static str;
}

impl<D: ObjectDetector + ?Sized> ObjectDetector for Box<D> {
    fn detect(&mut self, frame: &RgbaImage) -> Result<Prediction, DetectorError> {
        (**self).detect(frame)
    }

    fn backend(&self) -> &'static str {
        (**self).backend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_edges_are_floored() {
        let det = Detection::new(2, "car", 0.8, [10.9, 20.1, 99.99, -0.5]);
        assert_eq!((det.left, det.top, det.right, det.bottom), (10, 20, 99, -1));
    }

    #[test]
    fn wire_box_must_have_four_values() {
        let wire = WireDetection {
            object: 0,
            class_name: "person".into(),
            bbox: vec![1.0, 2.0, 3.0],
            confidence: 0.5,
        };
        assert!(matches!(Detection::try_from(wire), Err(DetectorError::Protocol(_))));
    }
}
