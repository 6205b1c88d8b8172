//! Object detection backends sharing one request/response contract.

pub mod detection;
pub mod network;

#[cfg(feature = "with-tch")]
pub mod detector;

pub use detection::{Detection, DetectorError, ObjectDetector, Prediction, WireDetection};
pub use network::NetworkDetector;

#[cfg(feature = "with-tch")]
pub use detector::TorchDetector;
#[cfg(feature = "with-tch")]
pub use tch;
