pub mod pipeline;

pub use pipeline::{CameraConfig, StartupError, prepare, run};
