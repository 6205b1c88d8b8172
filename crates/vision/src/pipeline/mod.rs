//! Camera pipeline that watches a low-res feed for moving objects and records
//! the hi-res feed around them.
//!
//! The module is split into focused submodules:
//! - `config`: JSON configuration file and its validation.
//! - `supervisor`: Startup checks, thread wiring and feed restarts.
//! - `processing`: Per-frame gate, detection, filtering and snapshots.
//! - `gate`: Pixel-difference motion gate.
//! - `tracker`: Short-term object identity tracking.
//! - `events`: Motion event state machine and metadata sidecars.
//! - `recorder`: Hi-res prebuffer and clip writer.
//! - `notify`: Webhook, Slack and script notification fan-out.
//! - `detector_process`: Supervision of a locally spawned detector server.
//! - `watchdog`: Kills feeds that stopped delivering data.
//! - `annotation`: Drawing primitives for snapshots.
//! - `telemetry`: Tracing subscriber and Prometheus exporter setup.

pub use config::{CameraConfig, ConfigError, TEMPLATE};
pub use events::{MotionEvent, MotionStateMachine, VideoMetadata};
pub use processing::{FrameOutcome, FrameProcessor, ProcessorSettings};
pub use supervisor::{StartupError, StreamSetup, prepare, run};

pub mod annotation;
pub mod clock;
pub mod config;
pub mod detector_process;
pub mod events;
pub mod gate;
pub mod notify;
pub mod processing;
pub mod recorder;
pub mod stats;
pub mod supervisor;
pub mod telemetry;
pub mod tracker;
pub mod watchdog;
