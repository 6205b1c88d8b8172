pub mod ffmpeg;
pub mod probe;
pub mod splitter;
pub mod transcode;
pub mod types;

pub use ffmpeg::{ChunkReceiver, FeedHandle, FrameReceiver, spawn_chunk_reader, spawn_frame_reader};
pub use probe::{MissingBinary, ProbeError, StreamInfo};
pub use transcode::RecodeOptions;
pub use types::{CaptureError, Chunk, Frame};
