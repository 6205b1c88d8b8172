use std::{io, time::Instant};

use image::RgbaImage;
use thiserror::Error;

/// Decoded RGBA frame pulled from the low-resolution feed.
pub struct Frame {
    pub image: RgbaImage,
    pub timestamp_ms: i64,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Raw container bytes read from the high-resolution feed.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

impl Chunk {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            captured_at: Instant::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("ffmpeg exited with code {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
    #[error("failed to decode PNG frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("feed read failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
