//! Splits the `image2pipe` byte stream emitted by ffmpeg into individual PNG
//! images.
//!
//! ffmpeg writes PNG files back to back with no framing, so boundaries are
//! recovered from the PNG signature and the `IEND` trailer. Bytes that do not
//! belong to a frame are dropped and the splitter resynchronises at the next
//! signature.

/// Magic bytes opening every PNG file.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
/// `IEND` chunk type followed by its fixed CRC, closing every PNG file.
pub const PNG_TRAILER: [u8; 8] = [0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82];
/// Hard cap on buffered bytes while waiting for a frame boundary.
pub const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

pub struct PngSplitter {
    buffer: Vec<u8>,
    limit: usize,
    // Offset up to which the buffer has already been searched for a trailer.
    scanned: usize,
}

impl Default for PngSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl PngSplitter {
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            scanned: 0,
        }
    }

    /// Bytes currently held while waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Feed freshly read bytes, returning every PNG image completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buffer, &PNG_SIGNATURE, 0) else {
                // A signature may straddle two reads, keep its possible prefix.
                let keep = PNG_SIGNATURE.len() - 1;
                if self.buffer.len() > keep {
                    let cut = self.buffer.len() - keep;
                    self.buffer.drain(..cut);
                }
                self.scanned = 0;
                break;
            };
            if start > 0 {
                self.buffer.drain(..start);
                self.scanned = self.scanned.saturating_sub(start);
            }

            let from = self
                .scanned
                .saturating_sub(PNG_TRAILER.len() - 1)
                .max(PNG_SIGNATURE.len());
            match find(&self.buffer, &PNG_TRAILER, from) {
                Some(end) => {
                    let frame_end = end + PNG_TRAILER.len();
                    frames.push(self.buffer.drain(..frame_end).collect());
                    self.scanned = 0;
                }
                None => {
                    self.scanned = self.buffer.len();
                    break;
                }
            }
        }

        if self.buffer.len() > self.limit {
            match find(&self.buffer, &PNG_SIGNATURE, 1) {
                Some(next) => {
                    self.buffer.drain(..next);
                }
                None => self.buffer.clear(),
            }
            self.scanned = 0;
        }

        frames
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
