use std::{
    io::Read,
    process::{Child, ChildStdout, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::warn;

use crate::{
    splitter::PngSplitter,
    types::{CaptureError, Chunk, Frame},
};

/// Read size used while draining the PNG pipe.
pub const FRAME_READ_BYTES: usize = 8192;
/// Read size used for raw container chunks.
pub const CHUNK_READ_BYTES: usize = 4096;
/// Only every Nth source frame is emitted by the low-res feed.
pub const FRAME_DECIMATION: u32 = 5;

const STDERR_TAIL_BYTES: usize = 4096;
const REAP_POLLS: u32 = 20;
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type FrameReceiver = Receiver<Result<Frame, CaptureError>>;
pub type ChunkReceiver = Receiver<Result<Chunk, CaptureError>>;

/// Handle on a running ffmpeg feed process.
///
/// Cloned into the watchdog so a hung process can be killed from outside the
/// reader thread; the reader then reports the exit and closes its channel.
#[derive(Clone)]
pub struct FeedHandle {
    child: Arc<Mutex<Child>>,
    pid: u32,
}

impl FeedHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn kill(&self) {
        if let Ok(mut child) = self.child.lock() {
            if let Err(err) = child.kill() {
                warn!("Failed to kill ffmpeg (pid {}): {err}", self.pid);
            }
        }
    }
}

/// Start ffmpeg decoding `url` into PNG stills and stream the decoded frames.
pub fn spawn_frame_reader(url: &str) -> Result<(FrameReceiver, FeedHandle), CaptureError> {
    let select = format!("select=not(mod(n\\,{FRAME_DECIMATION}))");
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-rtsp_transport")
        .arg("tcp")
        .arg("-re")
        .arg("-i")
        .arg(url)
        .arg("-analyzeduration")
        .arg("1000000")
        .arg("-probesize")
        .arg("1000000")
        .arg("-vf")
        .arg(&select)
        .arg("-fps_mode")
        .arg("vfr")
        .arg("-c:v")
        .arg("png")
        .arg("-f")
        .arg("image2pipe")
        .arg("-");

    let (tx, rx) = bounded(2);
    let (stdout, handle, stderr_tail) = spawn_feed(cmd)?;
    let reader_handle = handle.clone();
    thread::Builder::new()
        .name("lores-reader".into())
        .spawn(move || {
            let result = frame_loop(stdout, &tx);
            finish_feed(result, &reader_handle, stderr_tail, &tx);
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok((rx, handle))
}

/// Start ffmpeg copying `url` into an MPEG-TS byte stream without transcoding.
pub fn spawn_chunk_reader(url: &str) -> Result<(ChunkReceiver, FeedHandle), CaptureError> {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-rtsp_transport")
        .arg("tcp")
        .arg("-i")
        .arg(url)
        .arg("-c")
        .arg("copy")
        .arg("-f")
        .arg("mpegts")
        .arg("pipe:1");

    let (tx, rx) = bounded(64);
    let (stdout, handle, stderr_tail) = spawn_feed(cmd)?;
    let reader_handle = handle.clone();
    thread::Builder::new()
        .name("hires-reader".into())
        .spawn(move || {
            let result = chunk_loop(stdout, &tx);
            finish_feed(result, &reader_handle, stderr_tail, &tx);
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok((rx, handle))
}

type StderrTail = thread::JoinHandle<String>;

fn spawn_feed(
    mut cmd: Command,
) -> Result<(ChildStdout, FeedHandle, Option<StderrTail>), CaptureError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| CaptureError::Spawn {
        program: "ffmpeg",
        source,
    })?;
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            if let Err(err) = child.kill() {
                warn!("Failed to kill ffmpeg (pid {}): {err}", child.id());
            }
            return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
        }
    };
    let stderr_tail = child.stderr.take().and_then(|stderr| {
        thread::Builder::new()
            .name("ffmpeg-stderr".into())
            .spawn(move || collect_stderr(stderr))
            .ok()
    });

    let pid = child.id();
    let handle = FeedHandle {
        child: Arc::new(Mutex::new(child)),
        pid,
    };
    Ok((stdout, handle, stderr_tail))
}

fn frame_loop(
    mut stdout: impl Read,
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut splitter = PngSplitter::new();
    let mut buffer = vec![0u8; FRAME_READ_BYTES];

    loop {
        let read = stdout.read(&mut buffer)?;
        if read == 0 {
            return Ok(());
        }
        for png in splitter.push(&buffer[..read]) {
            let decoded = image::load_from_memory_with_format(&png, image::ImageFormat::Png)
                .map(|img| Frame {
                    image: img.into_rgba8(),
                    timestamp_ms: Utc::now().timestamp_millis(),
                })
                .map_err(CaptureError::from);
            if tx.send(decoded).is_err() {
                return Ok(());
            }
        }
    }
}

fn chunk_loop(
    mut stdout: impl Read,
    tx: &Sender<Result<Chunk, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut buffer = vec![0u8; CHUNK_READ_BYTES];

    loop {
        let read = stdout.read(&mut buffer)?;
        if read == 0 {
            return Ok(());
        }
        if tx.send(Ok(Chunk::new(buffer[..read].to_vec()))).is_err() {
            return Ok(());
        }
    }
}

fn finish_feed<T>(
    result: Result<(), CaptureError>,
    handle: &FeedHandle,
    stderr_tail: Option<StderrTail>,
    tx: &Sender<Result<T, CaptureError>>,
) {
    if let Err(err) = result {
        let _ = tx.send(Err(err));
    }

    let status = reap(handle);
    let stderr = stderr_tail
        .and_then(|tail| tail.join().ok())
        .unwrap_or_default();
    let _ = tx.send(Err(CaptureError::Exited {
        code: status.and_then(|status| status.code()),
        stderr: stderr.trim().to_string(),
    }));
}

// Give ffmpeg a moment to exit on its own after closing stdout, then force it.
// The lock is released between polls so `FeedHandle::kill` is never blocked.
fn reap(handle: &FeedHandle) -> Option<ExitStatus> {
    for _ in 0..REAP_POLLS {
        {
            let mut child = handle.child.lock().ok()?;
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(err) => {
                    warn!("Failed to poll ffmpeg (pid {}): {err}", handle.pid);
                    break;
                }
            }
        }
        thread::sleep(REAP_POLL_INTERVAL);
    }
    handle.kill();
    let mut child = handle.child.lock().ok()?;
    child.wait().ok()
}

fn collect_stderr(mut stderr: impl Read) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 1024];
    while let Ok(read) = stderr.read(&mut buffer) {
        if read == 0 {
            break;
        }
        tail.extend_from_slice(&buffer[..read]);
        if tail.len() > STDERR_TAIL_BYTES {
            let cut = tail.len() - STDERR_TAIL_BYTES;
            tail.drain(..cut);
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageBuffer, Rgba};

    use super::*;

    fn encoded_png(value: u8) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(4, 3, Rgba([value, value, value, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png)
            .expect("encode png");
        out.into_inner()
    }

    #[test]
    fn frame_loop_decodes_each_png_in_order() {
        let mut stream = encoded_png(10);
        stream.extend(encoded_png(200));
        let (tx, rx) = bounded(4);

        frame_loop(Cursor::new(stream), &tx).expect("loop ends cleanly at EOF");
        drop(tx);

        let frames: Vec<_> = rx.iter().map(|frame| frame.expect("decoded")).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].width(), frames[0].height()), (4, 3));
        assert_eq!(frames[0].image.get_pixel(0, 0)[0], 10);
        assert_eq!(frames[1].image.get_pixel(3, 2)[0], 200);
    }

    #[cfg(unix)]
    #[test]
    fn kill_is_not_blocked_while_reaping() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec sleep 30");
        let (_stdout, handle, _stderr) = spawn_feed(cmd).expect("spawn sleep");

        let reaper = handle.clone();
        let reaping = thread::spawn(move || reap(&reaper));
        thread::sleep(Duration::from_millis(250));

        let started = std::time::Instant::now();
        handle.kill();
        assert!(started.elapsed() < REAP_POLL_INTERVAL * 2);

        let status = reaping.join().expect("reaper thread");
        assert!(status.is_some_and(|status| !status.success()));
    }

    #[test]
    fn chunk_loop_preserves_byte_order() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (tx, rx) = bounded(16);

        chunk_loop(Cursor::new(payload.clone()), &tx).expect("loop ends cleanly at EOF");
        drop(tx);

        let joined: Vec<u8> = rx
            .iter()
            .flat_map(|chunk| chunk.expect("chunk").data)
            .collect();
        assert_eq!(joined, payload);
    }
}
