//! Recording controller: owns the hi-res byte stream, keeps a rolling
//! prebuffer and writes clips on command.
//!
//! A start command flushes the whole prebuffer into the new file before any
//! live chunk, so a clip begins up to `prebufferSeconds` before the trigger.
//! The controller survives hi-res feed restarts; only the ffmpeg process is
//! replaced.
//!
//! A stop command may carry re-encode options; the conversion only starts
//! once the clip has been flushed and closed.

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, select};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, Chunk, ChunkReceiver, RecodeOptions};

use crate::pipeline::{
    supervisor::FEED_RESTART_BACKOFF,
    telemetry,
    watchdog::{FeedHealth, HealthComponent},
};

/// Capacity of the command channel between the state machine and the recorder.
pub const COMMAND_CAPACITY: usize = 16;
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Start or stop instruction for the recorder. `filename` is meaningful only
/// when `record` is set, `recode` only when it is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordCommand {
    pub record: bool,
    pub filename: PathBuf,
    pub recode: Option<RecodeOptions>,
}

impl RecordCommand {
    pub fn start(filename: impl Into<PathBuf>) -> Self {
        Self {
            record: true,
            filename: filename.into(),
            recode: None,
        }
    }

    pub fn stop() -> Self {
        Self::stop_with(None)
    }

    /// Stop, then convert the finished clip to MP4 when `recode` is set.
    pub fn stop_with(recode: Option<RecodeOptions>) -> Self {
        Self {
            record: false,
            filename: PathBuf::new(),
            recode,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to create clip {path:?}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write clip {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

struct ClipWriter {
    path: PathBuf,
    file: BufWriter<File>,
    bytes: u64,
}

impl ClipWriter {
    fn create(path: &Path) -> Result<Self, RecorderError> {
        let file = File::create(path).map_err(|source| RecorderError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            bytes: 0,
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<(), RecorderError> {
        self.file
            .write_all(data)
            .map_err(|source| RecorderError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    fn finish(mut self) -> Result<(PathBuf, u64), RecorderError> {
        self.file.flush().map_err(|source| RecorderError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok((self.path, self.bytes))
    }
}

/// Prebuffer plus the clip currently being written, if any.
pub struct Recorder {
    prebuffer: VecDeque<Chunk>,
    window: Duration,
    output: Option<ClipWriter>,
}

impl Recorder {
    pub fn new(window: Duration) -> Self {
        Self {
            prebuffer: VecDeque::new(),
            window,
            output: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.output.is_some()
    }

    pub fn prebuffered_chunks(&self) -> usize {
        self.prebuffer.len()
    }

    /// Append a chunk to the prebuffer and, while recording, to the clip.
    ///
    /// A write failure abandons the clip; the prebuffer is kept either way.
    pub fn push_chunk(&mut self, chunk: Chunk) -> Result<(), RecorderError> {
        let written = match self.output.as_mut() {
            Some(clip) => clip.write(&chunk.data),
            None => Ok(()),
        };
        if written.is_err() {
            self.output = None;
        }

        self.prebuffer.push_back(chunk);
        self.trim();
        written
    }

    fn trim(&mut self) {
        let Some(newest) = self.prebuffer.back().map(|chunk| chunk.captured_at) else {
            return;
        };
        while self.prebuffer.len() > 1 {
            let Some(front) = self.prebuffer.front() else {
                break;
            };
            if newest.saturating_duration_since(front.captured_at) <= self.window {
                break;
            }
            self.prebuffer.pop_front();
        }
    }

    /// Apply a start/stop command. Starting while recording and stopping while
    /// idle are no-ops.
    pub fn apply(&mut self, command: &RecordCommand) -> Result<(), RecorderError> {
        if command.record {
            if self.output.is_some() {
                debug!("Already recording; ignoring start for {:?}", command.filename);
                return Ok(());
            }
            let mut clip = ClipWriter::create(&command.filename)?;
            for chunk in &self.prebuffer {
                clip.write(&chunk.data)?;
            }
            info!(
                "Recording started: {} ({} prebuffered bytes)",
                clip.path.display(),
                clip.bytes
            );
            self.output = Some(clip);
        } else if let Some(clip) = self.output.take() {
            let (path, bytes) = clip.finish()?;
            info!("Recording stopped: {} ({bytes} bytes)", path.display());
            if let Some(opts) = command.recode.clone() {
                spawn_recode(path, opts);
            }
        }
        Ok(())
    }

    fn handle(&mut self, command: &RecordCommand) {
        if let Err(err) = self.apply(command) {
            error!("Recording command failed, clip abandoned: {err}");
            metrics::counter!("clipwatch_recording_failures_total").increment(1);
        }
    }

    fn ingest(&mut self, chunk: Chunk) {
        if let Err(err) = self.push_chunk(chunk) {
            error!("Recording write failed, clip abandoned: {err}");
            metrics::counter!("clipwatch_recording_failures_total").increment(1);
        }
    }
}

fn spawn_recode(clip: PathBuf, opts: RecodeOptions) {
    let spawned = telemetry::spawn_thread("clip-recode", move || {
        match video_ingest::transcode::recode_to_mp4(&clip, &opts) {
            Ok(mp4) => info!("Recoded {} to {}", clip.display(), mp4.display()),
            Err(err) => error!("Failed to recode {}: {err:#}", clip.display()),
        }
    });
    if let Err(err) = spawned {
        error!("Failed to spawn recode thread: {err}");
    }
}

/// Why [`pump`] returned.
#[derive(Debug)]
pub enum PumpExit {
    FeedEnded(Option<CaptureError>),
    CommandsClosed,
    Shutdown,
}

/// Move chunks and commands into the recorder until the feed ends.
///
/// Pending commands are drained before each chunk so a start or stop is
/// applied at the next chunk boundary.
pub fn pump(
    recorder: &mut Recorder,
    commands: &Receiver<RecordCommand>,
    chunks: &ChunkReceiver,
    health: Option<&FeedHealth>,
    shutdown: &AtomicBool,
) -> PumpExit {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return PumpExit::Shutdown;
        }
        loop {
            match commands.try_recv() {
                Ok(command) => recorder.handle(&command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return PumpExit::CommandsClosed,
            }
        }

        select! {
            recv(commands) -> command => match command {
                Ok(command) => recorder.handle(&command),
                Err(_) => return PumpExit::CommandsClosed,
            },
            recv(chunks) -> chunk => match chunk {
                Ok(Ok(chunk)) => {
                    if let Some(health) = health {
                        health.beat(HealthComponent::HiResFeed);
                    }
                    recorder.ingest(chunk);
                }
                Ok(Err(err)) => return PumpExit::FeedEnded(Some(err)),
                Err(_) => return PumpExit::FeedEnded(None),
            },
            default(IDLE_POLL) => {}
        }
    }
}

/// Keep servicing commands for `period`; returns `false` once the command
/// channel closed or shutdown was requested.
fn service_commands_for(
    recorder: &mut Recorder,
    commands: &Receiver<RecordCommand>,
    period: Duration,
    shutdown: &AtomicBool,
) -> bool {
    let deadline = Instant::now() + period;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        match commands.recv_timeout(remaining.min(IDLE_POLL)) {
            Ok(command) => recorder.handle(&command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

/// Run the hi-res side of the pipeline until shutdown, restarting the ffmpeg
/// feed with a fixed backoff.
pub fn run_recorder(
    url: String,
    window: Duration,
    commands: Receiver<RecordCommand>,
    health: Arc<FeedHealth>,
    shutdown: Arc<AtomicBool>,
) {
    let worker_span = tracing::info_span!("recorder.worker", prebuffer_s = window.as_secs());
    let _guard = worker_span.enter();
    let mut recorder = Recorder::new(window);

    while !shutdown.load(Ordering::Relaxed) {
        match video_ingest::spawn_chunk_reader(&url) {
            Ok((chunks, handle)) => {
                info!("Hi-res feed started (pid {})", handle.pid());
                health.attach(HealthComponent::HiResFeed, handle);
                let exit = pump(&mut recorder, &commands, &chunks, Some(&health), &shutdown);
                if let Some(handle) = health.detach(HealthComponent::HiResFeed) {
                    handle.kill();
                }
                match exit {
                    PumpExit::FeedEnded(Some(err)) => error!("Hi-res feed failed: {err}"),
                    PumpExit::FeedEnded(None) => warn!("Hi-res feed ended"),
                    PumpExit::CommandsClosed | PumpExit::Shutdown => break,
                }
            }
            Err(err) => error!("Failed to start hi-res feed: {err}"),
        }

        metrics::counter!("clipwatch_feed_restarts_total", "feed" => "hires").increment(1);
        warn!("Restarting hi-res feed in {}s", FEED_RESTART_BACKOFF.as_secs());
        if !service_commands_for(&mut recorder, &commands, FEED_RESTART_BACKOFF, &shutdown) {
            break;
        }
    }
    debug!("Recorder stopped (recording: {})", recorder.is_recording());
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crossbeam_channel::{bounded, unbounded};

    use super::*;

    fn chunk(data: &[u8], captured_at: Instant) -> Chunk {
        Chunk {
            data: data.to_vec(),
            captured_at,
        }
    }

    #[test]
    fn clip_starts_with_prebuffer_then_live_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_a.ts");
        let now = Instant::now();
        let mut recorder = Recorder::new(Duration::from_secs(10));

        recorder.push_chunk(chunk(b"aa", now)).unwrap();
        recorder.push_chunk(chunk(b"bb", now)).unwrap();
        recorder.apply(&RecordCommand::start(&path)).unwrap();
        recorder.push_chunk(chunk(b"cc", now)).unwrap();
        recorder.push_chunk(chunk(b"dd", now)).unwrap();
        recorder.apply(&RecordCommand::stop()).unwrap();
        recorder.push_chunk(chunk(b"ee", now)).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"aabbccdd");
        assert!(!recorder.is_recording());
    }

    #[test]
    fn second_start_does_not_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("clip_1.ts");
        let second = dir.path().join("clip_2.ts");
        let mut recorder = Recorder::new(Duration::from_secs(10));

        recorder.apply(&RecordCommand::start(&first)).unwrap();
        recorder.apply(&RecordCommand::start(&second)).unwrap();
        recorder.push_chunk(chunk(b"xy", Instant::now())).unwrap();
        recorder.apply(&RecordCommand::stop()).unwrap();

        assert_eq!(fs::read(&first).unwrap(), b"xy");
        assert!(!second.exists());
    }

    #[test]
    fn prebuffer_is_trimmed_to_window() {
        let base = Instant::now();
        let mut recorder = Recorder::new(Duration::from_secs(5));
        recorder.push_chunk(chunk(b"1", base)).unwrap();
        recorder.push_chunk(chunk(b"2", base + Duration::from_secs(4))).unwrap();
        assert_eq!(recorder.prebuffered_chunks(), 2);
        recorder.push_chunk(chunk(b"3", base + Duration::from_secs(8))).unwrap();
        assert_eq!(recorder.prebuffered_chunks(), 2);
        recorder.push_chunk(chunk(b"4", base + Duration::from_secs(30))).unwrap();
        assert_eq!(recorder.prebuffered_chunks(), 1);
    }

    #[test]
    fn failed_create_leaves_recorder_idle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("clip.ts");
        let mut recorder = Recorder::new(Duration::from_secs(5));
        let err = recorder.apply(&RecordCommand::start(&path)).unwrap_err();
        assert!(matches!(err, RecorderError::Create { .. }));
        assert!(!recorder.is_recording());
    }

    #[test]
    fn pump_applies_commands_before_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_p.ts");
        let (cmd_tx, cmd_rx) = bounded(COMMAND_CAPACITY);
        let (chunk_tx, chunk_rx) = unbounded();
        let shutdown = AtomicBool::new(false);
        let mut recorder = Recorder::new(Duration::from_secs(10));

        cmd_tx.send(RecordCommand::start(&path)).unwrap();
        chunk_tx.send(Ok(Chunk::new(b"live".to_vec()))).unwrap();
        drop(chunk_tx);

        let exit = pump(&mut recorder, &cmd_rx, &chunk_rx, None, &shutdown);
        assert!(matches!(exit, PumpExit::FeedEnded(None)));
        assert!(recorder.is_recording());
        recorder.apply(&RecordCommand::stop()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"live");
    }
}
