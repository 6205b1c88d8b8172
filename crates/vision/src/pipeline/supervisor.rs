//! Pipeline supervisor tying together the feeds, the detector, the recorder
//! and notification dispatch.
//!
//! Startup is fail-fast: configuration, missing binaries and unreachable
//! streams each map to their own exit code. Once running, feeds restart with
//! a fixed backoff and only a dead detector process ends the run with an
//! error.

use std::{
    fs,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{RecvTimeoutError, bounded};
use ml_core::{DetectorError, NetworkDetector, ObjectDetector};
use thiserror::Error;
use tracing::{error, info, warn};
use video_ingest::{CaptureError, FrameReceiver, MissingBinary, ProbeError, RecodeOptions};

use crate::pipeline::{
    clock::SystemClock,
    config::{CameraConfig, ConfigError, DetectorBackend, StreamParams},
    detector_process::DetectorProcess,
    events::MotionStateMachine,
    notify::{self, NOTIFY_CAPACITY},
    processing::{FrameProcessor, ProcessorSettings},
    recorder::{COMMAND_CAPACITY, run_recorder},
    telemetry,
    watchdog::{FeedHealth, HealthComponent, spawn_watchdog},
};

/// Pause before a failed feed is restarted.
pub const FEED_RESTART_BACKOFF: Duration = Duration::from_secs(5);
const FRAME_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    MissingBinary(#[from] MissingBinary),
    #[error("failed to probe {feed} stream: {source}")]
    Probe {
        feed: &'static str,
        #[source]
        source: ProbeError,
    },
}

impl StartupError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 1,
            StartupError::MissingBinary(_) => 2,
            StartupError::Probe { .. } => 3,
        }
    }
}

/// Stream parameters resolved before the pipeline starts.
#[derive(Clone, Debug, Default)]
pub struct StreamSetup {
    pub lo: StreamParams,
    pub hi: StreamParams,
    /// Hi-res codec reported by ffprobe; empty when probing was bypassed.
    pub hi_codec: String,
}

/// Check external binaries and resolve both feeds' parameters.
pub fn prepare(config: &CameraConfig) -> Result<StreamSetup, StartupError> {
    video_ingest::probe::ensure_binaries()?;
    let (lo, _) = resolve_stream("lo-res", &config.device_url, config.lo_stream_param_bypass)?;
    let (hi, hi_codec) =
        resolve_stream("hi-res", &config.hi_res_device_url, config.hi_stream_param_bypass)?;
    Ok(StreamSetup { lo, hi, hi_codec })
}

fn resolve_stream(
    feed: &'static str,
    url: &str,
    bypass: StreamParams,
) -> Result<(StreamParams, String), StartupError> {
    if bypass.is_complete() {
        info!(
            "Using configured {feed} stream parameters: {}x{} @ {:.2} fps",
            bypass.width, bypass.height, bypass.fps
        );
        return Ok((bypass, String::new()));
    }
    let stream =
        video_ingest::probe::probe_video(url).map_err(|source| StartupError::Probe { feed, source })?;
    info!(
        "Probed {feed} stream: {}x{} @ {:.2} fps ({})",
        stream.width, stream.height, stream.fps, stream.codec_name
    );
    Ok((
        StreamParams {
            width: stream.width,
            height: stream.height,
            fps: stream.fps,
        },
        stream.codec_name,
    ))
}

/// Run the pipeline until Ctrl+C or until the detector process gives up.
pub fn run(config: CameraConfig, setup: StreamSetup) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let pipeline_span = tracing::info_span!(
        "clipwatch.pipeline",
        camera = %config.camera_name,
        lo_width = setup.lo.width,
        lo_height = setup.lo.height,
        hi_width = setup.hi.width,
        hi_height = setup.hi.height,
        backend = ?config.motion.detector_backend,
    );
    let _pipeline_guard = pipeline_span.enter();

    fs::create_dir_all(&config.video.hi_res_path).with_context(|| {
        format!(
            "failed to create clip directory {}",
            config.video.hi_res_path.display()
        )
    })?;

    let mut detector_process = if config.manages_detector() {
        Some(
            DetectorProcess::spawn(config.motion.detector_command.clone(), shutdown.clone())
                .context("failed to start detector process")?,
        )
    } else {
        None
    };

    let outcome = run_pipeline(&config, &setup, &shutdown);
    shutdown.store(true, Ordering::SeqCst);

    if let Some(process) = detector_process.as_mut() {
        process.kill();
        if process.has_failed() {
            bail!("object detector process kept failing; giving up");
        }
    }
    info!("Pipeline stopped");
    outcome
}

fn run_pipeline(config: &CameraConfig, setup: &StreamSetup, shutdown: &Arc<AtomicBool>) -> Result<()> {
    let Some(detector) = build_detector(config, shutdown)? else {
        return Ok(());
    };

    let health = Arc::new(FeedHealth::new());
    let watchdog = spawn_watchdog(health.clone(), shutdown.clone())
        .context("failed to spawn feed watchdog")?;

    let (event_tx, event_rx) = bounded(NOTIFY_CAPACITY);
    let sinks = notify::sinks_from_config(&config.events)?;
    info!("Notification sinks: {}", sinks.len());
    let dispatcher =
        notify::spawn_dispatcher(event_rx, sinks).context("failed to spawn notification dispatcher")?;

    let (cmd_tx, cmd_rx) = bounded(COMMAND_CAPACITY);
    let recorder = {
        let url = config.hi_res_device_url.clone();
        let window = config.motion.prebuffer();
        let health = health.clone();
        let shutdown = shutdown.clone();
        telemetry::spawn_thread("hires-recorder", move || {
            run_recorder(url, window, cmd_rx, health, shutdown)
        })
        .context("failed to spawn recorder thread")?
    };

    let recode = config.video.recode_ts_to_mp4.then(|| RecodeOptions {
        remux_only: config.video.only_remux_mp4,
        codec_name: setup.hi_codec.clone(),
    });
    let machine = Arc::new(MotionStateMachine::new(
        config.camera_name.clone(),
        config.video.hi_res_path.clone(),
        config.motion.event_gap(),
        recode,
        cmd_tx,
        event_tx,
    ));
    let mut processor = FrameProcessor::new(
        ProcessorSettings::from_config(config),
        detector,
        machine,
        Arc::new(SystemClock),
    );

    let result = run_low_res(&config.device_url, &mut processor, &health, shutdown);
    if let Err(err) = &result {
        error!("Frame processing stopped: {err:#}");
    }

    shutdown.store(true, Ordering::SeqCst);
    health.kill_all();
    drop(processor);
    for (name, handle) in [("recorder", recorder), ("dispatcher", dispatcher), ("watchdog", watchdog)] {
        if handle.join().is_err() {
            error!("{name} thread panicked");
        }
    }
    result
}

fn build_detector(
    config: &CameraConfig,
    shutdown: &AtomicBool,
) -> Result<Option<Box<dyn ObjectDetector>>> {
    match config.motion.detector_backend {
        DetectorBackend::Network => {
            let endpoint = config.detector_endpoint();
            info!("Waiting for object detector at {endpoint}");
            match ml_core::network::wait_for_endpoint(endpoint, shutdown) {
                Ok(()) => {}
                Err(DetectorError::Cancelled) => return Ok(None),
                Err(err) => return Err(err).context("object detector never became reachable"),
            }
            info!("Object detector ready at {endpoint}");
            Ok(Some(Box::new(NetworkDetector::new(
                endpoint,
                config.motion.detector_timeout(),
            ))))
        }
        DetectorBackend::Torch => torch_detector(config).map(Some),
    }
}

#[cfg(feature = "with-tch")]
fn torch_detector(config: &CameraConfig) -> Result<Box<dyn ObjectDetector>> {
    use ml_core::{TorchDetector, tch::Device};

    let model = config
        .motion
        .torch_model
        .as_deref()
        .context("motion.torchModel is required for the torch backend")?;
    let size = config.motion.torch_input_size;
    let detector = TorchDetector::new(model, Device::cuda_if_available(), (size, size))
        .with_context(|| format!("failed to load TorchScript model {}", model.display()))?
        .with_confidence_threshold(config.motion.confidence_min_threshold);
    info!("Loaded TorchScript detector on {:?}", detector.device());
    Ok(Box::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn torch_detector(_config: &CameraConfig) -> Result<Box<dyn ObjectDetector>> {
    bail!("torch backend requires building with the `with-tch` feature")
}

/// Result of one lo-res feed run.
#[derive(Debug)]
enum FeedOutcome {
    Shutdown,
    Restart(Option<CaptureError>),
}

fn run_low_res(
    url: &str,
    processor: &mut FrameProcessor,
    health: &FeedHealth,
    shutdown: &AtomicBool,
) -> Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        match video_ingest::spawn_frame_reader(url) {
            Ok((frames, handle)) => {
                info!("Lo-res feed started (pid {})", handle.pid());
                health.attach(HealthComponent::LowResFeed, handle);
                let outcome = consume_frames(&frames, processor, health, shutdown);
                if let Some(handle) = health.detach(HealthComponent::LowResFeed) {
                    handle.kill();
                }
                match outcome? {
                    FeedOutcome::Shutdown => return Ok(()),
                    FeedOutcome::Restart(Some(err)) => error!("Lo-res feed failed: {err}"),
                    FeedOutcome::Restart(None) => warn!("Lo-res feed ended"),
                }
            }
            Err(err) => error!("Failed to start lo-res feed: {err}"),
        }

        metrics::counter!("clipwatch_feed_restarts_total", "feed" => "lores").increment(1);
        warn!("Restarting lo-res feed in {}s", FEED_RESTART_BACKOFF.as_secs());
        sleep_unless_shutdown(FEED_RESTART_BACKOFF, shutdown);
    }
    Ok(())
}

fn consume_frames(
    frames: &FrameReceiver,
    processor: &mut FrameProcessor,
    health: &FeedHealth,
    shutdown: &AtomicBool,
) -> Result<FeedOutcome> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(FeedOutcome::Shutdown);
        }
        match frames.recv_timeout(FRAME_POLL) {
            Ok(Ok(frame)) => {
                health.beat(HealthComponent::LowResFeed);
                processor.process(frame)?;
            }
            Ok(Err(CaptureError::Decode(err))) => {
                warn!("Dropping undecodable lo-res frame: {err}");
                metrics::counter!("clipwatch_frame_decode_errors_total").increment(1);
            }
            Ok(Err(err)) => return Ok(FeedOutcome::Restart(Some(err))),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(FeedOutcome::Restart(None)),
        }
    }
}

fn sleep_unless_shutdown(period: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + period;
    while !shutdown.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(FRAME_POLL));
    }
}
