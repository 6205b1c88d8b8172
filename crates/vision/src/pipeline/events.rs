//! Motion event state machine.
//!
//! The machine is either idle or triggered. The first new object starts an
//! event and a recording; further new objects extend it; once no new object
//! arrived for the event gap the event ends, the recording stops and the
//! metadata sidecar is written. The trigger flag and the live video are kept
//! under one mutex so they are always set or cleared together.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{Sender, TrySendError};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use video_ingest::RecodeOptions;

use crate::pipeline::{recorder::RecordCommand, stats::InferenceSummary, tracker::TrackedObject};

const EVENT_ID_LEN: usize = 15;
const SNAPSHOT_SUFFIX_LEN: usize = 4;

/// Metadata of one motion episode, written as `meta_<ID>.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VideoMetadata {
    #[serde(rename = "ID")]
    pub id: String,
    pub motion_start: Option<DateTime<Utc>>,
    pub motion_end: Option<DateTime<Utc>>,
    pub objects: Vec<TrackedObject>,
    pub recoded_to_mp4: bool,
    pub snapshots: Vec<String>,
    pub video_file: String,
    pub camera_name: String,
}

/// Event state captured at a transition.
#[derive(Clone, Debug, PartialEq)]
pub struct EventState {
    pub at: DateTime<Utc>,
    pub last_trigger: Option<DateTime<Utc>>,
    pub video: VideoMetadata,
}

/// Lifecycle notifications emitted by the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum MotionEvent {
    Started(EventState),
    Updated(EventState),
    Ended {
        state: EventState,
        metadata_path: PathBuf,
    },
    InferenceAverage {
        at: DateTime<Utc>,
        summary: InferenceSummary,
    },
}

impl MotionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MotionEvent::Started(_) => "motion_started",
            MotionEvent::Updated(_) => "motion_update",
            MotionEvent::Ended { .. } => "motion_ended",
            MotionEvent::InferenceAverage { .. } => "inference_avg",
        }
    }
}

#[derive(Debug, Default)]
struct MotionState {
    triggered: bool,
    last_trigger: Option<DateTime<Utc>>,
    video: VideoMetadata,
}

/// Where a detection landed in the machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Started { id: String },
    Updated { id: String },
}

impl Transition {
    pub fn event_id(&self) -> &str {
        match self {
            Transition::Started { id } | Transition::Updated { id } => id,
        }
    }
}

pub struct MotionStateMachine {
    state: Mutex<MotionState>,
    camera_name: String,
    output_dir: PathBuf,
    event_gap: Duration,
    recode: Option<RecodeOptions>,
    recorder: Sender<RecordCommand>,
    notifier: Sender<MotionEvent>,
}

impl MotionStateMachine {
    pub fn new(
        camera_name: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        event_gap: std::time::Duration,
        recode: Option<RecodeOptions>,
        recorder: Sender<RecordCommand>,
        notifier: Sender<MotionEvent>,
    ) -> Self {
        Self {
            state: Mutex::new(MotionState::default()),
            camera_name: camera_name.into(),
            output_dir: output_dir.into(),
            event_gap: Duration::from_std(event_gap).unwrap_or(Duration::MAX),
            recode,
            recorder,
            notifier,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MotionState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("motion state mutex poisoned"))
    }

    pub fn is_triggered(&self) -> bool {
        self.lock().map(|state| state.triggered).unwrap_or(false)
    }

    /// Copy of the live event metadata.
    pub fn current(&self) -> Option<VideoMetadata> {
        let state = self.lock().ok()?;
        state.triggered.then(|| state.video.clone())
    }

    /// End the live event when no new object arrived for the event gap.
    ///
    /// Returns the metadata file written for the finished event.
    pub fn end_if_expired(&self, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
        let mut state = self.lock()?;
        let expired = state.triggered
            && state
                .last_trigger
                .is_some_and(|last| now.signed_duration_since(last) > self.event_gap);
        if !expired {
            return Ok(None);
        }

        let last_trigger = state.last_trigger;
        let mut video = std::mem::take(&mut state.video);
        state.triggered = false;
        state.last_trigger = None;
        video.motion_end = Some(now);

        // The recorder starts the conversion after closing the clip.
        video.recoded_to_mp4 = self.recode.is_some();
        self.send_record(RecordCommand::stop_with(self.recode.clone()))?;

        let metadata_path = self.output_dir.join(format!("meta_{}.json", video.id));
        if let Err(err) = write_metadata(&metadata_path, &video) {
            error!("Failed to write event metadata: {err:#}");
        }

        info!(event = "motion_ended", id = %video.id, objects = video.objects.len(), "Motion ended");
        metrics::counter!("clipwatch_events_ended_total").increment(1);
        self.notify(MotionEvent::Ended {
            state: EventState {
                at: now,
                last_trigger,
                video,
            },
            metadata_path: metadata_path.clone(),
        });
        Ok(Some(metadata_path))
    }

    /// Feed a new (unmatched) object into the machine.
    pub fn observe(&self, object: TrackedObject, now: DateTime<Utc>) -> Result<Transition> {
        let mut state = self.lock()?;

        if state.triggered {
            state.last_trigger = Some(now);
            state.video.objects.push(object);
            let id = state.video.id.clone();
            info!(event = "motion_update", id = %id, objects = state.video.objects.len(), "Motion update");
            self.notify(MotionEvent::Updated(EventState {
                at: now,
                last_trigger: state.last_trigger,
                video: state.video.clone(),
            }));
            return Ok(Transition::Updated { id });
        }

        let id = random_token(EVENT_ID_LEN);
        let video_file = format!("clip_{id}.ts");
        self.send_record(RecordCommand::start(self.output_dir.join(&video_file)))?;

        state.triggered = true;
        state.last_trigger = Some(now);
        state.video = VideoMetadata {
            id: id.clone(),
            motion_start: Some(now),
            motion_end: None,
            objects: vec![object],
            recoded_to_mp4: false,
            snapshots: Vec::new(),
            video_file,
            camera_name: self.camera_name.clone(),
        };

        info!(event = "motion_started", id = %id, "Motion started");
        metrics::counter!("clipwatch_events_started_total").increment(1);
        self.notify(MotionEvent::Started(EventState {
            at: now,
            last_trigger: state.last_trigger,
            video: state.video.clone(),
        }));
        Ok(Transition::Started { id })
    }

    /// Directory receiving clips, snapshots and metadata.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Fresh snapshot file name for the event `id`.
    pub fn snapshot_name(&self, id: &str) -> String {
        format!("snap_{id}_{}.jpg", random_token(SNAPSHOT_SUFFIX_LEN))
    }

    /// Record a saved snapshot on the live event, if it is still `id`.
    pub fn attach_snapshot(&self, id: &str, file_name: String) -> Result<()> {
        let mut state = self.lock()?;
        if state.triggered && state.video.id == id {
            state.video.snapshots.push(file_name);
        }
        Ok(())
    }

    pub fn emit(&self, event: MotionEvent) {
        self.notify(event);
    }

    fn send_record(&self, command: RecordCommand) -> Result<()> {
        self.recorder
            .send(command)
            .context("recorder command channel closed")
    }

    fn notify(&self, event: MotionEvent) {
        match self.notifier.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Notification queue full; dropping {}", event.kind());
            }
            Err(TrySendError::Disconnected(event)) => {
                warn!("Notification dispatcher gone; dropping {}", event.kind());
            }
        }
    }
}

fn write_metadata(path: &Path, video: &VideoMetadata) -> Result<()> {
    let json = serde_json::to_vec_pretty(video).context("failed to encode event metadata")?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
