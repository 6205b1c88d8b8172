//! Per-frame analysis on the low-res feed.
//!
//! Each frame passes the motion gate (bypassed while an event is live), goes
//! through the detector, and every surviving detection is filtered, tracked
//! and, when new, handed to the motion state machine with a snapshot.

use std::sync::Arc;

use anyhow::Result;
use image::RgbaImage;
use ml_core::ObjectDetector;
use tracing::{debug, error, warn};
use video_ingest::Frame;

use crate::pipeline::{
    annotation::{draw_detection, draw_ignore_regions, save_jpeg},
    clock::Clock,
    config::{CameraConfig, IgnoreRegion},
    events::{MotionEvent, MotionStateMachine},
    gate::MotionGate,
    stats::InferenceStats,
    tracker::{ObjectTracker, TrackedObject},
};

const SNAPSHOT_QUALITY: u8 = 100;

/// Filtering and tracking knobs taken from the configuration.
#[derive(Clone, Debug, Default)]
pub struct ProcessorSettings {
    pub confidence_min: f32,
    pub look_for_classes: Vec<String>,
    pub ignore_regions: Vec<IgnoreRegion>,
    pub draw_ignored_areas: bool,
    pub pixel_area_threshold: f64,
    pub center_threshold: f64,
    pub area_threshold: f64,
}

impl ProcessorSettings {
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            confidence_min: config.motion.confidence_min_threshold,
            look_for_classes: config.motion.look_for_classes.clone(),
            ignore_regions: config.ignore_regions.clone(),
            draw_ignored_areas: config.stream_draw_ignored_areas,
            pixel_area_threshold: config.pixel_motion_area_threshold,
            center_threshold: config.object_center_movement_threshold,
            area_threshold: config.object_area_threshold,
        }
    }

    fn wants_class(&self, class: &str) -> bool {
        self.look_for_classes.is_empty() || self.look_for_classes.iter().any(|c| c == class)
    }

    fn is_ignored(&self, object: &TrackedObject) -> bool {
        self.ignore_regions
            .iter()
            .any(|region| region.suppresses(&object.class, object.center.x, object.center.y))
    }
}

/// What happened to one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    pub gate_open: bool,
    pub detector_called: bool,
    pub new_objects: usize,
}

pub struct FrameProcessor {
    settings: ProcessorSettings,
    detector: Box<dyn ObjectDetector>,
    gate: MotionGate,
    tracker: ObjectTracker,
    machine: Arc<MotionStateMachine>,
    stats: InferenceStats,
    clock: Arc<dyn Clock>,
}

impl FrameProcessor {
    pub fn new(
        settings: ProcessorSettings,
        detector: Box<dyn ObjectDetector>,
        machine: Arc<MotionStateMachine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gate: MotionGate::new(settings.pixel_area_threshold),
            tracker: ObjectTracker::new(settings.center_threshold, settings.area_threshold),
            settings,
            detector,
            machine,
            stats: InferenceStats::new(),
            clock,
        }
    }

    pub fn machine(&self) -> &Arc<MotionStateMachine> {
        &self.machine
    }

    /// Analyse one frame. Errors mean the pipeline can no longer record.
    pub fn process(&mut self, frame: Frame) -> Result<FrameOutcome> {
        let span = tracing::debug_span!("processing.frame", ts = frame.timestamp_ms);
        let _guard = span.enter();
        metrics::counter!("clipwatch_frames_total").increment(1);

        let mut outcome = FrameOutcome::default();
        let changed = self.gate.measure(&frame.image);
        let motion = self.gate.is_open(changed);
        if motion {
            debug!("Motion detected: {} changed pixels", changed.unwrap_or_default());
        }

        if motion || self.machine.is_triggered() {
            outcome.gate_open = true;
            metrics::counter!("clipwatch_gate_open_total").increment(1);
            let now = self.clock.now();
            self.machine.end_if_expired(now)?;
            outcome.detector_called = true;
            outcome.new_objects = self.detect(&frame.image, now)?;
        }

        self.gate.remember(frame.image);
        Ok(outcome)
    }

    fn detect(&mut self, image: &RgbaImage, now: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let prediction = match self.detector.detect(image) {
            Ok(prediction) => prediction,
            Err(err) => {
                warn!("Detection on {} backend failed, skipping frame: {err}", self.detector.backend());
                metrics::counter!("clipwatch_detector_failures_total", "backend" => self.detector.backend())
                    .increment(1);
                return Ok(0);
            }
        };
        if let Some(summary) = self.stats.record(prediction.took) {
            self.machine.emit(MotionEvent::InferenceAverage { at: now, summary });
        }

        let mut canvas: Option<RgbaImage> = None;
        let mut new_objects = 0;
        for detection in &prediction.detections {
            if !self.settings.wants_class(&detection.class_name)
                || detection.confidence < self.settings.confidence_min
            {
                continue;
            }
            let object = TrackedObject::from_detection(detection, now);
            if self.settings.is_ignored(&object) {
                debug!(
                    "Ignoring {} at ({}, {}) inside an ignore area",
                    object.class, object.center.x, object.center.y
                );
                continue;
            }
            if self.tracker.observe(&object, now) {
                continue;
            }

            debug!(
                "New {} ({:.2}) at ({}, {})",
                object.class, object.confidence, object.center.x, object.center.y
            );
            new_objects += 1;
            let transition = self.machine.observe(object.clone(), now)?;

            let canvas = canvas.get_or_insert_with(|| {
                let mut copy = image.clone();
                if self.settings.draw_ignored_areas {
                    draw_ignore_regions(&mut copy, &self.settings.ignore_regions);
                }
                copy
            });
            draw_detection(canvas, &object);

            let id = transition.event_id();
            let name = self.machine.snapshot_name(id);
            let path = self.machine.output_dir().join(&name);
            match save_jpeg(canvas, &path, SNAPSHOT_QUALITY) {
                Ok(()) => self.machine.attach_snapshot(id, name)?,
                Err(err) => error!("Failed to save snapshot: {err:#}"),
            }
        }
        Ok(new_objects)
    }
}
