use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{TimeZone, Utc};
use crossbeam_channel::{Receiver, unbounded};
use image::{Rgba, RgbaImage};
use ml_core::{Detection, DetectorError, ObjectDetector, Prediction};
use video_ingest::Frame;
use vision::pipeline::{
    FrameProcessor, MotionEvent, MotionStateMachine, ProcessorSettings,
    clock::ManualClock,
    config::IgnoreRegion,
    recorder::RecordCommand,
};

struct FixedDetector {
    calls: Arc<AtomicUsize>,
    detections: Vec<Detection>,
}

impl ObjectDetector for FixedDetector {
    fn detect(&mut self, _frame: &RgbaImage) -> Result<Prediction, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Prediction {
            detections: self.detections.clone(),
            took: Duration::from_millis(12),
        })
    }

    fn backend(&self) -> &'static str {
        "fixed"
    }
}

struct Pipeline {
    processor: FrameProcessor,
    calls: Arc<AtomicUsize>,
    clock: Arc<ManualClock>,
    commands: Receiver<RecordCommand>,
    events: Receiver<MotionEvent>,
    dir: tempfile::TempDir,
}

fn pipeline(settings: ProcessorSettings, detections: Vec<Detection>) -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let (cmd_tx, commands) = unbounded();
    let (event_tx, events) = unbounded();
    let machine = Arc::new(MotionStateMachine::new(
        "driveway",
        dir.path(),
        Duration::from_secs(10),
        None,
        cmd_tx,
        event_tx,
    ));
    let calls = Arc::new(AtomicUsize::new(0));
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
    ));
    let detector = FixedDetector {
        calls: calls.clone(),
        detections,
    };
    let processor = FrameProcessor::new(settings, Box::new(detector), machine, clock.clone());
    Pipeline {
        processor,
        calls,
        clock,
        commands,
        events,
        dir,
    }
}

fn settings() -> ProcessorSettings {
    ProcessorSettings {
        confidence_min: 0.5,
        pixel_area_threshold: 500.0,
        center_threshold: 30.0,
        area_threshold: 400.0,
        ..ProcessorSettings::default()
    }
}

fn person() -> Detection {
    Detection::new(0, "person", 0.9, [40.0, 30.0, 80.0, 90.0])
}

fn blank() -> Frame {
    Frame {
        image: RgbaImage::from_pixel(160, 120, Rgba([20, 20, 20, 255])),
        timestamp_ms: 0,
    }
}

fn with_rectangle() -> Frame {
    let mut image = RgbaImage::from_pixel(160, 120, Rgba([20, 20, 20, 255]));
    for y in 30..90 {
        for x in 40..80 {
            image.put_pixel(x, y, Rgba([250, 250, 250, 255]));
        }
    }
    Frame {
        image,
        timestamp_ms: 200,
    }
}

fn snapshots(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("snap_") && name.ends_with(".jpg"))
        .collect()
}

#[test]
fn still_frames_never_reach_the_detector() {
    let mut p = pipeline(settings(), vec![person()]);
    for _ in 0..10 {
        let outcome = p.processor.process(blank()).unwrap();
        assert!(!outcome.gate_open);
    }
    assert_eq!(p.calls.load(Ordering::SeqCst), 0);
    assert_eq!(p.commands.try_iter().count(), 0);
    assert_eq!(p.events.try_iter().count(), 0);
    assert!(snapshots(p.dir.path()).is_empty());
}

#[test]
fn a_moving_object_starts_one_event() {
    let mut p = pipeline(settings(), vec![person()]);
    assert!(!p.processor.process(blank()).unwrap().gate_open);
    let outcome = p.processor.process(with_rectangle()).unwrap();
    assert!(outcome.gate_open);
    assert_eq!(outcome.new_objects, 1);
    assert_eq!(p.calls.load(Ordering::SeqCst), 1);

    let commands: Vec<_> = p.commands.try_iter().collect();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].record);
    let file_name = commands[0]
        .filename
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap()
        .to_string();
    assert!(file_name.starts_with("clip_") && file_name.ends_with(".ts"));

    let events: Vec<_> = p.events.try_iter().collect();
    assert_eq!(events.len(), 1);
    let MotionEvent::Started(state) = &events[0] else {
        panic!("expected motion_started, got {}", events[0].kind());
    };
    assert_eq!(file_name, format!("clip_{}.ts", state.video.id));
    assert_eq!(state.video.camera_name, "driveway");

    let snaps = snapshots(p.dir.path());
    assert_eq!(snaps.len(), 1);
    assert!(snaps[0].starts_with(&format!("snap_{}_", state.video.id)));
    let live = p.processor.machine().current().unwrap();
    assert_eq!(live.snapshots, snaps);
}

#[test]
fn live_event_bypasses_the_gate_and_ends_after_the_gap() {
    let mut p = pipeline(settings(), vec![person()]);
    p.processor.process(blank()).unwrap();
    p.processor.process(with_rectangle()).unwrap();

    p.clock.advance(chrono::Duration::seconds(2));
    let outcome = p.processor.process(with_rectangle()).unwrap();
    assert!(outcome.gate_open);
    assert_eq!(outcome.new_objects, 0);
    assert_eq!(p.calls.load(Ordering::SeqCst), 2);

    p.clock.advance(chrono::Duration::seconds(11));
    p.processor.process(with_rectangle()).unwrap();
    let kinds: Vec<_> = p.events.try_iter().map(|event| event.kind()).collect();
    assert_eq!(kinds, vec!["motion_started", "motion_ended"]);
    let commands: Vec<_> = p.commands.try_iter().map(|cmd| cmd.record).collect();
    assert_eq!(commands, vec![true, false]);
    assert!(!p.processor.machine().is_triggered());
}

#[test]
fn ignored_and_unwanted_detections_are_dropped() {
    let mut settings = settings();
    settings.look_for_classes = vec!["person".into(), "car".into()];
    settings.ignore_regions = vec![IgnoreRegion {
        classes: vec!["person".into()],
        top: 0,
        bottom: 120,
        left: 0,
        right: 100,
    }];
    let detections = vec![
        person(),
        Detection::new(16, "dog", 0.95, [10.0, 10.0, 50.0, 50.0]),
        Detection::new(2, "car", 0.4, [100.0, 10.0, 150.0, 50.0]),
        Detection::new(2, "car", 0.5, [100.0, 60.0, 150.0, 110.0]),
    ];
    let mut p = pipeline(settings, detections);
    p.processor.process(blank()).unwrap();
    let outcome = p.processor.process(with_rectangle()).unwrap();

    assert_eq!(outcome.new_objects, 1);
    let live = p.processor.machine().current().unwrap();
    assert_eq!(live.objects.len(), 1);
    assert_eq!(live.objects[0].class, "car");
    assert_eq!(live.objects[0].confidence, 0.5);
}
