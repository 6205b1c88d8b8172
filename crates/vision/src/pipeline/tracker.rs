//! Short-term identity tracking of detected objects across frames.

use chrono::{DateTime, Duration, Utc};
use ml_core::Detection;
use serde::{Deserialize, Serialize};

/// Seconds an unmatched object is remembered.
pub const OBJECT_MEMORY_SECS: i64 = 30;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rect {
    pub min: Point,
    pub max: Point,
}

impl Rect {
    pub fn width(&self) -> i32 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> i32 {
        self.max.y - self.min.y
    }
}

/// One physical object as seen in the most recent matching detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrackedObject {
    #[serde(rename = "BBox")]
    pub bbox: Rect,
    pub center: Point,
    pub area: f64,
    pub last_moved: DateTime<Utc>,
    pub class: String,
    pub confidence: f32,
}

impl TrackedObject {
    pub fn from_detection(detection: &Detection, now: DateTime<Utc>) -> Self {
        let bbox = Rect {
            min: Point {
                x: detection.left,
                y: detection.top,
            },
            max: Point {
                x: detection.right,
                y: detection.bottom,
            },
        };
        Self {
            center: Point {
                x: (detection.left + detection.right) / 2,
                y: (detection.top + detection.bottom) / 2,
            },
            area: f64::from(bbox.width().abs()) * f64::from(bbox.height().abs()),
            bbox,
            last_moved: now,
            class: detection.class_name.clone(),
            confidence: detection.confidence,
        }
    }

    fn distance_to(&self, other: &TrackedObject) -> f64 {
        let dx = f64::from(self.center.x - other.center.x);
        let dy = f64::from(self.center.y - other.center.y);
        dx.hypot(dy)
    }
}

/// Remembers recently seen objects and decides whether a detection is new.
///
/// Matching is first-match in insertion order: the first remembered object
/// within both the centre-distance and area-delta thresholds is overwritten.
/// Memory spans motion events.
#[derive(Debug)]
pub struct ObjectTracker {
    remembered: Vec<TrackedObject>,
    center_threshold: f64,
    area_threshold: f64,
}

impl ObjectTracker {
    pub fn new(center_threshold: f64, area_threshold: f64) -> Self {
        Self {
            remembered: Vec::new(),
            center_threshold,
            area_threshold,
        }
    }

    /// Returns `true` when `object` matches a remembered one.
    pub fn observe(&mut self, object: &TrackedObject, now: DateTime<Utc>) -> bool {
        let center_threshold = self.center_threshold;
        let area_threshold = self.area_threshold;
        if let Some(known) = self.remembered.iter_mut().find(|known| {
            known.distance_to(object) < center_threshold
                && (known.area - object.area).abs() < area_threshold
        }) {
            known.bbox = object.bbox;
            known.center = object.center;
            known.area = object.area;
            known.confidence = object.confidence;
            known.last_moved = now;
            return true;
        }

        let memory = Duration::seconds(OBJECT_MEMORY_SECS);
        self.remembered
            .retain(|known| now.signed_duration_since(known.last_moved) <= memory);
        let mut fresh = object.clone();
        fresh.last_moved = now;
        self.remembered.push(fresh);
        false
    }

    pub fn len(&self) -> usize {
        self.remembered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remembered.is_empty()
    }

    pub fn remembered(&self) -> &[TrackedObject] {
        &self.remembered
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn car_at(x: f32, y: f32, now: DateTime<Utc>) -> TrackedObject {
        let det = Detection::new(2, "car", 0.9, [x, y, x + 40.0, y + 20.0]);
        TrackedObject::from_detection(&det, now)
    }

    #[test]
    fn geometry_is_derived_from_the_box() {
        let det = Detection::new(0, "person", 0.7, [10.5, 21.0, 31.9, 60.0]);
        let obj = TrackedObject::from_detection(&det, start());
        assert_eq!(obj.center, Point { x: 20, y: 40 });
        assert_eq!(obj.area, 21.0 * 39.0);
    }

    #[test]
    fn observing_twice_is_idempotent() {
        let mut tracker = ObjectTracker::new(10.0, 100.0);
        let obj = car_at(100.0, 100.0, start());
        assert!(!tracker.observe(&obj, start()));
        assert!(tracker.observe(&obj, start()));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn stale_objects_expire() {
        let mut tracker = ObjectTracker::new(10.0, 100.0);
        let t0 = start();
        assert!(!tracker.observe(&car_at(100.0, 100.0, t0), t0));

        let later = t0 + Duration::seconds(31);
        assert!(!tracker.observe(&car_at(400.0, 300.0, later), later));
        assert_eq!(tracker.len(), 1);
        assert!(!tracker.observe(&car_at(100.0, 100.0, later), later));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn first_match_wins() {
        let mut tracker = ObjectTracker::new(50.0, 1000.0);
        let t0 = start();
        tracker.observe(&car_at(100.0, 100.0, t0), t0);
        tracker.observe(&car_at(200.0, 100.0, t0), t0);

        let between = car_at(140.0, 100.0, t0);
        assert!(tracker.observe(&between, t0));
        assert_eq!(tracker.remembered()[0].center, between.center);
        assert_eq!(tracker.remembered()[1].center, Point { x: 220, y: 110 });
    }

    #[test]
    fn serializes_with_pascal_case_keys() {
        let json = serde_json::to_value(car_at(0.0, 0.0, start())).unwrap();
        assert_eq!(json["BBox"]["Max"]["X"], 40);
        assert_eq!(json["Center"]["Y"], 10);
        assert_eq!(json["Class"], "car");
        assert!(json["LastMoved"].as_str().unwrap().starts_with("2024-05-01T12:00:00"));
    }
}
