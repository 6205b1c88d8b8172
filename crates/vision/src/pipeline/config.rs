//! Configuration parsing for the camera pipeline.
//!
//! This module owns translation of the JSON configuration file into a
//! `CameraConfig` which downstream stages use without re-reading the file.
//! Validation happens once at load time so that a bad file fails fast.

use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Configuration printed by `--template`.
pub const TEMPLATE: &str = include_str!("../../assets/template.json");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
/// Canonical configuration shared by every stage in the pipeline.
pub struct CameraConfig {
    /// Name stamped on every event and metadata file.
    pub camera_name: String,
    /// Lower the log filter to `debug`.
    pub print_debug: bool,
    /// Low-resolution feed used for analysis.
    pub device_url: String,
    /// Skip probing the low-res feed when fully populated.
    pub lo_stream_param_bypass: StreamParams,
    /// High-resolution feed used for recording.
    pub hi_res_device_url: String,
    /// Skip probing the hi-res feed when fully populated.
    pub hi_stream_param_bypass: StreamParams,
    /// Changed pixels needed to open the motion gate.
    pub pixel_motion_area_threshold: f64,
    /// Centroid distance below which two detections are the same object.
    pub object_center_movement_threshold: f64,
    /// Area delta below which two detections are the same object.
    pub object_area_threshold: f64,
    /// Outline ignore regions on snapshots.
    pub stream_draw_ignored_areas: bool,
    pub ignore_areas_classes: Vec<IgnoreArea>,
    pub motion: MotionSettings,
    pub video: VideoSettings,
    pub events: EventSettings,
    pub telemetry: TelemetryOptions,
    /// Parsed form of `ignore_areas_classes`, filled by validation.
    #[serde(skip)]
    pub ignore_regions: Vec<IgnoreRegion>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamParams {
    #[serde(alias = "Width")]
    pub width: u32,
    #[serde(alias = "Height")]
    pub height: u32,
    #[serde(alias = "FPS")]
    pub fps: f64,
}

impl StreamParams {
    /// All three values are known, so probing can be skipped.
    pub fn is_complete(&self) -> bool {
        self.width > 0 && self.height > 0 && self.fps > 0.0
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IgnoreArea {
    pub class: Vec<String>,
    /// `"top,bottom,left,right"` in low-res frame pixels.
    pub coordinates: String,
}

/// Rectangle in which detections of the listed classes are suppressed.
#[derive(Clone, Debug, PartialEq)]
pub struct IgnoreRegion {
    pub classes: Vec<String>,
    pub top: i32,
    pub bottom: i32,
    pub left: i32,
    pub right: i32,
}

impl IgnoreRegion {
    pub fn parse(area: &IgnoreArea) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = area.coordinates.split(',').collect();
        if parts.len() != 4 {
            return Err(invalid(format!(
                "coordinates {:?} must contain 4 comma separated integers",
                area.coordinates
            )));
        }
        let mut coords = [0i32; 4];
        for (slot, part) in coords.iter_mut().zip(&parts) {
            *slot = part.trim().parse().map_err(|_| {
                invalid(format!(
                    "coordinates {:?} contain non-integer value {part:?}",
                    area.coordinates
                ))
            })?;
        }
        let [top, bottom, left, right] = coords;
        Ok(Self {
            classes: area.class.clone(),
            top,
            bottom,
            left,
            right,
        })
    }

    /// Whether a detection of `class` centred at `(x, y)` falls strictly inside.
    pub fn suppresses(&self, class: &str, x: i32, y: i32) -> bool {
        self.classes.iter().any(|c| c == class)
            && x > self.left
            && x < self.right
            && y > self.top
            && y < self.bottom
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackend {
    /// External inference server over TCP.
    #[default]
    Network,
    /// In-process TorchScript model.
    Torch,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MotionSettings {
    pub confidence_min_threshold: f32,
    /// Only these classes are tracked; empty means every class.
    pub look_for_classes: Vec<String>,
    /// Remote detector endpoint; empty selects the managed local detector.
    pub network_object_detect_server: String,
    /// Command spawned as the local detector when no remote one is set.
    pub detector_command: Vec<String>,
    pub detector_timeout_ms: u64,
    pub detector_backend: DetectorBackend,
    pub torch_model: Option<PathBuf>,
    pub torch_input_size: u32,
    /// Seconds without a new object before an event ends.
    pub event_gap: u64,
    /// Seconds of hi-res footage kept ahead of a trigger.
    pub prebuffer_seconds: u64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            confidence_min_threshold: 0.0,
            look_for_classes: Vec::new(),
            network_object_detect_server: String::new(),
            detector_command: Vec::new(),
            detector_timeout_ms: 3_000,
            detector_backend: DetectorBackend::Network,
            torch_model: None,
            torch_input_size: 640,
            event_gap: 30,
            prebuffer_seconds: 10,
        }
    }
}

impl MotionSettings {
    pub fn event_gap(&self) -> Duration {
        Duration::from_secs(self.event_gap)
    }

    pub fn prebuffer(&self) -> Duration {
        Duration::from_secs(self.prebuffer_seconds)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoSettings {
    /// Directory receiving clips, snapshots and metadata.
    pub hi_res_path: PathBuf,
    pub recode_ts_to_mp4: bool,
    /// Stream-copy into MP4 instead of re-encoding.
    pub only_remux_mp4: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventSettings {
    pub webhook_url: String,
    pub script_path: String,
    #[serde(alias = "Slack")]
    pub slack: SlackSettings,
    #[serde(alias = "Mqtt")]
    pub mqtt: MqttSettings,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SlackSettings {
    #[serde(alias = "Url")]
    pub url: String,
}

/// Broker publishing. Disabled unless host, port and topic are all set.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub topic: String,
}

impl MqttSettings {
    pub fn is_enabled(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0 && !self.topic.trim().is_empty()
    }
}

/// Optional telemetry knobs for tracing and metrics export.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

impl CameraConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: CameraConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.device_url.trim().is_empty() {
            return Err(invalid("deviceUrl must be set"));
        }
        if self.hi_res_device_url.trim().is_empty() {
            return Err(invalid("hiResDeviceUrl must be set"));
        }
        if self.video.hi_res_path.as_os_str().is_empty() {
            return Err(invalid("video.hiResPath must be set"));
        }
        for (name, value) in [
            ("pixelMotionAreaThreshold", self.pixel_motion_area_threshold),
            ("objectCenterMovementThreshold", self.object_center_movement_threshold),
            ("objectAreaThreshold", self.object_area_threshold),
            ("motion.confidenceMinThreshold", self.motion.confidence_min_threshold as f64),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!("{name} must be a non-negative number")));
            }
        }
        if self.motion.event_gap == 0 {
            return Err(invalid("motion.eventGap must be at least 1 second"));
        }
        if self.motion.detector_timeout_ms == 0 {
            return Err(invalid("motion.detectorTimeoutMs must be positive"));
        }
        if self.motion.detector_backend == DetectorBackend::Torch {
            if self.motion.torch_model.is_none() {
                return Err(invalid("motion.torchModel is required for the torch backend"));
            }
            if !cfg!(feature = "with-tch") {
                return Err(invalid(
                    "torch backend requested but this build lacks the `with-tch` feature",
                ));
            }
        }

        self.ignore_regions = self
            .ignore_areas_classes
            .iter()
            .map(IgnoreRegion::parse)
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    /// Detector endpoint to use, falling back to the managed local detector.
    pub fn detector_endpoint(&self) -> &str {
        let server = self.motion.network_object_detect_server.trim();
        if server.is_empty() {
            ml_core::network::DEFAULT_ENDPOINT
        } else {
            server
        }
    }

    /// Whether the pipeline should spawn and supervise its own detector.
    pub fn manages_detector(&self) -> bool {
        self.motion.detector_backend == DetectorBackend::Network
            && self.motion.network_object_detect_server.trim().is_empty()
            && !self.motion.detector_command.is_empty()
    }

    /// Print the effective configuration at startup.
    pub fn log_summary(&self) {
        info!("Camera: {:?}", self.camera_name);
        info!("Print debug: {}", self.print_debug);
        info!("Device URL: {}", self.device_url);
        info!(
            "Lo-res bypass: {}x{} @ {:.2} fps",
            self.lo_stream_param_bypass.width,
            self.lo_stream_param_bypass.height,
            self.lo_stream_param_bypass.fps
        );
        info!("Hi-res device URL: {}", self.hi_res_device_url);
        info!(
            "Hi-res bypass: {}x{} @ {:.2} fps",
            self.hi_stream_param_bypass.width,
            self.hi_stream_param_bypass.height,
            self.hi_stream_param_bypass.fps
        );
        info!("Clip path: {}", self.video.hi_res_path.display());
        info!(
            "Recode to MP4: {} (remux only: {})",
            self.video.recode_ts_to_mp4, self.video.only_remux_mp4
        );
        info!(
            "Detector: {:?} at {} (timeout {} ms, managed: {})",
            self.motion.detector_backend,
            self.detector_endpoint(),
            self.motion.detector_timeout_ms,
            self.manages_detector()
        );
        info!("Confidence threshold: {}", self.motion.confidence_min_threshold);
        info!("Look for classes: {:?}", self.motion.look_for_classes);
        info!(
            "Event gap: {}s, prebuffer: {}s",
            self.motion.event_gap, self.motion.prebuffer_seconds
        );
        info!(
            "Thresholds: pixel area {}, center movement {}, object area {}",
            self.pixel_motion_area_threshold,
            self.object_center_movement_threshold,
            self.object_area_threshold
        );
        for region in &self.ignore_regions {
            info!(
                "Ignore {:?} inside top={} bottom={} left={} right={}",
                region.classes, region.top, region.bottom, region.left, region.right
            );
        }
        info!("Draw ignored areas: {}", self.stream_draw_ignored_areas);
        info!(
            "Events: webhook {:?}, script {:?}, slack {}",
            self.events.webhook_url,
            self.events.script_path,
            if self.events.slack.url.is_empty() { "off" } else { "on" }
        );
        info!(
            "MQTT: {}:{} topic {:?}",
            self.events.mqtt.host, self.events.mqtt.port, self.events.mqtt.topic
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "deviceUrl": "rtsp://cam/lo",
            "hiResDeviceUrl": "rtsp://cam/hi",
            "video": { "hiResPath": "/tmp/clips" },
            "motion": { "eventGap": 10 }
        })
    }

    #[test]
    fn template_is_a_valid_config() {
        let config = CameraConfig::from_json(TEMPLATE).expect("template parses");
        assert_eq!(config.ignore_regions.len(), 1);
        assert_eq!(config.ignore_regions[0].bottom, 120);
        assert!(config.manages_detector());
        assert_eq!(config.detector_endpoint(), "127.0.0.1:8555");
    }

    #[test]
    fn mqtt_needs_host_port_and_topic() {
        let mut raw = minimal();
        raw["events"] = serde_json::json!({
            "mqtt": { "host": "broker.lan", "port": 1883, "user": "cam", "pass": "pw", "topic": "cams/front" }
        });
        let config = CameraConfig::from_json(&raw.to_string()).expect("valid");
        assert!(config.events.mqtt.is_enabled());
        assert_eq!(config.events.mqtt.topic, "cams/front");

        raw["events"]["mqtt"]["port"] = serde_json::json!(0);
        let config = CameraConfig::from_json(&raw.to_string()).expect("valid");
        assert!(!config.events.mqtt.is_enabled());
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let config = CameraConfig::from_json(&minimal().to_string()).expect("valid");
        assert_eq!(config.motion.detector_timeout(), Duration::from_secs(3));
        assert_eq!(config.motion.prebuffer(), Duration::from_secs(10));
        assert!(!config.lo_stream_param_bypass.is_complete());
        assert!(!config.manages_detector());
    }

    #[test]
    fn go_style_stream_params_are_accepted() {
        let mut raw = minimal();
        raw["loStreamParamBypass"] = serde_json::json!({"Width": 640, "Height": 360, "FPS": 15.0});
        let config = CameraConfig::from_json(&raw.to_string()).expect("valid");
        assert!(config.lo_stream_param_bypass.is_complete());
    }

    #[test]
    fn malformed_coordinates_are_rejected() {
        for coords in ["1,2,3", "1,2,x,4", ""] {
            let mut raw = minimal();
            raw["ignoreAreasClasses"] = serde_json::json!([{ "class": ["car"], "coordinates": coords }]);
            assert!(
                matches!(CameraConfig::from_json(&raw.to_string()), Err(ConfigError::Invalid(_))),
                "{coords:?} should be rejected"
            );
        }
    }

    #[test]
    fn missing_urls_are_rejected() {
        let mut raw = minimal();
        raw["deviceUrl"] = serde_json::json!("");
        assert!(matches!(
            CameraConfig::from_json(&raw.to_string()),
            Err(ConfigError::Invalid(msg)) if msg.contains("deviceUrl")
        ));
    }

    #[test]
    fn ignore_region_uses_strict_bounds() {
        let region = IgnoreRegion {
            classes: vec!["car".into()],
            top: 0,
            bottom: 100,
            left: 0,
            right: 100,
        };
        assert!(region.suppresses("car", 50, 50));
        assert!(!region.suppresses("car", 0, 50));
        assert!(!region.suppresses("car", 50, 100));
        assert!(!region.suppresses("person", 50, 50));
    }
}
