//! Notification fan-out.
//!
//! The state machine emits [`MotionEvent`]s; the dispatcher encodes each one
//! to JSON once and hands it to every configured sink on its own thread. A
//! failing sink is logged and never blocks the others. Nothing is retried.

use std::{
    io::{self, Write},
    path::PathBuf,
    process::{Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use reqwest::{blocking::Client, header::CONTENT_TYPE};
use rumqttc::{Client as MqttClient, Event, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use tracing::{debug, error};

use crate::pipeline::{
    config::{EventSettings, MqttSettings},
    events::{EventState, MotionEvent},
    stats::InferenceSummary,
    telemetry,
    tracker::TrackedObject,
};

/// Capacity of the queue between the pipeline and the dispatcher.
pub const NOTIFY_CAPACITY: usize = 64;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(5);
const MQTT_QUEUE: usize = 10;

/// Lifecycle notification body. Keys are snake_case except `Objects`, which
/// existing consumers read under its Go field name.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct EventPayload<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub timestamp: DateTime<Utc>,
    pub motion_triggered_last: Option<DateTime<Utc>>,
    pub id: &'a str,
    pub motion_start: Option<DateTime<Utc>>,
    pub motion_end: Option<DateTime<Utc>>,
    #[serde(rename = "Objects")]
    pub objects: &'a [TrackedObject],
    pub recoded_to_mp4: bool,
    pub snapshots: &'a [String],
    pub video_file: &'a str,
    pub camera_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_path: Option<String>,
}

impl<'a> EventPayload<'a> {
    fn new(kind: &'a str, state: &'a EventState, metadata_path: Option<String>) -> Self {
        Self {
            kind,
            timestamp: state.at,
            motion_triggered_last: state.last_trigger,
            id: &state.video.id,
            motion_start: state.video.motion_start,
            motion_end: state.video.motion_end,
            objects: &state.video.objects,
            recoded_to_mp4: state.video.recoded_to_mp4,
            snapshots: &state.video.snapshots,
            video_file: &state.video.video_file,
            camera_name: &state.video.camera_name,
            metadata_path,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InferencePayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: DateTime<Utc>,
    pub inference_avg: f64,
    pub inference_min: f64,
    pub inference_max: f64,
    pub ceiling: u64,
}

impl InferencePayload {
    fn new(at: DateTime<Utc>, summary: &InferenceSummary) -> Self {
        Self {
            kind: "inferencing_avg",
            timestamp: at,
            inference_avg: summary.avg_ms,
            inference_min: summary.min_ms,
            inference_max: summary.max_ms,
            ceiling: summary.ceiling_ms,
        }
    }
}

/// JSON body delivered to every sink for `event`.
pub fn encode_event(event: &MotionEvent) -> serde_json::Result<Vec<u8>> {
    let kind = event.kind();
    match event {
        MotionEvent::Started(state) | MotionEvent::Updated(state) => {
            serde_json::to_vec(&EventPayload::new(kind, state, None))
        }
        MotionEvent::Ended {
            state,
            metadata_path,
        } => serde_json::to_vec(&EventPayload::new(
            kind,
            state,
            Some(metadata_path.display().to_string()),
        )),
        MotionEvent::InferenceAverage { at, summary } => {
            serde_json::to_vec(&InferencePayload::new(*at, summary))
        }
    }
}

/// Chat message wrapping an encoded payload.
pub fn slack_message(kind: &str, payload: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "text": format!("Event: {kind}\nPayload: {}", String::from_utf8_lossy(payload)),
    })
}

/// Destination for encoded notifications.
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn deliver(&self, kind: &str, payload: &[u8]) -> Result<()>;
}

pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn deliver(&self, _kind: &str, payload: &[u8]) -> Result<()> {
        self.client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .with_context(|| format!("failed to post to webhook {}", self.url))?
            .error_for_status()
            .context("webhook rejected the event")?;
        Ok(())
    }
}

pub struct SlackSink {
    client: Client,
    url: String,
}

impl SlackSink {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl NotificationSink for SlackSink {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn deliver(&self, kind: &str, payload: &[u8]) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&slack_message(kind, payload))
            .send()
            .context("failed to post to Slack")?
            .error_for_status()
            .context("Slack rejected the event")?;
        Ok(())
    }
}

/// Runs an executable with the payload on stdin.
pub struct ScriptSink {
    path: PathBuf,
}

impl ScriptSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl NotificationSink for ScriptSink {
    fn name(&self) -> &'static str {
        "script"
    }

    fn deliver(&self, _kind: &str, payload: &[u8]) -> Result<()> {
        let mut child = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start script {}", self.path.display()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload)
                .context("failed to write event to script stdin")?;
        }
        let status = child.wait().context("failed to wait for script")?;
        if !status.success() {
            bail!("script {} exited with {status}", self.path.display());
        }
        Ok(())
    }
}

/// Publishes each payload to a broker topic over its own short connection.
pub struct MqttSink {
    settings: MqttSettings,
    deliveries: AtomicU64,
}

impl MqttSink {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            deliveries: AtomicU64::new(0),
        }
    }

    fn options(&self) -> MqttOptions {
        let seq = self.deliveries.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("clipwatch-{}-{seq}", std::process::id());
        let mut options =
            MqttOptions::new(client_id, self.settings.host.trim(), self.settings.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        if !self.settings.user.is_empty() && !self.settings.pass.is_empty() {
            options.set_credentials(self.settings.user.clone(), self.settings.pass.clone());
        }
        options
    }
}

impl NotificationSink for MqttSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    // The first connection error ends the delivery; iterating further would
    // make the event loop reconnect.
    fn deliver(&self, _kind: &str, payload: &[u8]) -> Result<()> {
        let broker = format!("{}:{}", self.settings.host.trim(), self.settings.port);
        let (client, mut connection) = MqttClient::new(self.options(), MQTT_QUEUE);
        client
            .publish(self.settings.topic.trim(), QoS::AtMostOnce, false, payload.to_vec())
            .context("failed to queue MQTT publish")?;

        for notification in connection.iter() {
            match notification.with_context(|| format!("MQTT broker {broker} failed"))? {
                Event::Outgoing(Outgoing::Publish(_)) => {
                    debug!("Published event to {broker} on {:?}", self.settings.topic);
                    client
                        .disconnect()
                        .context("failed to queue MQTT disconnect")?;
                }
                Event::Outgoing(Outgoing::Disconnect) => return Ok(()),
                _ => {}
            }
        }
        bail!("MQTT connection to {broker} closed before the event was published")
    }
}

/// Build one sink per configured destination.
pub fn sinks_from_config(settings: &EventSettings) -> Result<Vec<Arc<dyn NotificationSink>>> {
    let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
    let webhook = settings.webhook_url.trim();
    let slack = settings.slack.url.trim();
    if !webhook.is_empty() || !slack.is_empty() {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        if !webhook.is_empty() {
            sinks.push(Arc::new(WebhookSink::new(client.clone(), webhook)));
        }
        if !slack.is_empty() {
            sinks.push(Arc::new(SlackSink::new(client, slack)));
        }
    }
    let script = settings.script_path.trim();
    if !script.is_empty() {
        sinks.push(Arc::new(ScriptSink::new(script)));
    }
    if settings.mqtt.is_enabled() {
        sinks.push(Arc::new(MqttSink::new(settings.mqtt.clone())));
    }
    Ok(sinks)
}

/// Spawn the dispatcher thread; it ends when every sender is dropped.
pub fn spawn_dispatcher(
    events: Receiver<MotionEvent>,
    sinks: Vec<Arc<dyn NotificationSink>>,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("notify-dispatch", move || {
        for event in events {
            dispatch(&event, &sinks);
        }
        debug!("Notification dispatcher stopped");
    })
}

fn dispatch(event: &MotionEvent, sinks: &[Arc<dyn NotificationSink>]) {
    let kind = event.kind();
    if sinks.is_empty() {
        return;
    }
    let payload: Arc<[u8]> = match encode_event(event) {
        Ok(payload) => payload.into(),
        Err(err) => {
            error!("Failed to encode {kind} event: {err}");
            return;
        }
    };

    for sink in sinks {
        let name = sink.name();
        let sink = Arc::clone(sink);
        let payload = Arc::clone(&payload);
        let spawned = telemetry::spawn_thread(format!("notify-{name}"), move || {
            if let Err(err) = sink.deliver(kind, &payload) {
                error!("Failed to deliver {kind} to {name}: {err:#}");
                metrics::counter!("clipwatch_notify_failures_total", "sink" => name).increment(1);
            }
        });
        if let Err(err) = spawned {
            error!("Failed to spawn {name} delivery: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Read},
        net::TcpListener,
        sync::Mutex,
    };

    use chrono::TimeZone;
    use crossbeam_channel::unbounded;

    use super::*;
    use crate::pipeline::events::VideoMetadata;

    fn started() -> MotionEvent {
        let at = Utc.with_ymd_and_hms(2024, 3, 2, 10, 0, 0).unwrap();
        MotionEvent::Started(EventState {
            at,
            last_trigger: Some(at),
            video: VideoMetadata {
                id: "abc".into(),
                motion_start: Some(at),
                video_file: "clip_abc.ts".into(),
                camera_name: "gate".into(),
                ..VideoMetadata::default()
            },
        })
    }

    #[test]
    fn event_payload_uses_snake_case_keys() {
        let json: serde_json::Value = serde_json::from_slice(&encode_event(&started()).unwrap()).unwrap();
        assert_eq!(json["type"], "motion_started");
        assert_eq!(json["id"], "abc");
        assert_eq!(json["video_file"], "clip_abc.ts");
        assert_eq!(json["camera_name"], "gate");
        assert_eq!(json["recoded_to_mp4"], false);
        assert!(json["motion_triggered_last"].is_string());
        assert!(json["motion_start"].is_string());
        assert!(json["Objects"].is_array());
        assert!(json.get("metadata_path").is_none());
        for camel in ["videoFile", "cameraName", "motionTriggeredLast", "objects"] {
            assert!(json.get(camel).is_none(), "unexpected key {camel}");
        }
    }

    #[test]
    fn ended_payload_carries_metadata_path() {
        let MotionEvent::Started(state) = started() else {
            unreachable!()
        };
        let event = MotionEvent::Ended {
            state,
            metadata_path: PathBuf::from("/clips/meta_abc.json"),
        };
        let json: serde_json::Value = serde_json::from_slice(&encode_event(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "motion_ended");
        assert_eq!(json["metadata_path"], "/clips/meta_abc.json");
    }

    #[test]
    fn inference_payload_matches_wire_names() {
        let event = MotionEvent::InferenceAverage {
            at: Utc::now(),
            summary: InferenceSummary {
                avg_ms: 12.5,
                min_ms: 10.0,
                max_ms: 15.0,
                ceiling_ms: 1000,
            },
        };
        let json: serde_json::Value = serde_json::from_slice(&encode_event(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "inferencing_avg");
        assert_eq!(json["inference_avg"], 12.5);
        assert_eq!(json["ceiling"], 1000);
    }

    #[test]
    fn slack_text_embeds_type_and_payload() {
        let msg = slack_message("motion_ended", br#"{"id":"x"}"#);
        assert_eq!(msg["text"], "Event: motion_ended\nPayload: {\"id\":\"x\"}");
    }

    #[test]
    fn webhook_posts_the_raw_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut content_length = 0usize;
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .unwrap();
            (request_line, body)
        });

        let sink = WebhookSink::new(Client::new(), url);
        sink.deliver("motion_started", b"{\"id\":\"abc\"}").unwrap();
        let (request_line, body) = server.join().unwrap();
        assert!(request_line.starts_with("POST /hook"));
        assert_eq!(body, b"{\"id\":\"abc\"}");
    }

    struct Recording(Mutex<Vec<String>>);

    impl NotificationSink for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn deliver(&self, kind: &str, _payload: &[u8]) -> Result<()> {
            self.0.lock().unwrap().push(kind.to_string());
            Ok(())
        }
    }

    struct Failing;

    impl NotificationSink for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn deliver(&self, _kind: &str, _payload: &[u8]) -> Result<()> {
            bail!("unreachable")
        }
    }

    #[test]
    fn failing_sink_does_not_block_others() {
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let (tx, rx) = unbounded();
        let dispatcher = spawn_dispatcher(
            rx,
            vec![Arc::new(Failing), recording.clone() as Arc<dyn NotificationSink>],
        )
        .unwrap();
        tx.send(started()).unwrap();
        drop(tx);
        dispatcher.join().unwrap();

        for _ in 0..100 {
            if !recording.0.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*recording.0.lock().unwrap(), vec!["motion_started".to_string()]);
    }

    fn read_packet(stream: &mut impl Read) -> (u8, Vec<u8>) {
        let mut header = [0u8; 1];
        stream.read_exact(&mut header).unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).unwrap();
            len |= usize::from(byte[0] & 0x7f) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        (header[0] >> 4, body)
    }

    #[test]
    fn mqtt_publishes_the_payload_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (kind, _) = read_packet(&mut stream);
            assert_eq!(kind, 1, "CONNECT");
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).unwrap();
            let (kind, body) = read_packet(&mut stream);
            assert_eq!(kind, 3, "PUBLISH");
            let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
            let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
            let payload = body[2 + topic_len..].to_vec();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest);
            (topic, payload)
        });

        let sink = MqttSink::new(MqttSettings {
            host: "127.0.0.1".into(),
            port,
            topic: "cams/gate".into(),
            ..MqttSettings::default()
        });
        sink.deliver("motion_started", b"{\"id\":\"abc\"}").unwrap();
        let (topic, payload) = broker.join().unwrap();
        assert_eq!(topic, "cams/gate");
        assert_eq!(payload, b"{\"id\":\"abc\"}");
    }

    #[test]
    fn unreachable_broker_fails_without_retrying() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let sink = MqttSink::new(MqttSettings {
            host: "127.0.0.1".into(),
            port,
            topic: "cams/gate".into(),
            ..MqttSettings::default()
        });
        let started = std::time::Instant::now();
        assert!(sink.deliver("motion_started", b"{}").is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn empty_settings_build_no_sinks() {
        assert!(sinks_from_config(&EventSettings::default()).unwrap().is_empty());
    }

    #[test]
    fn configured_mqtt_adds_a_sink() {
        let settings = EventSettings {
            mqtt: MqttSettings {
                host: "broker.lan".into(),
                port: 1883,
                topic: "cams".into(),
                ..MqttSettings::default()
            },
            ..EventSettings::default()
        };
        let names: Vec<_> = sinks_from_config(&settings)
            .unwrap()
            .iter()
            .map(|sink| sink.name())
            .collect();
        assert_eq!(names, vec!["mqtt"]);
    }
}
