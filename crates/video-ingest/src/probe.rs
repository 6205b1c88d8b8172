//! Stream discovery through `ffprobe`.

use std::{
    io::{self, Read},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use serde::Deserialize;
use thiserror::Error;

/// Upper bound on a single `ffprobe` run.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Video or audio stream reported by `ffprobe`.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub codec_type: String,
    pub codec_name: String,
    pub fps: f64,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run ffprobe: {0}")]
    Spawn(#[source] io::Error),
    #[error("ffprobe did not finish within {0:?}")]
    Timeout(Duration),
    #[error("ffprobe exited with code {code:?}")]
    Failed { code: Option<i32> },
    #[error("unreadable ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid frame rate: {0}")]
    InvalidFrameRate(String),
    #[error("no video stream found at {0}")]
    NoVideoStream(String),
}

#[derive(Debug, Error)]
#[error("{binary} binary not found: {source}")]
pub struct MissingBinary {
    pub binary: &'static str,
    #[source]
    pub source: io::Error,
}

#[derive(Deserialize)]
struct RawProbe {
    #[serde(default)]
    streams: Vec<RawStream>,
}

#[derive(Deserialize)]
struct RawStream {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    codec_type: String,
    #[serde(default)]
    codec_name: String,
    #[serde(default)]
    r_frame_rate: String,
}

/// Verify `ffmpeg` and `ffprobe` can be launched from `PATH`.
pub fn ensure_binaries() -> Result<(), MissingBinary> {
    for binary in ["ffmpeg", "ffprobe"] {
        Command::new(binary)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| MissingBinary { binary, source })?;
    }
    Ok(())
}

/// Probe `url` and return the first stream with `codec_type == "video"`.
pub fn probe_video(url: &str) -> Result<StreamInfo, ProbeError> {
    let streams = probe_streams(url, PROBE_TIMEOUT)?;
    streams
        .into_iter()
        .find(|stream| stream.codec_type == "video")
        .ok_or_else(|| ProbeError::NoVideoStream(url.to_string()))
}

/// Run `ffprobe -show_streams` against `url`, killing it after `timeout`.
pub fn probe_streams(url: &str, timeout: Duration) -> Result<Vec<StreamInfo>, ProbeError> {
    let mut child = Command::new("ffprobe")
        .arg("-rtsp_transport")
        .arg("tcp")
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(ProbeError::Spawn)?;

    let output = child.stdout.take().map(|mut stdout| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait().map_err(ProbeError::Spawn)? {
            Some(status) => break status,
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProbeError::Timeout(timeout));
            }
            None => thread::sleep(Duration::from_millis(50)),
        }
    };

    let stdout = output
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default();
    if !status.success() {
        return Err(ProbeError::Failed {
            code: status.code(),
        });
    }
    parse_streams(&stdout)
}

/// Parse `ffprobe -print_format json -show_streams` output.
///
/// Streams without dimensions are skipped, as are streams whose frame rate is
/// not in `num/den` form. A zero denominator is an error.
pub fn parse_streams(json: &[u8]) -> Result<Vec<StreamInfo>, ProbeError> {
    let raw: RawProbe = serde_json::from_slice(json)?;
    let mut streams = Vec::new();

    for stream in raw.streams {
        if stream.width == 0 || stream.height == 0 {
            continue;
        }
        let Some((num, den)) = stream.r_frame_rate.split_once('/') else {
            continue;
        };
        let (Ok(num), Ok(den)) = (num.trim().parse::<i64>(), den.trim().parse::<i64>()) else {
            return Err(ProbeError::InvalidFrameRate(stream.r_frame_rate));
        };
        if den == 0 {
            return Err(ProbeError::InvalidFrameRate(stream.r_frame_rate));
        }
        streams.push(StreamInfo {
            width: stream.width,
            height: stream.height,
            codec_type: stream.codec_type,
            codec_name: stream.codec_name,
            fps: num as f64 / den as f64,
        });
    }

    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"codec_type": "audio", "codec_name": "aac", "r_frame_rate": "0/0"},
            {"codec_type": "video", "codec_name": "hevc", "width": 2560, "height": 1440, "r_frame_rate": "30000/1001"},
            {"codec_type": "video", "codec_name": "h264", "width": 640, "height": 360, "r_frame_rate": "15/1"}
        ]
    }"#;

    #[test]
    fn parses_video_streams_and_skips_dimensionless_ones() {
        let streams = parse_streams(SAMPLE.as_bytes()).expect("valid probe output");

        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].codec_name, "hevc");
        assert_eq!((streams[0].width, streams[0].height), (2560, 1440));
        assert!((streams[0].fps - 29.97).abs() < 0.01);
        assert_eq!(streams[1].fps, 15.0);
    }

    #[test]
    fn zero_denominator_is_rejected() {
        let json = br#"{"streams":[{"codec_type":"video","width":10,"height":10,"r_frame_rate":"25/0"}]}"#;
        assert!(matches!(
            parse_streams(json),
            Err(ProbeError::InvalidFrameRate(rate)) if rate == "25/0"
        ));
    }

    #[test]
    fn empty_output_has_no_streams() {
        assert!(parse_streams(b"{}").expect("empty object").is_empty());
    }
}
