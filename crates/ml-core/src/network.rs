//! Client for an external inference server speaking the length-prefixed
//! JPEG protocol.
//!
//! Request: 4-byte big-endian length followed by a JPEG image.
//! Response: one `\n` terminated JSON array of detection records.

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use image::{Rgb, RgbImage, RgbaImage, codecs::jpeg::JpegEncoder};
use tracing::{debug, warn};

use crate::detection::{Detection, DetectorError, ObjectDetector, Prediction, WireDetection};

/// Endpoint used when a local detector process is managed by the pipeline.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:8555";
/// Deadline for one detection round trip, reconnect included.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Quality used for frames sent to the detector.
pub const REQUEST_JPEG_QUALITY: u8 = 75;

const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;
const READINESS_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const READINESS_RETRY: Duration = Duration::from_secs(1);

/// Lazily connected, single-owner detector client.
pub struct NetworkDetector {
    endpoint: String,
    timeout: Duration,
    connection: Option<TcpStream>,
}

impl NetworkDetector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            connection: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn round_trip(&mut self, request: &[u8], deadline: Instant) -> Result<Vec<u8>, DetectorError> {
        let mut stream = match self.connection.take() {
            Some(stream) => stream,
            None => connect(&self.endpoint, remaining(deadline, self.timeout)?)?,
        };

        stream.set_write_timeout(Some(remaining(deadline, self.timeout)?))?;
        stream
            .write_all(request)
            .map_err(|err| classify(err, self.timeout))?;
        let line = read_line(&mut stream, deadline, self.timeout)?;

        self.connection = Some(stream);
        Ok(line)
    }
}

impl ObjectDetector for NetworkDetector {
    fn detect(&mut self, frame: &RgbaImage) -> Result<Prediction, DetectorError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let request = encode_request(&encode_jpeg(frame, REQUEST_JPEG_QUALITY)?)?;

        let line = match self.round_trip(&request, deadline) {
            Ok(line) => line,
            Err(DetectorError::Io(err)) => {
                debug!("detector connection to {} lost ({err}), reconnecting", self.endpoint);
                self.round_trip(&request, deadline)?
            }
            Err(err) => return Err(err),
        };

        Ok(Prediction {
            detections: decode_response(&line)?,
            took: started.elapsed(),
        })
    }

    fn backend(&self) -> &'static str {
        "network"
    }
}

/// Compress an RGBA frame to JPEG, dropping the alpha channel.
pub fn encode_jpeg(frame: &RgbaImage, quality: u8) -> Result<Vec<u8>, DetectorError> {
    let rgb = RgbImage::from_fn(frame.width(), frame.height(), |x, y| {
        let [r, g, b, _] = frame.get_pixel(x, y).0;
        Rgb([r, g, b])
    });
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode_image(&rgb)?;
    Ok(jpeg)
}

/// Frame a JPEG payload with its big-endian length.
pub fn encode_request(jpeg: &[u8]) -> Result<Vec<u8>, DetectorError> {
    let len = u32::try_from(jpeg.len()).map_err(|_| {
        DetectorError::Protocol(format!("image of {} bytes exceeds the length prefix", jpeg.len()))
    })?;
    let mut request = Vec::with_capacity(jpeg.len() + 4);
    request.extend_from_slice(&len.to_be_bytes());
    request.extend_from_slice(jpeg);
    Ok(request)
}

/// Parse one response line. `null` is read as an empty result.
pub fn decode_response(line: &[u8]) -> Result<Vec<Detection>, DetectorError> {
    let wire: Option<Vec<WireDetection>> = serde_json::from_slice(line.trim_ascii())?;
    wire.unwrap_or_default()
        .into_iter()
        .map(Detection::try_from)
        .collect()
}

/// Block until `endpoint` accepts TCP connections or `shutdown` is raised.
pub fn wait_for_endpoint(endpoint: &str, shutdown: &AtomicBool) -> Result<(), DetectorError> {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Err(DetectorError::Cancelled);
        }
        match connect(endpoint, READINESS_DIAL_TIMEOUT) {
            Ok(_) => return Ok(()),
            Err(err) => {
                warn!("Waiting for object detector at {endpoint}: {err}");
                thread::sleep(READINESS_RETRY);
            }
        }
    }
}

fn connect(endpoint: &str, timeout: Duration) -> Result<TcpStream, DetectorError> {
    let addrs: Vec<SocketAddr> = endpoint.to_socket_addrs()?.collect();
    let mut last_err = io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("{endpoint} did not resolve to any address"),
    );
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = err,
        }
    }
    Err(classify(last_err, timeout))
}

fn read_line(
    stream: &mut TcpStream,
    deadline: Instant,
    timeout: Duration,
) -> Result<Vec<u8>, DetectorError> {
    let mut line = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        stream.set_read_timeout(Some(remaining(deadline, timeout)?))?;
        let read = stream.read(&mut buf).map_err(|err| classify(err, timeout))?;
        if read == 0 {
            return Err(DetectorError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "detector closed the connection",
            )));
        }
        if let Some(pos) = buf[..read].iter().position(|b| *b == b'\n') {
            line.extend_from_slice(&buf[..pos]);
            return Ok(line);
        }
        line.extend_from_slice(&buf[..read]);
        if line.len() > MAX_RESPONSE_BYTES {
            return Err(DetectorError::Protocol(format!(
                "response exceeded {MAX_RESPONSE_BYTES} bytes without a newline"
            )));
        }
    }
}

fn remaining(deadline: Instant, timeout: Duration) -> Result<Duration, DetectorError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(DetectorError::Timeout(timeout))
    } else {
        Ok(left)
    }
}

fn classify(err: io::Error, timeout: Duration) -> DetectorError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => DetectorError::Timeout(timeout),
        _ => DetectorError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_length_prefixed_big_endian() {
        let request = encode_request(&[0xFF, 0xD8, 0xAA]).expect("small payload");
        assert_eq!(request, vec![0, 0, 0, 3, 0xFF, 0xD8, 0xAA]);
    }

    #[test]
    fn null_and_empty_responses_mean_no_detections() {
        assert!(decode_response(b"null\n").expect("null").is_empty());
        assert!(decode_response(b"[]").expect("empty").is_empty());
    }

    #[test]
    fn response_records_become_detections() {
        let line = br#"[{"object":2,"class_name":"car","box":[1.5,2.5,30.9,40.0],"confidence":0.91}]"#;
        let detections = decode_response(line).expect("valid response");
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, "car");
        assert_eq!((detections[0].left, detections[0].right), (1, 30));
    }

    #[test]
    fn jpeg_encoding_drops_alpha() {
        let frame = RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, 0]));
        let jpeg = encode_jpeg(&frame, 90).expect("encodes");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
