use std::time::Duration;

use tracing::{info, warn};

/// Detector calls aggregated into one summary.
pub const INFERENCE_WINDOW: usize = 10;
/// Calls slower than this are logged individually.
pub const SLOW_INFERENCE: Duration = Duration::from_millis(1_000);

/// Aggregate detector latency over one window, in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InferenceSummary {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Latency budget per analysed frame.
    pub ceiling_ms: u64,
}

#[derive(Debug, Default)]
pub struct InferenceStats {
    window: Vec<f64>,
}

impl InferenceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one detector call; returns a summary when a window completes.
    pub fn record(&mut self, took: Duration) -> Option<InferenceSummary> {
        if took > SLOW_INFERENCE {
            warn!(
                "Inference took {}ms, above the {}ms ceiling",
                took.as_millis(),
                SLOW_INFERENCE.as_millis()
            );
        }
        metrics::histogram!("clipwatch_detector_latency_ms").record(took.as_secs_f64() * 1_000.0);

        self.window.push(took.as_secs_f64() * 1_000.0);
        if self.window.len() < INFERENCE_WINDOW {
            return None;
        }

        let samples = std::mem::take(&mut self.window);
        let summary = InferenceSummary {
            avg_ms: samples.iter().sum::<f64>() / samples.len() as f64,
            min_ms: samples.iter().copied().fold(f64::MAX, f64::min),
            max_ms: samples.iter().copied().fold(0.0, f64::max),
            ceiling_ms: SLOW_INFERENCE.as_millis() as u64,
        };
        info!(
            "Inference avg: {:.2}ms, min: {:.2}ms, max: {:.2}ms",
            summary.avg_ms, summary.min_ms, summary.max_ms
        );
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarises_every_tenth_call() {
        let mut stats = InferenceStats::new();
        for ms in 1..INFERENCE_WINDOW as u64 {
            assert!(stats.record(Duration::from_millis(ms * 10)).is_none());
        }
        let summary = stats.record(Duration::from_millis(100)).expect("window complete");
        assert_eq!(summary.min_ms, 10.0);
        assert_eq!(summary.max_ms, 100.0);
        assert!((summary.avg_ms - 55.0).abs() < 1e-9);

        assert!(stats.record(Duration::from_millis(5)).is_none());
    }
}
