//! Watchdog detecting ffmpeg feeds that stopped delivering data without
//! exiting.
//!
//! Each feed beats on every frame or chunk it delivers. A feed that stays
//! silent past the threshold has its process killed; the reader then reports
//! the exit and the feed's supervisor loop restarts it.

use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::error;
use video_ingest::FeedHandle;

use crate::pipeline::telemetry;

/// Sleep interval between watchdog health checks.
pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 1_000;
/// Time without data before a feed is considered hung.
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 30_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Feeds monitored by the watchdog.
pub enum HealthComponent {
    LowResFeed,
    HiResFeed,
}

impl HealthComponent {
    /// Human readable label used in log messages and metrics.
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::LowResFeed => "lores-feed",
            HealthComponent::HiResFeed => "hires-feed",
        }
    }
}

#[derive(Default)]
struct FeedSlot {
    last_beat: AtomicU64,
    handle: Mutex<Option<FeedHandle>>,
}

impl FeedSlot {
    fn is_attached(&self) -> bool {
        self.handle.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }
}

#[derive(Default)]
pub struct FeedHealth {
    lores: FeedSlot,
    hires: FeedSlot,
}

impl FeedHealth {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, component: HealthComponent) -> &FeedSlot {
        match component {
            HealthComponent::LowResFeed => &self.lores,
            HealthComponent::HiResFeed => &self.hires,
        }
    }

    /// Start monitoring a freshly spawned feed process.
    pub fn attach(&self, component: HealthComponent, handle: FeedHandle) {
        let slot = self.slot(component);
        slot.last_beat.store(current_millis(), Ordering::Relaxed);
        if let Ok(mut guard) = slot.handle.lock() {
            *guard = Some(handle);
        }
    }

    /// Stop monitoring a feed, returning its handle.
    pub fn detach(&self, component: HealthComponent) -> Option<FeedHandle> {
        self.slot(component)
            .handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }

    /// Register a heartbeat for the supplied feed.
    pub fn beat(&self, component: HealthComponent) {
        self.beat_at(component, current_millis());
    }

    pub(crate) fn beat_at(&self, component: HealthComponent, millis: u64) {
        self.slot(component).last_beat.store(millis, Ordering::Relaxed);
    }

    /// Attached feeds whose last heartbeat is older than the threshold.
    pub fn stale_components(&self, now: u64) -> Vec<HealthComponent> {
        [HealthComponent::LowResFeed, HealthComponent::HiResFeed]
            .into_iter()
            .filter(|component| {
                let slot = self.slot(*component);
                slot.is_attached()
                    && now.saturating_sub(slot.last_beat.load(Ordering::Relaxed))
                        > WATCHDOG_STALE_THRESHOLD_MS
            })
            .collect()
    }

    /// Kill every attached feed process.
    pub fn kill_all(&self) {
        for component in [HealthComponent::LowResFeed, HealthComponent::HiResFeed] {
            if let Some(handle) = self.detach(component) {
                handle.kill();
            }
        }
    }
}

/// Spawn the watchdog thread that kills hung feed processes.
pub fn spawn_watchdog(
    health: Arc<FeedHealth>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("feed-watchdog", move || {
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            let now = current_millis();
            for component in health.stale_components(now) {
                error!(
                    "Watchdog detected stalled {}; killing ffmpeg so it restarts",
                    component.label()
                );
                metrics::counter!("clipwatch_watchdog_kills_total", "feed" => component.label())
                    .increment(1);
                if let Some(handle) = health.detach(component) {
                    handle.kill();
                }
            }
        }
    })
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
