//! Transmission statistics
//!
//! Counters are plain atomics bumped by whichever stage produced the event.
//! Rates (frame rate, bitrate) are derived at snapshot time from the deltas
//! since the previous snapshot.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, SystemEvent};

/// Connection quality tier derived from drops and failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    pub fn from_counters(transmitted: u64, dropped: u64, failures: u64) -> Self {
        let total = transmitted + dropped;
        let drop_ratio = if total == 0 {
            0.0
        } else {
            dropped as f64 / total as f64
        };
        if drop_ratio < 0.01 && failures == 0 {
            ConnectionQuality::Excellent
        } else if drop_ratio < 0.05 && failures <= 1 {
            ConnectionQuality::Good
        } else if drop_ratio < 0.15 && failures <= 3 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }
}

/// Point-in-time copy of the counters plus derived gauges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_transmitted: u64,
    pub bytes_transmitted: u64,
    pub dropped_frames: u64,
    pub rejected_frames: u64,
    pub degraded_frames: u64,
    pub encode_errors: u64,
    pub failure_count: u64,
    pub reconnect_count: u64,
    /// Frames per second since the previous snapshot
    pub fps: f64,
    /// Transmit bitrate since the previous snapshot
    pub bitrate_kbps: f64,
    /// Smoothed capture-to-send latency
    pub latency_ms: f64,
    pub quality: ConnectionQuality,
    pub uptime_secs: u64,
}

struct RateState {
    started: Instant,
    last_at: Instant,
    last_frames: u64,
    last_bytes: u64,
}

impl RateState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_at: now,
            last_frames: 0,
            last_bytes: 0,
        }
    }
}

/// Transmission statistics
pub struct TransmissionStats {
    frames_transmitted: AtomicU64,
    bytes_transmitted: AtomicU64,
    dropped_frames: AtomicU64,
    rejected_frames: AtomicU64,
    degraded_frames: AtomicU64,
    encode_errors: AtomicU64,
    failure_count: AtomicU64,
    reconnect_count: AtomicU64,
    /// EWMA of latency in microseconds
    latency_us: AtomicU64,
    rates: Mutex<RateState>,
}

impl Default for TransmissionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmissionStats {
    pub fn new() -> Self {
        Self {
            frames_transmitted: AtomicU64::new(0),
            bytes_transmitted: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            rejected_frames: AtomicU64::new(0),
            degraded_frames: AtomicU64::new(0),
            encode_errors: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            rates: Mutex::new(RateState::new()),
        }
    }

    /// A sample left through the publish connection
    pub fn record_transmitted(&self, bytes: usize, latency: Duration) {
        self.frames_transmitted.fetch_add(1, Ordering::Relaxed);
        self.bytes_transmitted
            .fetch_add(bytes as u64, Ordering::Relaxed);

        let sample = latency.as_micros().min(u64::MAX as u128) as u64;
        let _ = self
            .latency_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                Some(if old == 0 {
                    sample
                } else {
                    // alpha = 1/8
                    old - old / 8 + sample / 8
                })
            });
    }

    pub fn record_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_error(&self) {
        self.encode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection-level failure (health check, send, connect)
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn frames_transmitted(&self) -> u64 {
        self.frames_transmitted.load(Ordering::Relaxed)
    }

    /// Copy the counters and derive gauges
    ///
    /// Rates cover the interval since the previous snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        let frames = self.frames_transmitted.load(Ordering::Relaxed);
        let bytes = self.bytes_transmitted.load(Ordering::Relaxed);
        let dropped = self.dropped_frames.load(Ordering::Relaxed);
        let failures = self.failure_count.load(Ordering::Relaxed);

        let now = Instant::now();
        let (fps, bitrate_kbps, uptime) = {
            let mut rates = self.rates.lock();
            let elapsed = now.duration_since(rates.last_at).as_secs_f64();
            let (fps, kbps) = if elapsed > 0.0 {
                (
                    frames.saturating_sub(rates.last_frames) as f64 / elapsed,
                    bytes.saturating_sub(rates.last_bytes) as f64 * 8.0 / 1000.0 / elapsed,
                )
            } else {
                (0.0, 0.0)
            };
            rates.last_at = now;
            rates.last_frames = frames;
            rates.last_bytes = bytes;
            (fps, kbps, now.duration_since(rates.started))
        };

        StatsSnapshot {
            frames_transmitted: frames,
            bytes_transmitted: bytes,
            dropped_frames: dropped,
            rejected_frames: self.rejected_frames.load(Ordering::Relaxed),
            degraded_frames: self.degraded_frames.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            failure_count: failures,
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            fps,
            bitrate_kbps,
            latency_ms: self.latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
            quality: ConnectionQuality::from_counters(frames, dropped, failures),
            uptime_secs: uptime.as_secs(),
        }
    }

    /// Zero every counter (stream start / restart)
    pub fn reset(&self) {
        for counter in [
            &self.frames_transmitted,
            &self.bytes_transmitted,
            &self.dropped_frames,
            &self.rejected_frames,
            &self.degraded_frames,
            &self.encode_errors,
            &self.failure_count,
            &self.reconnect_count,
            &self.latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.rates.lock() = RateState::new();
    }

    /// Publish a snapshot on the bus every `interval` until cancelled
    pub fn spawn_reporter(
        self: Arc<Self>,
        events: EventBus,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        events.publish(SystemEvent::StreamStatsUpdate {
                            stats: self.snapshot(),
                        });
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_tiers() {
        assert_eq!(
            ConnectionQuality::from_counters(1000, 0, 0),
            ConnectionQuality::Excellent
        );
        assert_eq!(
            ConnectionQuality::from_counters(1000, 20, 1),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::from_counters(1000, 100, 2),
            ConnectionQuality::Fair
        );
        assert_eq!(
            ConnectionQuality::from_counters(1000, 0, 5),
            ConnectionQuality::Poor
        );
        assert_eq!(ConnectionQuality::from_counters(0, 0, 0), ConnectionQuality::Excellent);
    }

    #[test]
    fn test_counters_and_reset() {
        let stats = TransmissionStats::new();
        stats.record_transmitted(1000, Duration::from_millis(40));
        stats.record_transmitted(500, Duration::from_millis(40));
        stats.record_dropped();
        stats.record_rejected();
        stats.record_failure();
        stats.record_reconnect();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_transmitted, 2);
        assert_eq!(snap.bytes_transmitted, 1500);
        assert_eq!(snap.dropped_frames, 1);
        assert_eq!(snap.rejected_frames, 1);
        assert_eq!(snap.reconnect_count, 1);
        assert!((snap.latency_ms - 40.0).abs() < 0.01);

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_transmitted, 0);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.quality, ConnectionQuality::Excellent);
    }

    #[test]
    fn test_rates_use_delta_since_last_snapshot() {
        let stats = TransmissionStats::new();
        stats.snapshot();
        std::thread::sleep(Duration::from_millis(100));
        for _ in 0..10 {
            stats.record_transmitted(1250, Duration::ZERO);
        }
        let snap = stats.snapshot();
        // 10 frames in ~0.1s
        assert!(snap.fps > 20.0 && snap.fps <= 100.0);
        assert!(snap.bitrate_kbps > 0.0);

        let snap = stats.snapshot();
        assert_eq!(snap.fps, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_publishes_until_cancelled() {
        let stats = Arc::new(TransmissionStats::new());
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();
        let task = stats
            .clone()
            .spawn_reporter(events.clone(), Duration::from_secs(1), cancel.clone());

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SystemEvent::StreamStatsUpdate { .. }));

        cancel.cancel();
        task.await.unwrap();
    }
}
