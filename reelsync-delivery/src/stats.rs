//! Process-lifetime fairness counters and rolling latency samples.
//!
//! Purely observational: nothing in the scheduler reads these back.  Reset
//! whenever the active file revision changes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// ---

use parking_lot::Mutex;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Samples retained per rolling window.
pub const SAMPLE_WINDOW: usize = 1_024;

// ---------------------------------------------------------------------------
// Counter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    // ---
    Enqueued,
    Truncated,
    Completed,
    Aborted,
    ChunkServes,
    CacheHits,
    CacheMisses,
    AheadGateDefers,
    RateLimitDefers,
    BytesSent,
}

const COUNTERS: usize = 10;

impl Counter {
    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// SampleWindow
// ---------------------------------------------------------------------------

/// Most recent [`SAMPLE_WINDOW`] durations.
#[derive(Debug, Default)]
pub struct SampleWindow {
    samples: VecDeque<Duration>,
}

// ---

impl SampleWindow {
    // ---
    pub fn record(&mut self, sample: Duration) {
        // ---
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    // ---

    /// Nearest-rank percentiles over the retained samples.
    pub fn percentiles(&self) -> Percentiles {
        // ---
        if self.samples.is_empty() {
            return Percentiles::default();
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let rank = |p: f64| {
            let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
            as_ms(sorted[idx.clamp(1, sorted.len()) - 1])
        };

        Percentiles {
            count: sorted.len(),
            p50_ms: rank(50.0),
            p90_ms: rank(90.0),
            p99_ms: rank(99.0),
            max_ms: as_ms(sorted[sorted.len() - 1]),
        }
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

// ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Percentiles {
    // ---
    pub count: usize,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

// ---------------------------------------------------------------------------
// DeliveryStats
// ---------------------------------------------------------------------------

/// Shared between the scheduling task and the façade's cache fast path.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    // ---
    counters: [AtomicU64; COUNTERS],

    /// Enqueue to first byte written, per job.
    queue_wait: Mutex<SampleWindow>,

    /// Read + write time of one chunk.
    chunk_service: Mutex<SampleWindow>,
}

// ---

impl DeliveryStats {
    // ---
    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn record_queue_wait(&self, wait: Duration) {
        self.queue_wait.lock().record(wait);
    }

    pub fn record_chunk_service(&self, took: Duration) {
        self.chunk_service.lock().record(took);
    }

    // ---

    pub fn reset(&self) {
        // ---
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
        self.queue_wait.lock().clear();
        self.chunk_service.lock().clear();
    }

    // ---

    pub fn snapshot(&self) -> StatsSnapshot {
        // ---
        StatsSnapshot {
            counters: CounterSnapshot {
                enqueued: self.get(Counter::Enqueued),
                truncated: self.get(Counter::Truncated),
                completed: self.get(Counter::Completed),
                aborted: self.get(Counter::Aborted),
                chunk_serves: self.get(Counter::ChunkServes),
                cache_hits: self.get(Counter::CacheHits),
                cache_misses: self.get(Counter::CacheMisses),
                ahead_gate_defers: self.get(Counter::AheadGateDefers),
                rate_limit_defers: self.get(Counter::RateLimitDefers),
                bytes_sent: self.get(Counter::BytesSent),
            },
            percentiles: PercentileSnapshot {
                queue_wait: self.queue_wait.lock().percentiles(),
                chunk_service_time: self.chunk_service.lock().percentiles(),
            },
        }
    }
}

// ---

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CounterSnapshot {
    // ---
    pub enqueued: u64,
    pub truncated: u64,
    pub completed: u64,
    pub aborted: u64,
    pub chunk_serves: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub ahead_gate_defers: u64,
    pub rate_limit_defers: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PercentileSnapshot {
    pub queue_wait: Percentiles,
    pub chunk_service_time: Percentiles,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub counters: CounterSnapshot,
    pub percentiles: PercentileSnapshot,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        // ---
        let mut w = SampleWindow::default();
        for ms in 1..=100 {
            w.record(Duration::from_millis(ms));
        }
        let p = w.percentiles();
        assert_eq!(p.count, 100);
        assert!((p.p50_ms - 50.0).abs() < 1e-6);
        assert!((p.p90_ms - 90.0).abs() < 1e-6);
        assert!((p.p99_ms - 99.0).abs() < 1e-6);
        assert!((p.max_ms - 100.0).abs() < 1e-6);
    }

    // ---

    #[test]
    fn window_keeps_only_recent_samples() {
        // ---
        let mut w = SampleWindow::default();
        for _ in 0..SAMPLE_WINDOW {
            w.record(Duration::from_secs(10));
        }
        for _ in 0..SAMPLE_WINDOW {
            w.record(Duration::from_millis(1));
        }
        assert!((w.percentiles().max_ms - 1.0).abs() < 1e-6);
    }

    // ---

    #[test]
    fn reset_zeroes_everything() {
        // ---
        let stats = DeliveryStats::default();
        stats.incr(Counter::Enqueued);
        stats.add(Counter::BytesSent, 4_096);
        stats.record_queue_wait(Duration::from_millis(3));

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.counters, CounterSnapshot::default());
        assert_eq!(snap.percentiles.queue_wait.count, 0);
    }
}
