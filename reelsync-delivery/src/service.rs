//! [`DeliveryService`]: the one entry point the HTTP layer talks to.
//!
//! `serve` validates and admits the range, then picks one of three ways to
//! produce the body:
//!
//! - head cache hit: the exact window is answered from memory at once
//! - fair scheduling on: a [`DeliveryJob`] is queued for the DRR loop
//! - fair scheduling off: a direct transfer task is spawned
//!
//! The service also notices file revision changes in the snapshots it is
//! handed and resets the scheduler before anything for the new revision is
//! queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ---

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

// ---

use reelsync_domain::{
    // ---
    admit,
    Admission,
    ByteRange,
    Category,
    ChunkReader,
    ClientKey,
    Diagnostic,
    Diagnostics,
    MediaFile,
    PlaybackClock,
    ReelSyncError,
    Result,
};

// ---

use super::client_queue::{ClientSnapshot, DeliveryJob};
use super::config::{DeliveryParams, DriftReport};
use super::diagnostics::Throttle;
use super::direct::DirectDelivery;
use super::head_cache::HeadCache;
use super::scheduler::{DeliveryScheduler, SchedulerContext, SchedulerCore};
use super::sink::{body_channel, BodyStream, BODY_CHANNEL_CAPACITY};
use super::stats::{Counter, CounterSnapshot, DeliveryStats, PercentileSnapshot};

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// 200, whole file.
    Full,
    /// 206, one admitted range.
    Partial,
}

// ---

pub enum DeliveryBody {
    // ---
    /// HEAD request, or a zero-length file.
    Empty,
    /// Answered from the head cache.
    Bytes(Bytes),
    /// Produced chunk by chunk by the scheduler or a direct transfer.
    Stream(BodyStream),
}

impl std::fmt::Debug for DeliveryBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => write!(f, "Bytes({})", b.len()),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

// ---

/// Everything the HTTP layer needs to write a response.
#[derive(Debug)]
pub struct Delivery {
    // ---
    pub status: DeliveryStatus,

    /// Length of the whole file.
    pub total_len: u64,

    /// Window being sent.  `None` only for a zero-length file.
    pub range: Option<ByteRange>,

    /// The requested span was cut down to the configured maximum.
    pub truncated: bool,

    pub body: DeliveryBody,
}

// ---

impl Delivery {
    // ---
    pub fn content_length(&self) -> u64 {
        self.range.map_or(0, |r| r.len())
    }

    /// `Content-Range` value for a 206.
    pub fn content_range(&self) -> Option<String> {
        // ---
        match self.status {
            DeliveryStatus::Partial => self.range.map(|r| r.content_range(self.total_len)),
            DeliveryStatus::Full => None,
        }
    }
}

// ---------------------------------------------------------------------------
// DebugSnapshot
// ---------------------------------------------------------------------------

/// Operator view of the delivery core.  Never read back by scheduling.
#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    // ---
    pub enabled: bool,
    pub chunk_bytes: u64,
    pub max_request_bytes: u64,
    pub head_cache_bytes: Option<u64>,
    pub rate_cap_bits_per_sec: Option<u64>,
    pub ahead_gate_seconds: Option<u64>,
    pub content_bitrate_bits_per_sec: Option<u64>,
    pub revision: u64,
    pub head_cache_len: u64,
    pub counters: CounterSnapshot,
    pub percentile_samples: PercentileSnapshot,
    pub per_client: Vec<ClientSnapshot>,
}

// ---------------------------------------------------------------------------
// DeliveryService
// ---------------------------------------------------------------------------

pub struct DeliveryService {
    // ---
    params: DeliveryParams,
    scheduler: DeliveryScheduler,
    direct: DirectDelivery,
    cache: Arc<HeadCache>,
    reader: Arc<dyn ChunkReader>,
    stats: Arc<DeliveryStats>,
    diag: Arc<dyn Diagnostics>,

    /// Newest file revision adopted.  Shared with direct transfers.
    revision: Arc<AtomicU64>,

    /// Serialises revision changes so no request for the new revision runs
    /// ahead of the reset.
    adopting: tokio::sync::Mutex<()>,

    /// Admission diagnostics, one per client and kind per interval.
    throttle: Mutex<Throttle<ClientKey>>,
}

// ---

impl DeliveryService {
    // ---
    /// Build the service and spawn its scheduling task.  Must be called
    /// from within a tokio runtime.
    pub fn start(
        params: DeliveryParams,
        reader: Arc<dyn ChunkReader>,
        clock: Arc<dyn PlaybackClock>,
        diag: Arc<dyn Diagnostics>,
    ) -> Self {
        // ---
        let cache = Arc::new(HeadCache::new(params.head_cache_bytes));
        let stats = Arc::new(DeliveryStats::default());
        let revision = Arc::new(AtomicU64::new(0));

        let core = SchedulerCore::new(SchedulerContext {
            params: params.clone(),
            reader: Arc::clone(&reader),
            cache: Arc::clone(&cache),
            clock,
            stats: Arc::clone(&stats),
            diag: Arc::clone(&diag),
        });
        let (scheduler, _task) = DeliveryScheduler::spawn(core);

        let direct = DirectDelivery {
            reader: Arc::clone(&reader),
            stats: Arc::clone(&stats),
            diag: Arc::clone(&diag),
            chunk_bytes: params.chunk_bytes,
            revision: Arc::clone(&revision),
        };

        tracing::info!(
            enabled = params.enabled,
            chunk_bytes = params.chunk_bytes,
            max_request_bytes = params.max_request_bytes,
            head_cache_bytes = ?params.head_cache_bytes,
            rate_cap_bits_per_sec = ?params.rate_cap_bits_per_sec,
            ahead_gate_secs = ?params.ahead_gate_secs,
            "delivery service started"
        );

        Self {
            params,
            scheduler,
            direct,
            cache,
            reader,
            stats,
            diag,
            revision,
            adopting: tokio::sync::Mutex::new(()),
            throttle: Mutex::new(Throttle::default()),
        }
    }

    // ---

    pub fn params(&self) -> &DeliveryParams {
        &self.params
    }

    pub fn stats(&self) -> &Arc<DeliveryStats> {
        &self.stats
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    // ---

    /// Answer one request for `file`.
    ///
    /// `range_header` is the raw `Range` value, if any.  `head_only`
    /// produces headers without a body and queues nothing.
    pub async fn serve(
        &self,
        client: ClientKey,
        range_header: Option<&str>,
        file: Option<MediaFile>,
        head_only: bool,
    ) -> Result<Delivery> {
        // ---
        let file = file.ok_or_else(|| ReelSyncError::NotFound("no active file".into()))?;
        self.reset(file.revision).await?;
        self.reader.probe(&file).await?;

        let (status, admission) = match range_header {
            Some(header) => match admit(header, file.len, self.params.max_request_bytes) {
                Ok(admission) => (DeliveryStatus::Partial, Some(admission)),
                Err(e) => {
                    self.note_rejection(&client, header, &file);
                    return Err(e);
                }
            },
            None => (DeliveryStatus::Full, ByteRange::full(file.len).map(whole)),
        };

        let Some(admission) = admission else {
            // Zero-length file, no range asked for.
            return Ok(Delivery {
                status,
                total_len: 0,
                range: None,
                truncated: false,
                body: DeliveryBody::Empty,
            });
        };

        let mut delivery = Delivery {
            status,
            total_len: file.len,
            range: Some(admission.range),
            truncated: admission.truncated,
            body: DeliveryBody::Empty,
        };
        if head_only {
            return Ok(delivery);
        }

        self.note_admission(&client, &admission, &file);
        self.stats.incr(Counter::Enqueued);
        if admission.truncated {
            self.stats.incr(Counter::Truncated);
        }

        if !self.params.enabled {
            let (sink, body) = body_channel(BODY_CHANNEL_CAPACITY, self.scheduler.wake_handle());
            tokio::spawn(self.direct.clone().deliver(client, file, admission.range, sink));
            delivery.body = DeliveryBody::Stream(body);
            return Ok(delivery);
        }

        let range = admission.range;
        if self.cache.is_enabled() && self.cache.ensure(&file, self.reader.as_ref(), self.diag.as_ref()).await {
            if let Some(bytes) = self.cache.try_serve(file.revision, range.start, range.end) {
                self.stats.incr(Counter::CacheHits);
                self.stats.incr(Counter::Completed);
                self.stats.add(Counter::BytesSent, range.len());
                delivery.body = DeliveryBody::Bytes(bytes);
                return Ok(delivery);
            }
        }

        let (sink, body) = body_channel(BODY_CHANNEL_CAPACITY, self.scheduler.wake_handle());
        let job = DeliveryJob::new(client, file, range, admission.truncated, Box::new(sink));
        self.scheduler.enqueue(job).await?;
        delivery.body = DeliveryBody::Stream(body);
        Ok(delivery)
    }

    // ---

    /// Adopt `revision` if it is newer than anything seen so far: the
    /// scheduler aborts old jobs, clears its queues, retires the head cache
    /// and zeroes the stats before it looks at anything else.
    pub async fn reset(&self, revision: u64) -> Result<()> {
        // ---
        if revision <= self.revision() {
            return Ok(());
        }

        let _adopting = self.adopting.lock().await;
        let previous = self.revision();
        if revision <= previous {
            return Ok(());
        }

        let aborted = self.scheduler.reset(revision).await?;
        self.revision.store(revision, Ordering::Release);
        self.throttle.lock().clear();
        tracing::info!(from = previous, to = revision, aborted, "file revision changed");
        Ok(())
    }

    // ---

    /// Build the head cache for `file` ahead of the first request.
    pub async fn warm(&self, file: &MediaFile) -> Result<()> {
        // ---
        self.reset(file.revision).await?;
        if self.params.enabled && self.cache.is_enabled() {
            self.cache.ensure(file, self.reader.as_ref(), self.diag.as_ref()).await;
        }
        Ok(())
    }

    // ---

    /// Apply a smaller head cache size detected at runtime.
    pub fn shrink_head_cache(&self, limit: u64) {
        // ---
        let previous = self.cache.limit();
        if limit >= previous {
            return;
        }
        self.cache.set_limit(limit);
        self.diag.emit(
            Diagnostic::info(Category::Cache, "head_cache_shrunk")
                .field("from", previous)
                .field("to", limit),
        );
    }

    /// Act on a drift check.  Only a head cache shrink takes effect; every
    /// other drifted value waits for a restart.
    pub fn apply_drift(&self, report: &DriftReport) {
        if let Some(limit) = report.head_cache_shrink {
            self.shrink_head_cache(limit);
        }
    }

    // ---

    pub async fn debug_snapshot(&self) -> Result<DebugSnapshot> {
        // ---
        let per_client = self.scheduler.snapshot().await?;
        let stats = self.stats.snapshot();
        let revision = self.revision();
        let limit = self.cache.limit();

        Ok(DebugSnapshot {
            enabled: self.params.enabled,
            chunk_bytes: self.params.chunk_bytes,
            max_request_bytes: self.params.max_request_bytes,
            head_cache_bytes: (limit > 0).then_some(limit),
            rate_cap_bits_per_sec: self.params.rate_cap_bits_per_sec,
            ahead_gate_seconds: self.params.ahead_gate_secs,
            content_bitrate_bits_per_sec: self.params.content_bitrate_bits_per_sec,
            revision,
            head_cache_len: self.cache.cached_len(revision),
            counters: stats.counters,
            percentile_samples: stats.percentiles,
            per_client,
        })
    }

    // ---

    fn allow(&self, client: &ClientKey, kind: &'static str) -> bool {
        // Anonymous keys are single use; tracking them would only grow the map.
        client.is_anonymous() || self.throttle.lock().allow(client.clone(), kind, Instant::now())
    }

    fn note_admission(&self, client: &ClientKey, admission: &Admission, file: &MediaFile) {
        // ---
        if self.allow(client, "enqueue") {
            self.diag.emit(
                Diagnostic::debug(Category::Admission, "enqueued")
                    .field("client", client.to_string())
                    .field("start", admission.range.start)
                    .field("end", admission.range.end)
                    .field("revision", file.revision),
            );
        }
        if admission.truncated && self.allow(client, "truncate") {
            self.diag.emit(
                Diagnostic::info(Category::Admission, "truncated")
                    .field("client", client.to_string())
                    .field("requested_end", admission.requested.end)
                    .field("served_end", admission.range.end)
                    .field("max_request_bytes", self.params.max_request_bytes),
            );
        }
    }

    fn note_rejection(&self, client: &ClientKey, header: &str, file: &MediaFile) {
        // ---
        if self.allow(client, "reject") {
            self.diag.emit(
                Diagnostic::debug(Category::Admission, "range_rejected")
                    .field("client", client.to_string())
                    .field("range", header)
                    .field("len", file.len),
            );
        }
    }
}

// ---

fn whole(range: ByteRange) -> Admission {
    Admission {
        range,
        requested: range,
        truncated: false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
