//! Deficit Round Robin delivery across per-client queues.
//!
//! [`SchedulerCore`] owns every [`ClientQueue`] and runs one pass at a time.
//! Each pass visits the non-empty queues in first-seen order; a visit moves
//! at most one quantum of the head job from disk (or the head cache) into
//! that job's sink.  Bytes are charged against the deficit and the token
//! bucket only after the sink accepted them.
//!
//! [`DeliveryScheduler`] is the handle the façade holds.  The core itself
//! lives inside a dedicated task:
//!
//! ```text
//!  handlers ──SchedulerCmd──► cmd_rx ─┐
//!                                     ▼
//!                           ┌─► apply commands ─► run_pass ─┐
//!                           │                               │ progressed
//!                           │◄──────────────────────────────┘
//!                           │ otherwise await one of:
//!                           │   next command
//!                           │   wake   (a body drained or was dropped)
//!                           └── tick   (rate cap / ahead gate deferral)
//! ```
//!
//! Commands are applied only between passes, so a revision reset is never
//! observed half-done.

use std::sync::Arc;
use std::time::{Duration, Instant};

// ---

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

// ---

use reelsync_domain::{
    // ---
    ByteRange,
    Category,
    ChunkReader,
    Diagnostic,
    Diagnostics,
    PlaybackClock,
    ReelSyncError,
    Result,
    SinkState,
};

// ---

use super::client_queue::{ClientQueue, ClientQueues, ClientSnapshot, DeliveryJob};
use super::config::DeliveryParams;
use super::head_cache::HeadCache;
use super::stats::{Counter, DeliveryStats};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Bounded command channel between request handlers and the loop.
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// How long the loop sleeps when the only pending work is deferred by the
/// rate cap or the ahead gate.
pub const DEFER_TICK: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// SchedulerCmd
// ---------------------------------------------------------------------------

/// Work handed to the scheduling task.
pub enum SchedulerCmd {
    // ---
    Enqueue(DeliveryJob),

    /// A newer file revision is active.  Ignored unless `revision` is newer
    /// than the one the loop already serves.  `done` receives the number of
    /// jobs aborted once the reset is complete.
    Reset {
        revision: u64,
        done: oneshot::Sender<usize>,
    },

    Snapshot(oneshot::Sender<Vec<ClientSnapshot>>),
}

// ---------------------------------------------------------------------------
// PassOutcome
// ---------------------------------------------------------------------------

/// What one pass over all queues achieved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    // ---
    /// Some queue moved bytes or retired a job.
    pub progressed: bool,

    /// Some queue is waiting on sink backpressure.
    pub blocked: bool,

    /// Some queue was held back by the rate cap or the ahead gate.
    pub deferred: bool,

    /// Jobs remain queued after the pass.
    pub pending: bool,
}

// ---

enum Visit {
    Idle,
    Progressed,
    Blocked,
    Deferred,
    /// The file behind this revision is gone; abort every job against it.
    FileGone(u64),
}

// ---------------------------------------------------------------------------
// SchedulerContext
// ---------------------------------------------------------------------------

/// Read-only collaborators of a pass.
pub struct SchedulerContext {
    // ---
    pub params: DeliveryParams,
    pub reader: Arc<dyn ChunkReader>,
    pub cache: Arc<HeadCache>,
    pub clock: Arc<dyn PlaybackClock>,
    pub stats: Arc<DeliveryStats>,
    pub diag: Arc<dyn Diagnostics>,
}

// ---

impl SchedulerContext {
    // ---
    /// Highest byte offset a job may start at under the ahead gate, or
    /// `None` when the gate is off or no playback position is known.
    fn allowed_offset(&self, now: Instant) -> Option<u64> {
        // ---
        let (window_secs, bits_per_sec) = self.params.ahead_gate()?;
        let snapshot = self.clock.snapshot()?;
        let position = snapshot.position_at(now);
        Some(((position + window_secs as f64) * bits_per_sec as f64 / 8.0) as u64)
    }

    // ---

    async fn visit(&self, q: &mut ClientQueue, now: Instant) -> Visit {
        // ---
        let quantum = self.params.chunk_bytes;
        if q.deficit < quantum {
            q.deficit += quantum;
        }

        let Some(job) = q.jobs.front_mut() else {
            return Visit::Idle;
        };

        match job.sink.state() {
            SinkState::Closed => {
                self.drop_closed(q);
                return Visit::Progressed;
            }
            SinkState::Busy => return Visit::Blocked,
            SinkState::Ready => {}
        }

        if job.cursor > job.range.end + 1 {
            self.diag.emit(
                Diagnostic::warn(Category::Scheduler, "cursor_past_end")
                    .field("client", q.client.to_string())
                    .field("cursor", job.cursor)
                    .field("end", job.range.end),
            );
            job.cursor = job.range.end + 1;
        }

        if job.is_complete() {
            self.finalize(q);
            return Visit::Progressed;
        }

        // --- ahead gate
        if let Some(allowed) = self.allowed_offset(now) {
            if job.range.start > allowed {
                self.stats.incr(Counter::AheadGateDefers);
                if q.gate_log.allow(now) {
                    self.diag.emit(
                        Diagnostic::debug(Category::Scheduler, "ahead_gate_defer")
                            .field("client", q.client.to_string())
                            .field("start", job.range.start)
                            .field("allowed", allowed),
                    );
                }
                return Visit::Deferred;
            }
        }

        // --- rate cap
        let mut budget = u64::MAX;
        if let Some(bucket) = q.bucket.as_mut() {
            bucket.refill(now);
            if bucket.tokens_bits() <= 0.0 {
                self.stats.incr(Counter::RateLimitDefers);
                if q.rate_log.allow(now) {
                    self.diag.emit(
                        Diagnostic::debug(Category::Scheduler, "rate_limit_defer")
                            .field("client", q.client.to_string())
                            .field("cursor", job.cursor),
                    );
                }
                return Visit::Deferred;
            }
            budget = bucket.available_bytes();
        }

        let to_send = job.remaining().min(q.deficit).min(quantum).min(budget);
        if to_send == 0 {
            return Visit::Deferred;
        }

        // --- serve
        let start = job.cursor;
        let end = start + to_send - 1;
        let started = Instant::now();

        let chunk = match self.cache.try_serve(job.file.revision, start, end) {
            Some(bytes) => {
                self.stats.incr(Counter::CacheHits);
                bytes
            }
            None => {
                if self.cache.is_enabled() {
                    self.stats.incr(Counter::CacheMisses);
                }
                match self.reader.read_at(&job.file, start, to_send as usize).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let gone = e.is_not_found().then_some(job.file.revision);
                        self.abort_head(q, "read_failed", e.to_string());
                        return gone.map_or(Visit::Progressed, Visit::FileGone);
                    }
                }
            }
        };

        if (chunk.len() as u64) < to_send {
            let detail = format!("short read: {} of {to_send} bytes at {start}", chunk.len());
            self.abort_head(q, "short_read", detail);
            return Visit::Progressed;
        }

        match job.sink.send(chunk) {
            Ok(()) => {}
            Err(ReelSyncError::SinkClosed) => {
                self.drop_closed(q);
                return Visit::Progressed;
            }
            // Lost the race with a filling buffer.  Nothing was charged; the
            // window is re-read once the sink drains.
            Err(_) => return Visit::Blocked,
        }

        // --- charge on delivery
        job.cursor += to_send;
        if job.first_byte_at.is_none() {
            job.first_byte_at = Some(now);
            self.stats
                .record_queue_wait(now.saturating_duration_since(job.enqueued_at));
        }
        let complete = job.is_complete();

        q.deficit = q.deficit.saturating_sub(to_send);
        if let Some(bucket) = q.bucket.as_mut() {
            bucket.consume_bytes(to_send);
        }
        q.bytes_sent += to_send;
        q.last_served = Some(ByteRange { start, end });

        self.stats.incr(Counter::ChunkServes);
        self.stats.add(Counter::BytesSent, to_send);
        self.stats.record_chunk_service(started.elapsed());

        if complete {
            self.finalize(q);
        }
        Visit::Progressed
    }

    // ---

    /// Pop the head job after its last byte and end the response.
    fn finalize(&self, q: &mut ClientQueue) {
        // ---
        let Some(mut job) = q.jobs.pop_front() else {
            return;
        };
        job.sink.finish();
        self.stats.incr(Counter::Completed);
        self.diag.emit(
            Diagnostic::debug(Category::Scheduler, "job_completed")
                .field("client", q.client.to_string())
                .field("start", job.range.start)
                .field("end", job.range.end)
                .field("elapsed_ms", job.enqueued_at.elapsed().as_millis() as u64),
        );
    }

    /// Pop a head job whose peer went away.  The sink is already closed, so
    /// it is neither finished nor aborted.
    fn drop_closed(&self, q: &mut ClientQueue) {
        // ---
        let Some(job) = q.jobs.pop_front() else {
            return;
        };
        self.stats.incr(Counter::Aborted);
        self.diag.emit(
            Diagnostic::debug(Category::Scheduler, "job_aborted")
                .field("client", q.client.to_string())
                .field("reason", "sink_closed")
                .field("sent", job.cursor - job.range.start),
        );
    }

    /// Pop the head job and terminate its response with an error.
    fn abort_head(&self, q: &mut ClientQueue, reason: &'static str, detail: String) {
        // ---
        let Some(mut job) = q.jobs.pop_front() else {
            return;
        };
        job.sink.abort(reason);
        self.stats.incr(Counter::Aborted);
        self.diag.emit(
            Diagnostic::warn(Category::Read, "job_aborted")
                .field("client", q.client.to_string())
                .field("reason", reason)
                .field("detail", detail)
                .field("cursor", job.cursor),
        );
    }
}

// ---------------------------------------------------------------------------
// SchedulerCore
// ---------------------------------------------------------------------------

/// All mutable scheduling state.  Only ever touched by one pass at a time.
pub struct SchedulerCore {
    // ---
    ctx: SchedulerContext,
    queues: ClientQueues,

    /// Revision of the file currently being served.
    revision: u64,
}

// ---

impl SchedulerCore {
    // ---
    pub fn new(ctx: SchedulerContext) -> Self {
        // ---
        Self {
            ctx,
            queues: ClientQueues::default(),
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn has_pending(&self) -> bool {
        self.queues.has_pending()
    }

    pub fn snapshots(&self) -> Vec<ClientSnapshot> {
        self.queues.snapshots()
    }

    // ---

    pub fn apply(&mut self, cmd: SchedulerCmd) {
        // ---
        match cmd {
            SchedulerCmd::Enqueue(job) => self.enqueue(job),
            SchedulerCmd::Reset { revision, done } => {
                let _ = done.send(self.reset(revision));
            }
            SchedulerCmd::Snapshot(reply) => {
                let _ = reply.send(self.snapshots());
            }
        }
    }

    // ---

    /// Append `job` to its client's queue.  A job for an older revision is
    /// aborted on the spot; one for a newer revision resets first.
    pub fn enqueue(&mut self, mut job: DeliveryJob) {
        // ---
        if job.file.revision < self.revision {
            job.sink.abort("file revision changed");
            self.ctx.stats.incr(Counter::Aborted);
            tracing::debug!(client = %job.client, revision = job.file.revision, "stale job dropped");
            return;
        }
        if job.file.revision > self.revision {
            self.reset(job.file.revision);
        }

        let rate_cap = self.ctx.params.rate_cap_bits_per_sec;
        let queue = self.queues.ensure(&job.client, rate_cap, job.enqueued_at);
        queue.jobs.push_back(job);
    }

    // ---

    /// Switch to `revision`: abort every queued job, drop all queues (and
    /// with them deficits and tokens), retire the head cache and zero the
    /// stats.  Returns how many jobs were aborted.
    pub fn reset(&mut self, revision: u64) -> usize {
        // ---
        if revision <= self.revision {
            return 0;
        }

        let mut aborted = 0;
        for queue in self.queues.iter_mut() {
            for mut job in queue.jobs.drain(..) {
                job.sink.abort("file revision changed");
                aborted += 1;
            }
        }
        self.queues.clear();
        self.ctx.cache.retire_before(revision);
        self.ctx.stats.reset();

        self.ctx.diag.emit(
            Diagnostic::info(Category::Reset, "revision_reset")
                .field("from", self.revision)
                .field("to", revision)
                .field("aborted", aborted as u64),
        );
        self.revision = revision;
        aborted
    }

    // ---

    /// Abort everything still queued.  Used when the façade goes away.
    pub fn shutdown(&mut self) {
        // ---
        for queue in self.queues.iter_mut() {
            for mut job in queue.jobs.drain(..) {
                job.sink.abort("delivery shutting down");
            }
        }
        self.queues.clear();
    }

    // ---

    pub async fn run_pass(&mut self) -> PassOutcome {
        self.run_pass_at(Instant::now()).await
    }

    /// One DRR sweep over all queues, with `now` as the clock for token
    /// refill, the ahead gate and log throttling.
    pub async fn run_pass_at(&mut self, now: Instant) -> PassOutcome {
        // ---
        let mut outcome = PassOutcome::default();

        for key in self.queues.order() {
            // ---
            let Some(queue) = self.queues.get_mut(&key) else {
                continue;
            };
            if queue.is_idle() {
                continue;
            }

            let mut gone = None;
            match self.ctx.visit(queue, now).await {
                Visit::Idle => {}
                Visit::Progressed => outcome.progressed = true,
                Visit::Blocked => outcome.blocked = true,
                Visit::Deferred => outcome.deferred = true,
                Visit::FileGone(revision) => {
                    outcome.progressed = true;
                    gone = Some(revision);
                }
            }

            let idle = queue.is_idle();
            if idle {
                // Credit is not banked across idle periods.
                queue.deficit = 0;
            }
            if idle && key.is_anonymous() {
                self.queues.remove(&key);
            }

            // Later queues in this pass must not hit the missing file again.
            if let Some(revision) = gone {
                self.abort_revision(revision);
            }
        }

        outcome.pending = self.queues.has_pending();
        outcome
    }

    // ---

    /// Abort every queued job reading `revision`.  The file is gone.
    fn abort_revision(&mut self, revision: u64) {
        // ---
        let mut aborted = 0u64;
        let mut drained = Vec::new();
        for queue in self.queues.iter_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = queue
                .jobs
                .drain(..)
                .partition(|job| job.file.revision == revision);
            queue.jobs = kept.into();
            for mut job in gone {
                job.sink.abort("file not found");
                aborted += 1;
            }
            if queue.is_idle() {
                queue.deficit = 0;
                if queue.client.is_anonymous() {
                    drained.push(queue.client.clone());
                }
            }
        }
        for key in &drained {
            self.queues.remove(key);
        }
        self.ctx.stats.add(Counter::Aborted, aborted);
        self.ctx.diag.emit(
            Diagnostic::warn(Category::Read, "file_vanished")
                .field("revision", revision)
                .field("aborted", aborted),
        );
    }
}

// ---------------------------------------------------------------------------
// DeliveryScheduler
// ---------------------------------------------------------------------------

/// Handle to the scheduling task.  Cheap to clone.
#[derive(Clone)]
pub struct DeliveryScheduler {
    // ---
    cmd_tx: mpsc::Sender<SchedulerCmd>,

    /// Poked by body streams when they drain or drop.
    wake: Arc<Notify>,
}

// ---

impl DeliveryScheduler {
    // ---
    /// Move `core` into its own task.  Must be called from within a tokio
    /// runtime.  The task ends once every handle is dropped.
    pub fn spawn(core: SchedulerCore) -> (Self, JoinHandle<()>) {
        // ---
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(run(core, cmd_rx, Arc::clone(&wake)));
        (Self { cmd_tx, wake }, task)
    }

    /// Handed to every body stream.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    // ---

    pub async fn enqueue(&self, job: DeliveryJob) -> Result<()> {
        self.send(SchedulerCmd::Enqueue(job)).await
    }

    /// Resolves once the loop has applied the reset.
    pub async fn reset(&self, revision: u64) -> Result<usize> {
        // ---
        let (done, rx) = oneshot::channel();
        self.send(SchedulerCmd::Reset { revision, done }).await?;
        rx.await.map_err(|_| ReelSyncError::SchedulerGone)
    }

    pub async fn snapshot(&self) -> Result<Vec<ClientSnapshot>> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCmd::Snapshot(tx)).await?;
        rx.await.map_err(|_| ReelSyncError::SchedulerGone)
    }

    async fn send(&self, cmd: SchedulerCmd) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| ReelSyncError::SchedulerGone)
    }
}

// ---

async fn run(mut core: SchedulerCore, mut cmd_rx: mpsc::Receiver<SchedulerCmd>, wake: Arc<Notify>) {
    // ---
    tracing::info!("delivery scheduler started");

    loop {
        // Drain what arrived during the last pass before starting the next.
        loop {
            match cmd_rx.try_recv() {
                Ok(cmd) => core.apply(cmd),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    core.shutdown();
                    tracing::info!("delivery scheduler exiting");
                    return;
                }
            }
        }

        let outcome = core.run_pass().await;
        if outcome.progressed {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => core.apply(cmd),
                None => {
                    core.shutdown();
                    break;
                }
            },
            _ = wake.notified(), if outcome.pending => {}
            _ = tokio::time::sleep(DEFER_TICK), if outcome.deferred => {}
        }
    }

    tracing::info!("delivery scheduler exiting");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
