//! Per-client scheduling state: the job FIFO, DRR deficit and token bucket.
//!
//! Owned exclusively by the scheduling task.  Nothing here is shared.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

// ---

use serde::Serialize;

// ---

use reelsync_domain::{ByteRange, ChunkSinkPtr, ClientKey, MediaFile, TokenBucket};

// ---

use super::diagnostics::LogGate;

// ---------------------------------------------------------------------------
// DeliveryJob
// ---------------------------------------------------------------------------

/// One admitted range on its way to one response body.
pub struct DeliveryJob {
    // ---
    pub client: ClientKey,
    pub file: MediaFile,

    /// Admitted (possibly truncated) inclusive window.
    pub range: ByteRange,
    pub truncated: bool,

    /// Next offset to send.  `range.end + 1` once complete.
    pub cursor: u64,

    pub sink: ChunkSinkPtr,
    pub enqueued_at: Instant,
    pub first_byte_at: Option<Instant>,
}

// ---

impl DeliveryJob {
    // ---
    pub fn new(
        client: ClientKey,
        file: MediaFile,
        range: ByteRange,
        truncated: bool,
        sink: ChunkSinkPtr,
    ) -> Self {
        // ---
        Self {
            client,
            file,
            cursor: range.start,
            range,
            truncated,
            sink,
            enqueued_at: Instant::now(),
            first_byte_at: None,
        }
    }

    /// Bytes still to send.  Saturates if the cursor ever overran the end.
    pub fn remaining(&self) -> u64 {
        (self.range.end + 1).saturating_sub(self.cursor)
    }

    pub fn is_complete(&self) -> bool {
        self.cursor > self.range.end
    }
}

// ---

impl std::fmt::Debug for DeliveryJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("DeliveryJob")
            .field("client", &self.client)
            .field("revision", &self.file.revision)
            .field("range", &self.range)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ClientQueue
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ClientQueue {
    // ---
    pub client: ClientKey,

    /// Served strictly in order.
    pub jobs: VecDeque<DeliveryJob>,

    /// DRR credit in bytes.  Reset to zero whenever the queue drains.
    pub deficit: u64,

    /// Present only when a rate cap is configured.
    pub bucket: Option<TokenBucket>,

    pub last_served: Option<ByteRange>,

    /// Bytes accepted by this client's sinks.
    pub bytes_sent: u64,

    // Throttles for the per-visit deferral diagnostics.
    pub gate_log: LogGate,
    pub rate_log: LogGate,
}

// ---

impl ClientQueue {
    // ---
    pub fn new(client: ClientKey, rate_cap_bits_per_sec: Option<u64>, now: Instant) -> Self {
        // ---
        Self {
            client,
            jobs: VecDeque::new(),
            deficit: 0,
            bucket: rate_cap_bits_per_sec.map(|rate| TokenBucket::new_at(rate, now)),
            last_served: None,
            bytes_sent: 0,
            gate_log: LogGate::default(),
            rate_log: LogGate::default(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        // ---
        ClientSnapshot {
            client_id: self.client.to_string(),
            pending_jobs: self.jobs.len(),
            deficit: self.deficit,
            tokens_remaining: self.bucket.as_ref().map(|b| b.tokens_bits()),
            last_served_range: self.last_served,
            bytes_sent: self.bytes_sent,
        }
    }
}

// ---

/// Debug view of one [`ClientQueue`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSnapshot {
    // ---
    pub client_id: String,
    pub pending_jobs: usize,
    pub deficit: u64,

    /// Bits; `None` when no rate cap is configured.
    pub tokens_remaining: Option<f64>,

    pub last_served_range: Option<ByteRange>,
    pub bytes_sent: u64,
}

// ---------------------------------------------------------------------------
// ClientQueues
// ---------------------------------------------------------------------------

/// All client queues, visited in the order clients were first seen.
#[derive(Debug, Default)]
pub struct ClientQueues {
    // ---
    queues: HashMap<ClientKey, ClientQueue>,
    order: Vec<ClientKey>,
}

// ---

impl ClientQueues {
    // ---
    /// The existing queue for `client`, or a fresh one appended to the
    /// visit order.
    pub fn ensure(
        &mut self,
        client: &ClientKey,
        rate_cap_bits_per_sec: Option<u64>,
        now: Instant,
    ) -> &mut ClientQueue {
        // ---
        if !self.queues.contains_key(client) {
            self.order.push(client.clone());
        }
        self.queues
            .entry(client.clone())
            .or_insert_with(|| ClientQueue::new(client.clone(), rate_cap_bits_per_sec, now))
    }

    pub fn get_mut(&mut self, client: &ClientKey) -> Option<&mut ClientQueue> {
        self.queues.get_mut(client)
    }

    pub fn remove(&mut self, client: &ClientKey) -> Option<ClientQueue> {
        // ---
        let removed = self.queues.remove(client)?;
        self.order.retain(|k| k != client);
        Some(removed)
    }

    /// Visit order snapshot.  Cloned so the caller may mutate queues while
    /// walking it.
    pub fn order(&self) -> Vec<ClientKey> {
        self.order.clone()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientQueue> {
        self.queues.values_mut()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.queues.values().any(|q| !q.is_idle())
    }

    /// Drop every queue.  Jobs still queued are dropped with them; callers
    /// abort their sinks first.
    pub fn clear(&mut self) {
        self.queues.clear();
        self.order.clear();
    }

    pub fn snapshots(&self) -> Vec<ClientSnapshot> {
        // ---
        self.order
            .iter()
            .filter_map(|k| self.queues.get(k))
            .map(ClientQueue::snapshot)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
