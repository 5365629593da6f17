//! In-memory copy of the first bytes of the active file.
//!
//! Late joiners nearly always start with `bytes=0-`, and players re-read the
//! container header on every seek.  Serving those windows from memory keeps
//! them off the disk and off the scheduler.
//!
//! The buffer is built lazily by [`HeadCache::ensure`], at most once per
//! revision, and is immutable afterwards: readers get cheap [`Bytes`]
//! slices of it without further locking.  A build failure disables the
//! cache for that revision instead of retrying on every request.

use std::sync::atomic::{AtomicU64, Ordering};

// ---

use bytes::Bytes;
use parking_lot::RwLock;

// ---

use reelsync_domain::{Category, ChunkReader, Diagnostic, Diagnostics, MediaFile};

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Slot {
    // ---
    Empty,
    Built { revision: u64, bytes: Bytes },
    /// Building failed for this revision; do not try again.
    Failed { revision: u64 },
}

// ---------------------------------------------------------------------------
// HeadCache
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct HeadCache {
    // ---
    /// Configured size in bytes.  Zero disables the cache.
    limit: AtomicU64,

    slot: RwLock<Slot>,

    /// Bumped by every invalidation so a build that raced with one is
    /// discarded instead of published.
    generation: AtomicU64,

    /// Oldest revision still worth caching.  Raised on revision change.
    floor: AtomicU64,

    /// Serialises builds so concurrent first requests read the head once.
    build: tokio::sync::Mutex<()>,
}

// ---

impl HeadCache {
    // ---
    pub fn new(limit: Option<u64>) -> Self {
        // ---
        Self {
            limit: AtomicU64::new(limit.unwrap_or(0)),
            slot: RwLock::new(Slot::Empty),
            generation: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            build: tokio::sync::Mutex::new(()),
        }
    }

    // ---

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.limit() > 0
    }

    /// Bytes currently held for `revision`, zero when not built.
    pub fn cached_len(&self, revision: u64) -> u64 {
        // ---
        match &*self.slot.read() {
            Slot::Built { revision: r, bytes } if *r == revision => bytes.len() as u64,
            _ => 0,
        }
    }

    // ---

    /// Build the buffer for `file` unless already built (or already failed)
    /// for its revision.  Returns `true` when a buffer for the revision is
    /// available afterwards.
    pub async fn ensure(
        &self,
        file: &MediaFile,
        reader: &dyn ChunkReader,
        diag: &dyn Diagnostics,
    ) -> bool {
        // ---
        if let Some(built) = self.settled(file.revision) {
            return built;
        }
        if file.revision < self.floor.load(Ordering::Acquire) {
            return false;
        }
        let want = self.limit().min(file.len);
        if want == 0 {
            return false;
        }

        let _guard = self.build.lock().await;
        if let Some(built) = self.settled(file.revision) {
            return built;
        }

        let generation = self.generation.load(Ordering::Acquire);
        let started = std::time::Instant::now();
        let next = match reader.read_at(file, 0, want as usize).await {
            Ok(bytes) => {
                diag.emit(
                    Diagnostic::info(Category::Cache, "head_cache_built")
                        .field("revision", file.revision)
                        .field("bytes", bytes.len() as u64)
                        .field("elapsed_ms", started.elapsed().as_millis() as u64),
                );
                Slot::Built {
                    revision: file.revision,
                    bytes,
                }
            }
            Err(e) => {
                diag.emit(
                    Diagnostic::warn(Category::Cache, "head_cache_build_failed")
                        .field("revision", file.revision)
                        .field("error", e.to_string()),
                );
                Slot::Failed {
                    revision: file.revision,
                }
            }
        };

        if self.generation.load(Ordering::Acquire) != generation
            || file.revision < self.floor.load(Ordering::Acquire)
        {
            tracing::debug!(revision = file.revision, "head cache build discarded after invalidation");
            return false;
        }
        let built = matches!(next, Slot::Built { .. });
        *self.slot.write() = next;
        built
    }

    // ---

    /// The exact inclusive window `[start, end]` when the buffer for
    /// `revision` covers it entirely.
    pub fn try_serve(&self, revision: u64, start: u64, end: u64) -> Option<Bytes> {
        // ---
        if start > end {
            return None;
        }
        match &*self.slot.read() {
            Slot::Built { revision: r, bytes } if *r == revision && end < bytes.len() as u64 => {
                Some(bytes.slice(start as usize..=end as usize))
            }
            _ => None,
        }
    }

    // ---

    /// Drop the buffer.  The next `ensure` rebuilds it.
    pub fn invalidate(&self) {
        // ---
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.slot.write() = Slot::Empty;
    }

    // ---

    /// Drop anything cached for revisions older than `revision` and refuse
    /// to build them from now on.  A build already running for `revision`
    /// itself is kept.
    pub fn retire_before(&self, revision: u64) {
        // ---
        self.floor.fetch_max(revision, Ordering::AcqRel);
        let mut slot = self.slot.write();
        let stale = match &*slot {
            Slot::Built { revision: r, .. } | Slot::Failed { revision: r } => *r < revision,
            Slot::Empty => false,
        };
        if stale {
            *slot = Slot::Empty;
        }
    }

    // ---

    /// Apply a new configured size.  A shrink discards the buffer outright
    /// rather than trimming it.
    pub fn set_limit(&self, limit: u64) {
        // ---
        let previous = self.limit.swap(limit, Ordering::AcqRel);
        if limit < previous {
            self.invalidate();
        }
    }

    // ---

    /// `Some(true)` built, `Some(false)` failed, `None` not attempted for
    /// `revision` yet.
    fn settled(&self, revision: u64) -> Option<bool> {
        // ---
        match &*self.slot.read() {
            Slot::Built { revision: r, .. } if *r == revision => Some(true),
            Slot::Failed { revision: r } if *r == revision => Some(false),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
