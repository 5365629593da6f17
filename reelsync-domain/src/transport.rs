use async_trait::async_trait;
use bytes::Bytes;

// ---

use super::error::Result;
use super::media::MediaFile;

// ---------------------------------------------------------------------------
// SinkState
// ---------------------------------------------------------------------------

/// Whether an output sink can take another chunk right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    // ---
    /// At least one more chunk will be accepted without waiting.
    Ready,

    /// Backpressure.  The sink signals the scheduler's wake handle once it
    /// drains; the job is not driven until then.
    Busy,

    /// The peer went away.  The job is dropped, nothing more is charged.
    Closed,
}

// ---------------------------------------------------------------------------
// ChunkSink
// ---------------------------------------------------------------------------

/// Output side of one delivery job: the live HTTP response body.
///
/// Exactly one writer ever drives a sink, so a `Ready` answer from
/// [`ChunkSink::state`] guarantees the following [`ChunkSink::send`]
/// succeeds unless the peer closed in between.
pub trait ChunkSink: Send {
    // ---
    fn state(&self) -> SinkState;

    /// Hand over the next chunk, in offset order.
    fn send(&mut self, chunk: Bytes) -> Result<()>;

    /// End the response normally after the last byte.
    fn finish(&mut self);

    /// Terminate the response abruptly.  The peer sees a truncated body and
    /// is expected to re-request.  A no-op on an already-closed sink.
    fn abort(&mut self, reason: &str);
}

// ---

/// Convenience alias for a heap-allocated [`ChunkSink`].
pub type ChunkSinkPtr = Box<dyn ChunkSink>;

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Bounded positional read of the media file.
///
/// Returns at most `len` bytes starting at `offset`.  Fewer bytes than asked
/// means end of file was hit; interpreting that is the caller's business.
#[async_trait]
pub trait ChunkReader: Send + Sync {
    // ---
    async fn read_at(&self, file: &MediaFile, offset: u64, len: usize) -> Result<Bytes>;

    /// Confirm `file` can be read at all, before a response is committed.
    /// A vanished file must surface as [`crate::ReelSyncError::NotFound`].
    async fn probe(&self, _file: &MediaFile) -> Result<()> {
        Ok(())
    }
}
