//! Channel-backed [`ChunkSink`] and the matching HTTP body stream.
//!
//! ```text
//!  scheduler task                 bounded mpsc                 hyper
//!  ChannelSink::send ─────────► [chunk][chunk][..] ─────────► BodyStream
//!        ▲                                                        │
//!        └──────────── wake.notify_one() on every recv / drop ────┘
//! ```
//!
//! A full channel is backpressure: [`ChannelSink::state`] reports
//! [`SinkState::Busy`] and the scheduler parks on the shared wake handle.
//! The body stream pokes that handle each time it hands a chunk to the
//! connection, and once more when it is dropped (client went away), so the
//! scheduler never polls a blocked sink.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

// ---

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, Notify};

// ---

use reelsync_domain::{ChunkSink, ReelSyncError, Result, SinkState};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Chunks buffered between the scheduler and one connection.  Kept small:
/// bytes parked here are bytes another client could have had.
pub const BODY_CHANNEL_CAPACITY: usize = 2;

// ---------------------------------------------------------------------------
// body_channel
// ---------------------------------------------------------------------------

/// Create a connected sink / body pair.  `wake` is the scheduler's wake
/// handle.
pub fn body_channel(capacity: usize, wake: Arc<Notify>) -> (ChannelSink, BodyStream) {
    // ---
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx: Some(tx) }, BodyStream { rx, wake })
}

// ---------------------------------------------------------------------------
// ChannelSink
// ---------------------------------------------------------------------------

pub struct ChannelSink {
    // ---
    /// `None` once finished or aborted.
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
}

// ---

impl ChannelSink {
    // ---
    /// Send, waiting for capacity.  Used by the direct path, which has no
    /// fairness loop to return to.
    pub async fn send_wait(&mut self, chunk: Bytes) -> Result<()> {
        // ---
        let tx = self.tx.as_ref().ok_or(ReelSyncError::SinkClosed)?;
        tx.send(Ok(chunk)).await.map_err(|_| ReelSyncError::SinkClosed)
    }
}

// ---

impl ChunkSink for ChannelSink {
    // ---
    fn state(&self) -> SinkState {
        // ---
        match &self.tx {
            None => SinkState::Closed,
            Some(tx) if tx.is_closed() => SinkState::Closed,
            Some(tx) if tx.capacity() == 0 => SinkState::Busy,
            Some(_) => SinkState::Ready,
        }
    }

    fn send(&mut self, chunk: Bytes) -> Result<()> {
        // ---
        let tx = self.tx.as_ref().ok_or(ReelSyncError::SinkClosed)?;
        tx.try_send(Ok(chunk)).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => ReelSyncError::SinkClosed,
            mpsc::error::TrySendError::Full(_) => {
                ReelSyncError::Io(io::Error::new(io::ErrorKind::WouldBlock, "sink full"))
            }
        })
    }

    fn finish(&mut self) {
        // Dropping the sender ends the body after the buffered chunks.
        self.tx = None;
    }

    fn abort(&mut self, reason: &str) {
        // ---
        if let Some(tx) = self.tx.take() {
            // If the buffer is full the error cannot be queued; the body
            // then ends short of its Content-Length, which hyper treats as
            // an aborted response all the same.
            let _ = tx.try_send(Err(io::Error::other(reason.to_string())));
        }
    }
}

// ---------------------------------------------------------------------------
// BodyStream
// ---------------------------------------------------------------------------

/// Receiving half, handed to the HTTP layer as a streaming body.
pub struct BodyStream {
    // ---
    rx: mpsc::Receiver<io::Result<Bytes>>,
    wake: Arc<Notify>,
}

// ---

impl BodyStream {
    // ---
    /// Take a buffered chunk without waiting.  Signals the scheduler exactly
    /// like a poll by the connection would.
    pub fn try_recv(&mut self) -> Option<io::Result<Bytes>> {
        // ---
        let item = self.rx.try_recv().ok()?;
        self.wake.notify_one();
        Some(item)
    }
}

// ---

impl Stream for BodyStream {
    // ---
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // ---
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(_)) = &polled {
            self.wake.notify_one();
        }
        polled
    }
}

// ---

impl Drop for BodyStream {
    fn drop(&mut self) {
        self.rx.close();
        self.wake.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;

    use bytes::Bytes;
    use futures::StreamExt;
    use tokio::sync::Notify;

    use reelsync_domain::{ChunkSink, SinkState};

    use super::body_channel;

    #[tokio::test]
    async fn full_channel_reports_busy_until_drained() {
        // ---
        let wake = Arc::new(Notify::new());
        let (mut sink, mut body) = body_channel(1, Arc::clone(&wake));

        assert_eq!(sink.state(), SinkState::Ready);
        sink.send(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(sink.state(), SinkState::Busy);

        let chunk = body.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"abc");
        assert_eq!(sink.state(), SinkState::Ready);

        // The drain left a wake permit behind for the scheduler.
        tokio::time::timeout(std::time::Duration::from_millis(100), wake.notified())
            .await
            .expect("drain must wake the scheduler");
    }

    // ---

    #[tokio::test]
    async fn dropped_body_closes_sink_and_wakes() {
        // ---
        let wake = Arc::new(Notify::new());
        let (mut sink, body) = body_channel(2, Arc::clone(&wake));

        drop(body);
        assert_eq!(sink.state(), SinkState::Closed);
        assert!(sink.send(Bytes::from_static(b"x")).is_err());

        tokio::time::timeout(std::time::Duration::from_millis(100), wake.notified())
            .await
            .expect("drop must wake the scheduler");
    }

    // ---

    #[tokio::test]
    async fn finish_ends_stream_and_abort_surfaces_error() {
        // ---
        let wake = Arc::new(Notify::new());

        let (mut sink, mut body) = body_channel(4, Arc::clone(&wake));
        sink.send(Bytes::from_static(b"tail")).unwrap();
        sink.finish();
        assert_eq!(sink.state(), SinkState::Closed);
        assert_eq!(&body.next().await.unwrap().unwrap()[..], b"tail");
        assert!(body.next().await.is_none());

        let (mut sink, mut body) = body_channel(4, wake);
        sink.abort("read failed");
        assert!(body.next().await.unwrap().is_err());
        assert!(body.next().await.is_none());
    }
}
