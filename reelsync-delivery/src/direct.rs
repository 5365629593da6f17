//! Unscheduled delivery, used when fair scheduling is switched off.
//!
//! Each response gets its own task that reads the admitted window chunk by
//! chunk and waits on the body channel between chunks.  Admission and
//! truncation still happen in the façade; only the queueing is skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ---

use reelsync_domain::{
    // ---
    ByteRange,
    Category,
    ChunkReader,
    ChunkSink,
    ClientKey,
    Diagnostic,
    Diagnostics,
    MediaFile,
};

// ---

use super::sink::ChannelSink;
use super::stats::{Counter, DeliveryStats};

// ---------------------------------------------------------------------------
// DirectDelivery
// ---------------------------------------------------------------------------

/// Everything one direct transfer needs.  Cloned into each task.
#[derive(Clone)]
pub struct DirectDelivery {
    // ---
    pub reader: Arc<dyn ChunkReader>,
    pub stats: Arc<DeliveryStats>,
    pub diag: Arc<dyn Diagnostics>,
    pub chunk_bytes: u64,

    /// Revision currently selected.  A transfer for an older one stops.
    pub revision: Arc<AtomicU64>,
}

// ---

impl DirectDelivery {
    // ---
    /// Stream `range` of `file` into `sink`, then finish it.  Any failure
    /// aborts the response; nothing is retried.
    pub async fn deliver(self, client: ClientKey, file: MediaFile, range: ByteRange, mut sink: ChannelSink) {
        // ---
        let enqueued_at = Instant::now();
        let mut cursor = range.start;

        while cursor <= range.end {
            // ---
            if self.revision.load(Ordering::Acquire) > file.revision {
                sink.abort("file revision changed");
                self.stats.incr(Counter::Aborted);
                return;
            }

            let len = (range.end + 1 - cursor).min(self.chunk_bytes.max(1));
            let started = Instant::now();

            let chunk = match self.reader.read_at(&file, cursor, len as usize).await {
                Ok(bytes) if bytes.len() as u64 == len => bytes,
                Ok(bytes) => {
                    let detail = format!("short read: {} of {len} bytes at {cursor}", bytes.len());
                    self.fail(&client, &mut sink, "short_read", detail);
                    return;
                }
                Err(e) => {
                    self.fail(&client, &mut sink, "read_failed", e.to_string());
                    return;
                }
            };

            if sink.send_wait(chunk).await.is_err() {
                self.stats.incr(Counter::Aborted);
                tracing::debug!(%client, cursor, "direct delivery: peer went away");
                return;
            }

            if cursor == range.start {
                self.stats.record_queue_wait(enqueued_at.elapsed());
            }
            cursor += len;
            self.stats.incr(Counter::ChunkServes);
            self.stats.add(Counter::BytesSent, len);
            self.stats.record_chunk_service(started.elapsed());
        }

        sink.finish();
        self.stats.incr(Counter::Completed);
        tracing::debug!(%client, start = range.start, end = range.end, "direct delivery complete");
    }

    // ---

    fn fail(&self, client: &ClientKey, sink: &mut ChannelSink, reason: &'static str, detail: String) {
        // ---
        sink.abort(reason);
        self.stats.incr(Counter::Aborted);
        self.diag.emit(
            Diagnostic::warn(Category::Read, "job_aborted")
                .field("client", client.to_string())
                .field("reason", reason)
                .field("detail", detail)
                .field("path", "direct"),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use futures::StreamExt;
    use tokio::sync::Notify;

    use reelsync_domain::{ByteRange, ClientKey, MediaFile};

    use super::DirectDelivery;
    use crate::sink::body_channel;
    use crate::stats::{Counter, DeliveryStats};
    use crate::{MemoryReader, RecordingDiagnostics};

    fn media(len: u64, revision: u64) -> MediaFile {
        MediaFile {
            path: PathBuf::from("/media/film.mkv"),
            len,
            revision,
        }
    }

    fn direct(reader: Arc<MemoryReader>, stats: Arc<DeliveryStats>, diag: RecordingDiagnostics) -> DirectDelivery {
        DirectDelivery {
            reader,
            stats,
            diag: Arc::new(diag),
            chunk_bytes: 4_096,
            revision: Arc::new(AtomicU64::new(1)),
        }
    }

    // ---

    #[tokio::test]
    async fn streams_the_exact_window() {
        // ---
        let reader = Arc::new(MemoryReader::patterned(50_000));
        let stats = Arc::new(DeliveryStats::default());
        let d = direct(reader.clone(), Arc::clone(&stats), RecordingDiagnostics::default());

        let (sink, body) = body_channel(2, Arc::new(Notify::new()));
        let range = ByteRange { start: 1_000, end: 20_999 };
        tokio::spawn(d.deliver(ClientKey::from_id(Some("a")), media(50_000, 1), range, sink));

        let chunks: Vec<_> = body.collect().await;
        let data: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect();
        assert_eq!(&data[..], &reader.data()[1_000..21_000]);
        assert_eq!(stats.get(Counter::Completed), 1);
        assert_eq!(stats.get(Counter::ChunkServes), 5);
    }

    // ---

    #[tokio::test]
    async fn read_failure_aborts_the_response() {
        // ---
        let reader = Arc::new(MemoryReader::patterned(50_000).failing_from(10_000));
        let stats = Arc::new(DeliveryStats::default());
        let diag = RecordingDiagnostics::default();
        let d = direct(reader, Arc::clone(&stats), diag.clone());

        let (sink, body) = body_channel(8, Arc::new(Notify::new()));
        let range = ByteRange { start: 0, end: 19_999 };
        d.deliver(ClientKey::from_id(Some("a")), media(50_000, 1), range, sink)
            .await;

        let items: Vec<_> = body.collect().await;
        assert!(items.last().unwrap().is_err(), "body ends in an error");
        assert_eq!(stats.get(Counter::Aborted), 1);
        assert_eq!(stats.get(Counter::Completed), 0);
        assert_eq!(diag.named("job_aborted").len(), 1);
    }
}
