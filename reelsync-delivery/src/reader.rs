//! Bounded positional reads of the active media file.
//!
//! [`FileReader`] keeps one open handle per revision and performs each read
//! on the blocking pool, so the scheduling task awaits the bytes before it
//! charges anything.  [`MemoryReader`] is the in-process stand-in used by
//! tests; it counts reads so cache-hit paths can be shown to skip the disk.

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ---

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

// ---

use reelsync_domain::{ChunkReader, MediaFile, ReelSyncError, Result};

// ---------------------------------------------------------------------------
// FileReader
// ---------------------------------------------------------------------------

struct OpenFile {
    revision: u64,
    path: PathBuf,
    file: Arc<File>,
}

/// Reads from disk.  The handle for the current revision is opened lazily
/// and reused until a different revision is asked for.
#[derive(Default)]
pub struct FileReader {
    open: Mutex<Option<OpenFile>>,
}

// ---

impl FileReader {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    // ---

    async fn handle(&self, media: &MediaFile) -> Result<Arc<File>> {
        // ---
        let cached = self
            .open
            .lock()
            .as_ref()
            .filter(|open| open.revision == media.revision && open.path == media.path)
            .map(|open| Arc::clone(&open.file));

        if let Some(file) = cached {
            // An unlinked file stays readable through the old handle.
            match tokio::fs::metadata(&media.path).await {
                Ok(_) => return Ok(file),
                Err(e) => {
                    self.forget(media.revision);
                    return Err(open_error(media, e));
                }
            }
        }

        let path = media.path.clone();
        let file = tokio::task::spawn_blocking(move || File::open(path))
            .await
            .map_err(|e| io::Error::other(format!("open task failed: {e}")))?
            .map_err(|e| open_error(media, e))?;
        let file = Arc::new(file);

        tracing::debug!(revision = media.revision, path = %media.path.display(), "media file opened");

        *self.open.lock() = Some(OpenFile {
            revision: media.revision,
            path: media.path.clone(),
            file: Arc::clone(&file),
        });
        Ok(file)
    }

    fn forget(&self, revision: u64) {
        // ---
        let mut open = self.open.lock();
        if open.as_ref().is_some_and(|o| o.revision == revision) {
            *open = None;
            tracing::debug!(revision, "media file handle dropped");
        }
    }
}

fn open_error(media: &MediaFile, e: io::Error) -> ReelSyncError {
    match e.kind() {
        io::ErrorKind::NotFound => ReelSyncError::NotFound(media.path.display().to_string()),
        _ => ReelSyncError::Io(e),
    }
}

// ---

#[async_trait]
impl ChunkReader for FileReader {
    // ---
    async fn read_at(&self, media: &MediaFile, offset: u64, len: usize) -> Result<Bytes> {
        // ---
        let file = self.handle(media).await?;
        tokio::task::spawn_blocking(move || read_full_at(&file, offset, len))
            .await
            .map_err(|e| ReelSyncError::Read {
                offset,
                reason: format!("read task failed: {e}"),
            })?
            .map_err(|e| ReelSyncError::Read {
                offset,
                reason: e.to_string(),
            })
    }

    async fn probe(&self, media: &MediaFile) -> Result<()> {
        self.handle(media).await.map(|_| ())
    }
}

// ---

/// Read up to `len` bytes at `offset`, stopping early only at end of file.
fn read_full_at(file: &File, offset: u64, len: usize) -> io::Result<Bytes> {
    // ---
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match pread(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

// ---------------------------------------------------------------------------
// MemoryReader
// ---------------------------------------------------------------------------

/// In-memory media for tests.
///
/// The declared [`MediaFile::len`] may exceed `data.len()` to provoke short
/// reads, and `fail_from` turns every read at or past an offset into a read
/// error.
pub struct MemoryReader {
    // ---
    data: Bytes,
    fail_from: Option<u64>,
    reads: AtomicUsize,
}

// ---

impl MemoryReader {
    // ---
    pub fn new(data: impl Into<Bytes>) -> Self {
        // ---
        Self {
            data: data.into(),
            fail_from: None,
            reads: AtomicUsize::new(0),
        }
    }

    /// Deterministic content: byte `i` is `i mod 251`.
    pub fn patterned(len: usize) -> Self {
        Self::new((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    pub fn failing_from(mut self, offset: u64) -> Self {
        self.fail_from = Some(offset);
        self
    }

    /// Number of `read_at` calls so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

// ---

#[async_trait]
impl ChunkReader for MemoryReader {
    // ---
    async fn read_at(&self, _media: &MediaFile, offset: u64, len: usize) -> Result<Bytes> {
        // ---
        self.reads.fetch_add(1, Ordering::Relaxed);

        if self.fail_from.is_some_and(|f| offset + len as u64 > f) {
            return Err(ReelSyncError::Read {
                offset,
                reason: "injected failure".into(),
            });
        }

        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        Ok(self.data.slice(start..end))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
