//! Minimal control plane: which file is selected and where playback is.
//!
//! The delivery core only ever sees this through [`MediaSource`] and
//! [`PlaybackClock`].  Selecting a file bumps the revision; the service picks
//! the change up on its next request or when the admin route resets it.

use std::path::Path;
use std::time::Instant;

// ---

use parking_lot::RwLock;

// ---

use reelsync_domain::{
    // ---
    MediaFile,
    MediaSource,
    PlaybackClock,
    PlaybackSnapshot,
    ReelSyncError,
    Result,
};

// ---------------------------------------------------------------------------
// ControlPlane
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ControlPlane {
    // ---
    /// Current selection and the revision counter it was stamped from.
    active: RwLock<Option<MediaFile>>,
    last_revision: RwLock<u64>,

    playback: RwLock<Option<PlaybackSnapshot>>,
}

// ---

impl ControlPlane {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    // ---

    /// Select `path` as the active file.  The file must exist and be a
    /// regular file; its length is captured now and never re-read.
    pub async fn select(&self, path: &Path) -> Result<MediaFile> {
        // ---
        let path = tokio::fs::canonicalize(path).await.map_err(|e| not_found(path, e))?;
        let meta = tokio::fs::metadata(&path).await.map_err(|e| not_found(&path, e))?;
        if !meta.is_file() {
            return Err(ReelSyncError::NotFound(format!("{} is not a regular file", path.display())));
        }

        let file = {
            // Held across the swap so concurrent selects publish in order.
            let mut last = self.last_revision.write();
            *last += 1;
            let file = MediaFile {
                path,
                len: meta.len(),
                revision: *last,
            };
            *self.active.write() = Some(file.clone());
            file
        };
        // The old position means nothing for the new file; the ahead gate
        // stays open until the controller publishes one.
        *self.playback.write() = None;

        tracing::info!(
            path = %file.path.display(),
            len = file.len,
            revision = file.revision,
            "media selected"
        );
        Ok(file)
    }

    /// Record the authoritative playback position, observed now.
    pub fn publish_playback(&self, position_secs: f64, paused: bool) {
        // ---
        *self.playback.write() = Some(PlaybackSnapshot {
            position_secs,
            paused,
            as_of: Instant::now(),
        });
        tracing::debug!(position_secs, paused, "playback position published");
    }
}

// ---

fn not_found(path: &Path, e: std::io::Error) -> ReelSyncError {
    // ---
    if e.kind() == std::io::ErrorKind::NotFound {
        ReelSyncError::NotFound(path.display().to_string())
    } else {
        ReelSyncError::Io(e)
    }
}

// ---

impl MediaSource for ControlPlane {
    fn current(&self) -> Option<MediaFile> {
        self.active.read().clone()
    }
}

impl PlaybackClock for ControlPlane {
    fn snapshot(&self) -> Option<PlaybackSnapshot> {
        *self.playback.read()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::io::Write;

    use reelsync_domain::{MediaSource, PlaybackClock};

    use super::ControlPlane;

    #[tokio::test]
    async fn select_captures_length_and_bumps_revision() {
        // ---
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[7u8; 1_000]).unwrap();
        tmp.flush().unwrap();

        let control = ControlPlane::new();
        assert!(control.current().is_none());

        let first = control.select(tmp.path()).await.unwrap();
        assert_eq!(first.len, 1_000);
        assert_eq!(first.revision, 1);
        assert!(first.path.is_absolute());

        let second = control.select(tmp.path()).await.unwrap();
        assert_eq!(second.revision, 2);
        assert_eq!(control.current(), Some(second));
    }

    // ---

    #[tokio::test]
    async fn rejects_missing_files_and_directories() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let control = ControlPlane::new();

        let err = control.select(&dir.path().join("nope.mkv")).await.unwrap_err();
        assert!(err.is_not_found());

        let err = control.select(dir.path()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(control.current().is_none());
    }

    // ---

    #[tokio::test]
    async fn selection_clears_the_playback_position() {
        // ---
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let control = ControlPlane::new();

        control.publish_playback(12.5, true);
        let snap = control.snapshot().unwrap();
        assert_eq!(snap.position_secs, 12.5);
        assert!(snap.paused);

        control.select(tmp.path()).await.unwrap();
        assert!(control.snapshot().is_none());
    }
}
