use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;

// ---------------------------------------------------------------------------
// MediaFile
// ---------------------------------------------------------------------------

/// Immutable snapshot of the file currently selected for playback.
///
/// Owned by the control plane.  The delivery core only reads it, once per
/// request, and a job keeps the snapshot it was admitted against for its
/// whole lifetime.  Selecting a different file bumps `revision`; a newer
/// revision invalidates everything tied to an older one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaFile {
    // ---
    /// Absolute path on disk.
    pub path: PathBuf,

    /// Length in bytes at selection time.
    pub len: u64,

    /// Increments every time the admin selects a file.
    pub revision: u64,
}

// ---------------------------------------------------------------------------
// PlaybackSnapshot
// ---------------------------------------------------------------------------

/// Last known authoritative playback position.
///
/// Published by the controller side of the control plane.  Only the ahead
/// gate looks at it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSnapshot {
    // ---
    pub position_secs: f64,
    pub paused: bool,
    /// When `position_secs` was observed.
    pub as_of: Instant,
}

// ---

impl PlaybackSnapshot {
    // ---
    /// Position extrapolated to `now` by wall clock.  A paused player stays
    /// where it was.
    pub fn position_at(&self, now: Instant) -> f64 {
        // ---
        if self.paused {
            return self.position_secs.max(0.0);
        }
        let elapsed = now.saturating_duration_since(self.as_of).as_secs_f64();
        (self.position_secs + elapsed).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Supplies the currently-selected file, if any.
pub trait MediaSource: Send + Sync {
    fn current(&self) -> Option<MediaFile>;
}

// ---

/// Supplies the authoritative playback position, if the controller has
/// published one.
pub trait PlaybackClock: Send + Sync {
    fn snapshot(&self) -> Option<PlaybackSnapshot>;
}

// ---

/// A clock that never reports a position.  The ahead gate stays open.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlayback;

impl PlaybackClock for NoPlayback {
    fn snapshot(&self) -> Option<PlaybackSnapshot> {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::{Duration, Instant};

    use super::PlaybackSnapshot;

    #[test]
    fn playing_position_advances_with_wall_clock() {
        // ---
        let as_of = Instant::now();
        let snap = PlaybackSnapshot {
            position_secs: 10.0,
            paused: false,
            as_of,
        };
        let pos = snap.position_at(as_of + Duration::from_secs(5));
        assert!((pos - 15.0).abs() < 1e-9, "expected 15s, got {pos}");
    }

    // ---

    #[test]
    fn paused_position_does_not_move() {
        // ---
        let as_of = Instant::now();
        let snap = PlaybackSnapshot {
            position_secs: 42.0,
            paused: true,
            as_of,
        };
        assert_eq!(snap.position_at(as_of + Duration::from_secs(30)), 42.0);
    }
}
