use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum ReelSyncError {
    // ---
    /// Malformed or out-of-bounds `Range` header.  Always surfaced as 416.
    #[error("range not satisfiable for length {len}: {reason}")]
    RangeNotSatisfiable { len: u64, reason: &'static str },

    /// No active file selected, or the file vanished from disk.
    #[error("media not found: {0}")]
    NotFound(String),

    /// I/O failure mid-job, including short reads not at the job's end.
    #[error("read error at offset {offset}: {reason}")]
    Read { offset: u64, reason: String },

    #[error("output sink closed")]
    SinkClosed,

    /// The scheduling worker has exited; nothing can be enqueued.
    #[error("delivery scheduler is gone")]
    SchedulerGone,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

impl ReelSyncError {
    // ---
    /// `true` when the failure means the active file itself is unusable,
    /// as opposed to one read going wrong.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

// ---

pub type Result<T> = std::result::Result<T, ReelSyncError>;
