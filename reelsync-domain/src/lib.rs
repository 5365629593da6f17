//! Core types and collaborator traits for the reelsync delivery scheduler.
//!
//! This crate defines the vocabulary of the system.  The delivery core and
//! the HTTP daemon both speak its types.  No scheduling lives here.
//!
//! # Structure
//!
//! - [`error`]         - [`ReelSyncError`] and [`Result<T>`] alias
//! - [`client`]        - [`ClientKey`], the per-viewer fairness key
//! - [`media`]         - [`MediaFile`], [`PlaybackSnapshot`] and the control-plane collaborators
//! - [`range`]         - `Range` header parsing, admission and truncation
//! - [`token_bucket`]  - [`TokenBucket`] (bits, one-second capacity)
//! - [`diagnostics`]   - [`Diagnostic`] events and the injected [`Diagnostics`] sink
//! - [`transport`]     - [`ChunkSink`] and [`ChunkReader`] traits

mod client;
mod diagnostics;
mod error;
mod media;
mod range;
mod token_bucket;
mod transport;

// --- error
pub use error::{ReelSyncError, Result};

// --- client
pub use client::ClientKey;

// --- media
pub use media::{
    // ---
    MediaFile,
    MediaSource,
    NoPlayback,
    PlaybackClock,
    PlaybackSnapshot,
};

// --- range
pub use range::{
    // ---
    admit,
    clip,
    parse_range,
    unsatisfiable_content_range,
    Admission,
    ByteRange,
};

// --- token bucket
pub use token_bucket::TokenBucket;

// --- diagnostics
pub use diagnostics::{
    // ---
    Category,
    Diagnostic,
    Diagnostics,
    NullDiagnostics,
    Severity,
};

// --- transport
pub use transport::{
    // ---
    ChunkReader,
    ChunkSink,
    ChunkSinkPtr,
    SinkState,
};
