//! The reelsync delivery core: fair progressive delivery of one large file
//! to many concurrent byte-range readers.
//!
//! # Structure
//!
//! - [`config`]        - [`DeliveryParams`], the environment resolver and drift watcher
//! - [`head_cache`]    - [`HeadCache`], the in-memory copy of the file's first bytes
//! - [`client_queue`]  - [`DeliveryJob`], [`ClientQueue`] and the first-seen visit order
//! - [`scheduler`]     - [`SchedulerCore`] (one DRR pass at a time) and its task handle
//! - [`direct`]        - unscheduled transfers for when fairness is switched off
//! - [`service`]       - [`DeliveryService`], the façade the HTTP layer calls
//! - [`sink`]          - channel-backed [`ChunkSink`](reelsync_domain::ChunkSink) and body stream
//! - [`reader`]        - positional file reads ([`FileReader`]) and the in-memory stand-in
//! - [`stats`]         - fairness counters and rolling percentiles
//! - [`diagnostics`]   - tracing-backed and recording [`Diagnostics`](reelsync_domain::Diagnostics) sinks
//!
//! # Usage
//!
//! ```rust,ignore
//! let params = DeliveryParams::resolve(&EnvSource, &TracingDiagnostics);
//! let service = DeliveryService::start(
//!     params,
//!     Arc::new(FileReader::new()),
//!     clock,
//!     Arc::new(TracingDiagnostics),
//! );
//! let delivery = service.serve(client, range_header, media.current(), false).await?;
//! ```

pub mod client_queue;
pub mod config;
pub mod diagnostics;
pub mod direct;
pub mod head_cache;
pub mod reader;
pub mod scheduler;
pub mod service;
pub mod sink;
pub mod stats;

// --- config
pub use config::{
    // ---
    ConfigWatcher,
    DeliveryParams,
    DriftReport,
    EnvSource,
    ParamSource,
};

// --- diagnostics
pub use diagnostics::{
    // ---
    LogGate,
    RecordingDiagnostics,
    Throttle,
    TracingDiagnostics,
    DIAGNOSTIC_THROTTLE,
};

// --- queues and scheduling
pub use client_queue::{ClientQueue, ClientSnapshot, DeliveryJob};
pub use head_cache::HeadCache;
pub use scheduler::{DeliveryScheduler, PassOutcome, SchedulerCmd, SchedulerContext, SchedulerCore};

// --- façade
pub use service::{DebugSnapshot, Delivery, DeliveryBody, DeliveryService, DeliveryStatus};

// --- transport
pub use reader::{FileReader, MemoryReader};
pub use sink::{body_channel, BodyStream, ChannelSink, BODY_CHANNEL_CAPACITY};

// --- stats
pub use stats::{Counter, DeliveryStats, StatsSnapshot};
