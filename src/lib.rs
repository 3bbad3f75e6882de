//! Multi-part media download engine.
//!
//! Requests become durable transactions that are fetched (directly or as
//! HLS/DASH segments), assembled, verified, deduplicated against earlier
//! downloads and committed to a library directory. Every step is logged to
//! SQLite before it runs, so an interrupted process resumes where it stopped.

pub mod assembler;
pub mod config;
pub mod dedup;
pub mod downloader;
pub mod error;
pub mod fingerprints;
pub mod integrity;
pub mod limiter;
pub mod locks;
pub mod manager;
pub mod models;
pub mod playlist;
pub mod queue;
pub mod retry;
pub mod state_manager;
pub mod strategy;
pub mod transaction_log;
pub mod transport;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::config::{ConcurrencyLimits, EngineConfig, FallbackPolicy, StorageConfig};
    pub use crate::dedup::{DedupConfig, DedupMode};
    pub use crate::error::{ErrorClass, FailureReport, ManagerError};
    pub use crate::manager::DownloadEngine;
    pub use crate::models::{
        CompletedDownload, ContentFingerprint, ContentKind, DownloadRequest, SourceFormat,
        SourceUrl, Tier, TransactionOutcome, TransactionState,
    };
    pub use crate::queue::{QueueSummary, RequestQueue};
    pub use crate::retry::RetryPolicy;
    pub use crate::transport::{HttpTransport, Transport};
}
