//! Storage, caching and upload engine for the stowage registry.
//!
//! Protocol handlers build on the engines in this crate:
//! - [`ProxyCacheEngine`]: pull-through cache with fetch coalescing,
//!   revalidation, negative caching and stale-if-error serving
//! - [`UploadSessionManager`]: resumable, content-addressed blob uploads
//! - [`JobQueue`] and [`JobWorker`]: durable lease-based background jobs,
//!   cleanup sweeps and the periodic [`Scheduler`]

pub mod context;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod metrics;
pub mod proxy;
pub mod uploads;
pub mod upstream;

pub use context::EngineContext;
pub use error::{EngineError, EngineResult, ErrorKind};
pub use jobs::{
    CleanupSweep, EngineJobHandler, JobHandler, JobOutcome, JobQueue, JobReport, JobWorker,
    Scheduler, SweepReport,
};
pub use lock::{DistributedLock, MetadataLock};
pub use proxy::{CacheRequest, CacheResponse, ProxyCacheEngine};
pub use uploads::{UploadGcReport, UploadSessionManager, blob_key};
pub use upstream::{HttpUpstream, Upstream, UpstreamBody, UpstreamResponse};
