//! Background jobs: the durable queue, workers, sweeps and the scheduler.

pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod sweep;
pub mod worker;

pub use queue::JobQueue;
pub use runner::{DeleteReport, EngineJobHandler};
pub use scheduler::Scheduler;
pub use sweep::{CleanupSweep, SweepReport};
pub use worker::{JobHandler, JobOutcome, JobReport, JobWorker};
