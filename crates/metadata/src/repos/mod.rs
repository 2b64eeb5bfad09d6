//! Repository traits for metadata operations.

pub mod cache_entries;
pub mod jobs;
pub mod locks;
pub mod uploads;

pub use cache_entries::CacheEntryRepo;
pub use jobs::{ClaimRequest, JobRepo};
pub use locks::LockRepo;
pub use uploads::UploadRepo;
