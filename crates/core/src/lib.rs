//! Core domain types for the stowage storage, caching and upload engine.
//!
//! This crate holds the data model every other crate shares:
//! - Storage keys and their canonical encoding
//! - Content hashes and blob digests
//! - Upload session lifecycle
//! - Background job types and payloads
//! - Cache state vocabulary
//! - Configuration

pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod job;
pub mod keyspace;
pub mod upload;

pub use cache::{CacheState, Validator};
pub use error::{Error, Result};
pub use hash::{BlobDigest, ContentHash, ContentHasher};
pub use job::{
    CacheDeletePayload, CacheFillPayload, CleanupSweepPayload, JobId, JobStatus, JobType,
    ObjectRef, SweepSelector, UploadGcPayload,
};
pub use keyspace::{
    StorageKey, build_key, normalize_storage_key, sanitize_segment, try_normalize_repo_names,
};
pub use upload::{CommittedBlob, UploadId, UploadSession, UploadState, UploadStatus};
