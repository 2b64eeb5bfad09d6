//! Storage backend implementations.

pub mod cloud;
pub mod filesystem;
pub mod s3;
