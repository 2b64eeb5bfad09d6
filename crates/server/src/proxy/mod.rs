//! Pull-through proxy cache engine.

mod coalesce;
pub mod engine;
pub mod response;

pub use engine::{PROXY_PREFIX, ProxyCacheEngine, proxy_object_key};
pub use response::{CacheRequest, CacheResponse};
