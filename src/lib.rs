//! Offline-capable resource cache with incremental windowed fetching.

pub mod cache;
pub mod config;
pub mod incremental;
pub mod logging;
pub mod service;
pub mod transport;

pub use cache::{CacheEntry, CacheError, CacheIndex, CacheLayer, FetchError};
pub use incremental::IncrementalFetcher;
pub use service::CacheService;
pub use transport::{HttpTransport, ReqwestTransport, TransportError};
