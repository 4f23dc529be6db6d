//! Offline resource cache: a persisted index of downloaded resources, the
//! startup reconciliation that keeps it in agreement with storage, and the
//! network-first fetch layer that falls back to it.
//!
//! - Resources are keyed by their URL; other cached values use a prefixed key
//! - File names are random tokens, never derived from the key
//! - Entries older than the configured age are evicted at startup
//! - Fetches prefer the network and serve the cached copy only when offline

mod entry;
mod error;
mod index;
mod layer;
mod reconcile;
pub(crate) mod storage;
mod traits;

pub use entry::{CacheEntry, INDEX_VERSION};
pub use error::{CacheError, CacheResult, FetchError};
pub use index::CacheIndex;
pub use layer::{decode_bytes, CacheLayer};
pub use reconcile::{CorruptIndexPolicy, PersistentFileSet, ReconcileReport, Reconciler};
pub use storage::{relative_name, FsStorage, Storage};
pub use traits::{object_list_key, CacheableUrls, OBJECT_LIST_PREFIX};
