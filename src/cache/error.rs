//! Error types for the cache index and the fetch/fallback path.

use crate::transport::TransportError;

/// Errors raised by the cache index and its storage.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The index file exists but could not be decoded.
  #[error("cache index {file} is unreadable: {source}")]
  IndexUnreadable {
    file: String,
    #[source]
    source: serde_json::Error,
  },

  /// The index file was written by a newer format than this build understands.
  #[error("cache index {file} has unsupported version {found} (supported: {supported})")]
  UnsupportedIndexVersion {
    file: String,
    found: u32,
    supported: u32,
  },

  /// Writing a file to local storage failed. The index was not updated.
  #[error("failed to write {name} to cache storage: {source}")]
  StorageWrite {
    name: String,
    #[source]
    source: std::io::Error,
  },

  /// Reading a file from local storage failed for a reason other than absence.
  #[error("failed to read {name} from cache storage: {source}")]
  StorageRead {
    name: String,
    #[source]
    source: std::io::Error,
  },

  /// Serializing a value for storage failed.
  #[error("failed to encode {what}: {source}")]
  Encode {
    what: String,
    #[source]
    source: serde_json::Error,
  },

  /// A background write task was aborted before it finished.
  #[error("cache write for {source_id} was interrupted")]
  Interrupted { source_id: String },
}

/// Errors surfaced by the fetch/fallback engine.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
  /// The transport failed and no cached copy exists.
  #[error("resource unavailable: {url}")]
  ResourceUnavailable {
    url: String,
    #[source]
    source: TransportError,
  },

  /// The transport failed and fallback did not apply.
  #[error(transparent)]
  Transport(#[from] TransportError),

  /// The request URL could not be parsed.
  #[error("invalid url {url}: {source}")]
  InvalidUrl {
    url: String,
    #[source]
    source: url::ParseError,
  },

  #[error(transparent)]
  Cache(#[from] CacheError),

  /// Response or cached bytes could not be decoded.
  #[error("failed to decode {what}: {source}")]
  Decode {
    what: String,
    #[source]
    source: serde_json::Error,
  },
}

impl FetchError {
  /// Whether this failure means "no network and nothing cached".
  pub fn is_unavailable(&self) -> bool {
    matches!(self, FetchError::ResourceUnavailable { .. })
  }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
