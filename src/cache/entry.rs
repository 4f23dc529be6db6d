//! Index entry metadata and the on-disk index document.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::error::{CacheError, CacheResult};

/// Current index document version.
pub const INDEX_VERSION: u32 = 1;

/// Metadata binding a resource identifier to its file in storage.
///
/// The aliases read index arrays written by older clients, which used
/// PascalCase field names and timestamps that may lack an offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  /// Originating URL, or a prefixed key for non-HTTP values
  #[serde(alias = "HttpSource")]
  pub source_id: String,
  /// Random file name inside the storage root
  #[serde(alias = "DownloadedPath")]
  pub local_path: String,
  /// When the bytes were first downloaded or last fully overwritten
  #[serde(alias = "WhenDownloadedUtc", deserialize_with = "utc_timestamp")]
  pub downloaded_at: DateTime<Utc>,
  /// When the bytes were last written or served from the cache
  #[serde(alias = "WhenLastAccessedUtc", deserialize_with = "utc_timestamp")]
  pub last_accessed_at: DateTime<Utc>,
}

/// RFC 3339, or a bare `YYYY-MM-DDTHH:MM:SS[.f]` taken as UTC.
fn utc_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
  D: Deserializer<'de>,
{
  let raw = String::deserialize(deserializer)?;
  DateTime::parse_from_rfc3339(&raw)
    .map(|t| t.with_timezone(&Utc))
    .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f").map(|t| t.and_utc()))
    .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {:?}: {}", raw, e)))
}

impl CacheEntry {
  pub(crate) fn new(source_id: &str, local_path: String, now: DateTime<Utc>) -> Self {
    Self {
      source_id: source_id.to_string(),
      local_path,
      downloaded_at: now,
      last_accessed_at: now,
    }
  }

  /// Record an access, never moving `last_accessed_at` before `downloaded_at`.
  pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
    self.last_accessed_at = now.max(self.downloaded_at);
  }

  /// Whether the entry is older than `max_age` at `now`.
  ///
  /// An entry exactly `max_age` old is still retained.
  pub fn is_expired(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    now - self.downloaded_at > max_age
  }
}

/// Generate an unguessable file name for a new entry.
pub(crate) fn new_local_path() -> String {
  uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Serialize)]
struct IndexDocumentRef<'a> {
  version: u32,
  entries: Vec<&'a CacheEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IndexDocument {
  Versioned {
    version: u32,
    entries: Vec<CacheEntry>,
  },
  /// Snapshots written before the version field existed
  Legacy(Vec<CacheEntry>),
}

/// Serialize entries as a versioned index document.
pub(crate) fn encode_index<'a>(
  entries: impl Iterator<Item = &'a CacheEntry>,
) -> CacheResult<Vec<u8>> {
  let mut entries: Vec<&CacheEntry> = entries.collect();
  entries.sort_by(|a, b| a.source_id.cmp(&b.source_id));

  serde_json::to_vec(&IndexDocumentRef {
    version: INDEX_VERSION,
    entries,
  })
  .map_err(|source| CacheError::Encode {
    what: "cache index".to_string(),
    source,
  })
}

/// Decode an index document, accepting legacy unversioned snapshots.
pub(crate) fn decode_index(file: &str, bytes: &[u8]) -> CacheResult<Vec<CacheEntry>> {
  let document: IndexDocument =
    serde_json::from_slice(bytes).map_err(|source| CacheError::IndexUnreadable {
      file: file.to_string(),
      source,
    })?;

  match document {
    IndexDocument::Versioned { version, entries } if version <= INDEX_VERSION => Ok(entries),
    IndexDocument::Versioned { version, .. } => Err(CacheError::UnsupportedIndexVersion {
      file: file.to_string(),
      found: version,
      supported: INDEX_VERSION,
    }),
    IndexDocument::Legacy(entries) => Ok(entries),
  }
}
