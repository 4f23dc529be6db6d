//! The cache index: resource identifier to on-disk entry metadata.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::entry::{decode_index, encode_index, new_local_path, CacheEntry};
use super::error::{CacheError, CacheResult};
use super::storage::Storage;

/// Process-wide index of cached resources.
///
/// Every operation holds the index lock for its whole read-mutate-persist
/// cycle, so concurrent callers never clobber each other's changes. Every
/// mutation persists the full index before returning.
#[derive(Clone)]
pub struct CacheIndex {
  inner: Arc<Inner>,
}

struct Inner {
  storage: Arc<dyn Storage>,
  index_file: String,
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CacheIndex {
  /// An empty index over `storage`. Nothing is written until the first save.
  pub fn empty(storage: Arc<dyn Storage>, index_file: impl Into<String>) -> Self {
    Self::from_entries(storage, index_file, Vec::new())
  }

  /// Load the index file from storage.
  ///
  /// A missing file yields an empty index. A present but undecodable file is
  /// an error; the caller decides whether to start over.
  pub async fn load(storage: Arc<dyn Storage>, index_file: impl Into<String>) -> CacheResult<Self> {
    let index_file = index_file.into();

    let bytes = storage
      .read_bytes(&index_file)
      .await
      .map_err(|source| CacheError::StorageRead {
        name: index_file.clone(),
        source,
      })?;

    let entries = match bytes {
      Some(bytes) => decode_index(&index_file, &bytes)?,
      None => {
        debug!("No cache index at {}, starting empty", index_file);
        Vec::new()
      }
    };

    Ok(Self::from_entries(storage, index_file, entries))
  }

  pub(crate) fn from_entries(
    storage: Arc<dyn Storage>,
    index_file: impl Into<String>,
    mut entries: Vec<CacheEntry>,
  ) -> Self {
    // Two entries sharing a file would delete each other's bytes
    entries.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    let mut seen_paths = HashSet::new();
    let mut by_source = HashMap::with_capacity(entries.len());
    for entry in entries {
      if !seen_paths.insert(entry.local_path.clone()) {
        warn!(
          "Dropping index entry {} sharing file {}",
          entry.source_id, entry.local_path
        );
        continue;
      }
      by_source.insert(entry.source_id.clone(), entry);
    }

    Self {
      inner: Arc::new(Inner {
        storage,
        index_file: index_file.into(),
        entries: Mutex::new(by_source),
      }),
    }
  }

  /// Name of the index file inside the storage root.
  pub fn index_file(&self) -> &str {
    &self.inner.index_file
  }

  pub(crate) fn storage(&self) -> &Arc<dyn Storage> {
    &self.inner.storage
  }

  /// Write the current index snapshot to storage.
  pub async fn save(&self) -> CacheResult<()> {
    let entries = self.inner.entries.lock().await;
    self.persist(&entries).await
  }

  /// Find the entry for `source_id`.
  pub async fn lookup(&self, source_id: &str) -> Option<CacheEntry> {
    self.inner.entries.lock().await.get(source_id).cloned()
  }

  /// All entries, ordered by source identifier.
  pub async fn entries(&self) -> Vec<CacheEntry> {
    let mut entries: Vec<CacheEntry> = self.inner.entries.lock().await.values().cloned().collect();
    entries.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    entries
  }

  pub async fn len(&self) -> usize {
    self.inner.entries.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  /// Store `bytes` for `source_id`.
  ///
  /// An existing entry keeps its file, which is overwritten in place. A new
  /// entry gets a fresh random file name. The write runs on its own task, so
  /// dropping the returned future never leaves a half-applied update.
  pub async fn put(&self, source_id: &str, bytes: Vec<u8>) -> CacheResult<CacheEntry> {
    let index = self.clone();
    let id = source_id.to_string();

    tokio::spawn(async move { index.put_locked(&id, &bytes).await })
      .await
      .map_err(|_| CacheError::Interrupted {
        source_id: source_id.to_string(),
      })?
  }

  async fn put_locked(&self, source_id: &str, bytes: &[u8]) -> CacheResult<CacheEntry> {
    let mut entries = self.inner.entries.lock().await;

    let local_path = entries
      .get(source_id)
      .map(|e| e.local_path.clone())
      .unwrap_or_else(new_local_path);

    self
      .inner
      .storage
      .write_bytes(&local_path, bytes)
      .await
      .map_err(|source| CacheError::StorageWrite {
        name: local_path.clone(),
        source,
      })?;

    let entry = CacheEntry::new(source_id, local_path, Utc::now());
    let previous = entries.insert(source_id.to_string(), entry.clone());

    if let Err(e) = self.persist(&entries).await {
      match previous {
        Some(previous) => entries.insert(source_id.to_string(), previous),
        None => entries.remove(source_id),
      };
      return Err(e);
    }

    debug!(
      "Cached {} ({} bytes) as {}",
      source_id,
      bytes.len(),
      entry.local_path
    );
    Ok(entry)
  }

  /// Read the cached bytes for `source_id`, recording the access.
  ///
  /// Returns `None` on a miss. An entry whose file has disappeared is dropped
  /// and reported as a miss.
  pub async fn touch_and_read(&self, source_id: &str) -> CacheResult<Option<Vec<u8>>> {
    let mut entries = self.inner.entries.lock().await;

    let Some(local_path) = entries.get(source_id).map(|e| e.local_path.clone()) else {
      return Ok(None);
    };

    let bytes = self
      .inner
      .storage
      .read_bytes(&local_path)
      .await
      .map_err(|source| CacheError::StorageRead {
        name: local_path.clone(),
        source,
      })?;

    match bytes {
      Some(bytes) => {
        if let Some(entry) = entries.get_mut(source_id) {
          entry.touch(Utc::now());
        }
        if let Err(e) = self.persist(&entries).await {
          warn!("Failed to record access to {}: {}", source_id, e);
        }
        Ok(Some(bytes))
      }
      None => {
        warn!(
          "Cached file {} for {} is missing, dropping entry",
          local_path, source_id
        );
        entries.remove(source_id);
        if let Err(e) = self.persist(&entries).await {
          warn!("Failed to persist index after dropping {}: {}", source_id, e);
        }
        Ok(None)
      }
    }
  }

  /// Remove every entry downloaded more than `max_age` ago, with its file.
  ///
  /// Returns the removed identifiers.
  pub async fn evict_older_than(&self, max_age: Duration) -> CacheResult<Vec<String>> {
    self.evict_expired(Utc::now(), max_age).await
  }

  pub(crate) async fn evict_expired(
    &self,
    now: DateTime<Utc>,
    max_age: Duration,
  ) -> CacheResult<Vec<String>> {
    let mut entries = self.inner.entries.lock().await;

    let expired: Vec<String> = entries
      .values()
      .filter(|e| e.is_expired(now, max_age))
      .map(|e| e.source_id.clone())
      .collect();

    if expired.is_empty() {
      return Ok(expired);
    }

    let removed: Vec<CacheEntry> = expired
      .iter()
      .filter_map(|id| entries.remove(id))
      .collect();

    // Persist before deleting so the index never names a deleted file
    if let Err(e) = self.persist(&entries).await {
      for entry in removed {
        entries.insert(entry.source_id.clone(), entry);
      }
      return Err(e);
    }
    drop(entries);

    let mut evicted = Vec::with_capacity(removed.len());
    for entry in removed {
      if let Err(e) = self.inner.storage.delete(&entry.local_path).await {
        // Unreferenced now, so the next reconcile removes it as an orphan
        warn!(
          "Failed to delete expired file {} for {}: {}",
          entry.local_path, entry.source_id, e
        );
      }
      evicted.push(entry.source_id);
    }

    evicted.sort();
    Ok(evicted)
  }

  /// File names referenced by live entries.
  pub(crate) async fn referenced_paths(&self) -> HashSet<String> {
    self
      .inner
      .entries
      .lock()
      .await
      .values()
      .map(|e| e.local_path.clone())
      .collect()
  }

  /// Drop entries whose file is not in `present`. Returns the dropped identifiers.
  pub(crate) async fn retain_present(&self, present: &HashSet<String>) -> Vec<String> {
    let mut entries = self.inner.entries.lock().await;

    let mut dangling: Vec<String> = entries
      .values()
      .filter(|e| !present.contains(&e.local_path))
      .map(|e| e.source_id.clone())
      .collect();
    dangling.sort();

    for id in &dangling {
      entries.remove(id);
    }
    dangling
  }

  async fn persist(&self, entries: &HashMap<String, CacheEntry>) -> CacheResult<()> {
    let bytes = encode_index(entries.values())?;

    self
      .inner
      .storage
      .write_bytes(&self.inner.index_file, &bytes)
      .await
      .map_err(|source| CacheError::StorageWrite {
        name: self.inner.index_file.clone(),
        source,
      })
  }
}
