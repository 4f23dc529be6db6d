//! Startup reconciliation of the cache index against the storage root.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::error::{CacheError, CacheResult};
use super::index::CacheIndex;
use super::storage::{relative_name, Storage};

/// What to do when the index file exists but cannot be decoded.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CorruptIndexPolicy {
  /// Start from an empty index; the old files become orphans and are removed
  #[default]
  Forgive,
  /// Refuse to open the cache
  Fail,
}

/// Files the reconciler never deletes even though no entry references them.
///
/// Matching is by suffix, so a protected name survives regardless of any
/// prefix the storage listing puts in front of it.
#[derive(Debug, Clone)]
pub struct PersistentFileSet {
  names: Vec<String>,
}

impl PersistentFileSet {
  /// A set protecting the index file plus `extra`.
  pub fn new(index_file: &str, extra: impl IntoIterator<Item = String>) -> Self {
    let mut names = vec![index_file.to_string()];
    names.extend(extra.into_iter().filter(|n| !n.is_empty()));
    Self { names }
  }

  pub fn protects(&self, path: &str) -> bool {
    self.names.iter().any(|name| path.ends_with(name.as_str()))
  }
}

/// Settings for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Reconciler {
  pub index_file: String,
  pub persistent: PersistentFileSet,
  pub max_age: Duration,
  pub on_corrupt_index: CorruptIndexPolicy,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  /// Untracked files deleted from storage
  pub orphans_removed: Vec<String>,
  /// Untracked files that could not be deleted
  pub orphan_delete_failures: Vec<String>,
  /// Entries dropped because their file was missing
  pub dangling_entries: Vec<String>,
  /// Entries evicted for age
  pub expired: Vec<String>,
  /// Whether an unreadable index was discarded
  pub index_reset: bool,
}

impl Reconciler {
  pub fn new(
    index_file: impl Into<String>,
    persistent_files: impl IntoIterator<Item = String>,
    max_age: Duration,
  ) -> Self {
    let index_file = index_file.into();
    Self {
      persistent: PersistentFileSet::new(&index_file, persistent_files),
      index_file,
      max_age,
      on_corrupt_index: CorruptIndexPolicy::default(),
    }
  }

  pub fn with_corrupt_index_policy(mut self, policy: CorruptIndexPolicy) -> Self {
    self.on_corrupt_index = policy;
    self
  }

  /// Load the index and bring it and the storage root into agreement.
  ///
  /// Afterwards every file in storage is referenced by a live entry or is
  /// persistent, every entry has its file, and no entry is older than
  /// `max_age`. Failing to delete a single orphan is logged and skipped.
  pub async fn run(&self, storage: Arc<dyn Storage>) -> CacheResult<(CacheIndex, ReconcileReport)> {
    self.run_at(storage, Utc::now()).await
  }

  pub(crate) async fn run_at(
    &self,
    storage: Arc<dyn Storage>,
    now: DateTime<Utc>,
  ) -> CacheResult<(CacheIndex, ReconcileReport)> {
    let mut report = ReconcileReport::default();

    let index = match CacheIndex::load(storage.clone(), self.index_file.as_str()).await {
      Ok(index) => index,
      Err(
        e @ (CacheError::IndexUnreadable { .. } | CacheError::UnsupportedIndexVersion { .. }),
      ) => match self.on_corrupt_index {
        CorruptIndexPolicy::Forgive => {
          warn!("Discarding unreadable cache index: {}", e);
          report.index_reset = true;
          CacheIndex::empty(storage.clone(), self.index_file.as_str())
        }
        CorruptIndexPolicy::Fail => return Err(e),
      },
      Err(e) => return Err(e),
    };

    let root = storage.native_path_of("");
    let listed = storage
      .list_files("")
      .await
      .map_err(|source| CacheError::StorageRead {
        name: root.clone(),
        source,
      })?;
    let files: Vec<String> = listed.iter().map(|p| relative_name(&root, p)).collect();

    let referenced = index.referenced_paths().await;
    let mut present = HashSet::with_capacity(files.len());

    for file in files {
      if referenced.contains(&file) || self.persistent.protects(&file) {
        present.insert(file);
        continue;
      }

      match storage.delete(&file).await {
        Ok(()) => report.orphans_removed.push(file),
        Err(e) => {
          warn!("Failed to delete orphan cache file {}: {}", file, e);
          report.orphan_delete_failures.push(file);
        }
      }
    }

    report.dangling_entries = index.retain_present(&present).await;
    for id in &report.dangling_entries {
      warn!("Dropping cache entry {} with missing file", id);
    }

    report.expired = index.evict_expired(now, self.max_age).await?;
    index.save().await?;

    info!(
      "Cache reconciled: {} entries, {} orphans removed, {} expired, {} dangling",
      index.len().await,
      report.orphans_removed.len(),
      report.expired.len(),
      report.dangling_entries.len()
    );

    Ok((index, report))
  }
}


#[cfg(test)]
mod proptest_tests {
  use super::*;
  use crate::cache::storage::memory::MemoryStorage;
  use proptest::prelude::*;

  const INDEX: &str = "_cacheindex.txt";

  #[derive(Debug, Clone)]
  enum Op {
    /// Store a resource; a repeated id overwrites
    Put(u8),
    /// Evict with the clock this many hours ahead
    Evict(i64),
    /// Drop an unrelated file into the root
    Stray(u8),
    /// Delete the file behind an entry
    LoseFile(u8),
    /// Restart: reconcile with the clock this many hours ahead
    Reconcile(i64),
  }

  fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
      4 => (0..6u8).prop_map(Op::Put),
      1 => (0..150i64).prop_map(Op::Evict),
      1 => (0..4u8).prop_map(Op::Stray),
      1 => (0..6u8).prop_map(Op::LoseFile),
      1 => (0..150i64).prop_map(Op::Reconcile),
    ]
  }

  fn url(id: u8) -> String {
    format!("https://x/{}.png", id)
  }

  async fn assert_unique_paths(index: &CacheIndex) {
    let entries = index.entries().await;
    let paths: HashSet<&str> = entries.iter().map(|e| e.local_path.as_str()).collect();
    assert_eq!(paths.len(), entries.len());
  }

  async fn assert_agree(storage: &MemoryStorage, index: &CacheIndex) {
    let referenced = index.referenced_paths().await;
    let mut on_disk: HashSet<String> = storage.names().into_iter().collect();
    on_disk.remove(INDEX);
    assert_eq!(referenced, on_disk);
  }

  async fn run_ops(ops: Vec<Op>) {
    let storage = Arc::new(MemoryStorage::new());
    let reconciler = Reconciler::new(INDEX, Vec::new(), Duration::days(3));
    let (mut index, _) = reconciler.run(storage.clone()).await.unwrap();
    // Index and files agree until something outside the index touches the root
    let mut clean = true;

    for op in ops {
      match op {
        Op::Put(id) => {
          index.put(&url(id), vec![id]).await.unwrap();
        }
        Op::Evict(hours) => {
          let now = Utc::now() + Duration::hours(hours);
          index.evict_expired(now, Duration::days(3)).await.unwrap();
        }
        Op::Stray(n) => {
          storage.insert(&format!("stray{}", n), b"?");
          clean = false;
        }
        Op::LoseFile(id) => {
          if let Some(entry) = index.lookup(&url(id)).await {
            storage.delete(&entry.local_path).await.unwrap();
            clean = false;
          }
        }
        Op::Reconcile(hours) => {
          let now = Utc::now() + Duration::hours(hours);
          index = reconciler.run_at(storage.clone(), now).await.unwrap().0;
          clean = true;
        }
      }

      assert_unique_paths(&index).await;
      if clean {
        assert_agree(&storage, &index).await;
      }
    }

    let (index, _) = reconciler.run(storage.clone()).await.unwrap();
    assert_agree(&storage, &index).await;
    assert_unique_paths(&index).await;

    let reloaded = CacheIndex::load(storage.clone(), INDEX).await.unwrap();
    assert_eq!(reloaded.entries().await, index.entries().await);
  }

  proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// After any sequence of operations and a reconciliation, every entry has
    /// its file, every file is an entry's or the index, and no two entries
    /// share a file.
    #[test]
    fn index_and_storage_agree_after_reconcile(ops in prop::collection::vec(op(), 1..40)) {
      tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run_ops(ops));
    }
  }
}
