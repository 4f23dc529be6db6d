//! Process-wide cache service: storage, reconciled index and fetch layer.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cache::{CacheIndex, CacheLayer, FsStorage, ReconcileReport, Reconciler, Storage};
use crate::config::{CacheConfig, Config};
use crate::incremental::IncrementalFetcher;
use crate::transport::{HttpTransport, ReqwestTransport};

static INSTANCE: OnceCell<CacheService> = OnceCell::const_new();

/// The cache, opened and reconciled.
pub struct CacheService<T: HttpTransport = ReqwestTransport> {
  layer: CacheLayer<T>,
  report: ReconcileReport,
  block_size: usize,
  growth_divisor: usize,
}

impl CacheService {
  /// Initialize the process-wide service once and return it.
  ///
  /// Later calls return the existing instance and ignore their arguments, so
  /// reconciliation happens exactly once per process.
  pub async fn init(config: &Config, session_token: Option<&str>) -> Result<&'static CacheService> {
    INSTANCE
      .get_or_try_init(|| Self::from_config(config, session_token))
      .await
  }

  /// The process-wide service, if [`CacheService::init`] has run.
  pub fn get() -> Option<&'static CacheService> {
    INSTANCE.get()
  }

  /// Open a service over the native filesystem and a `reqwest` transport.
  pub async fn from_config(config: &Config, session_token: Option<&str>) -> Result<Self> {
    let root = config.cache.root_dir()?;
    let storage = FsStorage::open(&root)
      .await
      .map_err(|e| eyre!("Failed to open cache directory {}: {}", root.display(), e))?;
    debug!("Cache root: {}", root.display());

    let transport = ReqwestTransport::new(
      Duration::from_secs(config.http.timeout_secs),
      &config.http.user_agent,
      session_token,
    )?;

    Self::open(config, Arc::new(storage), transport).await
  }
}

impl<T: HttpTransport> CacheService<T> {
  /// Reconcile the index in `storage` and build the fetch layer over it.
  pub async fn open(config: &Config, storage: Arc<dyn Storage>, transport: T) -> Result<Self> {
    let (index, report) = reconciler(&config.cache)?.run(storage).await?;

    Ok(Self {
      layer: CacheLayer::new(index, transport),
      report,
      block_size: config.incremental.block_size,
      growth_divisor: config.incremental.growth_divisor,
    })
  }

  pub fn layer(&self) -> &CacheLayer<T> {
    &self.layer
  }

  pub fn index(&self) -> &CacheIndex {
    self.layer.index()
  }

  /// What startup reconciliation did.
  pub fn reconcile_report(&self) -> &ReconcileReport {
    &self.report
  }

  /// A fresh incremental fetcher using the configured block policy.
  pub fn incremental(&self) -> IncrementalFetcher<T> {
    IncrementalFetcher::new(self.layer.clone())
      .with_block_size(self.block_size)
      .with_growth_divisor(self.growth_divisor)
  }
}

fn reconciler(config: &CacheConfig) -> Result<Reconciler> {
  Ok(
    Reconciler::new(
      config.index_file.as_str(),
      config.persistent_files.iter().cloned(),
      config.max_age()?,
    )
    .with_corrupt_index_policy(config.on_corrupt_index),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::memory::MemoryStorage;
  use crate::config::CacheConfig;
  use crate::transport::fake::FakeTransport;

  fn config() -> Config {
    Config {
      cache: CacheConfig {
        persistent_files: vec!["credentials.json".to_string()],
        ..CacheConfig::default()
      },
      ..Config::default()
    }
  }

  #[tokio::test]
  async fn test_open_reconciles_before_use() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert("_cacheindex.txt", br#"{"version":1,"entries":[]}"#);
    storage.insert("credentials.json", b"{}");
    storage.insert("orphan123", b"junk");

    let service = CacheService::open(&config(), storage.clone(), FakeTransport::new())
      .await
      .unwrap();

    assert_eq!(
      service.reconcile_report().orphans_removed,
      vec!["orphan123".to_string()]
    );
    assert!(storage.get("credentials.json").is_some());
    assert!(storage.get("orphan123").is_none());
  }

  #[tokio::test]
  async fn test_incremental_uses_configured_block_size() {
    let mut config = config();
    config.incremental.block_size = 4;
    let transport = Arc::new(FakeTransport::new());
    let items: Vec<String> = (0..6).map(|i| format!("https://x/{}", i)).collect();
    for url in &items {
      transport.serve(url, b"x");
    }

    let service = CacheService::open(&config, Arc::new(MemoryStorage::new()), transport)
      .await
      .unwrap();
    let mut fetcher = service.incremental();
    let block = fetcher.fetch_next_block(&items, |u| u.clone()).await;

    assert_eq!(block.len(), 4);
    assert_eq!(service.index().len().await, 4);
  }

  #[tokio::test]
  async fn test_open_rejects_out_of_range_max_age() {
    let storage = Arc::new(MemoryStorage::new());
    let mut config = config();
    config.cache.max_age_hours = u64::MAX;

    let result = CacheService::open(&config, storage.clone(), FakeTransport::new()).await;

    assert!(result.is_err());
    assert!(storage.names().is_empty());
  }

  #[tokio::test]
  async fn test_init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.cache.root = Some(dir.path().to_path_buf());

    let first = CacheService::init(&config, None).await.unwrap();
    let second = CacheService::init(&Config::default(), None).await.unwrap();

    assert!(std::ptr::eq(first, second));
    assert!(CacheService::get().is_some());
  }
}
