//! Incremental, windowed fetching of resources for long ordered lists.
//!
//! A list view only needs the resources for the rows it is about to show.
//! `IncrementalFetcher` fetches them in fixed-size blocks and decides when
//! the next block is due: once the consumer has read past the midpoint of
//! what has been loaded so far.
//!
//! # Example
//!
//! ```ignore
//! let mut fetcher = IncrementalFetcher::new(layer.clone());
//!
//! // Called as each row scrolls into view
//! fetcher
//!   .maybe_load(row, &players, |p| p.photo_url.clone(), |index, bytes| {
//!     photos[index] = Some(bytes);
//!   })
//!   .await;
//! ```

use futures::future::join_all;
use tracing::{debug, warn};

use crate::cache::{CacheLayer, FetchError};
use crate::transport::HttpTransport;

pub const DEFAULT_BLOCK_SIZE: usize = 10;
pub const DEFAULT_GROWTH_DIVISOR: usize = 2;

/// Outcome of fetching one position of a block.
#[derive(Debug)]
pub struct BlockItem {
  /// Position in the caller's list
  pub index: usize,
  pub result: Result<Vec<u8>, FetchError>,
}

/// Summary of a triggered load.
#[derive(Debug, Default)]
pub struct BlockReport {
  /// Positions delivered to the caller
  pub loaded: Vec<usize>,
  /// Positions whose fetch failed, with the reason
  pub failures: Vec<(usize, FetchError)>,
}

/// Fetches list resources block by block through the cache layer.
pub struct IncrementalFetcher<T: HttpTransport> {
  layer: CacheLayer<T>,
  loaded_count: usize,
  block_size: usize,
  growth_divisor: usize,
}

impl<T: HttpTransport> IncrementalFetcher<T> {
  pub fn new(layer: CacheLayer<T>) -> Self {
    Self {
      layer,
      loaded_count: 0,
      block_size: DEFAULT_BLOCK_SIZE,
      growth_divisor: DEFAULT_GROWTH_DIVISOR,
    }
  }

  pub fn with_block_size(mut self, block_size: usize) -> Self {
    self.block_size = block_size.max(1);
    self
  }

  pub fn with_growth_divisor(mut self, growth_divisor: usize) -> Self {
    self.growth_divisor = growth_divisor.max(1);
    self
  }

  /// Number of list positions fetched so far.
  pub fn loaded_count(&self) -> usize {
    self.loaded_count
  }

  /// Whether reading `requested_index` of a `total`-long list is due to
  /// trigger the next block.
  pub fn should_load(&self, requested_index: usize, total: usize) -> bool {
    self.loaded_count < total && requested_index >= self.loaded_count / self.growth_divisor
  }

  /// Fetch, with caching, the next block of `items`.
  ///
  /// Positions are fetched independently; one failure does not affect the
  /// rest of the block. `loaded_count` advances by the number of positions
  /// that actually exist.
  pub async fn fetch_next_block<I, F>(&mut self, items: &[I], url_of: F) -> Vec<BlockItem>
  where
    F: Fn(&I) -> String,
  {
    let start = self.loaded_count.min(items.len());
    let end = (self.loaded_count + self.block_size).min(items.len());

    let layer = &self.layer;
    let fetches = (start..end).map(|index| {
      let url = url_of(&items[index]);
      async move {
        BlockItem {
          index,
          result: layer.fetch(&url, true).await,
        }
      }
    });
    let block = join_all(fetches).await;

    debug!("Fetched block [{}, {}) of {}", start, end, items.len());
    self.loaded_count = end.max(self.loaded_count);
    block
  }

  /// Load the next block if `requested_index` has crossed the threshold.
  ///
  /// Each fetched position is handed to `on_loaded`. Returns `None` when no
  /// load was triggered.
  pub async fn maybe_load<I, F, L>(
    &mut self,
    requested_index: usize,
    items: &[I],
    url_of: F,
    mut on_loaded: L,
  ) -> Option<BlockReport>
  where
    F: Fn(&I) -> String,
    L: FnMut(usize, Vec<u8>),
  {
    if !self.should_load(requested_index, items.len()) {
      return None;
    }

    let mut report = BlockReport::default();
    for item in self.fetch_next_block(items, url_of).await {
      match item.result {
        Ok(bytes) => {
          on_loaded(item.index, bytes);
          report.loaded.push(item.index);
        }
        Err(e) => {
          warn!("Failed to load item {}: {}", item.index, e);
          report.failures.push((item.index, e));
        }
      }
    }

    Some(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::memory::MemoryStorage;
  use crate::cache::CacheIndex;
  use crate::transport::fake::FakeTransport;
  use std::sync::Arc;

  fn urls(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("https://x/{}.png", i)).collect()
  }

  fn setup(items: &[String]) -> (Arc<FakeTransport>, IncrementalFetcher<Arc<FakeTransport>>) {
    let storage = Arc::new(MemoryStorage::new());
    let transport = Arc::new(FakeTransport::new());
    for url in items {
      transport.serve(url, url.as_bytes());
    }
    let index = CacheIndex::empty(storage, "_cacheindex.txt");
    let fetcher = IncrementalFetcher::new(CacheLayer::new(index, transport.clone()));
    (transport, fetcher)
  }

  #[tokio::test]
  async fn test_trigger_points_follow_midpoint() {
    let items = urls(100);
    let (_transport, mut fetcher) = setup(&items);

    let mut triggered_at = Vec::new();
    for requested in 0..20 {
      let report = fetcher
        .maybe_load(requested, &items, |u| u.clone(), |_, _| {})
        .await;
      if report.is_some() {
        triggered_at.push(requested);
      }
    }

    assert_eq!(triggered_at, vec![0, 5, 10, 15]);
    assert_eq!(fetcher.loaded_count(), 40);
  }

  #[tokio::test]
  async fn test_block_delivers_positions_in_order() {
    let items = urls(25);
    let (_transport, mut fetcher) = setup(&items);

    let mut delivered = Vec::new();
    let report = fetcher
      .maybe_load(0, &items, |u| u.clone(), |index, bytes| {
        delivered.push((index, bytes))
      })
      .await
      .unwrap();

    assert_eq!(report.loaded, (0..10).collect::<Vec<_>>());
    assert!(report.failures.is_empty());
    assert_eq!(delivered[3], (3, b"https://x/3.png".to_vec()));
  }

  #[tokio::test]
  async fn test_short_tail_advances_by_available_items() {
    let items = urls(13);
    let (transport, mut fetcher) = setup(&items);

    let first = fetcher.fetch_next_block(&items, |u| u.clone()).await;
    assert_eq!(first.len(), 10);
    let second = fetcher.fetch_next_block(&items, |u| u.clone()).await;
    assert_eq!(second.len(), 3);
    assert_eq!(fetcher.loaded_count(), 13);

    // Nothing left: no trigger and no extra requests
    assert!(!fetcher.should_load(12, items.len()));
    let none = fetcher
      .maybe_load(12, &items, |u| u.clone(), |_, _| {})
      .await;
    assert!(none.is_none());
    assert_eq!(transport.requests(), 13);
  }

  #[tokio::test]
  async fn test_grown_list_resumes_loading() {
    let mut items = urls(10);
    let (transport, mut fetcher) = setup(&urls(30));

    fetcher.fetch_next_block(&items, |u| u.clone()).await;
    assert!(!fetcher.should_load(9, items.len()));

    items = urls(30);
    let report = fetcher
      .maybe_load(9, &items, |u| u.clone(), |_, _| {})
      .await
      .unwrap();
    assert_eq!(report.loaded, (10..20).collect::<Vec<_>>());
    assert_eq!(transport.requests(), 20);
  }

  #[tokio::test]
  async fn test_one_failure_does_not_drop_the_block() {
    let items = urls(10);
    let (transport, mut fetcher) = setup(&items);
    transport.fail_with_status("https://x/4.png", 404);

    let mut delivered = Vec::new();
    let report = fetcher
      .maybe_load(0, &items, |u| u.clone(), |index, _| delivered.push(index))
      .await
      .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, 4);
    assert_eq!(delivered, vec![0, 1, 2, 3, 5, 6, 7, 8, 9]);
  }

  #[tokio::test]
  async fn test_offline_block_is_served_from_cache() {
    let items = urls(10);
    let (transport, mut fetcher) = setup(&items);
    fetcher.fetch_next_block(&items, |u| u.clone()).await;

    transport.set_offline(true);
    let mut revisit = IncrementalFetcher::new(fetcher.layer.clone());
    let block = revisit.fetch_next_block(&items, |u| u.clone()).await;

    assert!(block.iter().all(|item| item.result.is_ok()));
    assert_eq!(block[7].result.as_ref().unwrap(), &b"https://x/7.png".to_vec());
  }
}
