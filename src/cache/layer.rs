//! Cache layer that orchestrates network fetching with cache fallback.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use url::Url;

use super::entry::CacheEntry;
use super::error::{CacheError, CacheResult, FetchError};
use super::index::CacheIndex;
use super::traits::{object_list_key, CacheableUrls};
use crate::transport::HttpTransport;

/// Network-first fetching with the cache as an offline fallback.
///
/// Fresh data is always preferred when the network is reachable. The cache
/// only answers when the exchange could not complete at all.
pub struct CacheLayer<T: HttpTransport> {
  index: CacheIndex,
  transport: Arc<T>,
}

impl<T: HttpTransport> CacheLayer<T> {
  pub fn new(index: CacheIndex, transport: T) -> Self {
    Self {
      index,
      transport: Arc::new(transport),
    }
  }

  pub fn index(&self) -> &CacheIndex {
    &self.index
  }

  /// Fetch `url`, returning the full body.
  ///
  /// 1. GET the URL and buffer the body
  /// 2. If `should_cache`, store the bytes under the canonical URL
  /// 3. If the network is unreachable and `should_cache` is set, serve the
  ///    cached copy; with nothing cached, fail with `ResourceUnavailable`
  pub async fn fetch(&self, url: &str, should_cache: bool) -> Result<Vec<u8>, FetchError> {
    let url = parse_url(url)?;
    self.fetch_url(&url, should_cache).await
  }

  pub async fn fetch_url(&self, url: &Url, should_cache: bool) -> Result<Vec<u8>, FetchError> {
    let source_id = url.as_str();

    match self.transport.get(url).await {
      Ok(bytes) => {
        if should_cache {
          // The caller still gets the fresh bytes if the local write fails
          if let Err(e) = self.index.put(source_id, bytes.clone()).await {
            warn!("Failed to cache {}: {}", source_id, e);
          }
        }
        Ok(bytes)
      }
      Err(e) if should_cache && e.is_unreachable() => {
        debug!("Network unavailable for {}, trying cache", source_id);

        let cached = match self.index.touch_and_read(source_id).await {
          Ok(cached) => cached,
          Err(read_error) => {
            warn!("Failed to read cached {}: {}", source_id, read_error);
            None
          }
        };

        match cached {
          Some(bytes) => {
            warn!("Serving {} from cache (offline)", source_id);
            Ok(bytes)
          }
          None => {
            error!("{} is unavailable: {}", source_id, e);
            Err(FetchError::ResourceUnavailable {
              url: source_id.to_string(),
              source: e,
            })
          }
        }
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Store bytes already in hand under `source_id`.
  pub async fn cache_bytes(&self, source_id: &str, bytes: Vec<u8>) -> CacheResult<CacheEntry> {
    self.index.put(source_id, bytes).await
  }

  /// Fetch `url` without caching and decode the JSON body.
  ///
  /// No fallback: this is for metadata that must be fresh or absent.
  pub async fn fetch_json<D: DeserializeOwned>(&self, url: &str) -> Result<D, FetchError> {
    let bytes = self.fetch(url, false).await?;
    decode_bytes(url, &bytes)
  }

  /// Serialize `items` and store them under the object-list key for `identifier`.
  pub async fn cache_object_list<V: Serialize>(
    &self,
    identifier: &str,
    items: &[V],
  ) -> CacheResult<CacheEntry> {
    let key = object_list_key(identifier);
    let bytes = serde_json::to_vec(items).map_err(|source| CacheError::Encode {
      what: key.clone(),
      source,
    })?;

    self.cache_bytes(&key, bytes).await
  }

  /// Read back an object list stored with [`CacheLayer::cache_object_list`].
  pub async fn read_object_list<V: DeserializeOwned>(
    &self,
    identifier: &str,
  ) -> Result<Option<Vec<V>>, FetchError> {
    let key = object_list_key(identifier);

    match self.index.touch_and_read(&key).await? {
      Some(bytes) => decode_bytes(&key, &bytes).map(Some),
      None => Ok(None),
    }
  }

  /// Fetch and cache every resource URL `object` exposes.
  ///
  /// Each resource succeeds or fails on its own.
  pub async fn cache_resources_of<O: CacheableUrls>(
    &self,
    object: &O,
  ) -> BTreeMap<&'static str, Result<Vec<u8>, FetchError>> {
    let mut results = BTreeMap::new();

    for (name, url) in object.cacheable_urls() {
      let result = self.fetch(&url, true).await;
      if let Err(e) = &result {
        warn!("Failed to cache {} ({}): {}", name, url, e);
      }
      results.insert(name, result);
    }

    results
  }
}

impl<T: HttpTransport> Clone for CacheLayer<T> {
  fn clone(&self) -> Self {
    Self {
      index: self.index.clone(),
      transport: Arc::clone(&self.transport),
    }
  }
}

/// Decode JSON bytes, naming `what` in the error.
pub fn decode_bytes<D: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<D, FetchError> {
  serde_json::from_slice(bytes).map_err(|source| FetchError::Decode {
    what: what.to_string(),
    source,
  })
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
  Url::parse(url).map_err(|source| FetchError::InvalidUrl {
    url: url.to_string(),
    source,
  })
}
