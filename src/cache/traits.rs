//! Core traits and key conventions for the caching system.

use std::collections::BTreeMap;

/// Prefix for keys of cached values that did not come from an HTTP URL.
///
/// An underscore is not valid in a URL scheme, so these keys can never
/// collide with a literal URL in the same index.
pub const OBJECT_LIST_PREFIX: &str = "kf_id_";

/// Cache key for a serialized object list stored under `identifier`.
pub fn object_list_key(identifier: &str) -> String {
  format!("{}{}", OBJECT_LIST_PREFIX, identifier)
}

/// Types that carry URLs of resources worth caching for offline use.
///
/// Implemented per concrete type, e.g. a team record exposing its logo and
/// banner image URLs.
pub trait CacheableUrls {
  /// Named resource URLs, keyed by a stable field name.
  fn cacheable_urls(&self) -> BTreeMap<&'static str, String>;
}
