use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::CorruptIndexPolicy;
use crate::incremental::{DEFAULT_BLOCK_SIZE, DEFAULT_GROWTH_DIVISOR};

pub const DEFAULT_INDEX_FILE: &str = "_cacheindex.txt";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub http: HttpConfig,
  pub incremental: IncrementalConfig,
  /// Directory for rolling log files (stderr only if unset)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Storage root (defaults to the platform cache directory)
  pub root: Option<PathBuf>,
  /// Name of the index file inside the root
  pub index_file: String,
  /// Entries downloaded longer ago than this are evicted at startup
  pub max_age_hours: u64,
  /// Extra files in the root that are never treated as orphans
  pub persistent_files: Vec<String>,
  /// What to do with an index file that cannot be decoded
  pub on_corrupt_index: CorruptIndexPolicy,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      root: None,
      index_file: DEFAULT_INDEX_FILE.to_string(),
      max_age_hours: 72,
      persistent_files: Vec::new(),
      on_corrupt_index: CorruptIndexPolicy::default(),
    }
  }
}

/// Convert an age in hours, rejecting values a `chrono::Duration` can't hold.
pub fn hours_to_duration(hours: u64) -> Result<chrono::Duration> {
  i64::try_from(hours)
    .ok()
    .and_then(chrono::Duration::try_hours)
    .ok_or_else(|| eyre!("Age of {} hours is out of range", hours))
}

impl CacheConfig {
  pub fn max_age(&self) -> Result<chrono::Duration> {
    hours_to_duration(self.max_age_hours)
      .map_err(|e| eyre!("Invalid cache.max_age_hours: {}", e))
  }

  /// Resolve the storage root.
  pub fn root_dir(&self) -> Result<PathBuf> {
    if let Some(root) = &self.root {
      return Ok(root.clone());
    }

    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| eyre!("Could not determine cache directory"))?;

    Ok(cache_dir.join("rescache"))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      user_agent: format!("rescache/{}", env!("CARGO_PKG_VERSION")),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IncrementalConfig {
  /// Positions fetched per block
  pub block_size: usize,
  /// The next block is due once reads pass loaded / growth_divisor
  pub growth_divisor: usize,
}

impl Default for IncrementalConfig {
  fn default() -> Self {
    Self {
      block_size: DEFAULT_BLOCK_SIZE,
      growth_divisor: DEFAULT_GROWTH_DIVISOR,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rescache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rescache/config.yaml
  ///
  /// Without any file, every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rescache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rescache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
    config
      .validate()
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;
    Ok(config)
  }

  /// Check settings that deserialize fine but can't be used.
  pub fn validate(&self) -> Result<()> {
    self.cache.max_age()?;
    Ok(())
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the session token from the environment, if one is set.
  ///
  /// Checks RESCACHE_TOKEN.
  pub fn get_session_token() -> Option<String> {
    std::env::var("RESCACHE_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
