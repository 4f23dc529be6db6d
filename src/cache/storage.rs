//! Storage adapter trait and the native filesystem implementation.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use tokio::fs;

/// Byte-level file operations against the cache's storage root.
///
/// Names are relative to the root. `list_files` returns native paths, which
/// callers normalize back to relative names with `native_path_of`.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
  /// Check whether a file exists.
  async fn exists(&self, name: &str) -> io::Result<bool>;

  /// Read a whole file. Returns `None` if it does not exist.
  async fn read_bytes(&self, name: &str) -> io::Result<Option<Vec<u8>>>;

  /// Create or replace a file with the given contents.
  async fn write_bytes(&self, name: &str, bytes: &[u8]) -> io::Result<()>;

  /// Remove a file. Removing a missing file is not an error.
  async fn delete(&self, name: &str) -> io::Result<()>;

  /// List the files directly inside `dir`, as native paths.
  async fn list_files(&self, dir: &str) -> io::Result<Vec<String>>;

  /// Native absolute path of `dir`.
  fn native_path_of(&self, dir: &str) -> String;
}

/// Strip the native root prefix from a listed path.
///
/// Paths that do not carry the prefix are returned unchanged.
pub fn relative_name(native_root: &str, listed: &str) -> String {
  let mut prefix = native_root.trim_end_matches(MAIN_SEPARATOR).to_string();
  prefix.push(MAIN_SEPARATOR);

  match listed.find(&prefix) {
    Some(index) => {
      let mut cleaned = listed.to_string();
      cleaned.replace_range(index..index + prefix.len(), "");
      cleaned
    }
    None => listed.to_string(),
  }
}

/// Storage rooted at a directory on the native filesystem.
#[derive(Debug, Clone)]
pub struct FsStorage {
  root: PathBuf,
}

impl FsStorage {
  /// Open storage at `root`, creating the directory if needed.
  pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
    let root = root.into();
    fs::create_dir_all(&root).await?;
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn path_of(&self, name: &str) -> PathBuf {
    if name.is_empty() {
      self.root.clone()
    } else {
      self.root.join(name)
    }
  }
}

#[async_trait]
impl Storage for FsStorage {
  async fn exists(&self, name: &str) -> io::Result<bool> {
    fs::try_exists(self.path_of(name)).await
  }

  async fn read_bytes(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
    match fs::read(self.path_of(name)).await {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e),
    }
  }

  async fn write_bytes(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
    // Temp file lives in the root so the rename never crosses filesystems.
    // A leftover temp file is an orphan and goes away at the next reconcile.
    let target = self.path_of(name);
    let temp = self
      .root
      .join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));

    fs::write(&temp, bytes).await?;
    if let Err(e) = fs::rename(&temp, &target).await {
      let _ = fs::remove_file(&temp).await;
      return Err(e);
    }
    Ok(())
  }

  async fn delete(&self, name: &str) -> io::Result<()> {
    match fs::remove_file(self.path_of(name)).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
    }
  }

  async fn list_files(&self, dir: &str) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(self.path_of(dir)).await?;

    while let Some(entry) = entries.next_entry().await? {
      if entry.file_type().await?.is_file() {
        files.push(entry.path().display().to_string());
      }
    }

    Ok(files)
  }

  fn native_path_of(&self, dir: &str) -> String {
    self.path_of(dir).display().to_string()
  }
}
