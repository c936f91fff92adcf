//! Content-addressable file cache with quota-based eviction.
//!
//! The cache backs expensive remote-input fetches: the transport layer
//! consults it before transferring bytes and populates it afterwards.
//!
//! # Layout
//!
//! ```text
//! {cache_dir}/
//! ├── index.json            # CacheIndex: size + last-access per entry
//! └── <sha256 of locator>   # Cached file, flat, one per source locator
//! ```
//!
//! Entries are keyed by the SHA-256 of their canonical source locator, so
//! the same source always lands in the same entry. The index tracks byte
//! sizes and a monotonic access ordinal; after every insertion the least
//! recently accessed entries are evicted until the total size fits the
//! configured quota again.
//!
//! # Corruption handling
//!
//! An index that fails to deserialize is deleted and rebuilt from the
//! entry files on disk, and the operation fails with a *retryable*
//! [`CacheError::Corrupt`]. The caller retries once; nothing else is
//! retried automatically.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::sync::SourceLocator;
use crate::util::hash::locator_key;

/// Schema version of the cache index.
pub const CACHE_INDEX_VERSION: u32 = 1;

/// Index file name within the cache directory.
const INDEX_FILENAME: &str = "index.json";

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache index '{path}' was corrupt; it has been rebuilt, retry the operation")]
  Corrupt { path: PathBuf },

  #[error("failed to create cache directory '{path}': {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write '{path}': {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize cache index: {0}")]
  Serialize(#[from] serde_json::Error),
}

impl CacheError {
  /// Whether the caller should retry the failed operation once.
  pub fn is_retryable(&self) -> bool {
    matches!(self, CacheError::Corrupt { .. })
  }
}

/// Index record of one cached file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub size: u64,

  /// Monotonic access ordinal; higher means more recently used.
  pub last_access: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
  version: u32,
  clock: u64,
  entries: BTreeMap<String, CacheEntry>,
}

impl CacheIndex {
  fn new() -> Self {
    Self {
      version: CACHE_INDEX_VERSION,
      clock: 0,
      entries: BTreeMap::new(),
    }
  }
}

/// Summary counters for front ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub total_bytes: u64,
  pub quota: u64,
}

/// The content cache for one build host.
///
/// Only one build process accesses the cache at a time (the build lock
/// serializes builds), so no concurrent-writer protocol is needed.
#[derive(Debug)]
pub struct ContentCache {
  dir: PathBuf,
  quota: u64,
  index: CacheIndex,
}

impl ContentCache {
  /// Open (or create) the cache at `dir` with the given byte quota.
  ///
  /// # Errors
  ///
  /// A corrupt index is deleted and rebuilt from the entry files on
  /// disk; the call then fails with a retryable [`CacheError::Corrupt`]
  /// and the next attempt succeeds against the rebuilt index.
  pub fn open(dir: impl Into<PathBuf>, quota: u64) -> Result<Self, CacheError> {
    let dir = dir.into();
    fs::create_dir_all(&dir).map_err(|e| CacheError::CreateDir {
      path: dir.clone(),
      source: e,
    })?;

    let index_path = dir.join(INDEX_FILENAME);
    let index = match fs::read_to_string(&index_path) {
      Err(e) if e.kind() == io::ErrorKind::NotFound => CacheIndex::new(),
      Err(e) => {
        return Err(CacheError::Read {
          path: index_path,
          source: e,
        });
      }
      Ok(content) => match serde_json::from_str::<CacheIndex>(&content) {
        Ok(index) if index.version == CACHE_INDEX_VERSION => index,
        Ok(index) => {
          warn!(
            found = index.version,
            expected = CACHE_INDEX_VERSION,
            "cache index has incompatible schema; rebuilding"
          );
          return Self::heal(dir, quota, index_path);
        }
        Err(e) => {
          warn!(path = %index_path.display(), error = %e, "cache index is corrupt; rebuilding");
          return Self::heal(dir, quota, index_path);
        }
      },
    };

    Ok(Self { dir, quota, index })
  }

  /// Delete the broken index, rebuild it from the entry files, and ask
  /// the caller to retry.
  fn heal(dir: PathBuf, quota: u64, index_path: PathBuf) -> Result<Self, CacheError> {
    match fs::remove_file(&index_path) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => {
        return Err(CacheError::Write {
          path: index_path,
          source: e,
        });
      }
    }

    let cache = Self {
      index: rebuild_index(&dir)?,
      dir,
      quota,
    };
    cache.save_index()?;

    Err(CacheError::Corrupt { path: index_path })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn quota(&self) -> u64 {
    self.quota
  }

  fn entry_path(&self, key: &str) -> PathBuf {
    self.dir.join(key)
  }

  /// Look up the cached file for a source locator.
  ///
  /// A hit refreshes the entry's access ordinal. Index records whose
  /// entry file vanished are dropped and reported as a miss.
  pub fn lookup(&mut self, locator: &SourceLocator) -> Result<Option<PathBuf>, CacheError> {
    let key = locator_key(locator.canonical());
    let path = self.entry_path(&key);

    if !self.index.entries.contains_key(&key) {
      return Ok(None);
    }

    if !path.exists() {
      warn!(key = %key, "cache entry file vanished; dropping index record");
      self.index.entries.remove(&key);
      self.save_index()?;
      return Ok(None);
    }

    self.touch(&key);
    self.save_index()?;
    debug!(locator = %locator, key = %key, "cache hit");
    Ok(Some(path))
  }

  /// Insert a file into the cache under its locator's key, then enforce
  /// the quota.
  ///
  /// Returns the path of the cached copy. The just-inserted entry is
  /// never evicted while older entries remain.
  pub fn insert(&mut self, locator: &SourceLocator, source: &Path) -> Result<PathBuf, CacheError> {
    let key = locator_key(locator.canonical());
    let path = self.entry_path(&key);
    let temp_path = self.dir.join(format!("{}.tmp", key));

    fs::copy(source, &temp_path).map_err(|e| CacheError::Write {
      path: temp_path.clone(),
      source: e,
    })?;
    fs::rename(&temp_path, &path).map_err(|e| CacheError::Write {
      path: path.clone(),
      source: e,
    })?;

    let size = fs::metadata(&path)
      .map_err(|e| CacheError::Read {
        path: path.clone(),
        source: e,
      })?
      .len();

    self.index.entries.insert(key.clone(), CacheEntry { size, last_access: 0 });
    self.touch(&key);
    self.evict_to_quota(&key);
    self.save_index()?;

    debug!(locator = %locator, key = %key, size, "cached source");
    Ok(path)
  }

  pub fn contains(&self, locator: &SourceLocator) -> bool {
    self.index.entries.contains_key(&locator_key(locator.canonical()))
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      entries: self.index.entries.len(),
      total_bytes: self.total_bytes(),
      quota: self.quota,
    }
  }

  fn total_bytes(&self) -> u64 {
    self.index.entries.values().map(|entry| entry.size).sum()
  }

  fn touch(&mut self, key: &str) {
    self.index.clock += 1;
    let clock = self.index.clock;
    if let Some(entry) = self.index.entries.get_mut(key) {
      entry.last_access = clock;
    }
  }

  /// Evict least-recently-accessed entries, regardless of size, until
  /// the total is back under quota. `protect` (the entry just inserted)
  /// survives even if it alone exceeds the quota.
  fn evict_to_quota(&mut self, protect: &str) {
    while self.total_bytes() > self.quota {
      let candidate = self
        .index
        .entries
        .iter()
        .filter(|(key, _)| key.as_str() != protect)
        .min_by_key(|(_, entry)| entry.last_access)
        .map(|(key, entry)| (key.clone(), entry.size));

      let Some((key, size)) = candidate else {
        break;
      };

      let path = self.entry_path(&key);
      if let Err(e) = fs::remove_file(&path) {
        warn!(path = %path.display(), error = %e, "failed to remove evicted cache entry");
      }
      self.index.entries.remove(&key);
      debug!(key = %key, size, "evicted cache entry");
    }
  }

  fn save_index(&self) -> Result<(), CacheError> {
    let path = self.dir.join(INDEX_FILENAME);
    let temp_path = self.dir.join(format!("{}.tmp", INDEX_FILENAME));

    let content = serde_json::to_string_pretty(&self.index)?;
    fs::write(&temp_path, &content).map_err(|e| CacheError::Write {
      path: temp_path.clone(),
      source: e,
    })?;
    fs::rename(&temp_path, &path).map_err(|e| CacheError::Write { path, source: e })?;

    Ok(())
  }
}

/// Reconstruct an index from the entry files in the cache directory.
///
/// Access order is lost; surviving entries restart with ascending
/// ordinals in name order.
fn rebuild_index(dir: &Path) -> Result<CacheIndex, CacheError> {
  let mut index = CacheIndex::new();

  let entries = fs::read_dir(dir).map_err(|e| CacheError::Read {
    path: dir.to_path_buf(),
    source: e,
  })?;

  let mut files: Vec<(String, u64)> = Vec::new();
  for entry in entries.flatten() {
    let name = entry.file_name().to_string_lossy().to_string();
    if name == INDEX_FILENAME || name.ends_with(".tmp") {
      continue;
    }
    let Ok(metadata) = entry.metadata() else { continue };
    if !metadata.is_file() {
      continue;
    }
    files.push((name, metadata.len()));
  }
  files.sort();

  for (name, size) in files {
    index.clock += 1;
    index.entries.insert(
      name,
      CacheEntry {
        size,
        last_access: index.clock,
      },
    );
  }

  Ok(index)
}
