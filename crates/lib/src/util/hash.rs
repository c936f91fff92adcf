//! Hashing utilities for content addressing and change detection.
//!
//! This module provides:
//! - `ContentHash`: A full 64-character SHA-256 hash for file contents
//! - `hash_file()`: Streamed single file hashing
//! - `hash_bytes()`: Arbitrary byte hashing
//! - `hash_directory()`: Deterministic directory hashing
//! - `locator_key()`: Cache key derivation from a canonical source locator

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

/// A full 64-character SHA-256 hash used for content verification.
///
/// # Format
///
/// The hash is a lowercase hexadecimal string (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error while hashing a file.
#[derive(Debug, Error)]
#[error("failed to read file {path}: {source}")]
pub struct HashFileError {
  pub path: String,
  #[source]
  pub source: std::io::Error,
}

/// Hash a file's contents.
///
/// Returns the full 64-character SHA-256 hash of the file, reading it in
/// 8 KiB chunks so large build inputs never have to fit in memory.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashFileError> {
  let mut file = fs::File::open(path).map_err(|e| HashFileError {
    path: path.display().to_string(),
    source: e,
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| HashFileError {
      path: path.display().to_string(),
      source: e,
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash arbitrary bytes.
///
/// Returns the full 64-character SHA-256 hash.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(format!("{:x}", hasher.finalize()))
}

/// Error during directory hashing.
#[derive(Debug, Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error(transparent)]
  ReadFile(#[from] HashFileError),

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash covers file contents, directory structure, and symlink
/// targets, but not metadata like timestamps or permissions. Entries are
/// sorted by path for determinism. Special files are skipped.
pub fn hash_directory(path: &Path) -> Result<ContentHash, DirHashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  for entry in WalkDir::new(path).sort_by_file_name() {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .to_string();

    // Skip the root directory itself
    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let entry_hash = if file_type.is_file() {
      let content_hash = hash_file(entry_path)?;
      format!("F:{}:{}", rel_path, content_hash.0)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| DirHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      let target_hash = hash_bytes(target.to_string_lossy().as_bytes());
      format!("L:{}:{}", rel_path, target_hash.0)
    } else {
      continue;
    };

    entries.push((rel_path, entry_hash));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, entry_hash) in entries {
    hasher.update(entry_hash.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Derive the cache key for a canonical source locator.
///
/// Entries in the content cache are flat files named by this key, so the
/// same locator always maps to the same entry.
pub fn locator_key(canonical: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(canonical.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  #[test]
  fn hash_file_is_deterministic() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("test.txt");
    fs::write(&file_path, "hello world").unwrap();

    let hash = hash_file(&file_path).unwrap();
    assert_eq!(hash.0.len(), 64);

    let hash2 = hash_file(&file_path).unwrap();
    assert_eq!(hash, hash2);
  }

  #[test]
  fn hash_changes_with_content() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("file.txt");

    fs::write(&file_path, "original").unwrap();
    let hash1 = hash_file(&file_path).unwrap();

    fs::write(&file_path, "modified").unwrap();
    let hash2 = hash_file(&file_path).unwrap();

    assert_ne!(hash1, hash2);
  }

  #[test]
  fn hash_file_missing_is_error() {
    let temp = tempdir().unwrap();
    let missing = temp.path().join("nope.txt");
    assert!(hash_file(&missing).is_err());
  }

  #[test]
  fn hash_bytes_matches_file_hash() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("same.txt");
    fs::write(&file_path, b"identical bytes").unwrap();

    assert_eq!(hash_bytes(b"identical bytes"), hash_file(&file_path).unwrap());
  }

  #[test]
  fn directory_hash_is_deterministic() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("a.txt"), "content a").unwrap();
    fs::create_dir(temp.path().join("sub")).unwrap();
    fs::write(temp.path().join("sub/b.txt"), "content b").unwrap();

    let hash1 = hash_directory(temp.path()).unwrap();
    let hash2 = hash_directory(temp.path()).unwrap();
    assert_eq!(hash1, hash2);
  }

  #[test]
  fn directory_hash_changes_with_structure() {
    let temp1 = tempdir().unwrap();
    fs::write(temp1.path().join("file.txt"), "content").unwrap();

    let temp2 = tempdir().unwrap();
    fs::create_dir(temp2.path().join("sub")).unwrap();
    fs::write(temp2.path().join("sub/file.txt"), "content").unwrap();

    assert_ne!(hash_directory(temp1.path()).unwrap(), hash_directory(temp2.path()).unwrap());
  }

  #[test]
  fn locator_keys_differ_per_locator() {
    let a = locator_key("https://mirror.example/repo/base.img");
    let b = locator_key("https://mirror.example/repo/boot.img");

    assert_eq!(a.len(), 64);
    assert_ne!(a, b);
    assert_eq!(a, locator_key("https://mirror.example/repo/base.img"));
  }
}
