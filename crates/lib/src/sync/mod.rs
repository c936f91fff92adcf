//! Narrow interface between the engine and the byte-transport layer.
//!
//! Task bodies materialize their input files through a [`Transport`]:
//! given a source locator, a destination path, and a mode, the transport
//! performs the transfer and reports progress through a callback the
//! engine never interprets. Remote transports (rsync, HTTP mirrors) are
//! external collaborators implementing the trait; [`FsTransport`] is the
//! built-in local-filesystem implementation used by tests and local
//! builds, optionally routed through the content cache.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::{CacheError, ContentCache};

/// Canonical reference to a source file (mirror URL or local path).
///
/// Canonicalization strips surrounding whitespace and trailing slashes so
/// equivalent spellings share one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocator(String);

impl SourceLocator {
  pub fn new(raw: impl Into<String>) -> Self {
    let raw = raw.into();
    Self(raw.trim().trim_end_matches('/').to_string())
  }

  pub fn canonical(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for SourceLocator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// How a transfer materializes the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
  /// Plain byte copy.
  Copy,

  /// Hard-link the destination to the source (same filesystem only).
  HardLink,

  /// Consult the content cache first and populate it on a miss.
  CacheThrough,
}

/// Progress callback contract; the engine passes values through
/// untouched.
pub trait ProgressSink {
  fn transferred(&mut self, bytes: u64, total: Option<u64>);
}

/// Sink that discards all progress reports.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
  fn transferred(&mut self, _bytes: u64, _total: Option<u64>) {}
}

#[derive(Debug, Error)]
pub enum SyncError {
  #[error("source '{0}' does not exist")]
  SourceMissing(String),

  #[error("failed to transfer '{from}' to '{to}': {source}")]
  Io {
    from: String,
    to: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Cache(#[from] CacheError),
}

/// The transport contract consumed by task bodies.
pub trait Transport {
  fn transfer(
    &mut self,
    source: &SourceLocator,
    dest: &Path,
    mode: TransferMode,
    progress: &mut dyn ProgressSink,
  ) -> Result<(), SyncError>;
}

/// Local-filesystem transport; locators are plain paths.
#[derive(Default)]
pub struct FsTransport {
  cache: Option<ContentCache>,
}

impl FsTransport {
  pub fn new() -> Self {
    Self { cache: None }
  }

  /// Attach a content cache consulted by [`TransferMode::CacheThrough`].
  pub fn with_cache(cache: ContentCache) -> Self {
    Self { cache: Some(cache) }
  }

  pub fn cache(&self) -> Option<&ContentCache> {
    self.cache.as_ref()
  }

  pub fn cache_mut(&mut self) -> Option<&mut ContentCache> {
    self.cache.as_mut()
  }

  fn source_path<'a>(&self, source: &'a SourceLocator) -> Result<&'a Path, SyncError> {
    let path = Path::new(source.canonical());
    if !path.exists() {
      return Err(SyncError::SourceMissing(source.canonical().to_string()));
    }
    Ok(path)
  }

  fn copy(&self, from: &Path, to: &Path, progress: &mut dyn ProgressSink) -> Result<(), SyncError> {
    copy_with_progress(from, to, progress).map(|_| ()).map_err(|e| SyncError::Io {
      from: from.display().to_string(),
      to: to.to_path_buf(),
      source: e,
    })
  }

  fn hard_link(&self, from: &Path, to: &Path, progress: &mut dyn ProgressSink) -> Result<(), SyncError> {
    let link = || -> io::Result<u64> {
      if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
      }
      match fs::remove_file(to) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
      }
      fs::hard_link(from, to)?;
      Ok(fs::metadata(to)?.len())
    };

    let size = link().map_err(|e| SyncError::Io {
      from: from.display().to_string(),
      to: to.to_path_buf(),
      source: e,
    })?;

    progress.transferred(size, Some(size));
    Ok(())
  }

  /// Serve from the cache when possible; otherwise transfer from the
  /// source and populate the cache. The source only has to exist on a
  /// cache miss.
  fn cache_through(
    &mut self,
    source: &SourceLocator,
    to: &Path,
    progress: &mut dyn ProgressSink,
  ) -> Result<(), SyncError> {
    if let Some(cache) = self.cache.as_mut()
      && let Some(cached) = cache.lookup(source)?
    {
      debug!(source = %source, "materializing from cache");
      return copy_with_progress(&cached, to, progress).map(|_| ()).map_err(|e| SyncError::Io {
        from: cached.display().to_string(),
        to: to.to_path_buf(),
        source: e,
      });
    }

    let from = self.source_path(source)?.to_path_buf();
    self.copy(&from, to, progress)?;

    if let Some(cache) = self.cache.as_mut() {
      cache.insert(source, to)?;
    } else {
      trace!(source = %source, "no cache attached; plain copy");
    }
    Ok(())
  }
}

impl Transport for FsTransport {
  fn transfer(
    &mut self,
    source: &SourceLocator,
    dest: &Path,
    mode: TransferMode,
    progress: &mut dyn ProgressSink,
  ) -> Result<(), SyncError> {
    match mode {
      TransferMode::Copy => {
        let from = self.source_path(source)?.to_path_buf();
        self.copy(&from, dest, progress)
      }
      TransferMode::HardLink => {
        let from = self.source_path(source)?.to_path_buf();
        self.hard_link(&from, dest, progress)
      }
      TransferMode::CacheThrough => self.cache_through(source, dest, progress),
    }
  }
}

/// Copy `from` to `to` in 64 KiB chunks, reporting cumulative progress.
fn copy_with_progress(from: &Path, to: &Path, progress: &mut dyn ProgressSink) -> io::Result<u64> {
  if let Some(parent) = to.parent() {
    fs::create_dir_all(parent)?;
  }

  let total = fs::metadata(from)?.len();
  let mut reader = fs::File::open(from)?;
  let mut writer = fs::File::create(to)?;

  let mut buffer = [0u8; 64 * 1024];
  let mut written = 0u64;

  loop {
    let read = reader.read(&mut buffer)?;
    if read == 0 {
      break;
    }
    writer.write_all(&buffer[..read])?;
    written += read as u64;
    progress.transferred(written, Some(total));
  }

  writer.flush()?;
  Ok(written)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[derive(Default)]
  struct RecordingProgress {
    calls: Vec<(u64, Option<u64>)>,
  }

  impl ProgressSink for RecordingProgress {
    fn transferred(&mut self, bytes: u64, total: Option<u64>) {
      self.calls.push((bytes, total));
    }
  }

  fn locator_for(path: &Path) -> SourceLocator {
    SourceLocator::new(path.display().to_string())
  }

  #[test]
  fn locator_canonicalizes_spelling() {
    let a = SourceLocator::new("  https://mirror.example/repo/ ");
    let b = SourceLocator::new("https://mirror.example/repo");
    assert_eq!(a, b);
    assert_eq!(a.canonical(), "https://mirror.example/repo");
  }

  #[test]
  fn copy_transfers_bytes_and_reports_progress() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source.img");
    fs::write(&source, b"image contents").unwrap();

    let dest = temp.path().join("tree/images/source.img");
    let mut progress = RecordingProgress::default();

    let mut transport = FsTransport::new();
    transport
      .transfer(&locator_for(&source), &dest, TransferMode::Copy, &mut progress)
      .unwrap();

    assert_eq!(fs::read(&dest).unwrap(), b"image contents");
    assert_eq!(progress.calls.last(), Some(&(14, Some(14))));
  }

  #[test]
  fn missing_source_is_an_error() {
    let temp = tempdir().unwrap();
    let mut transport = FsTransport::new();
    let err = transport
      .transfer(
        &locator_for(&temp.path().join("absent")),
        &temp.path().join("dest"),
        TransferMode::Copy,
        &mut NullProgress,
      )
      .unwrap_err();

    assert!(matches!(err, SyncError::SourceMissing(_)));
  }

  #[cfg(unix)]
  #[test]
  fn hard_link_shares_the_inode() {
    use std::os::unix::fs::MetadataExt;

    let temp = tempdir().unwrap();
    let source = temp.path().join("source.img");
    fs::write(&source, b"linked").unwrap();
    let dest = temp.path().join("dest.img");

    let mut transport = FsTransport::new();
    transport
      .transfer(&locator_for(&source), &dest, TransferMode::HardLink, &mut NullProgress)
      .unwrap();

    assert_eq!(fs::metadata(&source).unwrap().ino(), fs::metadata(&dest).unwrap().ino());
  }

  #[test]
  fn cache_through_populates_then_serves_from_cache() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("remote/base.img");
    fs::create_dir_all(source.parent().unwrap()).unwrap();
    fs::write(&source, b"remote bytes").unwrap();
    let locator = locator_for(&source);

    let cache = ContentCache::open(temp.path().join("cache"), 1024).unwrap();
    let mut transport = FsTransport::with_cache(cache);

    let first = temp.path().join("tree/base.img");
    transport
      .transfer(&locator, &first, TransferMode::CacheThrough, &mut NullProgress)
      .unwrap();
    assert!(transport.cache().unwrap().contains(&locator));

    // The origin disappears; the cache still serves the bytes.
    fs::remove_file(&source).unwrap();

    let second = temp.path().join("tree/base2.img");
    transport
      .transfer(&locator, &second, TransferMode::CacheThrough, &mut NullProgress)
      .unwrap();
    assert_eq!(fs::read(&second).unwrap(), b"remote bytes");
  }

  #[test]
  fn cache_through_without_cache_still_copies() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source.img");
    fs::write(&source, b"plain").unwrap();
    let dest = temp.path().join("dest.img");

    let mut transport = FsTransport::new();
    transport
      .transfer(&locator_for(&source), &dest, TransferMode::CacheThrough, &mut NullProgress)
      .unwrap();

    assert_eq!(fs::read(&dest).unwrap(), b"plain");
  }
}
