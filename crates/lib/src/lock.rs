//! File-based build locking for mutual exclusion.
//!
//! One advisory lock per build identifier serializes whole builds: it is
//! acquired before scheduling begins and released when the guard drops,
//! success or failure. Contention is a hard error naming the holding
//! process; there is no retry or queueing — the caller retries manually.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  /// Read-only inspection of build metadata.
  Shared,

  /// A running build.
  Exclusive,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub build_id: String,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error(
    "build '{build_id}' is locked by another process: {command} (PID {pid}, started {started_at})\n\
             If you're sure no build is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    build_id: String,
    command: String,
    pid: u32,
    started_at: String,
    lock_path: PathBuf,
  },

  #[error(
    "build is locked (could not read lock metadata)\n\
             If you're sure no build is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create lock directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// Guard holding the per-build advisory lock.
///
/// The lock is released when the guard drops, whatever the build's
/// outcome.
#[derive(Debug)]
pub struct BuildLock {
  _file: File,
  lock_path: PathBuf,
}

impl BuildLock {
  /// Acquire the lock at `lock_path` without blocking.
  ///
  /// Exclusive acquisition writes metadata (pid, command, start time) so
  /// contention errors can name the holder.
  pub fn acquire(lock_path: &Path, mode: LockMode, build_id: &str, command: &str) -> Result<Self, LockError> {
    if let Some(parent) = lock_path.parent()
      && !parent.exists()
    {
      std::fs::create_dir_all(parent).map_err(LockError::CreateDir)?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(lock_path)
      .map_err(LockError::OpenFile)?;

    if let Err(err) = try_lock(&file, mode) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(Self::read_contention_error(lock_path));
      }
      return Err(LockError::LockFailed(err));
    }

    if mode == LockMode::Exclusive {
      Self::write_metadata(&file, build_id, command)?;
    }

    Ok(BuildLock {
      _file: file,
      lock_path: lock_path.to_path_buf(),
    })
  }

  /// Reads the lock metadata from the held file handle.
  ///
  /// Useful for tests and diagnostics where the caller already holds the
  /// lock and needs to verify metadata without opening a new handle.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self._file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  fn write_metadata(file: &File, build_id: &str, command: &str) -> Result<(), LockError> {
    let metadata = LockMetadata {
      version: 1,
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      command: command.to_string(),
      build_id: build_id.to_string(),
    };

    file.set_len(0).map_err(LockError::WriteMetadata)?;
    let mut writer = io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &metadata)
      .map_err(|e| LockError::WriteMetadata(io::Error::other(e)))?;
    writer.flush().map_err(LockError::WriteMetadata)?;

    Ok(())
  }

  fn read_contention_error(lock_path: &Path) -> LockError {
    if let Ok(mut file) = File::open(lock_path) {
      let mut contents = String::new();
      if file.read_to_string(&mut contents).is_ok()
        && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
      {
        let started_at = format!("Unix timestamp {}", metadata.started_at_unix);

        return LockError::Contention {
          build_id: metadata.build_id,
          command: metadata.command,
          pid: metadata.pid,
          started_at,
          lock_path: lock_path.to_path_buf(),
        };
      }
    }

    LockError::ContentionUnknown {
      lock_path: lock_path.to_path_buf(),
    }
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn lock_path(temp: &TempDir) -> PathBuf {
    temp.path().join("meta").join(".lock")
  }

  #[test]
  fn acquire_exclusive_lock() {
    let temp = TempDir::new().unwrap();
    let lock = BuildLock::acquire(&lock_path(&temp), LockMode::Exclusive, "appliance", "build").unwrap();
    assert!(lock.lock_path().exists());
  }

  #[test]
  fn multiple_shared_locks() {
    let temp = TempDir::new().unwrap();
    let path = lock_path(&temp);

    let lock1 = BuildLock::acquire(&path, LockMode::Shared, "appliance", "status").unwrap();
    let lock2 = BuildLock::acquire(&path, LockMode::Shared, "appliance", "status").unwrap();
    assert!(lock1.lock_path().exists());
    assert!(lock2.lock_path().exists());
  }

  #[test]
  fn lock_metadata_names_the_holder() {
    let temp = TempDir::new().unwrap();
    let lock = BuildLock::acquire(&lock_path(&temp), LockMode::Exclusive, "appliance", "build").unwrap();

    let metadata = lock.read_metadata().unwrap();
    assert_eq!(metadata.version, 1);
    assert_eq!(metadata.pid, std::process::id());
    assert_eq!(metadata.command, "build");
    assert_eq!(metadata.build_id, "appliance");
  }

  #[test]
  fn contention_names_the_holding_process() {
    let temp = TempDir::new().unwrap();
    let path = lock_path(&temp);

    let _held = BuildLock::acquire(&path, LockMode::Exclusive, "appliance", "build").unwrap();
    let err = BuildLock::acquire(&path, LockMode::Exclusive, "appliance", "build").unwrap_err();

    match err {
      LockError::Contention { pid, command, .. } => {
        assert_eq!(pid, std::process::id());
        assert_eq!(command, "build");
      }
      other => panic!("expected contention, got {:?}", other),
    }
  }

  #[test]
  fn lock_released_on_drop() {
    let temp = TempDir::new().unwrap();
    let path = lock_path(&temp);

    {
      let _lock = BuildLock::acquire(&path, LockMode::Exclusive, "appliance", "build").unwrap();
    }

    let lock2 = BuildLock::acquire(&path, LockMode::Exclusive, "appliance", "build").unwrap();
    assert!(lock2.lock_path().exists());
  }
}
