//! Per-layer build locks.
//!
//! Two builds of the same label would materialize phases into the same
//! staging directory. The first one to take the lock wins; the second fails
//! immediately, naming the holder.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feature::Label;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub label: String,
}

#[derive(Debug, Error)]
pub enum LayerLockError {
  #[error(
    "{label} is already being built (PID {pid}, started at unix time {started_at})\n\
             If you're sure no build is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    label: String,
    pid: u32,
    started_at: u64,
    lock_path: PathBuf,
  },

  #[error(
    "layer is locked (could not read lock metadata)\n\
             If you're sure no build is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create working directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// Held for the duration of one layer build; released on drop.
pub struct LayerLock {
  file: File,
  lock_path: PathBuf,
}

impl LayerLock {
  pub fn acquire(dir: &Path, label: &Label) -> Result<Self, LayerLockError> {
    let lock_path = dir.join(LOCK_FILENAME);
    std::fs::create_dir_all(dir).map_err(LayerLockError::CreateDir)?;

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(LayerLockError::OpenFile)?;

    if let Err(err) = try_lock_exclusive(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(Self::contention_error(&lock_path));
      }
      return Err(LayerLockError::LockFailed(err));
    }

    Self::write_metadata(&file, label)?;
    Ok(LayerLock { file, lock_path })
  }

  /// Read the metadata back through the held handle. Opening the file again
  /// would fail on Windows while the lock is held.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  fn write_metadata(file: &File, label: &Label) -> Result<(), LayerLockError> {
    let metadata = LockMetadata {
      version: 1,
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      label: label.to_string(),
    };

    file.set_len(0).map_err(LayerLockError::WriteMetadata)?;
    let mut writer = io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &metadata)
      .map_err(|e| LayerLockError::WriteMetadata(io::Error::other(e)))?;
    writer.flush().map_err(LayerLockError::WriteMetadata)?;
    Ok(())
  }

  fn contention_error(lock_path: &Path) -> LayerLockError {
    if let Ok(mut file) = File::open(lock_path) {
      let mut contents = String::new();
      if file.read_to_string(&mut contents).is_ok()
        && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
      {
        return LayerLockError::Contention {
          label: metadata.label,
          pid: metadata.pid,
          started_at: metadata.started_at_unix,
          lock_path: lock_path.to_path_buf(),
        };
      }
    }
    LayerLockError::ContentionUnknown {
      lock_path: lock_path.to_path_buf(),
    }
  }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized,
  // and the handle is owned by `file` for the duration of the call.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(
      handle,
      LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
      0,
      1,
      0,
      &mut overlapped,
    )
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

  #[test]
  fn lock_metadata_names_the_label() {
    let temp = TempDir::new().unwrap();
    let lock = LayerLock::acquire(temp.path(), &Label::new("//app:layer")).unwrap();

    let metadata = lock.read_metadata().unwrap();
    assert_eq!(metadata.version, 1);
    assert_eq!(metadata.label, "//app:layer");
    assert_eq!(metadata.pid, std::process::id());
    assert!(lock.lock_path().exists());
  }

  #[cfg(unix)]
  #[test]
  fn second_build_of_same_layer_is_refused() {
    let temp = TempDir::new().unwrap();
    let _held = LayerLock::acquire(temp.path(), &Label::new("//app:layer")).unwrap();

    let err = LayerLock::acquire(temp.path(), &Label::new("//app:layer")).err().unwrap();
    match err {
      LayerLockError::Contention { label, pid, .. } => {
        assert_eq!(label, "//app:layer");
        assert_eq!(pid, std::process::id());
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn lock_released_on_drop() {
    let temp = TempDir::new().unwrap();
    {
      let _lock = LayerLock::acquire(temp.path(), &Label::new("//app:layer")).unwrap();
    }
    LayerLock::acquire(temp.path(), &Label::new("//app:layer")).unwrap();
  }
}
