//! Advisory locking of the layer store.
//!
//! `build` and `plan` take the lock shared: any number of them may read and
//! publish layers at once, since a published layer never changes. `gc` takes
//! it exclusively and records who it is in the lock file, so a build that
//! finds the store busy can say which collection is running.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  /// Readers and publishers of layers.
  Shared,
  /// Garbage collection.
  Exclusive,
}

/// Who holds the exclusive lock; written into the lock file by `gc`.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub since_unix: u64,
  pub command: String,
  pub store: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error("store is being collected by '{command}' (PID {pid}, since unix time {since_unix}); retry when it finishes")]
  Collecting { command: String, pid: u32, since_unix: u64 },

  #[error("store is in use by a running build or plan; retry when it finishes")]
  InUse,

  #[error("store is locked by another process; if none is running, delete {0}")]
  Stale(PathBuf),

  #[error("cannot {action} {path}: {source}")]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_error<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> StoreLockError + 'a {
  move |source| StoreLockError::Io {
    action,
    path: path.to_path_buf(),
    source,
  }
}

/// A held store lock. Dropping it closes the file, which releases the lock.
pub struct StoreLock {
  file: File,
  path: PathBuf,
}

impl StoreLock {
  /// Take the store lock without waiting. `command` names the holder in errors.
  pub fn acquire(store: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    std::fs::create_dir_all(store).map_err(io_error("create", store))?;
    let path = store.join(LOCK_FILENAME);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(io_error("open", &path))?;

    match try_lock(&file, mode) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Err(busy(&path, mode)),
      Err(err) => return Err(io_error("lock", &path)(err)),
    }

    let lock = StoreLock { file, path };
    if mode == LockMode::Exclusive {
      lock.record_holder(command, store)?;
    }
    debug!(command, ?mode, store = ?store, "store lock acquired");
    Ok(lock)
  }

  /// The holder recorded in the lock file, read through the held handle.
  pub fn holder(&self) -> io::Result<LockHolder> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn record_holder(&self, command: &str, store: &Path) -> Result<(), StoreLockError> {
    let holder = LockHolder {
      pid: std::process::id(),
      since_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      command: command.to_string(),
      store: store.to_path_buf(),
    };
    let json = serde_json::to_vec_pretty(&holder).map_err(|e| io_error("write", &self.path)(io::Error::other(e)))?;

    let mut file = &self.file;
    file.set_len(0).map_err(io_error("truncate", &self.path))?;
    file.seek(SeekFrom::Start(0)).map_err(io_error("write", &self.path))?;
    file.write_all(&json).map_err(io_error("write", &self.path))?;
    file.flush().map_err(io_error("write", &self.path))
  }
}

/// Why `mode` could not be taken right now.
///
/// A blocked exclusive request means builds hold the lock. A blocked shared
/// request means a collection does, and it left its details in the file.
fn busy(path: &Path, mode: LockMode) -> StoreLockError {
  if mode == LockMode::Exclusive {
    return StoreLockError::InUse;
  }
  let holder = std::fs::read_to_string(path)
    .ok()
    .and_then(|contents| serde_json::from_str::<LockHolder>(&contents).ok());
  match holder {
    Some(h) => StoreLockError::Collecting {
      command: h.command,
      pid: h.pid,
      since_unix: h.since_unix,
    },
    None => StoreLockError::Stale(path.to_path_buf()),
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
  flock(file.as_fd(), operation).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn try_lock(_file: &File, _mode: LockMode) -> io::Result<()> {
  Ok(())
}
