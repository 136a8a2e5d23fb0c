//! Process-singleton advisory lock.
//!
//! The backup directory is single-writer: a second export attempt while
//! the lock file exists must fail fast with a clear error. The lock file
//! carries the holder's pid and is removed when the guard drops.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum LockError {
    AlreadyLocked { path: PathBuf, holder: String },
    Io(std::io::Error),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::AlreadyLocked { path, holder } => write!(
                f,
                "Lock file {} already exists (held by pid {}); is another instance running?",
                path.display(),
                holder.trim()
            ),
            LockError::Io(e) => write!(f, "Lock file error: {}", e),
        }
    }
}

impl std::error::Error for LockError {}

impl From<std::io::Error> for LockError {
    fn from(err: std::io::Error) -> Self {
        LockError::Io(err)
    }
}

/// Held process lock; releases on drop.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the lock, failing fast if it is already held.
    pub fn acquire(path: &Path) -> Result<ProcessLock, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                log::debug!("acquired process lock {}", path.display());
                Ok(ProcessLock {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_string());
                Err(LockError::AlreadyLocked {
                    path: path.to_path_buf(),
                    holder,
                })
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Release explicitly; equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}
