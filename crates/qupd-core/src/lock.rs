//! Cross-process update lock.
//!
//! The lock is a file created with `create_new`, holding the owner's pid and
//! acquisition time. A lock older than [`LockPolicy::max_age`] is treated as
//! abandoned and reclaimed. The guard removes the file on drop.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default age after which a lock is considered abandoned.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Why the update lock could not be taken.
#[derive(Error, Debug)]
pub enum LockError {
    /// A live holder recorded itself in the lock.
    #[error("another update is in progress (pid {pid}, since {acquired_at})")]
    Held {
        pid: u32,
        acquired_at: DateTime<Utc>,
    },

    /// The lock exists but its contents do not parse.
    #[error("update lock {} is held", .0.display())]
    HeldUnknown(PathBuf),

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process id of the holder.
    pub pid: u32,
    /// When the holder took the lock.
    pub acquired_at: DateTime<Utc>,
}

/// How contended locks are treated.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    /// Locks older than this are reclaimed.
    pub max_age: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

/// Held update lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct UpdateLock {
    path: PathBuf,
    info: LockInfo,
}

impl UpdateLock {
    /// Try to take the lock at `path` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Held`] if a live lock exists, or [`LockError::Io`]
    /// if the lock file cannot be created.
    pub fn acquire(path: &Path, policy: LockPolicy) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match Self::create(path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        if !reclaim_if_stale(path, policy)? {
            return Err(match read_info(path) {
                Some(info) => LockError::Held {
                    pid: info.pid,
                    acquired_at: info.acquired_at,
                },
                None => LockError::HeldUnknown(path.to_path_buf()),
            });
        }

        // Another process may win the race after reclamation.
        match Self::create(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(LockError::HeldUnknown(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec(&info).map_err(std::io::Error::other)?;
        if let Err(e) = file.write_all(&body) {
            let _ = std::fs::remove_file(path);
            return Err(e);
        }
        debug!(path = %path.display(), "acquired update lock");
        Ok(Self {
            path: path.to_path_buf(),
            info,
        })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What this holder wrote into the lock.
    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "released update lock"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to release update lock"),
        }
    }
}

/// Read the holder recorded in the lock at `path`, if it parses.
pub fn read_info(path: &Path) -> Option<LockInfo> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Age of the lock at `path`, from its recorded time or, if unreadable,
/// its modification time.
fn lock_age(path: &Path) -> std::io::Result<Duration> {
    if let Some(info) = read_info(path) {
        let age = Utc::now().signed_duration_since(info.acquired_at);
        return Ok(age.to_std().unwrap_or_default());
    }
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default())
}

/// Remove the lock at `path` if it is older than the policy allows.
///
/// Returns whether a lock was removed. A missing lock counts as reclaimed.
///
/// # Errors
///
/// Returns an I/O error if the lock exists but cannot be inspected or removed.
pub fn reclaim_if_stale(path: &Path, policy: LockPolicy) -> std::io::Result<bool> {
    let age = match lock_age(path) {
        Ok(age) => age,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    if age <= policy.max_age {
        return Ok(false);
    }
    warn!(
        path = %path.display(),
        age_secs = age.as_secs(),
        "reclaiming stale update lock"
    );
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}
