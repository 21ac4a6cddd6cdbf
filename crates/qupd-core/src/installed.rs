//! Installed hot updates under `updates/`.
//!
//! Version directories are ranked by semver when their names coerce to one,
//! otherwise by modification time. A directory only counts as installed when
//! it contains the entry file.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use qupd_schema::coerce_version;
use semver::Version;
use tracing::{debug, info, warn};

use crate::lock::{self, LockPolicy};
use crate::paths::{DOWNLOAD_PREFIX, STAGE_PREFIX, UpdateLayout};

/// One directory under `updates/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledVersion {
    pub name: String,
    pub path: PathBuf,
    /// Semver coerced from the directory name, if any.
    pub version: Option<Version>,
    pub modified: SystemTime,
    /// Whether the entry file exists.
    pub complete: bool,
}

/// Newest first: semver-named dirs before others, then by version, then mtime.
fn newest_first(a: &InstalledVersion, b: &InstalledVersion) -> Ordering {
    match (&a.version, &b.version) {
        (Some(va), Some(vb)) => vb.cmp(va).then(b.modified.cmp(&a.modified)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.modified.cmp(&a.modified),
    }
}

/// List version directories, newest first. Hidden entries such as
/// `.staging` are skipped; a missing `updates/` dir yields nothing.
///
/// # Errors
///
/// Returns an I/O error if `updates/` exists but cannot be read.
pub fn list_installed(
    layout: &UpdateLayout,
    entry_file: &str,
) -> std::io::Result<Vec<InstalledVersion>> {
    let dir = layout.updates_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push(InstalledVersion {
            version: coerce_version(&name),
            complete: path.join(entry_file).is_file(),
            name,
            path,
            modified,
        });
    }
    found.sort_by(newest_first);
    Ok(found)
}

/// The newest complete installed version.
///
/// # Errors
///
/// Returns an I/O error if `updates/` cannot be read.
pub fn latest_installed(
    layout: &UpdateLayout,
    entry_file: &str,
) -> std::io::Result<Option<InstalledVersion>> {
    let latest = list_installed(layout, entry_file)?
        .into_iter()
        .find(|v| v.complete);
    debug!(latest = ?latest.as_ref().map(|v| &v.name), "resolved latest installed update");
    Ok(latest)
}

/// What [`cleanup`] removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub kept: Vec<String>,
    pub removed_versions: Vec<String>,
    pub removed_files: usize,
    pub reclaimed_lock: bool,
}

/// A per-attempt dir young enough that its attempt may still be running.
fn in_flight(path: &Path, max_age: Duration) -> bool {
    let attempt = path.file_name().is_some_and(|name| {
        let name = name.to_string_lossy();
        name.starts_with(STAGE_PREFIX) || name.starts_with(DOWNLOAD_PREFIX)
    });
    if !attempt {
        return false;
    }
    let age = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| SystemTime::now().duration_since(modified).unwrap_or_default());
    match age {
        Ok(age) => age <= max_age,
        Err(_) => false,
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Prune `updates/` and the download cache.
///
/// Keeps the newest `retain` complete versions (at least one), removes
/// incomplete version dirs, leftover `*.tar.gz` files and staging dirs,
/// and empties the download cache apart from the lock file. Attempt dirs
/// younger than the lock's `max_age` belong to a running attempt, possibly
/// in another process, and are left alone. A stale lock
/// is reclaimed. Callers should hold the update lock.
///
/// # Errors
///
/// Returns an I/O error if a directory cannot be listed. Failures to remove
/// individual entries are logged and skipped.
pub fn cleanup(
    layout: &UpdateLayout,
    retain: usize,
    entry_file: &str,
    policy: LockPolicy,
) -> std::io::Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let retain = retain.max(1);

    let mut complete = 0;
    for installed in list_installed(layout, entry_file)? {
        if installed.complete && complete < retain {
            complete += 1;
            report.kept.push(installed.name);
            continue;
        }
        match std::fs::remove_dir_all(&installed.path) {
            Ok(()) => {
                info!(version = %installed.name, complete = installed.complete, "removed installed update");
                report.removed_versions.push(installed.name);
            }
            Err(e) => warn!(path = %installed.path.display(), error = %e, "failed to remove update dir"),
        }
    }

    let updates = layout.updates_dir();
    if updates.is_dir() {
        for entry in std::fs::read_dir(&updates)? {
            let path = entry?.path();
            if path.to_string_lossy().ends_with(".tar.gz") {
                match remove_path(&path) {
                    Ok(()) => report.removed_files += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove leftover archive"),
                }
            }
        }
    }

    let lock_path = layout.lock_path();
    for dir in [layout.staging_root(), layout.cache_dir()] {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            if path == lock_path {
                continue;
            }
            if in_flight(&path, policy.max_age) {
                debug!(path = %path.display(), "keeping in-flight attempt dir");
                continue;
            }
            match remove_path(&path) {
                Ok(()) => report.removed_files += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove cached file"),
            }
        }
    }

    if lock_path.exists() {
        report.reclaimed_lock = lock::reclaim_if_stale(&lock_path, policy)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn install(layout: &UpdateLayout, name: &str, complete: bool) {
        let dir = layout.version_dir(name);
        fs::create_dir_all(&dir).unwrap();
        if complete {
            fs::write(dir.join("index.html"), name).unwrap();
        }
    }

    #[test]
    fn latest_prefers_semver() {
        let root = tempfile::tempdir().unwrap();
        let layout = UpdateLayout::new(root.path());
        assert_eq!(latest_installed(&layout, "index.html").unwrap(), None);

        install(&layout, "1.10.0", true);
        install(&layout, "1.9.0", true);
        install(&layout, "2.0.0", false);
        install(&layout, "nightly", true);
        fs::create_dir_all(layout.staging_root().join("tmp")).unwrap();

        let latest = latest_installed(&layout, "index.html").unwrap().unwrap();
        assert_eq!(latest.name, "1.10.0");
        assert_eq!(latest.version, Some(Version::new(1, 10, 0)));
    }

    #[test]
    fn latest_falls_back_to_mtime() {
        let root = tempfile::tempdir().unwrap();
        let layout = UpdateLayout::new(root.path());
        install(&layout, "alpha", true);
        std::thread::sleep(std::time::Duration::from_millis(20));
        install(&layout, "beta", true);
        let latest = latest_installed(&layout, "index.html").unwrap().unwrap();
        assert_eq!(latest.name, "beta");
    }

    #[test]
    fn cleanup_retains_newest() {
        let root = tempfile::tempdir().unwrap();
        let layout = UpdateLayout::new(root.path());
        for v in ["1.0.0", "1.1.0", "1.2.0"] {
            install(&layout, v, true);
        }
        install(&layout, "1.3.0", false);
        fs::write(layout.updates_dir().join("1.2.0.tar.gz"), b"x").unwrap();
        fs::create_dir_all(layout.cache_dir().join("attempt")).unwrap();
        fs::write(layout.lock_path(), b"{}").unwrap();

        let report = cleanup(&layout, 2, "index.html", LockPolicy::default()).unwrap();
        assert_eq!(report.kept, vec!["1.2.0", "1.1.0"]);
        assert_eq!(report.removed_versions.len(), 2);
        assert!(!layout.version_dir("1.0.0").exists());
        assert!(!layout.version_dir("1.3.0").exists());
        assert!(!layout.updates_dir().join("1.2.0.tar.gz").exists());
        assert!(!layout.cache_dir().join("attempt").exists());
        assert!(layout.lock_path().exists());
        assert!(!report.reclaimed_lock);
    }

    #[test]
    fn cleanup_spares_running_attempts() {
        let root = tempfile::tempdir().unwrap();
        let layout = UpdateLayout::new(root.path());
        install(&layout, "1.0.0", true);
        let stage = layout.staging_root().join("stage-otherproc");
        let download = layout.cache_dir().join("download-otherproc");
        fs::create_dir_all(&stage).unwrap();
        fs::create_dir_all(&download).unwrap();
        fs::write(download.join("update.bin"), b"partial").unwrap();

        cleanup(&layout, 2, "index.html", LockPolicy::default()).unwrap();
        assert!(stage.exists());
        assert!(download.join("update.bin").exists());

        let eager = LockPolicy {
            max_age: Duration::ZERO,
        };
        std::thread::sleep(Duration::from_millis(20));
        cleanup(&layout, 2, "index.html", eager).unwrap();
        assert!(!stage.exists());
        assert!(!download.exists());
        assert!(layout.version_dir("1.0.0").exists());
    }
}
