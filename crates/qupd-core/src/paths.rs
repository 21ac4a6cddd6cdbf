use std::path::{Path, PathBuf};

use dirs::data_dir;

/// Prefix of a per-attempt extraction dir under [`UpdateLayout::staging_root`].
pub const STAGE_PREFIX: &str = "stage-";
/// Prefix of a per-attempt download dir under [`UpdateLayout::cache_dir`].
pub const DOWNLOAD_PREFIX: &str = "download-";

/// Returns the qupd data directory, or None if no data directory can be resolved.
///
/// `QUPD_HOME` takes precedence over the platform data directory.
pub fn try_qupd_home() -> Option<PathBuf> {
    if let Some(val) = std::env::var_os("QUPD_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(val));
    }
    data_dir().map(|d| d.join("qupd"))
}

/// On-disk layout of installed updates under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLayout {
    root: PathBuf,
}

impl UpdateLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout rooted at [`try_qupd_home`].
    pub fn from_env() -> Option<Self> {
        try_qupd_home().map(Self::new)
    }

    /// The data directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Installed versions: `<root>/updates`
    pub fn updates_dir(&self) -> PathBuf {
        self.root.join("updates")
    }

    /// One installed version: `<root>/updates/<version>`
    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.updates_dir().join(version)
    }

    /// Extraction area, same volume as `updates/`: `<root>/updates/.staging`
    pub fn staging_root(&self) -> PathBuf {
        self.updates_dir().join(".staging")
    }

    /// Download scratch space: `<root>/update-cache`
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("update-cache")
    }

    /// `<root>/update-cache/update.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.cache_dir().join("update.lock")
    }

    /// `<root>/config.toml`
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = UpdateLayout::new("/data/qupd");
        assert_eq!(layout.version_dir("1.2.3"), Path::new("/data/qupd/updates/1.2.3"));
        assert_eq!(layout.staging_root(), Path::new("/data/qupd/updates/.staging"));
        assert_eq!(layout.lock_path(), Path::new("/data/qupd/update-cache/update.lock"));
    }
}
