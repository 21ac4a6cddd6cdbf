//! Client configuration.
//!
//! Read from `$QUPD_HOME/config.toml`, then overridden by `QUPD_*`
//! environment variables. A missing file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::lock::{DEFAULT_MAX_AGE, LockPolicy};

pub const ENV_MANIFEST_URL: &str = "QUPD_MANIFEST_URL";
pub const ENV_ASSET_URL: &str = "QUPD_ASSET_URL";
pub const ENV_RESOURCE_DIR: &str = "QUPD_RESOURCE_DIR";

/// Update client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdateConfig {
    /// URL or local path of the release manifest.
    pub manifest_url: Option<String>,
    /// URL of the release asset. Defaults to `asset_name` resolved against
    /// the manifest URL.
    pub asset_url: Option<String>,
    /// Packaged resources directory (holds `security/` and `build-info.json`).
    pub resource_dir: Option<PathBuf>,
    /// Installed versions kept by retention cleanup.
    pub retain: usize,
    /// File that must exist in an installed version for it to count.
    pub entry_file: String,
    /// Seconds after which an update lock is treated as abandoned.
    pub lock_max_age_secs: u64,
    /// HTTP timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            manifest_url: None,
            asset_url: None,
            resource_dir: None,
            retain: 2,
            entry_file: "index.html".to_string(),
            lock_max_age_secs: DEFAULT_MAX_AGE.as_secs(),
            timeout_secs: 60,
        }
    }
}

impl UpdateConfig {
    /// Load `path` if it exists and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load `path` without consulting the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Override fields from `lookup`. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get(ENV_MANIFEST_URL) {
            self.manifest_url = Some(url);
        }
        if let Some(url) = get(ENV_ASSET_URL) {
            self.asset_url = Some(url);
        }
        if let Some(dir) = get(ENV_RESOURCE_DIR) {
            self.resource_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            max_age: Duration::from_secs(self.lock_max_age_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpdateConfig::load_file(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, UpdateConfig::default());
        assert_eq!(config.lock_policy().max_age, DEFAULT_MAX_AGE);
    }

    #[test]
    fn file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "manifest_url = \"https://example.com/latest.yml\"\nretain = 3\n",
        )
        .unwrap();

        let mut config = UpdateConfig::load_file(&path).unwrap();
        assert_eq!(config.retain, 3);
        assert_eq!(config.entry_file, "index.html");

        config.apply_env(|key| match key {
            ENV_MANIFEST_URL => Some("https://mirror.example.com/latest.yml".into()),
            ENV_ASSET_URL => Some("  ".into()),
            _ => None,
        });
        assert_eq!(
            config.manifest_url.as_deref(),
            Some("https://mirror.example.com/latest.yml")
        );
        assert_eq!(config.asset_url, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "manifest = \"x\"\n").unwrap();
        assert!(UpdateConfig::load_file(&path).is_err());
    }
}
