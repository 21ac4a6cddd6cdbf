//! Build information for the running host application.
//!
//! The release tooling writes `build-info.json` next to the packaged
//! resources; the client reads it at startup to learn its own version, build
//! time and main-process hash.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use qupd_schema::Sha256Digest;
use semver::Version;
use serde::{Deserialize, Serialize};

/// File name of the host build record.
pub const BUILD_INFO_FILE: &str = "build-info.json";

/// What the update pipeline needs to know about the running build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBuild {
    /// Host application version.
    pub version: Version,
    /// When the host was built. Updates not newer than this are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time: Option<DateTime<Utc>>,
    /// Main-process hash of the running build, if one was computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_hash: Option<Sha256Digest>,
}

impl HostBuild {
    /// A host record with only a version.
    pub fn new(version: Version) -> Self {
        Self {
            version,
            build_time: None,
            main_hash: None,
        }
    }

    /// Load `build-info.json` from `resource_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load(resource_dir: &Path) -> Result<Self> {
        let path = resource_dir.join(BUILD_INFO_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Write `build-info.json` into `resource_dir` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be written.
    pub fn save(&self, resource_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(resource_dir)?;
        let path = resource_dir.join(BUILD_INFO_FILE);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, &path).context("Failed to replace build-info.json")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostBuild {
            version: Version::new(3, 1, 0),
            build_time: Some(Utc::now()),
            main_hash: Some(Sha256Digest::compute(b"main")),
        };
        host.save(dir.path()).unwrap();
        assert_eq!(HostBuild::load(dir.path()).unwrap(), host);
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BUILD_INFO_FILE), r#"{"version":"1.0.0"}"#).unwrap();
        let host = HostBuild::load(dir.path()).unwrap();
        assert_eq!(host, HostBuild::new(Version::new(1, 0, 0)));
    }
}
