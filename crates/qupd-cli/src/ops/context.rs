//! Resolved client settings.
//!
//! `ClientContext` turns command-line flags, `config.toml` and the
//! environment into the collaborators an [`UpdateOrchestrator`] needs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use qupd_core::config::UpdateConfig;
use qupd_core::envelope::PackageKeys;
use qupd_core::host::HostBuild;
use qupd_core::io::{ReleaseSource, source_for};
use qupd_core::update::{UpdateContext, UpdateOrchestrator};
use qupd_core::{Reporter, UpdateLayout};

/// Directory under the resource dir holding the update keys.
pub const SECURITY_DIR: &str = "security";

/// Layout plus merged configuration for one CLI invocation.
#[derive(Clone)]
pub struct ClientContext {
    pub layout: UpdateLayout,
    pub config: UpdateConfig,
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("root", &self.layout.root())
            .field("manifest_url", &self.config.manifest_url)
            .finish_non_exhaustive()
    }
}

impl ClientContext {
    /// Resolve the data directory and load its configuration.
    ///
    /// `home` and `resource_dir` override `$QUPD_HOME` and the config file.
    pub fn resolve(home: Option<&Path>, resource_dir: Option<&Path>) -> Result<Self> {
        let layout = match home {
            Some(home) => UpdateLayout::new(home),
            None => UpdateLayout::from_env().context(
                "Could not determine a data directory. Set QUPD_HOME or pass --home.",
            )?,
        };
        let mut config = UpdateConfig::load(&layout.config_path())?;
        if let Some(dir) = resource_dir {
            config.resource_dir = Some(dir.to_path_buf());
        }
        Ok(Self { layout, config })
    }

    pub fn resource_dir(&self) -> Result<&Path> {
        self.config.resource_dir.as_deref().context(
            "No resource directory configured. Pass --resource-dir or set QUPD_RESOURCE_DIR.",
        )
    }

    /// `<resources>/security`
    pub fn security_dir(&self) -> Result<PathBuf> {
        Ok(self.resource_dir()?.join(SECURITY_DIR))
    }

    /// The running build, from `<resources>/build-info.json`.
    pub fn host(&self) -> Result<HostBuild> {
        HostBuild::load(self.resource_dir()?)
    }

    /// Release source for `manifest`, falling back to the configured URL.
    pub fn source(
        &self,
        manifest: Option<&str>,
        asset_url: Option<&str>,
    ) -> Result<Arc<dyn ReleaseSource>> {
        let location = manifest
            .or(self.config.manifest_url.as_deref())
            .context("No manifest URL configured. Pass --manifest or set QUPD_MANIFEST_URL.")?;
        let asset_url = asset_url.or(self.config.asset_url.as_deref());
        let source = source_for(location, asset_url, self.config.timeout())
            .with_context(|| format!("Invalid manifest location {location}"))?;
        Ok(Arc::from(source))
    }

    /// Build an orchestrator reporting to `reporter`.
    pub fn orchestrator(
        &self,
        source: Arc<dyn ReleaseSource>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<UpdateOrchestrator> {
        let security = self.security_dir()?;
        let keys = PackageKeys::load(&security)
            .with_context(|| format!("Failed to load update keys from {}", security.display()))?;
        let ctx = UpdateContext::new(source, keys, self.host()?, self.layout.clone())
            .with_reporter(reporter)
            .with_config(&self.config);
        Ok(UpdateOrchestrator::new(ctx))
    }
}
