//! Everything one update attempt needs, built once at startup.

use std::fmt;
use std::sync::Arc;

use crate::config::UpdateConfig;
use crate::envelope::PackageKeys;
use crate::host::HostBuild;
use crate::io::ReleaseSource;
use crate::lock::LockPolicy;
use crate::paths::UpdateLayout;
use crate::reporter::{NullReporter, Reporter};

/// Groups the collaborators of the update pipeline.
#[derive(Clone)]
pub struct UpdateContext {
    /// Where the manifest and asset come from.
    pub source: Arc<dyn ReleaseSource>,
    /// Keys that open packages.
    pub keys: PackageKeys,
    /// The running host build.
    pub host: HostBuild,
    /// Data directory layout.
    pub layout: UpdateLayout,
    /// Receives state changes and progress.
    pub reporter: Arc<dyn Reporter>,
    /// Installed versions kept after a successful apply.
    pub retain: usize,
    /// File an installed version must contain.
    pub entry_file: String,
    /// When a held lock counts as stale.
    pub lock_policy: LockPolicy,
}

impl fmt::Debug for UpdateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateContext")
            .field("host", &self.host)
            .field("layout", &self.layout)
            .field("retain", &self.retain)
            .finish_non_exhaustive()
    }
}

impl UpdateContext {
    /// Context with default settings and a [`NullReporter`].
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        keys: PackageKeys,
        host: HostBuild,
        layout: UpdateLayout,
    ) -> Self {
        let defaults = UpdateConfig::default();
        Self {
            source,
            keys,
            host,
            layout,
            reporter: Arc::new(NullReporter),
            retain: defaults.retain,
            lock_policy: defaults.lock_policy(),
            entry_file: defaults.entry_file,
        }
    }

    /// Send progress to `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Take retention, entry file and lock settings from `config`.
    pub fn with_config(mut self, config: &UpdateConfig) -> Self {
        self.retain = config.retain;
        self.entry_file = config.entry_file.clone();
        self.lock_policy = config.lock_policy();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalSource;
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use semver::Version;

    fn context() -> UpdateContext {
        let key = RsaPrivateKey::new(&mut rsa::rand_core::OsRng, 1024).unwrap();
        UpdateContext::new(
            Arc::new(LocalSource::new("release")),
            PackageKeys::new(RsaPublicKey::from(&key), key),
            HostBuild::new(Version::new(1, 0, 0)),
            UpdateLayout::new("home"),
        )
    }

    #[test]
    fn new_uses_config_defaults() {
        let ctx = context();
        let defaults = UpdateConfig::default();
        assert_eq!(ctx.retain, defaults.retain);
        assert_eq!(ctx.entry_file, defaults.entry_file);
        assert_eq!(ctx.lock_policy.max_age, defaults.lock_policy().max_age);
    }

    #[test]
    fn with_config_overrides_settings() {
        let config = UpdateConfig {
            retain: 5,
            entry_file: "main.js".into(),
            lock_max_age_secs: 10,
            ..UpdateConfig::default()
        };
        let ctx = context().with_config(&config);
        assert_eq!(ctx.retain, 5);
        assert_eq!(ctx.entry_file, "main.js");
        assert_eq!(ctx.lock_policy.max_age.as_secs(), 10);
    }
}
