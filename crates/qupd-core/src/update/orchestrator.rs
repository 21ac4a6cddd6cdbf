//! The update state machine.
//!
//! One attempt runs manifest fetch, download, cheap size/sha256 check,
//! package verification, the main-hash gate, staging, locking and apply, in
//! that order. The fetch and the download honour cancellation; from
//! verification onward the attempt runs to a terminal state on the blocking
//! pool. Staged files live in per-attempt temp dirs and vanish on any failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use qupd_schema::{ReleaseManifest, Sha256Digest, coerce_version};
use semver::Version;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::UpdateContext;
use super::error::{FailureKind, UpdateError};
use super::state::UpdateState;
use crate::installed;
use crate::io::extract_payload;
use crate::lock::UpdateLock;
use crate::paths::{DOWNLOAD_PREFIX, STAGE_PREFIX};

/// How a finished attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update was installed at `path`.
    Applied {
        /// The version now installed.
        version: Version,
        /// Its directory under `updates/`.
        path: PathBuf,
    },
    /// The published release is not newer than `current`.
    UpToDate {
        /// Version named by the manifest.
        available: Version,
        /// Version already running or installed.
        current: Version,
    },
    /// Cancelled before verification began.
    Cancelled,
}

/// Result of a read-only [`UpdateOrchestrator::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// The manifest names a newer release.
    Available(ReleaseManifest),
    /// Nothing newer than `current` is published.
    UpToDate {
        /// The validated manifest.
        manifest: ReleaseManifest,
        /// Version already running or installed.
        current: Version,
    },
}

/// Clears the single-flight flag when an attempt ends.
struct FlightGuard(Arc<AtomicBool>);

impl FlightGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Puts the machine back to rest if the attempt future is dropped while
/// still cancellable.
struct AbandonGuard<'a>(Option<&'a Machine>);

impl AbandonGuard<'_> {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if let Some(machine) = self.0 {
            machine.abandon();
        }
    }
}

/// An asset that passed the size and checksum checks.
struct Downloaded {
    manifest: ReleaseManifest,
    version: Version,
    path: PathBuf,
    dir: tempfile::TempDir,
}

enum Fetched {
    Finished(UpdateOutcome),
    Downloaded(Downloaded),
}

/// State and collaborators shared with the non-cancellable tail of an attempt.
struct Machine {
    ctx: UpdateContext,
    state: watch::Sender<UpdateState>,
}

impl Machine {
    fn state(&self) -> UpdateState {
        self.state.borrow().clone()
    }

    fn transition(&self, next: UpdateState) {
        let current = self.state();
        if current == next {
            return;
        }
        debug_assert!(
            current.can_transition_to(&next),
            "illegal transition {current} -> {next}"
        );
        info!(from = %current, to = %next, "update state changed");
        self.ctx.reporter.state_changed(&next);
        self.state.send_replace(next);
    }

    /// Return a dropped attempt to `Idle`, or fail it where `Idle` is not
    /// a legal successor.
    fn abandon(&self) {
        let current = self.state();
        if current == UpdateState::Idle || current.is_terminal() {
            return;
        }
        warn!(state = %current, "update attempt dropped before completion");
        if current.can_transition_to(&UpdateState::Idle) {
            self.transition(UpdateState::Idle);
        } else {
            self.transition(UpdateState::Failed(FailureKind::Io));
        }
    }

    /// Record how an attempt ended.
    fn finish(&self, result: Result<UpdateOutcome, UpdateError>) -> Result<UpdateOutcome, UpdateError> {
        match result {
            Ok(UpdateOutcome::Cancelled) => {
                info!("update attempt cancelled");
                self.transition(UpdateState::Idle);
                Ok(UpdateOutcome::Cancelled)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let kind = e.kind();
                warn!(code = kind.code(), error = %e, "update attempt failed");
                self.ctx.reporter.error(&e.to_string());
                if !self.state().is_terminal() {
                    self.transition(UpdateState::Failed(kind));
                }
                Err(e)
            }
        }
    }

    /// The version the host effectively runs: the newer of the host build
    /// and the newest installed hot update.
    fn current_version(&self) -> Result<Version, UpdateError> {
        let installed = installed::latest_installed(&self.ctx.layout, &self.ctx.entry_file)?
            .and_then(|v| v.version);
        Ok(match installed {
            Some(v) if v > self.ctx.host.version => v,
            _ => self.ctx.host.version.clone(),
        })
    }

    /// Validate a fetched manifest and decide whether it is newer.
    ///
    /// Returns the current version when the manifest is not an upgrade.
    fn evaluate(&self, raw: &str) -> Result<(ReleaseManifest, Option<Version>), UpdateError> {
        let manifest = ReleaseManifest::parse_and_validate(raw)?;
        if let Some(expected) = self.ctx.source.expected_asset_name() {
            if expected != manifest.asset_name {
                return Err(UpdateError::AssetNameMismatch {
                    expected: expected.to_string(),
                    actual: manifest.asset_name.clone(),
                });
            }
        }

        let current = self.current_version()?;
        let not_newer = manifest.semver() <= current;
        let built_after = self
            .ctx
            .host
            .build_time
            .is_some_and(|built| manifest.created_at <= built);
        if not_newer || built_after {
            debug!(
                available = %manifest.version,
                %current,
                built_after,
                "release is not an upgrade"
            );
            return Ok((manifest, Some(current)));
        }
        Ok((manifest, None))
    }

    /// Manifest fetch through the size/checksum check. Cancellable.
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Fetched, UpdateError> {
        let ctx = &self.ctx;

        self.transition(UpdateState::FetchingManifest);
        let raw = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(Fetched::Finished(UpdateOutcome::Cancelled)),
            raw = ctx.source.fetch_manifest() => raw?,
        };
        let (manifest, current) = self.evaluate(&raw)?;
        self.transition(UpdateState::ManifestValidated);

        let available = manifest.semver();
        if let Some(current) = current {
            self.transition(UpdateState::UpToDate);
            return Ok(Fetched::Finished(UpdateOutcome::UpToDate { available, current }));
        }
        info!(version = %available, asset = %manifest.asset_name, "update available");

        self.transition(UpdateState::Downloading);
        let cache_dir = ctx.layout.cache_dir();
        std::fs::create_dir_all(&cache_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(DOWNLOAD_PREFIX)
            .tempdir_in(&cache_dir)?;
        let dest = dir.path().join(&manifest.asset_name);
        let asset = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(Fetched::Finished(UpdateOutcome::Cancelled)),
            asset = ctx.source.download_asset(
                &manifest.asset_name,
                &dest,
                manifest.asset_size,
                ctx.reporter.as_ref(),
            ) => asset?,
        };

        if asset.size != manifest.asset_size {
            return Err(UpdateError::AssetSize {
                expected: manifest.asset_size,
                actual: asset.size,
            });
        }
        if asset.sha256 != manifest.asset_sha256 {
            return Err(UpdateError::AssetChecksum {
                expected: manifest.asset_sha256.to_string(),
                actual: asset.sha256.to_string(),
            });
        }
        self.transition(UpdateState::SizeChecked);

        Ok(Fetched::Downloaded(Downloaded {
            manifest,
            version: available,
            path: asset.path,
            dir,
        }))
    }

    /// Verification through apply. Runs on the blocking pool and always
    /// reaches a terminal state.
    fn install(&self, downloaded: Downloaded) -> Result<UpdateOutcome, UpdateError> {
        let ctx = &self.ctx;
        let Downloaded {
            manifest,
            version,
            path,
            dir,
        } = downloaded;

        self.transition(UpdateState::Verifying);
        let bytes = std::fs::read(&path)?;
        drop(dir);
        let opened = ctx.keys.open(&bytes)?;
        drop(bytes);

        if coerce_version(&opened.package.product_version).as_ref() != Some(&version) {
            return Err(UpdateError::VersionMismatch {
                manifest: manifest.version.clone(),
                package: opened.package.product_version.clone(),
            });
        }

        let package_required = opened
            .package
            .metadata
            .as_ref()
            .and_then(|m| m.required_main_hash())
            .map(str::to_string);
        let manifest_required = manifest.required_main_hash.as_ref().map(|d| d.to_string());
        for required in package_required.iter().chain(manifest_required.iter()) {
            gate(required, ctx.host.main_hash.as_ref())?;
        }
        self.transition(UpdateState::HashGated);

        self.transition(UpdateState::Staging);
        let staging_root = ctx.layout.staging_root();
        std::fs::create_dir_all(&staging_root)?;
        let staged = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .tempdir_in(&staging_root)?;
        let files = extract_payload(&opened.plaintext, staged.path())?;
        if !staged.path().join(&ctx.entry_file).is_file() {
            warn!(entry_file = %ctx.entry_file, "staged update has no entry file");
        }
        debug!(files, dir = %staged.path().display(), "update staged");

        let lock = UpdateLock::acquire(&ctx.layout.lock_path(), ctx.lock_policy)?;
        self.transition(UpdateState::LockAcquired);

        self.transition(UpdateState::Applying);
        let target = ctx.layout.version_dir(&version.to_string());
        apply(staged.path(), &target)?;
        match installed::cleanup(&ctx.layout, ctx.retain, &ctx.entry_file, ctx.lock_policy) {
            Ok(report) => debug!(?report, "retention cleanup finished"),
            Err(e) => warn!(error = %e, "retention cleanup failed"),
        }
        drop(lock);

        self.transition(UpdateState::Applied);
        info!(%version, path = %target.display(), "update applied");
        Ok(UpdateOutcome::Applied {
            version,
            path: target,
        })
    }
}

/// Drives update attempts for one host.
pub struct UpdateOrchestrator {
    machine: Arc<Machine>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for UpdateOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateOrchestrator")
            .field("state", &self.state())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl UpdateOrchestrator {
    /// Orchestrator at rest in `Idle`.
    pub fn new(ctx: UpdateContext) -> Self {
        let (state, _) = watch::channel(UpdateState::Idle);
        Self {
            machine: Arc::new(Machine { ctx, state }),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The collaborators this orchestrator was built with.
    pub fn context(&self) -> &UpdateContext {
        &self.machine.ctx
    }

    /// Current state.
    pub fn state(&self) -> UpdateState {
        self.machine.state()
    }

    /// Receive every state transition.
    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.machine.state.subscribe()
    }

    /// Fetch and validate the manifest without downloading or changing state.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Source`] if the manifest cannot be fetched and
    /// a manifest validation error if it is invalid.
    pub async fn check(&self) -> Result<Availability, UpdateError> {
        let raw = self.machine.ctx.source.fetch_manifest().await?;
        let (manifest, current) = self.machine.evaluate(&raw)?;
        Ok(match current {
            Some(current) => Availability::UpToDate { manifest, current },
            None => Availability::Available(manifest),
        })
    }

    /// Run one full update attempt.
    ///
    /// Only one attempt runs at a time per orchestrator; a concurrent call
    /// fails with [`UpdateError::Busy`] without disturbing the running one.
    /// Cancelling `cancel` during the manifest fetch or download returns the
    /// machine to `Idle` and yields [`UpdateOutcome::Cancelled`]. Dropping the
    /// returned future at that point also returns it to `Idle`. Once
    /// verification starts the attempt finishes on its own even if the
    /// future is dropped.
    ///
    /// # Errors
    ///
    /// Any failure moves the machine to `Failed(kind)` with
    /// `kind == err.kind()` and returns the error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<UpdateOutcome, UpdateError> {
        let Some(flight) = FlightGuard::try_acquire(&self.running) else {
            warn!("update attempt rejected: another attempt is running");
            return Err(UpdateError::Busy);
        };

        if self.state().is_terminal() {
            self.machine.transition(UpdateState::Idle);
        }

        let mut abandon = AbandonGuard(Some(self.machine.as_ref()));
        let fetched = self.machine.fetch(&cancel).await;
        abandon.disarm();

        let downloaded = match fetched {
            Ok(Fetched::Downloaded(downloaded)) => downloaded,
            Ok(Fetched::Finished(outcome)) => return self.machine.finish(Ok(outcome)),
            Err(e) => return self.machine.finish(Err(e)),
        };
        if cancel.is_cancelled() {
            info!("cancellation ignored: verification is starting");
        }

        let machine = Arc::clone(&self.machine);
        let task = tokio::task::spawn_blocking(move || {
            let _flight = flight;
            let result = machine.install(downloaded);
            machine.finish(result)
        });
        match task.await {
            Ok(result) => result,
            Err(e) => self
                .machine
                .finish(Err(UpdateError::context("update task failed", e))),
        }
    }
}

/// Check one required main hash against the host's.
fn gate(required: &str, host: Option<&Sha256Digest>) -> Result<(), UpdateError> {
    let Some(host) = host else {
        return Err(UpdateError::MainHashMissing {
            required: required.to_string(),
        });
    };
    if !host.as_str().eq_ignore_ascii_case(required.trim()) {
        return Err(UpdateError::MainHashMismatch {
            required: required.to_string(),
            actual: host.to_string(),
        });
    }
    Ok(())
}

/// Move a staged directory into place.
///
/// A previous copy of the same version is removed first. Both paths are
/// under `updates/`, so the rename stays on one filesystem.
fn apply(staged: &Path, target: &Path) -> std::io::Result<()> {
    if target.exists() {
        warn!(path = %target.display(), "replacing existing install of this version");
        std::fs::remove_dir_all(target)?;
    }
    std::fs::rename(staged, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_distinguishes_missing_and_mismatch() {
        let host = Sha256Digest::compute(b"main");
        assert!(gate(host.as_str(), Some(&host)).is_ok());
        assert!(gate(&host.as_str().to_uppercase(), Some(&host)).is_ok());
        assert!(matches!(
            gate(host.as_str(), None),
            Err(UpdateError::MainHashMissing { .. })
        ));
        assert!(matches!(
            gate(&"0".repeat(64), Some(&host)),
            Err(UpdateError::MainHashMismatch { .. })
        ));
    }

    #[test]
    fn flight_guard_is_exclusive() {
        let flag = Arc::new(AtomicBool::new(false));
        let first = FlightGuard::try_acquire(&flag).unwrap();
        assert!(FlightGuard::try_acquire(&flag).is_none());
        drop(first);
        assert!(FlightGuard::try_acquire(&flag).is_some());
    }
}
