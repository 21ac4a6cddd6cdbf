//! States of one update attempt and the legal moves between them.

use std::fmt;

use super::error::FailureKind;

/// Where an update attempt currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpdateState {
    /// No attempt in progress.
    #[default]
    Idle,
    /// Waiting on the release manifest.
    FetchingManifest,
    /// The manifest parsed and names a newer release.
    ManifestValidated,
    /// Nothing newer than what is already running or installed.
    UpToDate,
    /// Streaming the asset into the download cache.
    Downloading,
    /// The asset matches the manifest's size and sha256.
    SizeChecked,
    /// Checking the package signature and decrypting the payload.
    Verifying,
    /// The main-hash gate passed.
    HashGated,
    /// Extracting the payload into a private staging dir.
    Staging,
    /// This process holds the update lock.
    LockAcquired,
    /// Moving the staged files into `updates/<version>`.
    Applying,
    /// The new version is installed.
    Applied,
    /// The attempt stopped with this failure.
    Failed(FailureKind),
}

impl UpdateState {
    /// Whether the attempt has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::UpToDate | Self::Applied | Self::Failed(_))
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Every non-terminal state may fail. Cancellation returns the manifest
    /// fetch and the download to `Idle`. A finished attempt may start over.
    pub fn can_transition_to(&self, next: &UpdateState) -> bool {
        use UpdateState::*;
        if let Failed(_) = next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, FetchingManifest)
                | (FetchingManifest, ManifestValidated)
                | (FetchingManifest, Idle)
                | (ManifestValidated, UpToDate)
                | (ManifestValidated, Downloading)
                | (Downloading, SizeChecked)
                | (Downloading, Idle)
                | (SizeChecked, Verifying)
                | (Verifying, HashGated)
                | (HashGated, Staging)
                | (Staging, LockAcquired)
                | (LockAcquired, Applying)
                | (Applying, Applied)
                | (UpToDate, Idle)
                | (Applied, Idle)
                | (Failed(_), Idle)
        )
    }

    /// Short stable name, for logs and progress output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::FetchingManifest => "fetching-manifest",
            Self::ManifestValidated => "manifest-validated",
            Self::UpToDate => "up-to-date",
            Self::Downloading => "downloading",
            Self::SizeChecked => "size-checked",
            Self::Verifying => "verifying",
            Self::HashGated => "hash-gated",
            Self::Staging => "staging",
            Self::LockAcquired => "lock-acquired",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "failed ({})", kind.code()),
            other => f.write_str(other.name()),
        }
    }
}
