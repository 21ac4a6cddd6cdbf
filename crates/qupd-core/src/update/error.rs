//! Update failures.
//!
//! [`UpdateError`] carries the detailed cause; [`FailureKind`] is the coarse,
//! stable classification callers branch on.

use std::fmt;

use qupd_schema::{ManifestError, PackageError};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::envelope::EnvelopeError;
use crate::io::{ExtractError, SourceError};
use crate::lock::LockError;

/// Which cryptographic check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoFailure {
    /// The downloaded asset's size or sha256 differs from the manifest.
    AssetChecksumMismatch,
    BadSignature,
    KeyUnwrap,
    Decryption,
    /// The decrypted payload does not hash to the package's original hash.
    PlaintextHashMismatch,
}

/// Why the main-process compatibility gate refused the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateFailure {
    /// The update requires a main hash but the host has none.
    MainHashMissing,
    /// The host's main hash differs from the required one.
    MainHashMismatch,
}

/// Stable failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The package bytes do not decode.
    MalformedInput,
    /// The package declares a format version this client does not read.
    UnsupportedFormat,
    /// A checksum, signature or decryption check failed.
    CryptoVerification(CryptoFailure),
    /// The manifest is invalid or disagrees with the package.
    ManifestValidation,
    /// The host build is not compatible with the update.
    CompatibilityGate(GateFailure),
    /// Another attempt holds the lock or is already running.
    Concurrency,
    /// Network or filesystem trouble.
    Io,
}

impl FailureKind {
    /// Machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedInput => "malformed-input",
            Self::UnsupportedFormat => "unsupported-format",
            Self::CryptoVerification(c) => match c {
                CryptoFailure::AssetChecksumMismatch => "crypto.asset-checksum-mismatch",
                CryptoFailure::BadSignature => "crypto.bad-signature",
                CryptoFailure::KeyUnwrap => "crypto.key-unwrap",
                CryptoFailure::Decryption => "crypto.decryption",
                CryptoFailure::PlaintextHashMismatch => "crypto.plaintext-hash-mismatch",
            },
            Self::ManifestValidation => "manifest-validation",
            Self::CompatibilityGate(GateFailure::MainHashMissing) => "gate.main-hash-missing",
            Self::CompatibilityGate(GateFailure::MainHashMismatch) => "gate.main-hash-mismatch",
            Self::Concurrency => "concurrency",
            Self::Io => "io",
        }
    }

    /// Whether re-running the check can succeed without a new artifact.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io | Self::Concurrency)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Everything that can stop an update attempt.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("release source: {0}")]
    Source(#[from] SourceError),

    #[error("invalid release manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("manifest names asset {actual}, source publishes {expected}")]
    AssetNameMismatch { expected: String, actual: String },

    #[error("package version {package} does not match manifest version {manifest}")]
    VersionMismatch { manifest: String, package: String },

    #[error("downloaded asset is {actual} bytes, manifest declares {expected}")]
    AssetSize { expected: u64, actual: u64 },

    #[error("asset checksum mismatch: expected {expected}, got {actual}")]
    AssetChecksum { expected: String, actual: String },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("update requires main hash {required} but this build has none")]
    MainHashMissing { required: String },

    #[error("update requires main hash {required}, this build is {actual}")]
    MainHashMismatch { required: String, actual: String },

    #[error("an update is already running in this process")]
    Busy,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to extract update payload: {0}")]
    Extract(#[from] ExtractError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl UpdateError {
    /// Create an I/O-class error with context.
    pub fn context(ctx: &'static str, msg: impl fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        use CryptoFailure as C;
        match self {
            Self::Source(SourceError::TooLarge { .. })
            | Self::AssetSize { .. }
            | Self::AssetChecksum { .. } => FailureKind::CryptoVerification(C::AssetChecksumMismatch),
            Self::Source(_) | Self::Io(_) | Self::Context { .. } => FailureKind::Io,
            Self::Manifest(_) | Self::AssetNameMismatch { .. } | Self::VersionMismatch { .. } => {
                FailureKind::ManifestValidation
            }
            Self::Envelope(EnvelopeError::Package(PackageError::UnsupportedFormat(_))) => {
                FailureKind::UnsupportedFormat
            }
            Self::Envelope(EnvelopeError::Package(_)) => FailureKind::MalformedInput,
            Self::Envelope(EnvelopeError::Crypto(e)) => FailureKind::CryptoVerification(match e {
                CryptoError::BadSignature | CryptoError::Signing(_) => C::BadSignature,
                CryptoError::KeyUnwrap | CryptoError::KeyWrap(_) | CryptoError::KeyLength(_) => {
                    C::KeyUnwrap
                }
                CryptoError::IvLength(_)
                | CryptoError::TagLength(_)
                | CryptoError::Decryption
                | CryptoError::Encryption => C::Decryption,
                CryptoError::ChecksumMismatch { .. } => C::PlaintextHashMismatch,
            }),
            Self::MainHashMissing { .. } => FailureKind::CompatibilityGate(GateFailure::MainHashMissing),
            Self::MainHashMismatch { .. } => {
                FailureKind::CompatibilityGate(GateFailure::MainHashMismatch)
            }
            Self::Busy | Self::Lock(LockError::Held { .. } | LockError::HeldUnknown(_)) => {
                FailureKind::Concurrency
            }
            Self::Lock(LockError::Io(_)) => FailureKind::Io,
            Self::Extract(ExtractError::Io(_)) => FailureKind::Io,
            Self::Extract(_) => FailureKind::MalformedInput,
        }
    }
}
