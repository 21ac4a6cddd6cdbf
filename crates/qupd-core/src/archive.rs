//! Detached Ed25519 signatures for packaged application archives.
//!
//! The signer hashes an archive with SHA-256 and signs the raw 32-byte digest,
//! writing the base64 signature plus a newline to `<archive>.sig`. The
//! verifier recomputes the digest and checks it against the first public key
//! it can find.
//!
//! Verification runs in one of two modes. [`VerificationMode::Advisory`]
//! logs failures and lets the caller continue; [`VerificationMode::Strict`]
//! turns a missing key, a missing signature or a bad signature into an error.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use qupd_schema::Sha256Digest;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;
use zeroize::Zeroizing;

use crate::keys::{self, KeyError, PemKeyPair};

/// Inline PEM for the verification public key.
pub const ENV_PUBLIC_KEY_PEM: &str = "QUPD_ARCHIVE_PUBKEY_PEM";
/// Path to the verification public key.
pub const ENV_PUBLIC_KEY_PATH: &str = "QUPD_ARCHIVE_PUBKEY_PATH";
/// Inline PEM for the signing private key.
pub const ENV_PRIVATE_KEY_PEM: &str = "QUPD_ARCHIVE_PRIVKEY_PEM";
/// Path to the signing private key.
pub const ENV_PRIVATE_KEY_PATH: &str = "QUPD_ARCHIVE_PRIVKEY_PATH";
/// Set to `1` to force strict verification.
pub const ENV_VERIFY_STRICT: &str = "QUPD_VERIFY_STRICT";

/// Default archive extension scanned for by [`find_archives`].
pub const DEFAULT_ARCHIVE_EXTENSION: &str = "asar";
/// Maximum directory depth scanned by [`find_archives`].
pub const MAX_SCAN_DEPTH: usize = 5;

/// Errors from signing or verifying archives.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// No verification key is configured.
    #[error("no archive public key found (packaged, $QUPD_ARCHIVE_PUBKEY_PATH or $QUPD_ARCHIVE_PUBKEY_PEM)")]
    MissingPublicKey,

    /// No signing key is configured and dev key generation was not requested.
    #[error(
        "no archive signing key: set $QUPD_ARCHIVE_PRIVKEY_PEM or $QUPD_ARCHIVE_PRIVKEY_PATH, or pass --generate-dev-key"
    )]
    MissingSigningKey,

    /// The archive has no `.sig` sidecar.
    #[error("signature file missing: {}", .0.display())]
    MissingSignature(PathBuf),

    /// The sidecar is not base64 of a 64-byte signature.
    #[error("signature file is malformed: {}", .0.display())]
    MalformedSignature(PathBuf),

    /// The signature does not match the archive.
    #[error("signature does not match archive: {}", .0.display())]
    SignatureMismatch(PathBuf),

    /// Key material could not be loaded.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Reading the archive or writing the sidecar failed.
    #[error("{}: {source}", path.display())]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `<archive>.sig`
pub fn signature_path(archive: &Path) -> PathBuf {
    let mut name = OsString::from(archive.as_os_str());
    name.push(".sig");
    PathBuf::from(name)
}

/// Find files with `extension` under `root`, at most [`MAX_SCAN_DEPTH`]
/// directories deep, in sorted order.
pub fn find_archives(root: &Path, extension: &str) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(MAX_SCAN_DEPTH + 1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        })
        .map(walkdir::DirEntry::into_path)
        .collect();
    found.sort();
    found
}

/// Signs archives with an Ed25519 key.
pub struct ArchiveSigner {
    key: SigningKey,
}

impl std::fmt::Debug for ArchiveSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSigner")
            .field("public", &self.key.verifying_key())
            .finish_non_exhaustive()
    }
}

impl ArchiveSigner {
    /// Wrap a signing key.
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Parse a PKCS#8 PEM private key.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Key`] if the PEM is not an Ed25519 key.
    pub fn from_pem(pem: &str) -> Result<Self, ArchiveError> {
        Ok(Self::new(keys::ed25519_private_from_pem(pem)?))
    }

    /// The matching verification key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Sign `archive`, writing `<archive>.sig` and removing any legacy
    /// `<archive>.sha256` sidecar.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the archive cannot be read or the
    /// sidecar cannot be written.
    pub fn sign(&self, archive: &Path) -> Result<PathBuf, ArchiveError> {
        let digest = Sha256Digest::compute_file(archive).map_err(io_err(archive))?;
        let signature = self.key.sign(&digest.to_bytes());
        let encoded = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        let sig_path = signature_path(archive);
        std::fs::write(&sig_path, format!("{encoded}\n")).map_err(io_err(&sig_path))?;
        info!(archive = %archive.display(), "wrote archive signature");

        let mut legacy = OsString::from(archive.as_os_str());
        legacy.push(".sha256");
        let legacy = PathBuf::from(legacy);
        if legacy.exists() {
            std::fs::remove_file(&legacy).map_err(io_err(&legacy))?;
            info!(path = %legacy.display(), "removed legacy checksum sidecar");
        }
        Ok(sig_path)
    }
}

/// Where the signer's private key comes from.
///
/// Resolution order: inline PEM, then PEM path, then (only when explicitly
/// allowed) a development keypair under `dev_key_dir`, generated if absent.
pub struct SignerKeyLookup {
    /// Inline PEM, usually from [`ENV_PRIVATE_KEY_PEM`].
    pub pem: Option<Zeroizing<String>>,
    /// PEM path, usually from [`ENV_PRIVATE_KEY_PATH`].
    pub path: Option<PathBuf>,
    /// Directory holding the development keypair.
    pub dev_key_dir: PathBuf,
    /// Whether a development keypair may be used or created.
    pub allow_dev_key: bool,
}

impl std::fmt::Debug for SignerKeyLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerKeyLookup")
            .field("path", &self.path)
            .field("dev_key_dir", &self.dev_key_dir)
            .field("allow_dev_key", &self.allow_dev_key)
            .finish_non_exhaustive()
    }
}

impl SignerKeyLookup {
    /// Read the inline PEM and path from the environment.
    pub fn from_env(dev_key_dir: PathBuf, allow_dev_key: bool) -> Self {
        Self {
            pem: std::env::var(ENV_PRIVATE_KEY_PEM)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(Zeroizing::new),
            path: std::env::var_os(ENV_PRIVATE_KEY_PATH)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            dev_key_dir,
            allow_dev_key,
        }
    }

    /// Resolve to a signer.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::MissingSigningKey`] when nothing is configured
    /// and dev keys are not allowed, or a key error if loading fails.
    pub fn resolve(&self) -> Result<ArchiveSigner, ArchiveError> {
        if let Some(pem) = &self.pem {
            return ArchiveSigner::from_pem(pem);
        }
        if let Some(path) = &self.path {
            return ArchiveSigner::from_pem(&keys::read_pem(path)?);
        }
        if !self.allow_dev_key {
            return Err(ArchiveError::MissingSigningKey);
        }

        let private_path = self.dev_key_dir.join(keys::ARCHIVE_PRIVATE_KEY);
        let public_path = self.dev_key_dir.join(keys::ARCHIVE_PUBLIC_KEY);
        if !private_path.is_file() || !public_path.is_file() {
            for stale in [&private_path, &public_path] {
                if stale.exists() {
                    std::fs::remove_file(stale).map_err(io_err(stale))?;
                }
            }
            PemKeyPair::generate_ed25519()?.write_to(
                &self.dev_key_dir,
                keys::ARCHIVE_PUBLIC_KEY,
                keys::ARCHIVE_PRIVATE_KEY,
            )?;
            warn!(
                dir = %self.dev_key_dir.display(),
                "generated a DEVELOPMENT archive signing keypair; do not ship it"
            );
        }
        ArchiveSigner::from_pem(&keys::read_pem(&private_path)?)
    }
}

/// Where a verification key was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// `<resources>/security/archive_pubkey.pem`
    Packaged(PathBuf),
    /// The file named by [`ENV_PUBLIC_KEY_PATH`].
    EnvPath(PathBuf),
    /// The inline PEM in [`ENV_PUBLIC_KEY_PEM`].
    EnvPem,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Packaged(p) => write!(f, "packaged key {}", p.display()),
            Self::EnvPath(p) => write!(f, "${} ({})", ENV_PUBLIC_KEY_PATH, p.display()),
            Self::EnvPem => write!(f, "${ENV_PUBLIC_KEY_PEM}"),
        }
    }
}

/// Candidate locations for the verification key, checked in order.
#[derive(Debug, Clone, Default)]
pub struct KeyLookup {
    /// Packaged resources directory; its `security/` subdirectory is checked.
    pub resource_dir: Option<PathBuf>,
    /// Value of [`ENV_PUBLIC_KEY_PATH`].
    pub env_path: Option<PathBuf>,
    /// Value of [`ENV_PUBLIC_KEY_PEM`].
    pub env_pem: Option<String>,
}

impl KeyLookup {
    /// Candidates from `resource_dir` and the process environment.
    pub fn from_env(resource_dir: Option<PathBuf>) -> Self {
        Self {
            resource_dir,
            env_path: std::env::var_os(ENV_PUBLIC_KEY_PATH)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            env_pem: std::env::var(ENV_PUBLIC_KEY_PEM)
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }

    /// Return the first key found.
    ///
    /// An existing but unparseable key is an error rather than a reason to
    /// try the next candidate.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Key`] if a found key cannot be read or parsed.
    pub fn discover(&self) -> Result<Option<ArchiveVerifier>, ArchiveError> {
        if let Some(dir) = &self.resource_dir {
            let packaged = dir.join("security").join(keys::ARCHIVE_PUBLIC_KEY);
            if packaged.is_file() {
                let key = keys::ed25519_public_from_pem(&keys::read_pem(&packaged)?)?;
                return Ok(Some(ArchiveVerifier::new(key, KeySource::Packaged(packaged))));
            }
        }
        if let Some(path) = self.env_path.as_ref().filter(|p| p.is_file()) {
            let key = keys::ed25519_public_from_pem(&keys::read_pem(path)?)?;
            return Ok(Some(ArchiveVerifier::new(key, KeySource::EnvPath(path.clone()))));
        }
        if let Some(pem) = &self.env_pem {
            let key = keys::ed25519_public_from_pem(pem)?;
            return Ok(Some(ArchiveVerifier::new(key, KeySource::EnvPem)));
        }
        Ok(None)
    }
}

/// Verifies archive signatures against one public key.
#[derive(Debug, Clone)]
pub struct ArchiveVerifier {
    key: VerifyingKey,
    source: KeySource,
}

impl ArchiveVerifier {
    /// Wrap a verification key.
    pub fn new(key: VerifyingKey, source: KeySource) -> Self {
        Self { key, source }
    }

    /// Where the key came from.
    pub fn source(&self) -> &KeySource {
        &self.source
    }

    /// Verify `archive` against `<archive>.sig`.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::MissingSignature`] if the sidecar does not exist
    /// - [`ArchiveError::MalformedSignature`] if it is not a 64-byte base64 signature
    /// - [`ArchiveError::SignatureMismatch`] if it does not verify
    pub fn verify(&self, archive: &Path) -> Result<(), ArchiveError> {
        let sig_path = signature_path(archive);
        if !sig_path.is_file() {
            return Err(ArchiveError::MissingSignature(sig_path));
        }
        let encoded = std::fs::read_to_string(&sig_path).map_err(io_err(&sig_path))?;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| ArchiveError::MalformedSignature(sig_path.clone()))?;
        let bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| ArchiveError::MalformedSignature(sig_path.clone()))?;
        let signature = Signature::from_bytes(&bytes);

        let digest = Sha256Digest::compute_file(archive).map_err(io_err(archive))?;
        self.key
            .verify_strict(&digest.to_bytes(), &signature)
            .map_err(|_| ArchiveError::SignatureMismatch(archive.to_path_buf()))
    }
}

/// How verification failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationMode {
    /// Log failures and continue.
    #[default]
    Advisory,
    /// Any failure is an error.
    Strict,
}

impl VerificationMode {
    /// Strict if `strict` is set or [`ENV_VERIFY_STRICT`] is `1`.
    pub fn from_flag(strict: bool) -> Self {
        let env_strict = std::env::var(ENV_VERIFY_STRICT).is_ok_and(|v| v.trim() == "1");
        if strict || env_strict {
            Self::Strict
        } else {
            Self::Advisory
        }
    }
}

/// Outcome of verifying a set of archives.
#[derive(Debug, Default)]
pub struct VerificationReport {
    /// Where the key came from, if one was found.
    pub key_source: Option<KeySource>,
    /// Archives whose signatures verified.
    pub verified: Vec<PathBuf>,
    /// Archives that failed, with the reason. Only populated in advisory mode.
    pub failed: Vec<(PathBuf, ArchiveError)>,
}

impl VerificationReport {
    /// Whether every archive verified with a key present.
    pub fn is_clean(&self) -> bool {
        self.key_source.is_some() && self.failed.is_empty()
    }
}

/// Verify `archives` under `mode`.
///
/// # Errors
///
/// In [`VerificationMode::Strict`], returns the first failure (including a
/// missing key). In advisory mode only key-loading errors are returned;
/// everything else is logged and recorded in the report.
pub fn verify_archives(
    lookup: &KeyLookup,
    archives: &[PathBuf],
    mode: VerificationMode,
) -> Result<VerificationReport, ArchiveError> {
    let mut report = VerificationReport::default();
    let Some(verifier) = lookup.discover()? else {
        if mode == VerificationMode::Strict {
            return Err(ArchiveError::MissingPublicKey);
        }
        warn!("no archive public key found, skipping signature verification");
        return Ok(report);
    };
    report.key_source = Some(verifier.source().clone());

    for archive in archives {
        match verifier.verify(archive) {
            Ok(()) => {
                info!(archive = %archive.display(), "archive signature verified");
                report.verified.push(archive.clone());
            }
            Err(e) if mode == VerificationMode::Strict => return Err(e),
            Err(e) => {
                warn!(archive = %archive.display(), error = %e, "archive signature check failed");
                report.failed.push((archive.clone(), e));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn signer() -> ArchiveSigner {
        let pair = PemKeyPair::generate_ed25519().unwrap();
        ArchiveSigner::from_pem(&pair.private_pem).unwrap()
    }

    fn lookup_for(signer: &ArchiveSigner) -> KeyLookup {
        use ed25519_dalek::pkcs8::EncodePublicKey;
        use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
        KeyLookup {
            env_pem: Some(signer.verifying_key().to_public_key_pem(LineEnding::LF).unwrap()),
            ..KeyLookup::default()
        }
    }

    fn archive(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn sign_then_verify() {
        let dir = tempdir().unwrap();
        let app = archive(dir.path(), "app.asar", b"archive bytes");
        std::fs::write(dir.path().join("app.asar.sha256"), "legacy").unwrap();

        let signer = signer();
        let sig = signer.sign(&app).unwrap();
        assert_eq!(sig, dir.path().join("app.asar.sig"));
        assert!(std::fs::read_to_string(&sig).unwrap().ends_with('\n'));
        assert!(!dir.path().join("app.asar.sha256").exists());

        let verifier = lookup_for(&signer).discover().unwrap().unwrap();
        assert_eq!(verifier.source(), &KeySource::EnvPem);
        verifier.verify(&app).unwrap();
    }

    #[test]
    fn tampered_archive_fails() {
        let dir = tempdir().unwrap();
        let app = archive(dir.path(), "app.asar", b"archive bytes");
        let signer = signer();
        signer.sign(&app).unwrap();
        std::fs::write(&app, b"archive bytez").unwrap();

        let verifier = lookup_for(&signer).discover().unwrap().unwrap();
        assert!(matches!(
            verifier.verify(&app),
            Err(ArchiveError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn strict_fails_where_advisory_continues() {
        let dir = tempdir().unwrap();
        let app = archive(dir.path(), "app.asar", b"unsigned");
        let lookup = lookup_for(&signer());

        let report = verify_archives(&lookup, &[app.clone()], VerificationMode::Advisory).unwrap();
        assert!(!report.is_clean());
        assert!(matches!(report.failed[0].1, ArchiveError::MissingSignature(_)));

        assert!(matches!(
            verify_archives(&lookup, &[app], VerificationMode::Strict),
            Err(ArchiveError::MissingSignature(_))
        ));
    }

    #[test]
    fn missing_key_only_fails_strict() {
        let lookup = KeyLookup::default();
        let report = verify_archives(&lookup, &[], VerificationMode::Advisory).unwrap();
        assert!(report.key_source.is_none());
        assert!(matches!(
            verify_archives(&lookup, &[], VerificationMode::Strict),
            Err(ArchiveError::MissingPublicKey)
        ));
    }

    #[test]
    fn packaged_key_wins_over_env() {
        use ed25519_dalek::pkcs8::EncodePublicKey;
        use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;

        let dir = tempdir().unwrap();
        let packaged = signer();
        let security = dir.path().join("security");
        std::fs::create_dir_all(&security).unwrap();
        std::fs::write(
            security.join(keys::ARCHIVE_PUBLIC_KEY),
            packaged.verifying_key().to_public_key_pem(LineEnding::LF).unwrap(),
        )
        .unwrap();

        let mut lookup = lookup_for(&signer());
        lookup.resource_dir = Some(dir.path().to_path_buf());
        let verifier = lookup.discover().unwrap().unwrap();
        assert_eq!(
            verifier.source(),
            &KeySource::Packaged(security.join(keys::ARCHIVE_PUBLIC_KEY))
        );
    }

    #[test]
    fn dev_key_requires_opt_in() {
        let dir = tempdir().unwrap();
        let mut lookup = SignerKeyLookup {
            pem: None,
            path: None,
            dev_key_dir: dir.path().join("security"),
            allow_dev_key: false,
        };
        assert!(matches!(lookup.resolve(), Err(ArchiveError::MissingSigningKey)));
        assert!(!dir.path().join("security").exists());

        lookup.allow_dev_key = true;
        let first = lookup.resolve().unwrap();
        let second = lookup.resolve().unwrap();
        assert_eq!(first.verifying_key(), second.verifying_key());
        assert!(dir.path().join("security").join(keys::ARCHIVE_PUBLIC_KEY).is_file());
    }

    #[test]
    fn finds_archives_by_extension() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("mac/App.app/Contents/Resources");
        std::fs::create_dir_all(&nested).unwrap();
        archive(&nested, "app.asar", b"x");
        archive(&nested, "app.ASAR.sig", b"x");
        archive(dir.path(), "readme.txt", b"x");

        let found = find_archives(dir.path(), DEFAULT_ARCHIVE_EXTENSION);
        assert_eq!(found, vec![nested.join("app.asar")]);
    }
}
