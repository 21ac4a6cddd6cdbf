//! PEM key loading, generation and on-disk layout.
//!
//! RSA keys are accepted in SPKI / PKCS#8 form (what the release tooling
//! writes) or in legacy PKCS#1 form. Ed25519 keys are SPKI / PKCS#8 only.

use std::path::{Path, PathBuf};

use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use zeroize::Zeroizing;

/// File holding the RSA public key that verifies package signatures.
pub const UPDATE_SIGN_PUBLIC_KEY: &str = "update_sign_pub.pem";
/// Older name for [`UPDATE_SIGN_PUBLIC_KEY`], still honoured when the new one is absent.
pub const LEGACY_UPDATE_PUBLIC_KEY: &str = "update_pubkey.pem";
/// File holding the RSA private key that unwraps package content keys.
pub const UPDATE_PRIVATE_KEY: &str = "update_privkey.pem";
/// Release-side RSA private key that signs packages. Never shipped.
pub const UPDATE_SIGN_PRIVATE_KEY: &str = "update_sign_privkey.pem";
/// Release-side RSA public key that wraps content keys.
pub const UPDATE_ENCRYPT_PUBLIC_KEY: &str = "update_enc_pub.pem";
/// File holding the Ed25519 public key that verifies archive signatures.
pub const ARCHIVE_PUBLIC_KEY: &str = "archive_pubkey.pem";
/// File holding the development Ed25519 private key for archive signing.
pub const ARCHIVE_PRIVATE_KEY: &str = "archive_privkey.pem";

/// Default RSA modulus size for generated keys.
pub const RSA_KEY_BITS: usize = 2048;

/// Errors produced while loading or creating key material.
#[derive(Error, Debug)]
pub enum KeyError {
    /// A key file could not be read.
    #[error("failed to read key {}: {source}", path.display())]
    Read {
        /// Key file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// None of the candidate key files exist.
    #[error("no key found, looked for: {}", display_paths(.0))]
    NotFound(Vec<PathBuf>),

    /// The PEM text does not hold a key of the expected kind.
    #[error("invalid {kind} key: {reason}")]
    Invalid {
        /// What kind of key was expected.
        kind: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// A keypair already exists where one would be written.
    #[error("refusing to overwrite existing key {}", .0.display())]
    Exists(PathBuf),

    /// Key generation or encoding failed.
    #[error("key generation failed: {0}")]
    Generate(String),

    /// Writing a key file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read a key file, attaching the path to any error.
///
/// # Errors
///
/// Returns [`KeyError::Read`] if the file cannot be read.
pub fn read_pem(path: &Path) -> Result<Zeroizing<String>, KeyError> {
    std::fs::read_to_string(path)
        .map(Zeroizing::new)
        .map_err(|source| KeyError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Return the first of `candidates` that exists.
///
/// # Errors
///
/// Returns [`KeyError::NotFound`] listing every candidate if none exist.
pub fn first_existing(candidates: &[PathBuf]) -> Result<&Path, KeyError> {
    candidates
        .iter()
        .find(|p| p.is_file())
        .map(PathBuf::as_path)
        .ok_or_else(|| KeyError::NotFound(candidates.to_vec()))
}

/// Parse an RSA public key (SPKI or PKCS#1 PEM).
///
/// # Errors
///
/// Returns [`KeyError::Invalid`] if neither encoding matches.
pub fn rsa_public_from_pem(pem: &str) -> Result<RsaPublicKey, KeyError> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| KeyError::Invalid {
            kind: "RSA public",
            reason: e.to_string(),
        })
}

/// Parse an RSA private key (PKCS#8 or PKCS#1 PEM).
///
/// # Errors
///
/// Returns [`KeyError::Invalid`] if neither encoding matches.
pub fn rsa_private_from_pem(pem: &str) -> Result<RsaPrivateKey, KeyError> {
    RsaPrivateKey::from_pkcs8_pem(pem.trim())
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| KeyError::Invalid {
            kind: "RSA private",
            reason: e.to_string(),
        })
}

/// Parse an Ed25519 public key (SPKI PEM).
///
/// # Errors
///
/// Returns [`KeyError::Invalid`] if the PEM is not an Ed25519 public key.
pub fn ed25519_public_from_pem(pem: &str) -> Result<ed25519_dalek::VerifyingKey, KeyError> {
    ed25519_dalek::VerifyingKey::from_public_key_pem(pem.trim()).map_err(|e| KeyError::Invalid {
        kind: "Ed25519 public",
        reason: e.to_string(),
    })
}

/// Parse an Ed25519 private key (PKCS#8 PEM).
///
/// # Errors
///
/// Returns [`KeyError::Invalid`] if the PEM is not an Ed25519 private key.
pub fn ed25519_private_from_pem(pem: &str) -> Result<ed25519_dalek::SigningKey, KeyError> {
    ed25519_dalek::SigningKey::from_pkcs8_pem(pem.trim()).map_err(|e| KeyError::Invalid {
        kind: "Ed25519 private",
        reason: e.to_string(),
    })
}

/// A freshly generated keypair in PEM form.
pub struct PemKeyPair {
    /// SPKI public key.
    pub public_pem: String,
    /// PKCS#8 private key.
    pub private_pem: Zeroizing<String>,
}

impl std::fmt::Debug for PemKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PemKeyPair")
            .field("public_pem", &self.public_pem)
            .finish_non_exhaustive()
    }
}

impl PemKeyPair {
    /// Generate an RSA keypair of `bits` bits.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Generate`] if generation or encoding fails.
    pub fn generate_rsa(bits: usize) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::new(&mut rsa::rand_core::OsRng, bits)
            .map_err(|e| KeyError::Generate(e.to_string()))?;
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Generate(e.to_string()))?;
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::Generate(e.to_string()))?;
        Ok(Self {
            public_pem,
            private_pem,
        })
    }

    /// Generate an Ed25519 keypair.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Generate`] if PEM encoding fails.
    pub fn generate_ed25519() -> Result<Self, KeyError> {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut *secret);
        let signing = ed25519_dalek::SigningKey::from_bytes(&secret);

        let public_pem = signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Generate(e.to_string()))?;
        let private_pem = signing
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::Generate(e.to_string()))?;
        Ok(Self {
            public_pem,
            private_pem,
        })
    }

    /// Write both halves into `dir`, refusing to overwrite either file.
    ///
    /// The private key is created with owner-only permissions on Unix.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Exists`] if either file is already present, or an
    /// I/O error if writing fails.
    pub fn write_to(
        &self,
        dir: &Path,
        public_name: &str,
        private_name: &str,
    ) -> Result<(PathBuf, PathBuf), KeyError> {
        let public_path = dir.join(public_name);
        let private_path = dir.join(private_name);
        for path in [&public_path, &private_path] {
            if path.exists() {
                return Err(KeyError::Exists(path.clone()));
            }
        }

        std::fs::create_dir_all(dir)?;
        write_private(&private_path, self.private_pem.as_bytes())?;
        std::fs::write(&public_path, self.public_pem.as_bytes())?;
        Ok((public_path, private_path))
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(data)
}
