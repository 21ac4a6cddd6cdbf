//! Opening and sealing complete QUPD packages.
//!
//! Opening runs the checks in a fixed order: decode, verify the signature
//! over the exact signed bytes, unwrap the content key, decrypt, then compare
//! the plaintext hash. Nothing is decrypted until the signature verifies.

use std::path::Path;

use qupd_schema::{FormatVersion, PackageError, PackageMetadata, UpdatePackage};
use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::crypto::{self, CryptoError};
use crate::keys::{self, KeyError};

/// Errors from opening or sealing a package.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The bytes are not a well-formed package.
    #[error(transparent)]
    Package(#[from] PackageError),

    /// A cryptographic check failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A package whose signature, key, ciphertext and plaintext hash all verified.
#[derive(Debug, Clone)]
pub struct OpenedPackage {
    /// Decoded envelope fields.
    pub package: UpdatePackage,
    /// Decrypted payload.
    pub plaintext: Vec<u8>,
}

/// Client-side key material: the release signing public key and the
/// client's content-key unwrapping private key.
#[derive(Clone)]
pub struct PackageKeys {
    verifying: VerifyingKey<Sha256>,
    decryption: RsaPrivateKey,
}

impl std::fmt::Debug for PackageKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageKeys").finish_non_exhaustive()
    }
}

impl PackageKeys {
    /// Build from parsed keys.
    pub fn new(signing_public: RsaPublicKey, decryption: RsaPrivateKey) -> Self {
        Self {
            verifying: VerifyingKey::new(signing_public),
            decryption,
        }
    }

    /// Build from PEM text.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Invalid`] if either PEM fails to parse.
    pub fn from_pem(signing_public_pem: &str, decryption_private_pem: &str) -> Result<Self, KeyError> {
        Ok(Self::new(
            keys::rsa_public_from_pem(signing_public_pem)?,
            keys::rsa_private_from_pem(decryption_private_pem)?,
        ))
    }

    /// Load from a `security/` directory.
    ///
    /// The signing key is read from `update_sign_pub.pem`, falling back to the
    /// legacy `update_pubkey.pem`; the decryption key from `update_privkey.pem`.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if a file is missing, unreadable or invalid.
    pub fn load(security_dir: &Path) -> Result<Self, KeyError> {
        let public_candidates = [
            security_dir.join(keys::UPDATE_SIGN_PUBLIC_KEY),
            security_dir.join(keys::LEGACY_UPDATE_PUBLIC_KEY),
        ];
        let public_path = keys::first_existing(&public_candidates)?;
        let private_path = security_dir.join(keys::UPDATE_PRIVATE_KEY);
        debug!(
            public = %public_path.display(),
            private = %private_path.display(),
            "loading update keys"
        );
        Self::from_pem(&keys::read_pem(public_path)?, &keys::read_pem(&private_path)?)
    }

    /// Decode and fully verify a package.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Package`] for malformed or unsupported input
    /// and [`EnvelopeError::Crypto`] for the first failing cryptographic check.
    pub fn open(&self, bytes: &[u8]) -> Result<OpenedPackage, EnvelopeError> {
        let parsed = UpdatePackage::parse(bytes)?;
        let pkg = parsed.package;

        crypto::verify_signature(parsed.signed_content, &pkg.signature, &self.verifying)?;
        debug!(version = %pkg.product_version, "package signature verified");

        let content_key = crypto::unwrap_key(&pkg.encrypted_key, &self.decryption)?;
        let plaintext =
            crypto::decrypt_payload(&pkg.encrypted_payload, &content_key, &pkg.iv, &pkg.auth_tag)?;
        crypto::verify_plaintext_hash(&plaintext, &pkg.original_hash)?;
        debug!(bytes = plaintext.len(), "package payload decrypted and hash verified");

        Ok(OpenedPackage {
            package: pkg,
            plaintext,
        })
    }
}

/// Release-side key material: the client's content-key wrapping public key
/// and the release signing private key.
#[derive(Clone)]
pub struct PackageSealer {
    encryption: RsaPublicKey,
    signing: SigningKey<Sha256>,
}

impl std::fmt::Debug for PackageSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageSealer").finish_non_exhaustive()
    }
}

impl PackageSealer {
    /// Build from parsed keys.
    pub fn new(encryption: RsaPublicKey, signing: RsaPrivateKey) -> Self {
        Self {
            encryption,
            signing: SigningKey::new(signing),
        }
    }

    /// Build from PEM text.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Invalid`] if either PEM fails to parse.
    pub fn from_pem(encryption_public_pem: &str, signing_private_pem: &str) -> Result<Self, KeyError> {
        Ok(Self::new(
            keys::rsa_public_from_pem(encryption_public_pem)?,
            keys::rsa_private_from_pem(signing_private_pem)?,
        ))
    }

    /// Encrypt, wrap, assemble and sign a package.
    ///
    /// Packages with metadata are written as format 2, others as format 1.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Package`] if a field overflows its length
    /// prefix, or [`EnvelopeError::Crypto`] if encryption or signing fails.
    pub fn seal(
        &self,
        plaintext: &[u8],
        product_version: &str,
        metadata: Option<PackageMetadata>,
    ) -> Result<Vec<u8>, EnvelopeError> {
        let content_key = crypto::generate_content_key();
        let sealed = crypto::encrypt_payload(plaintext, &content_key)?;
        let encrypted_key = crypto::wrap_key(&content_key, &self.encryption)?;

        let mut pkg = UpdatePackage {
            format_version: if metadata.is_some() {
                FormatVersion::V2
            } else {
                FormatVersion::V1
            },
            product_version: product_version.to_string(),
            original_hash: Sha256::digest(plaintext).into(),
            metadata,
            encrypted_key,
            iv: sealed.iv.to_vec(),
            auth_tag: sealed.auth_tag.to_vec(),
            encrypted_payload: sealed.ciphertext,
            signature: Vec::new(),
        };

        let signed_content = pkg.encode_signed_content()?;
        pkg.signature = crypto::sign_content(&signed_content, &self.signing)?;
        Ok(pkg.encode()?)
    }
}
