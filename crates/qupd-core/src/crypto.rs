//! Cryptographic primitives for the QUPD envelope.
//!
//! - RSASSA-PKCS1-v1_5 / SHA-256 signatures over the signed region
//! - RSA-OAEP (SHA-256, MGF1-SHA-256) wrapping of the 32-byte content key
//! - AES-256-GCM payload encryption with a detached 16-byte tag
//! - SHA-256 of the plaintext, compared against the embedded original hash
//!
//! Every check fails closed. The functions here are CPU-bound and synchronous;
//! async callers should run them on the blocking pool.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::rand_core::OsRng;
use rsa::signature::{RandomizedSigner as _, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// AES-256 key length.
pub const CONTENT_KEY_LEN: usize = 32;
/// AES-GCM IV length produced by the release tooling.
pub const GCM_IV_LEN: usize = 12;
/// AES-GCM authentication tag length.
pub const GCM_TAG_LEN: usize = 16;

/// A 32-byte AES content key, wiped on drop.
pub type ContentKey = Zeroizing<[u8; CONTENT_KEY_LEN]>;

/// Errors produced by the crypto engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The RSA signature does not verify over the signed region.
    #[error("package signature is invalid")]
    BadSignature,

    /// Producing a signature failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// RSA-OAEP unwrapping of the content key failed.
    #[error("failed to unwrap content key")]
    KeyUnwrap,

    /// RSA-OAEP wrapping of the content key failed.
    #[error("failed to wrap content key: {0}")]
    KeyWrap(String),

    /// The unwrapped content key is not 32 bytes.
    #[error("content key is {0} bytes, expected 32")]
    KeyLength(usize),

    /// The IV length is not supported.
    #[error("unsupported iv length {0}, expected 12")]
    IvLength(usize),

    /// The authentication tag length is not supported.
    #[error("unsupported auth tag length {0}, expected 16")]
    TagLength(usize),

    /// AES-GCM authentication failed.
    #[error("payload decryption failed: authentication tag mismatch")]
    Decryption,

    /// AES-GCM encryption failed.
    #[error("payload encryption failed")]
    Encryption,

    /// The decrypted plaintext does not hash to the embedded original hash.
    #[error("plaintext checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Hex digest carried in the package.
        expected: String,
        /// Hex digest of the decrypted bytes.
        actual: String,
    },
}

/// Verify an RSA-SHA256 signature over `content`.
///
/// # Errors
///
/// Returns [`CryptoError::BadSignature`] if the signature is malformed or
/// does not verify.
pub fn verify_signature(
    content: &[u8],
    signature: &[u8],
    key: &VerifyingKey<Sha256>,
) -> Result<(), CryptoError> {
    let signature = Signature::try_from(signature).map_err(|_| CryptoError::BadSignature)?;
    key.verify(content, &signature)
        .map_err(|_| CryptoError::BadSignature)
}

/// Produce an RSA-SHA256 signature over `content`.
///
/// # Errors
///
/// Returns [`CryptoError::Signing`] if the key cannot sign.
pub fn sign_content(content: &[u8], key: &SigningKey<Sha256>) -> Result<Vec<u8>, CryptoError> {
    key.try_sign_with_rng(&mut OsRng, content)
        .map(|sig| sig.to_vec())
        .map_err(|e| CryptoError::Signing(e.to_string()))
}

/// Unwrap the AES content key with RSA-OAEP.
///
/// # Errors
///
/// Returns [`CryptoError::KeyUnwrap`] if decryption fails, or
/// [`CryptoError::KeyLength`] if the result is not 32 bytes.
pub fn unwrap_key(encrypted_key: &[u8], key: &RsaPrivateKey) -> Result<ContentKey, CryptoError> {
    let raw = Zeroizing::new(
        key.decrypt_blinded(&mut OsRng, Oaep::new::<Sha256>(), encrypted_key)
            .map_err(|_| CryptoError::KeyUnwrap)?,
    );
    let bytes: [u8; CONTENT_KEY_LEN] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::KeyLength(raw.len()))?;
    Ok(Zeroizing::new(bytes))
}

/// Wrap an AES content key with RSA-OAEP.
///
/// # Errors
///
/// Returns [`CryptoError::KeyWrap`] if the key is too small for OAEP.
pub fn wrap_key(content_key: &ContentKey, key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), content_key.as_slice())
        .map_err(|e| CryptoError::KeyWrap(e.to_string()))
}

/// Generate a random content key.
pub fn generate_content_key() -> ContentKey {
    Zeroizing::new(rand::random())
}

/// Ciphertext and the parameters needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// Random 12-byte IV.
    pub iv: [u8; GCM_IV_LEN],
    /// Detached authentication tag.
    pub auth_tag: [u8; GCM_TAG_LEN],
    /// Ciphertext, same length as the plaintext.
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` with AES-256-GCM under a fresh random IV.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the payload exceeds GCM limits.
pub fn encrypt_payload(plaintext: &[u8], key: &ContentKey) -> Result<SealedPayload, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| CryptoError::Encryption)?;
    let iv: [u8; GCM_IV_LEN] = rand::random();
    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buf)
        .map_err(|_| CryptoError::Encryption)?;

    let mut auth_tag = [0u8; GCM_TAG_LEN];
    auth_tag.copy_from_slice(&tag);
    Ok(SealedPayload {
        iv,
        auth_tag,
        ciphertext: buf,
    })
}

/// Decrypt an AES-256-GCM payload with a detached tag.
///
/// # Errors
///
/// - [`CryptoError::IvLength`] / [`CryptoError::TagLength`] for unsupported sizes
/// - [`CryptoError::Decryption`] if authentication fails
pub fn decrypt_payload(
    ciphertext: &[u8],
    key: &ContentKey,
    iv: &[u8],
    auth_tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != GCM_IV_LEN {
        return Err(CryptoError::IvLength(iv.len()));
    }
    if auth_tag.len() != GCM_TAG_LEN {
        return Err(CryptoError::TagLength(auth_tag.len()));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| CryptoError::Decryption)?;
    let mut buf = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(iv), b"", &mut buf, Tag::from_slice(auth_tag))
        .map_err(|_| CryptoError::Decryption)?;
    Ok(buf)
}

/// Check that `plaintext` hashes to `expected`.
///
/// # Errors
///
/// Returns [`CryptoError::ChecksumMismatch`] with both digests on mismatch.
pub fn verify_plaintext_hash(plaintext: &[u8], expected: &[u8; 32]) -> Result<(), CryptoError> {
    let actual: [u8; 32] = Sha256::digest(plaintext).into();
    if actual != *expected {
        return Err(CryptoError::ChecksumMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}
