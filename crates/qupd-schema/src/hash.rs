//! SHA-256 digests in their canonical lowercase hex form.

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Error returned when a string is not a valid SHA-256 hex digest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// Wrong number of characters.
    #[error("expected 64 hex characters, got {0}")]
    Length(usize),

    /// Right length, but something other than `[0-9a-fA-F]`.
    #[error("contains non-hex characters")]
    NonHex,
}

/// A validated SHA-256 digest (64 hex characters, stored lowercase).
///
/// Digests are validated on construction and on deserialization, so a value of
/// this type can be compared with `==` against any other digest without
/// worrying about case or stray whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// No `sha256:` prefix is accepted: the input must be
    /// exactly 64 hex characters. Upper-case input is normalised.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError`] if `s` is not exactly 64 ASCII hex characters.
    pub fn new(s: impl AsRef<str>) -> Result<Self, DigestError> {
        let s = s.as_ref();
        if s.len() != 64 {
            return Err(DigestError::Length(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigestError::NonHex);
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Wrap a raw 32-byte digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Compute the SHA-256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        Self::from_bytes(Sha256::digest(data).into())
    }

    /// Compute the SHA-256 digest of a file, streaming it from disk.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened or read.
    pub fn compute_file(path: &std::path::Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(Self::from_bytes(hasher.finalize().into()))
    }

    /// The raw 32 digest bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Validated on construction.
        let _ = hex::decode_to_slice(&self.0, &mut out);
        out
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for Sha256Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
