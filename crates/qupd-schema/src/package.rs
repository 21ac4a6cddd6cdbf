//! The QUPD update package envelope.
//!
//! ```text
//! 4B  magic "QUPD"
//! 1B  format version (1 or 2)
//! 1B  version length        + product version (utf8)
//! 32B sha256 of the plaintext payload
//! 2B  metadata length (v2)  + metadata (utf8 JSON, v2 only)
//! 2B  encrypted key length  + RSA-OAEP wrapped AES key
//! 1B  iv length             + AES-GCM iv
//! 1B  auth tag length       + AES-GCM tag
//! 4B  payload length        + AES-GCM ciphertext
//! 2B  signature length      + RSA-SHA256 signature
//! ```
//!
//! All multi-byte lengths are big-endian. The signature covers every byte that
//! precedes the signature length field, and nothing may follow the signature.

use serde_json::Value;
use thiserror::Error;

use crate::cursor::ByteCursor;

/// Leading magic bytes of every package.
pub const PACKAGE_MAGIC: [u8; 4] = *b"QUPD";

/// Length of the embedded plaintext digest.
pub const ORIGINAL_HASH_LEN: usize = 32;

/// Errors produced while decoding or encoding a package.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackageError {
    /// The first four bytes are not `QUPD`.
    #[error("invalid magic bytes: not a QUPD package")]
    InvalidMagic,

    /// The format version byte is neither 1 nor 2.
    #[error("unsupported package format version {0}")]
    UnsupportedFormat(u8),

    /// A length prefix points past the end of the buffer.
    #[error("truncated {field}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Field being read.
        field: &'static str,
        /// Bytes the field requires.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A text field is not valid UTF-8.
    #[error("{field} is not valid utf-8")]
    InvalidUtf8 {
        /// Field being read.
        field: &'static str,
    },

    /// The v2 metadata block is not well-formed JSON.
    #[error("metadata is not well-formed JSON: {0}")]
    MalformedMetadata(String),

    /// Bytes remain after the signature.
    #[error("{count} trailing bytes after signature")]
    TrailingData {
        /// Number of unexpected bytes.
        count: usize,
    },

    /// A field is too long for its length prefix.
    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        /// Field being written.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Maximum the prefix can express.
        max: usize,
    },

    /// Metadata was attached to a format version that cannot carry it.
    #[error("format version 1 cannot carry metadata")]
    MetadataNotSupported,
}

impl PackageError {
    /// Whether this error means the input bytes are malformed, as opposed to
    /// being a well-formed package of a format this build does not support.
    pub fn is_malformed_input(&self) -> bool {
        !matches!(self, Self::UnsupportedFormat(_))
    }
}

/// Envelope format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatVersion {
    /// No metadata block.
    V1,
    /// Adds a length-prefixed JSON metadata block after the original hash.
    V2,
}

impl FormatVersion {
    /// Parse the version byte.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::UnsupportedFormat`] for anything but 1 or 2.
    pub fn from_byte(b: u8) -> Result<Self, PackageError> {
        match b {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(PackageError::UnsupportedFormat(other)),
        }
    }

    /// The on-wire version byte.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Whether packages of this version carry a metadata block.
    pub fn has_metadata(self) -> bool {
        matches!(self, Self::V2)
    }
}

/// Opaque v2 metadata.
///
/// The exact JSON text is retained so that re-encoding a decoded package
/// reproduces the signed bytes. Only well-formedness is checked here; the
/// typed accessors return `None` for absent, empty, or non-string values.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageMetadata {
    raw: String,
    value: Value,
}

impl PackageMetadata {
    /// Key holding the required main-process hash.
    pub const REQUIRED_MAIN_HASH: &'static str = "requiredMainHash";
    /// Key holding the required host version range.
    pub const REQUIRED_MAIN_VERSION_RANGE: &'static str = "requiredMainVersionRange";
    /// Key holding the package creation timestamp.
    pub const CREATED_AT: &'static str = "createdAt";

    /// Parse metadata from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::MalformedMetadata`] if `raw` is not valid JSON.
    pub fn parse(raw: impl Into<String>) -> Result<Self, PackageError> {
        let raw = raw.into();
        let value = serde_json::from_str(&raw)
            .map_err(|e| PackageError::MalformedMetadata(e.to_string()))?;
        Ok(Self { raw, value })
    }

    /// Build metadata from a JSON value, serialised compactly.
    pub fn from_value(value: Value) -> Self {
        Self {
            raw: value.to_string(),
            value,
        }
    }

    /// The exact JSON text as carried in the package.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The parsed JSON value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    fn string_field(&self, key: &str) -> Option<&str> {
        self.value
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// `requiredMainHash`, if present and non-empty.
    pub fn required_main_hash(&self) -> Option<&str> {
        self.string_field(Self::REQUIRED_MAIN_HASH)
    }

    /// `requiredMainVersionRange`, if present and non-empty.
    pub fn required_main_version_range(&self) -> Option<&str> {
        self.string_field(Self::REQUIRED_MAIN_VERSION_RANGE)
    }

    /// `createdAt`, if present and non-empty.
    pub fn created_at(&self) -> Option<&str> {
        self.string_field(Self::CREATED_AT)
    }
}

/// A decoded update package.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePackage {
    /// Envelope format version.
    pub format_version: FormatVersion,
    /// Product version string, at most 255 bytes.
    pub product_version: String,
    /// SHA-256 of the decrypted payload.
    pub original_hash: [u8; ORIGINAL_HASH_LEN],
    /// v2 metadata. `None` on v1, or on v2 with an empty metadata block.
    pub metadata: Option<PackageMetadata>,
    /// RSA-OAEP wrapped AES-256 key.
    pub encrypted_key: Vec<u8>,
    /// AES-GCM initialisation vector.
    pub iv: Vec<u8>,
    /// AES-GCM authentication tag.
    pub auth_tag: Vec<u8>,
    /// AES-GCM ciphertext.
    pub encrypted_payload: Vec<u8>,
    /// RSA-SHA256 signature over the signed region.
    pub signature: Vec<u8>,
}

/// A decoded package together with the exact bytes its signature covers.
#[derive(Debug, Clone)]
pub struct ParsedPackage<'a> {
    /// The decoded fields.
    pub package: UpdatePackage,
    /// Every byte preceding the signature length field.
    pub signed_content: &'a [u8],
}

impl UpdatePackage {
    /// Decode a package, discarding the signed region slice.
    ///
    /// # Errors
    ///
    /// See [`UpdatePackage::parse`].
    pub fn decode(bytes: &[u8]) -> Result<Self, PackageError> {
        Self::parse(bytes).map(|parsed| parsed.package)
    }

    /// Decode a package and return the signed region alongside it.
    ///
    /// # Errors
    ///
    /// - [`PackageError::InvalidMagic`] if the magic bytes are wrong
    /// - [`PackageError::UnsupportedFormat`] for an unknown format byte
    /// - [`PackageError::Truncated`] if any length runs past the buffer
    /// - [`PackageError::InvalidUtf8`] / [`PackageError::MalformedMetadata`]
    ///   for undecodable text
    /// - [`PackageError::TrailingData`] if bytes follow the signature
    pub fn parse(bytes: &[u8]) -> Result<ParsedPackage<'_>, PackageError> {
        let mut cur = ByteCursor::new(bytes);

        if cur.take(PACKAGE_MAGIC.len(), "magic")? != PACKAGE_MAGIC {
            return Err(PackageError::InvalidMagic);
        }
        let format_version = FormatVersion::from_byte(cur.read_u8("format version")?)?;

        let version = cur.read_prefixed_u8("version")?;
        let product_version = std::str::from_utf8(version)
            .map_err(|_| PackageError::InvalidUtf8 { field: "version" })?
            .to_string();

        let original_hash = cur.take_array::<ORIGINAL_HASH_LEN>("original hash")?;

        let metadata = if format_version.has_metadata() {
            let raw = cur.read_prefixed_u16("metadata")?;
            if raw.is_empty() {
                None
            } else {
                let text = std::str::from_utf8(raw)
                    .map_err(|_| PackageError::InvalidUtf8 { field: "metadata" })?;
                Some(PackageMetadata::parse(text)?)
            }
        } else {
            None
        };

        let encrypted_key = cur.read_prefixed_u16("encrypted key")?.to_vec();
        let iv = cur.read_prefixed_u8("iv")?.to_vec();
        let auth_tag = cur.read_prefixed_u8("auth tag")?.to_vec();
        let encrypted_payload = cur.read_prefixed_u32("payload")?.to_vec();

        let signed_content = cur.consumed();
        let signature = cur.read_prefixed_u16("signature")?.to_vec();

        if cur.remaining() > 0 {
            return Err(PackageError::TrailingData {
                count: cur.remaining(),
            });
        }

        Ok(ParsedPackage {
            package: Self {
                format_version,
                product_version,
                original_hash,
                metadata,
                encrypted_key,
                iv,
                auth_tag,
                encrypted_payload,
                signature,
            },
            signed_content,
        })
    }

    /// Encode everything the signature covers.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::FieldTooLong`] if a field overflows its length
    /// prefix, or [`PackageError::MetadataNotSupported`] for v1 with metadata.
    pub fn encode_signed_content(&self) -> Result<Vec<u8>, PackageError> {
        let meta_len = self.metadata.as_ref().map_or(0, |m| m.raw().len());
        let mut out = Vec::with_capacity(
            64 + self.product_version.len()
                + meta_len
                + self.encrypted_key.len()
                + self.iv.len()
                + self.auth_tag.len()
                + self.encrypted_payload.len(),
        );

        out.extend_from_slice(&PACKAGE_MAGIC);
        out.push(self.format_version.as_byte());
        put_u8_prefixed(&mut out, "version", self.product_version.as_bytes())?;
        out.extend_from_slice(&self.original_hash);

        match (&self.metadata, self.format_version.has_metadata()) {
            (Some(meta), true) => put_u16_prefixed(&mut out, "metadata", meta.raw().as_bytes())?,
            (None, true) => put_u16_prefixed(&mut out, "metadata", &[])?,
            (Some(_), false) => return Err(PackageError::MetadataNotSupported),
            (None, false) => {}
        }

        put_u16_prefixed(&mut out, "encrypted key", &self.encrypted_key)?;
        put_u8_prefixed(&mut out, "iv", &self.iv)?;
        put_u8_prefixed(&mut out, "auth tag", &self.auth_tag)?;
        put_u32_prefixed(&mut out, "payload", &self.encrypted_payload)?;
        Ok(out)
    }

    /// Encode the full package.
    ///
    /// # Errors
    ///
    /// See [`UpdatePackage::encode_signed_content`].
    pub fn encode(&self) -> Result<Vec<u8>, PackageError> {
        let mut out = self.encode_signed_content()?;
        put_u16_prefixed(&mut out, "signature", &self.signature)?;
        Ok(out)
    }
}

fn put_u8_prefixed(out: &mut Vec<u8>, field: &'static str, data: &[u8]) -> Result<(), PackageError> {
    let len = u8::try_from(data.len()).map_err(|_| too_long(field, data.len(), u8::MAX.into()))?;
    out.push(len);
    out.extend_from_slice(data);
    Ok(())
}

fn put_u16_prefixed(out: &mut Vec<u8>, field: &'static str, data: &[u8]) -> Result<(), PackageError> {
    let len = u16::try_from(data.len()).map_err(|_| too_long(field, data.len(), u16::MAX.into()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn put_u32_prefixed(out: &mut Vec<u8>, field: &'static str, data: &[u8]) -> Result<(), PackageError> {
    let len =
        u32::try_from(data.len()).map_err(|_| too_long(field, data.len(), u32::MAX as usize))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn too_long(field: &'static str, len: usize, max: usize) -> PackageError {
    PackageError::FieldTooLong { field, len, max }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(format_version: FormatVersion) -> UpdatePackage {
        UpdatePackage {
            format_version,
            product_version: "1.4.0".into(),
            original_hash: [7u8; 32],
            metadata: format_version.has_metadata().then(|| {
                PackageMetadata::parse(r#"{"requiredMainHash":"ab","createdAt":"2025-01-01"}"#)
                    .unwrap()
            }),
            encrypted_key: vec![1; 256],
            iv: vec![2; 12],
            auth_tag: vec![3; 16],
            encrypted_payload: b"ciphertext".to_vec(),
            signature: vec![4; 256],
        }
    }

    #[test]
    fn v2_layout_is_exact() {
        let pkg = sample(FormatVersion::V2);
        let bytes = pkg.encode().unwrap();
        assert_eq!(&bytes[..4], b"QUPD");
        assert_eq!(bytes[4], 2);
        assert_eq!(bytes[5], 5);
        assert_eq!(&bytes[6..11], b"1.4.0");

        let parsed = UpdatePackage::parse(&bytes).unwrap();
        assert_eq!(parsed.package, pkg);
        // signature length (2) + signature (256)
        assert_eq!(parsed.signed_content.len(), bytes.len() - 258);
        assert_eq!(parsed.signed_content, pkg.encode_signed_content().unwrap());
    }

    #[test]
    fn v1_has_no_metadata_block() {
        let v1 = sample(FormatVersion::V1).encode().unwrap();
        let mut v2_pkg = sample(FormatVersion::V2);
        v2_pkg.metadata = None;
        let v2 = v2_pkg.encode().unwrap();
        // empty metadata still costs its two length bytes
        assert_eq!(v2.len(), v1.len() + 2);
        assert_eq!(UpdatePackage::decode(&v2).unwrap().metadata, None);
    }

    #[test]
    fn metadata_accessors() {
        let pkg = sample(FormatVersion::V2);
        let meta = pkg.metadata.unwrap();
        assert_eq!(meta.required_main_hash(), Some("ab"));
        assert_eq!(meta.created_at(), Some("2025-01-01"));
        assert_eq!(meta.required_main_version_range(), None);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample(FormatVersion::V1).encode().unwrap();
        bytes[0] = b'X';
        assert_eq!(UpdatePackage::decode(&bytes), Err(PackageError::InvalidMagic));
    }

    #[test]
    fn rejects_unknown_format() {
        let mut bytes = sample(FormatVersion::V1).encode().unwrap();
        bytes[4] = 3;
        let err = UpdatePackage::decode(&bytes).unwrap_err();
        assert_eq!(err, PackageError::UnsupportedFormat(3));
        assert!(!err.is_malformed_input());
    }

    #[test]
    fn rejects_trailing_byte() {
        let mut bytes = sample(FormatVersion::V2).encode().unwrap();
        bytes.push(0);
        assert_eq!(
            UpdatePackage::decode(&bytes),
            Err(PackageError::TrailingData { count: 1 })
        );
    }

    #[test]
    fn every_truncation_is_malformed() {
        let bytes = sample(FormatVersion::V2).encode().unwrap();
        for len in 0..bytes.len() {
            let err = UpdatePackage::decode(&bytes[..len]).unwrap_err();
            assert!(err.is_malformed_input(), "prefix {len}: {err:?}");
        }
    }

    #[test]
    fn rejects_malformed_metadata() {
        let mut pkg = sample(FormatVersion::V2);
        pkg.metadata = None;
        let mut bytes = pkg.encode().unwrap();
        // splice "{" into the empty metadata block (after magic, fmt, ver, hash)
        let meta_at = 4 + 1 + 1 + 5 + 32;
        bytes[meta_at..meta_at + 2].copy_from_slice(&1u16.to_be_bytes());
        bytes.insert(meta_at + 2, b'{');
        assert!(matches!(
            UpdatePackage::decode(&bytes),
            Err(PackageError::MalformedMetadata(_))
        ));
    }

    #[test]
    fn encode_rejects_oversized_fields() {
        let mut pkg = sample(FormatVersion::V1);
        pkg.product_version = "9".repeat(256);
        assert_eq!(
            pkg.encode(),
            Err(PackageError::FieldTooLong {
                field: "version",
                len: 256,
                max: 255,
            })
        );

        let mut pkg = sample(FormatVersion::V1);
        pkg.metadata = Some(PackageMetadata::from_value(serde_json::json!({})));
        assert_eq!(pkg.encode(), Err(PackageError::MetadataNotSupported));
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            v2 in any::<bool>(),
            version in "[0-9a-z.+-]{0,40}",
            hash in any::<[u8; 32]>(),
            key in proptest::collection::vec(any::<u8>(), 0..300),
            iv in proptest::collection::vec(any::<u8>(), 0..20),
            tag in proptest::collection::vec(any::<u8>(), 0..20),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            signature in proptest::collection::vec(any::<u8>(), 0..300),
            note in proptest::option::of("[a-z ]{0,20}"),
        ) {
            let format_version = if v2 { FormatVersion::V2 } else { FormatVersion::V1 };
            let metadata = if v2 {
                note.map(|n| PackageMetadata::from_value(serde_json::json!({ "note": n })))
            } else {
                None
            };
            let pkg = UpdatePackage {
                format_version,
                product_version: version,
                original_hash: hash,
                metadata,
                encrypted_key: key,
                iv,
                auth_tag: tag,
                encrypted_payload: payload,
                signature,
            };
            let bytes = pkg.encode().unwrap();
            let decoded = UpdatePackage::decode(&bytes).unwrap();
            prop_assert_eq!(&decoded, &pkg);
            prop_assert_eq!(decoded.encode().unwrap(), bytes);
        }
    }
}
