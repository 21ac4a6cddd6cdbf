//! Wire formats shared by the qupd client and release tooling.
//!
//! - [`package`]: the binary QUPD update envelope
//! - [`manifest`]: the release manifest published next to each asset
//! - [`hash`]: validated SHA-256 digests

pub mod cursor;
pub mod hash;
pub mod manifest;
pub mod package;

// Re-exports
pub use hash::{DigestError, Sha256Digest};
pub use manifest::{ManifestError, ReleaseManifest, coerce_version};
pub use package::{
    FormatVersion, PACKAGE_MAGIC, PackageError, PackageMetadata, ParsedPackage, UpdatePackage,
};
