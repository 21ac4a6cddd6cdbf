//! IO modules - side effects (network, filesystem)

pub mod download;
pub mod extract;

pub use download::{DownloadedAsset, HttpSource, LocalSource, ReleaseSource, SourceError, source_for};
pub use extract::{ExtractError, extract_payload};
