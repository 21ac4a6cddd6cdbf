//! Extraction of decrypted update payloads (gzip tar).
//!
//! Payloads built from a `dist/` directory carry that directory as a single
//! top-level wrapper; when every entry sits under `dist/`, one path level is
//! stripped so the installed version dir holds the bundle contents directly.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use thiserror::Error;
use tracing::debug;

const WRAPPER_DIR: &str = "dist";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive entry escapes the destination: {0}")]
    UnsafePath(String),

    #[error("unsupported archive entry type for {0}")]
    UnsupportedEntry(String),

    #[error("archive contains no files")]
    Empty,
}

fn archive(payload: &[u8]) -> Archive<GzDecoder<&[u8]>> {
    Archive::new(GzDecoder::new(payload))
}

/// Whether every entry lives under a top-level `dist/` directory.
fn has_wrapper(payload: &[u8]) -> Result<bool, ExtractError> {
    let mut any = false;
    for entry in archive(payload).entries()? {
        let entry = entry?;
        let path = entry.path()?;
        let first = path.components().find(|c| !matches!(c, Component::CurDir));
        if first != Some(Component::Normal(OsStr::new(WRAPPER_DIR))) {
            return Ok(false);
        }
        any = true;
    }
    Ok(any)
}

/// Validate an entry path and drop `strip` leading components.
fn sanitize(path: &Path, strip: usize) -> Result<Option<PathBuf>, ExtractError> {
    let mut out = PathBuf::new();
    let mut skipped = 0;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(_) if skipped < strip => skipped += 1,
            Component::Normal(part) => out.push(part),
            _ => return Err(ExtractError::UnsafePath(path.display().to_string())),
        }
    }
    Ok((!out.as_os_str().is_empty()).then_some(out))
}

/// Extract a gzip tar `payload` into `dest`, which must already exist.
///
/// Only regular files and directories are accepted. Returns the number of
/// files written.
///
/// # Errors
///
/// Returns [`ExtractError::UnsafePath`] for absolute or `..` paths,
/// [`ExtractError::UnsupportedEntry`] for links and devices,
/// [`ExtractError::Empty`] if no file was extracted.
pub fn extract_payload(payload: &[u8], dest: &Path) -> Result<usize, ExtractError> {
    let strip = usize::from(has_wrapper(payload)?);
    debug!(strip, dest = %dest.display(), "extracting update payload");

    let mut files = 0;
    let mut archive = archive(payload);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let Some(relative) = sanitize(&raw, strip)? else {
            continue;
        };
        let target = dest.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => std::fs::create_dir_all(&target)?,
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = std::fs::File::create(&target)?;
                std::io::copy(&mut entry, &mut out)?;
                files += 1;
            }
            _ => return Err(ExtractError::UnsupportedEntry(raw.display().to_string())),
        }
    }

    if files == 0 {
        return Err(ExtractError::Empty);
    }
    Ok(files)
}
