//! Verify-archive command

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use qupd_core::archive::{KeyLookup, VerificationMode, find_archives, verify_archives};
use qupd_core::config::ENV_RESOURCE_DIR;

use crate::ui::Output;

/// Check the `.sig` sidecars of `paths` and of every archive under `scan`.
///
/// Advisory mode reports problems and succeeds; strict mode (`--strict` or
/// `QUPD_VERIFY_STRICT=1`) fails on the first one.
pub fn verify_archive(
    paths: &[PathBuf],
    scan: Option<&Path>,
    extension: &str,
    strict: bool,
    resource_dir: Option<PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut archives = paths.to_vec();
    if let Some(dir) = scan {
        archives.extend(find_archives(dir, extension));
    }
    archives.sort();
    archives.dedup();
    if archives.is_empty() {
        if scan.is_some() {
            output.info(&format!("No .{extension} archives found"));
            return Ok(());
        }
        bail!("Nothing to verify. Pass archive paths or --scan DIR.");
    }

    let resource_dir =
        resource_dir.or_else(|| std::env::var_os(ENV_RESOURCE_DIR).map(PathBuf::from));
    let mode = VerificationMode::from_flag(strict);
    let report = verify_archives(&KeyLookup::from_env(resource_dir), &archives, mode)
        .context("Archive verification failed")?;

    let Some(source) = &report.key_source else {
        output.warning("No archive public key found, signatures were not checked");
        return Ok(());
    };
    for path in &report.verified {
        output.success(&format!("{} verified", path.display()));
    }
    for (path, err) in &report.failed {
        output.warning(&format!("{}: {err}", path.display()));
    }
    output.info(&format!(
        "{} of {} archives verified (key: {source})",
        report.verified.len(),
        archives.len()
    ));
    Ok(())
}
