//! Main-hash command

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use qupd_core::integrity::{compute_hash_from_roots, default_roots};

/// Print the main-process hash of `project`.
///
/// Paths are hashed relative to `project`. Without explicit `roots` the
/// built output is preferred over the source tree.
pub fn main_hash(project: &Path, roots: &[PathBuf]) -> Result<()> {
    let roots = if roots.is_empty() {
        default_roots(project)
    } else {
        roots.to_vec()
    };
    let hash = compute_hash_from_roots(&roots, project)
        .context("Failed to hash main-process files")?;
    match hash {
        Some(hash) => {
            println!("{hash}");
            Ok(())
        }
        None => bail!("No main-process files found under {}", project.display()),
    }
}
