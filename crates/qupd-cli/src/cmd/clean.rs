//! Clean command

use anyhow::{Context, Result};
use qupd_core::installed::cleanup;
use qupd_core::lock::UpdateLock;

use crate::ops::ClientContext;
use crate::ui::Output;

/// Apply retention and clear staging leftovers.
///
/// Takes the update lock first so it never races a running update.
pub fn clean(ctx: &ClientContext, output: &Output) -> Result<()> {
    let layout = &ctx.layout;
    let policy = ctx.config.lock_policy();
    let _lock = UpdateLock::acquire(&layout.lock_path(), policy)
        .context("Cannot clean while an update is running")?;

    let report = cleanup(layout, ctx.config.retain, &ctx.config.entry_file, policy)
        .context("Failed to clean update directory")?;

    for version in &report.removed_versions {
        output.info(&format!("Removed {version}"));
    }
    if report.removed_files > 0 {
        output.info(&format!("Removed {} leftover files", report.removed_files));
    }
    if report.kept.is_empty() {
        output.success("Nothing installed.");
    } else {
        output.success(&format!("Keeping {}", report.kept.join(", ")));
    }
    Ok(())
}
