//! Update command

use std::sync::Arc;

use anyhow::Result;
use qupd_core::update::UpdateOutcome;
use tokio_util::sync::CancellationToken;

use super::failure;
use crate::ops::ClientContext;
use crate::ui::Output;

/// Download, verify and install the latest release.
///
/// Ctrl-C cancels while the manifest or asset is still being fetched;
/// once verification starts the attempt runs to completion.
pub async fn update(
    ctx: &ClientContext,
    manifest: Option<String>,
    asset_url: Option<String>,
    output: &Output,
) -> Result<()> {
    let source = ctx.source(manifest.as_deref(), asset_url.as_deref())?;
    let orchestrator = ctx.orchestrator(source, Arc::new(output.clone()))?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    output.section("Updating");
    let result = orchestrator.run(cancel).await;
    watcher.abort();

    match result {
        Ok(UpdateOutcome::Applied { version, path }) => {
            output.success(&format!("Installed {version} to {}", path.display()));
        }
        Ok(UpdateOutcome::UpToDate { available, current }) => {
            output.success(&format!(
                "Already up to date at {current} (latest published {available})"
            ));
        }
        Ok(UpdateOutcome::Cancelled) => output.warning("Update cancelled"),
        Err(e) => {
            if e.kind().is_retryable() {
                output.info("This failure is transient. Run the update again later.");
            }
            return Err(failure(e));
        }
    }
    Ok(())
}
