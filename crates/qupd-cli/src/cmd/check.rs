//! Check command

use std::sync::Arc;

use anyhow::Result;
use crossterm::style::Stylize;
use qupd_core::NullReporter;
use qupd_core::update::Availability;
use serde_json::json;

use super::failure;
use crate::ops::ClientContext;
use crate::ui::Output;
use crate::ui::theme::format_size;

/// Report whether the published release is newer than this host.
pub async fn check(
    ctx: &ClientContext,
    manifest: Option<String>,
    json: bool,
    output: &Output,
) -> Result<()> {
    let source = ctx.source(manifest.as_deref(), None)?;
    let orchestrator = ctx.orchestrator(source, Arc::new(NullReporter))?;
    let availability = orchestrator.check().await.map_err(failure)?;

    let (manifest, current) = match &availability {
        Availability::Available(manifest) => (manifest, None),
        Availability::UpToDate { manifest, current } => (manifest, Some(current)),
    };

    if json {
        let value = json!({
            "available": current.is_none(),
            "version": manifest.semver().to_string(),
            "current": current.map(ToString::to_string),
            "assetName": manifest.asset_name,
            "assetSize": manifest.asset_size,
            "createdAt": manifest.created_at_iso(),
            "requiresMainHash": manifest.required_main_hash.is_some(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match current {
        None => {
            let theme = output.theme();
            output.success(&format!(
                "Update available: {} ({}, built {})",
                manifest.semver().to_string().with(theme.colors.version),
                format_size(manifest.asset_size),
                manifest.created_at_iso()
            ));
        }
        Some(current) => output.info(&format!(
            "Up to date at {current} (latest published {})",
            manifest.semver()
        )),
    }
    Ok(())
}
