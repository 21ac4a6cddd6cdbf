//! Status command

use anyhow::Result;
use comfy_table::{Table, presets};
use crossterm::style::Stylize;
use qupd_core::host::HostBuild;
use qupd_core::installed::list_installed;
use qupd_core::lock;

use crate::VERSION;
use crate::ops::ClientContext;
use crate::ui::Output;

/// Show the host build, installed versions and lock state.
pub fn status(ctx: &ClientContext) -> Result<()> {
    let output = Output::new(false);
    let layout = &ctx.layout;

    output.section("Update status");
    output.field("Client", VERSION);
    output.field("Home", layout.root().display());
    output.field(
        "Manifest",
        ctx.config.manifest_url.as_deref().unwrap_or("not configured"),
    );

    match ctx.config.resource_dir.as_deref() {
        None => output.field("Host", "no resource directory configured"),
        Some(dir) => match HostBuild::load(dir) {
            Ok(host) => {
                output.field("Host", &host.version);
                if let Some(built) = host.build_time {
                    output.field("Built", built.format("%Y-%m-%d %H:%M UTC"));
                }
                match &host.main_hash {
                    Some(hash) => output.field("Main hash", hash),
                    None => output.field("Main hash", "unavailable"),
                }
            }
            Err(e) => output.field("Host", format!("unreadable ({e:#})")),
        },
    }

    let lock_path = layout.lock_path();
    if let Some(info) = lock::read_info(&lock_path) {
        output.field(
            "Lock",
            format!(
                "held by pid {} since {}",
                info.pid,
                info.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        );
    } else if lock_path.exists() {
        output.field("Lock", "present (unreadable)");
    } else {
        output.field("Lock", "free");
    }

    let installed = list_installed(layout, &ctx.config.entry_file)?;
    if installed.is_empty() {
        println!();
        println!("{}", "No updates installed".dark_grey());
        println!();
        return Ok(());
    }

    let active = installed.iter().position(|v| v.complete);
    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_header(vec!["Version", "State", "Installed"]);
    for (i, version) in installed.iter().enumerate() {
        let state = if Some(i) == active {
            "active"
        } else if version.complete {
            "retained"
        } else {
            "incomplete"
        };
        let modified = chrono::DateTime::<chrono::Local>::from(version.modified)
            .format("%Y-%m-%d %H:%M")
            .to_string();
        table.add_row(vec![version.name.clone(), state.to_string(), modified]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
