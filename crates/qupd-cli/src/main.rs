//! qupd - secure hot updates CLI

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use qupd_cli::cmd;
use qupd_cli::ops::ClientContext;
use qupd_cli::ui::Output;
use qupd_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so command output stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let Cli {
        home,
        resource_dir,
        quiet,
        command,
    } = Cli::parse();
    let output = Output::new(quiet);
    let context = || ClientContext::resolve(home.as_deref(), resource_dir.as_deref());

    match command {
        Commands::Check { manifest, json } => {
            cmd::check::check(&context()?, manifest, json, &output).await
        }
        Commands::Update {
            manifest,
            asset_url,
        } => cmd::update::update(&context()?, manifest, asset_url, &output).await,
        Commands::Inspect { file, json } => cmd::inspect::inspect(&file, json),
        Commands::VerifyArchive {
            paths,
            scan,
            ext,
            strict,
        } => cmd::verify_archive::verify_archive(
            &paths,
            scan.as_deref(),
            &ext,
            strict,
            resource_dir.clone(),
            &output,
        ),
        Commands::MainHash { project, roots } => cmd::main_hash::main_hash(&project, &roots),
        Commands::Status => cmd::status::status(&context()?),
        Commands::Clean => cmd::clean::clean(&context()?, &output),
        Commands::Completions { shell } => {
            cmd::completions::completions(shell);
            Ok(())
        }
    }
}
