//! qupd - secure hot updates
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Command-line client for the qupd update pipeline.
//!
//! # Directory Layout
//!
//! ```text
//! $QUPD_HOME/
//! ├── config.toml     # Client settings
//! ├── updates/        # Installed versions, one directory each
//! │   └── .staging/   # Extraction area, same filesystem as updates/
//! └── update-cache/   # Scratch space and update.lock
//! ```
//!
//! The host's resource directory supplies `build-info.json` and the
//! `security/` key files.

pub mod cmd;
pub mod ops;
pub mod ui;

pub use qupd_core::paths::*;

use clap::{Parser, Subcommand};
use qupd_core::archive::DEFAULT_ARCHIVE_EXTENSION;
use std::path::PathBuf;

/// Client version reported by `--version` and `status`.
pub const VERSION: &str = env!("QUPD_VERSION");

#[derive(Debug, Parser)]
#[command(name = "qupd")]
#[command(author, version = VERSION, about = "qupd - secure hot updates for desktop apps")]
pub struct Cli {
    /// Data directory (defaults to $QUPD_HOME or the platform data dir)
    #[arg(long, global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Host resource directory holding build-info.json and security/
    #[arg(long, global = true, value_name = "DIR")]
    pub resource_dir: Option<PathBuf>,

    /// Only print warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check whether a newer update is published
    Check {
        /// Manifest URL or local path (overrides config)
        #[arg(long, value_name = "URL")]
        manifest: Option<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download, verify and install the latest update
    Update {
        /// Manifest URL or local path (overrides config)
        #[arg(long, value_name = "URL")]
        manifest: Option<String>,
        /// Asset URL (defaults to the manifest's asset name next to it)
        #[arg(long, value_name = "URL")]
        asset_url: Option<String>,
    },
    /// Show the header of an update package
    Inspect {
        /// Package file
        file: PathBuf,
        /// Print the header as JSON
        #[arg(long)]
        json: bool,
    },
    /// Verify detached Ed25519 signatures of packaged archives
    VerifyArchive {
        /// Archives to verify
        paths: Vec<PathBuf>,
        /// Also verify every archive found under this directory
        #[arg(long, value_name = "DIR")]
        scan: Option<PathBuf>,
        /// Archive extension used with --scan
        #[arg(long, default_value = DEFAULT_ARCHIVE_EXTENSION)]
        ext: String,
        /// Fail on any missing key or bad signature
        #[arg(long)]
        strict: bool,
    },
    /// Compute the main-process hash of a project or build
    MainHash {
        /// Project directory
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// Hash these roots instead of the project defaults
        #[arg(long = "root", value_name = "DIR")]
        roots: Vec<PathBuf>,
    },
    /// Show host build, installed versions and lock state
    Status,
    /// Remove stale versions, staging leftovers and abandoned locks
    Clean,
    /// Generate shell completions
    Completions {
        /// Shell to generate for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}
