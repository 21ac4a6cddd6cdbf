//! Command modules - one file per CLI command

pub mod check;
pub mod clean;
pub mod completions;
pub mod inspect;
pub mod main_hash;
pub mod status;
pub mod update;
pub mod verify_archive;

use qupd_core::update::UpdateError;

/// Wrap a pipeline error so the top-level message carries its stable code.
pub(crate) fn failure(err: UpdateError) -> anyhow::Error {
    let code = err.kind().code();
    anyhow::Error::new(err).context(format!("update failed [{code}]"))
}
