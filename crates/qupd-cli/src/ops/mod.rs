//! Wiring between the CLI and the update pipeline.

pub mod context;

pub use context::ClientContext;
