//! Terminal output.
//!
//! - [`theme`] - Colors, icons and size formatting
//! - [`output`] - The handle commands print through; also the pipeline's
//!   [`Reporter`](qupd_core::Reporter)

pub mod output;
pub mod theme;

pub use output::Output;
pub use theme::Theme;
