pub mod archive;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod host;
pub mod installed;
pub mod integrity;
pub mod io;
pub mod keys;
pub mod lock;
pub mod paths;
pub mod update;

pub mod reporter;

pub use paths::*;
pub use reporter::{NullReporter, Reporter};

/// User Agent string for core operations
pub const USER_AGENT: &str = concat!("qupd-core/", env!("CARGO_PKG_VERSION"));
