//! Hot-update orchestration.

pub mod context;
pub mod error;
pub mod orchestrator;
pub mod state;

pub use context::UpdateContext;
pub use error::{CryptoFailure, FailureKind, GateFailure, UpdateError};
pub use orchestrator::{Availability, UpdateOrchestrator, UpdateOutcome};
pub use state::UpdateState;
