//! Reporter trait for dependency injection
//!
//! Lets the update pipeline report progress without depending on a
//! particular terminal or GUI front end.

use crate::update::UpdateState;

pub trait Reporter: Send + Sync {
    /// The orchestrator moved to a new state.
    fn state_changed(&self, state: &UpdateState);

    /// Download progress in bytes.
    fn downloading(&self, current: u64, total: Option<u64>);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn state_changed(&self, state: &UpdateState) {
        (**self).state_changed(state)
    }
    fn downloading(&self, current: u64, total: Option<u64>) {
        (**self).downloading(current, total)
    }
    fn info(&self, msg: &str) {
        (**self).info(msg)
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg)
    }
    fn error(&self, msg: &str) {
        (**self).error(msg)
    }
}

/// A reporter that does nothing (for headless runs and tests)
#[derive(Clone, Copy, Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn state_changed(&self, _state: &UpdateState) {}
    fn downloading(&self, _current: u64, _total: Option<u64>) {}
    fn info(&self, _msg: &str) {}
    fn warning(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
}
