//! Non-error outcomes of component operations
//!
//! Components return `Result<Progress>`: errors are failures that feed the
//! backoff policy, while [`Progress::Deferred`] is expected throttling (a
//! closed maintenance window, a running execution unit) that only shortens
//! the next requeue.

use std::time::Duration;

/// Result of one non-blocking step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Step finished for this cycle
    Complete,
    /// Step is waiting on something outside the controller
    Deferred {
        /// Stable CamelCase reason
        reason: &'static str,
        /// When it is worth looking again
        retry_after: Duration,
    },
}

impl Progress {
    pub fn deferred(reason: &'static str, retry_after: Duration) -> Self {
        Progress::Deferred {
            reason,
            retry_after,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Progress::Deferred { .. })
    }

    /// Requeue hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Progress::Complete => None,
            Progress::Deferred { retry_after, .. } => Some(*retry_after),
        }
    }
}
