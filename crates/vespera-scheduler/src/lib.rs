//! Execution contexts and debounced scheduling for Vespera tooling.
//!
//! The crate models two kinds of execution context:
//!
//! - a single serialized [`Foreground`] context that owns user-facing state, and
//! - background worker pools owned by a [`Scheduler`].
//!
//! [`DebouncedRunner`] ties them together: bursts of `run()` calls collapse into one delayed
//! background execution whose result is delivered back on the foreground, unless the owning
//! [`Scope`] has been disposed in the meantime.

use std::any::Any;

use thiserror::Error;

mod debouncer;
mod foreground;
mod scheduler;
mod scope;
mod task;

pub use debouncer::{DebouncedRunner, RunHandle, RunnerError, RunnerState};
pub use foreground::Foreground;
pub use scheduler::{PoolKind, Scheduler, SchedulerConfig};
pub use scope::{Registration, Scope};
pub use task::BlockingTask;
pub use tokio_util::sync::CancellationToken;

/// Returned by cooperative work that noticed its [`CancellationToken`] was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

impl Cancelled {
    pub fn check(token: &CancellationToken) -> Result<(), Cancelled> {
        if token.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Failure of a scheduled task, as observed by whoever joins it or receives its result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        TaskError::Cancelled
    }
}

pub(crate) fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    match payload.downcast_ref::<String>() {
        Some(message) => message.clone(),
        None => "<non-string panic payload>".to_string(),
    }
}
