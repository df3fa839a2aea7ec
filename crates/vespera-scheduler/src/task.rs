use tokio::sync::oneshot;

use crate::{CancellationToken, TaskError};

/// Handle to a closure running on one of the [`Scheduler`](crate::Scheduler) worker pools.
pub struct BlockingTask<T> {
    token: CancellationToken,
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> BlockingTask<T> {
    pub(crate) fn new(
        token: CancellationToken,
        rx: oneshot::Receiver<Result<T, TaskError>>,
    ) -> Self {
        Self { token, rx }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the task to finish.
    ///
    /// Resolves to [`TaskError::Cancelled`] as soon as the token is cancelled, even if the closure
    /// is still running on its worker thread.
    pub async fn join(self) -> Result<T, TaskError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(TaskError::Cancelled),
            result = self.rx => match result {
                Ok(result) => result,
                Err(_) => Err(TaskError::Panicked("worker dropped the task".to_string())),
            }
        }
    }
}
