use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, ReentrantMutex};
use thiserror::Error;

use crate::{
    scope::Registration, CancellationToken, Cancelled, Foreground, PoolKind, Scheduler, Scope,
    TaskError,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("debounce delay must be greater than zero")]
    NonPositiveDelay,
}

/// Observable lifecycle of a [`DebouncedRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Nothing scheduled.
    Idle,
    /// A cycle is waiting for its delay, running, or waiting for foreground delivery.
    Pending,
    /// Terminal. `run()` is a no-op.
    Disposed,
}

struct PendingRun {
    id: u64,
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct RunnerSlot {
    disposed: bool,
    pending: Option<PendingRun>,
}

struct RunnerInner {
    scheduler: Scheduler,
    foreground: Foreground,
    pool: PoolKind,
    delay: Duration,
    /// Parent of every cycle token; cancelled on disposal.
    token: CancellationToken,
    next_id: AtomicU64,
    slot: Mutex<RunnerSlot>,
    /// Held while a delivery is checked and performed, and by `dispose()`.
    delivery: ReentrantMutex<()>,
    /// Teardown entry in the owning scope; released on disposal or drop.
    registration: Mutex<Option<Registration>>,
}

/// Coalesces bursts of [`DebouncedRunner::run`] calls into one delayed background execution
/// whose result is delivered on the [`Foreground`].
///
/// Every `run()` cancels the previously scheduled cycle and restarts the delay, so only the last
/// call of a burst executes. The background closure runs on a [`Scheduler`] pool; its result is
/// handed to the foreground callback unless the cycle was superseded or the runner was disposed
/// first. A background closure that is already executing when it gets superseded is not
/// interrupted, but its token is cancelled and its result is dropped.
///
/// The runner is bound to an owning [`Scope`]: disposing the scope disposes the runner.
///
/// ```ignore
/// let runner = DebouncedRunner::new(scheduler, foreground, scope, Duration::from_millis(200))?;
/// runner.run(
///     move |_token| Ok(check_toolchain(&path)),
///     move |result| label.set_text(render(result)),
/// );
/// ```
#[derive(Clone)]
pub struct DebouncedRunner {
    inner: Arc<RunnerInner>,
}

/// Handle to a single debounce cycle.
#[derive(Debug, Clone)]
pub struct RunHandle {
    token: CancellationToken,
}

impl RunHandle {
    /// Cancel this cycle. A later cycle of the same runner is unaffected.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl DebouncedRunner {
    pub fn new(
        scheduler: Scheduler,
        foreground: Foreground,
        scope: Scope,
        delay: Duration,
    ) -> Result<Self, RunnerError> {
        Self::new_on_pool(scheduler, foreground, scope, PoolKind::Background, delay)
    }

    /// Like [`DebouncedRunner::new`], but background closures run on `pool`.
    pub fn new_on_pool(
        scheduler: Scheduler,
        foreground: Foreground,
        scope: Scope,
        pool: PoolKind,
        delay: Duration,
    ) -> Result<Self, RunnerError> {
        if delay.is_zero() {
            return Err(RunnerError::NonPositiveDelay);
        }

        let inner = Arc::new(RunnerInner {
            scheduler,
            foreground,
            pool,
            delay,
            token: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            slot: Mutex::new(RunnerSlot::default()),
            delivery: ReentrantMutex::new(()),
            registration: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let registration = scope.on_dispose(move || {
            if let Some(inner) = weak.upgrade() {
                inner.dispose();
            }
        });
        if inner.is_disposed() {
            registration.release();
        } else {
            *inner.registration.lock() = Some(registration);
        }

        Ok(Self { inner })
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    pub fn pool(&self) -> PoolKind {
        self.inner.pool
    }

    /// Schedule `background` to run after the debounce delay and hand its result to
    /// `foreground` on the foreground thread.
    ///
    /// Replaces any cycle scheduled by an earlier call. On a disposed runner this is a no-op and
    /// the returned handle is already cancelled.
    pub fn run<T, B, F>(&self, background: B, foreground: F) -> RunHandle
    where
        T: Send + 'static,
        B: FnOnce(CancellationToken) -> Result<T, Cancelled> + Send + 'static,
        F: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        let mut slot = self.inner.slot.lock();
        if slot.disposed {
            tracing::trace!(target: "vespera.scheduler", "run() on disposed runner ignored");
            let token = CancellationToken::new();
            token.cancel();
            return RunHandle { token };
        }

        if let Some(previous) = slot.pending.take() {
            tracing::trace!(target: "vespera.scheduler", cycle = previous.id, "superseded");
            previous.token.cancel();
            previous.handle.abort();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.token.child_token();

        let inner = Arc::clone(&self.inner);
        let token_for_task = token.clone();
        let delay = self.inner.delay;

        // Spawned while the slot is locked so the cycle is registered before it can finish.
        let handle = self.inner.scheduler.io_handle().spawn(async move {
            tokio::select! {
                biased;
                _ = token_for_task.cancelled() => {
                    inner.finish(id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let task = inner
                .scheduler
                .spawn_blocking_on(inner.pool, token_for_task.clone(), background);
            let result = task.join().await;

            if token_for_task.is_cancelled() {
                inner.finish(id);
                return;
            }

            let inner_for_delivery = Arc::clone(&inner);
            let queued = inner.foreground.invoke_later(move || {
                inner_for_delivery.deliver(id, result, foreground);
            });
            if !queued {
                tracing::debug!(
                    target: "vespera.scheduler",
                    cycle = id,
                    "foreground is shut down; dropping result"
                );
                inner.finish(id);
            }
        });

        slot.pending = Some(PendingRun {
            id,
            token: token.clone(),
            handle,
        });

        RunHandle { token }
    }

    /// Cancel the scheduled cycle, if any, without disposing the runner.
    pub fn cancel(&self) -> bool {
        let Some(pending) = self.inner.slot.lock().pending.take() else {
            return false;
        };
        pending.token.cancel();
        pending.handle.abort();
        true
    }

    /// Dispose the runner. Returns `true` only for the first call.
    ///
    /// Once this returns no result is delivered anymore. If another thread is in the middle of a
    /// delivery, this waits for it to finish.
    pub fn dispose(&self) -> bool {
        self.inner.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn state(&self) -> RunnerState {
        let slot = self.inner.slot.lock();
        if slot.disposed {
            RunnerState::Disposed
        } else if slot.pending.is_some() {
            RunnerState::Pending
        } else {
            RunnerState::Idle
        }
    }
}

impl fmt::Debug for DebouncedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebouncedRunner")
            .field("delay", &self.inner.delay)
            .field("pool", &self.inner.pool)
            .field("state", &self.state())
            .finish()
    }
}

impl RunnerInner {
    fn is_disposed(&self) -> bool {
        self.slot.lock().disposed
    }

    /// Clear the pending slot if it still belongs to cycle `id`.
    fn finish(&self, id: u64) {
        let mut slot = self.slot.lock();
        if slot.pending.as_ref().is_some_and(|pending| pending.id == id) {
            slot.pending = None;
        }
    }

    fn deliver<T, F>(&self, id: u64, result: Result<T, TaskError>, callback: F)
    where
        F: FnOnce(Result<T, TaskError>),
    {
        let _gate = self.delivery.lock();

        let current = {
            let mut slot = self.slot.lock();
            let current = !slot.disposed
                && slot
                    .pending
                    .as_ref()
                    .is_some_and(|pending| pending.id == id && !pending.token.is_cancelled());
            if slot.pending.as_ref().is_some_and(|pending| pending.id == id) {
                slot.pending = None;
            }
            current
        };

        if !current {
            tracing::trace!(target: "vespera.scheduler", cycle = id, "dropping stale result");
            return;
        }

        if let Err(err) = &result {
            tracing::debug!(
                target: "vespera.scheduler",
                cycle = id,
                error = %err,
                "delivering failure"
            );
        }
        callback(result);
    }

    fn dispose(&self) -> bool {
        let _gate = self.delivery.lock();

        let pending = {
            let mut slot = self.slot.lock();
            if slot.disposed {
                return false;
            }
            slot.disposed = true;
            slot.pending.take()
        };

        self.token.cancel();
        if let Some(pending) = pending {
            pending.handle.abort();
        }
        let registration = self.registration.lock().take();
        if let Some(registration) = registration {
            registration.release();
        }
        tracing::debug!(target: "vespera.scheduler", "debounced runner disposed");
        true
    }
}

impl Drop for RunnerInner {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.get_mut().take() {
            registration.release();
        }
    }
}
