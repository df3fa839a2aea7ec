use std::{
    fmt,
    sync::Arc,
    thread::{self, ThreadId},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::panic_payload_to_string;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The single serialized execution context that owns user-facing state.
///
/// Jobs submitted with [`Foreground::invoke_later`] run one at a time, in submission order, on a
/// dedicated thread. A panicking job is logged and the loop moves on to the next job.
///
/// The thread exits once [`Foreground::shutdown`] is called (or every handle is dropped) and the
/// queue has drained.
#[derive(Clone)]
pub struct Foreground {
    inner: Arc<ForegroundInner>,
}

struct ForegroundInner {
    name: String,
    thread_id: ThreadId,
    tx: Mutex<Option<Sender<Job>>>,
}

impl Foreground {
    pub fn new() -> std::io::Result<Self> {
        Self::named("vespera-foreground")
    }

    pub fn named(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let loop_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_foreground_loop(&loop_name, rx))?;

        Ok(Self {
            inner: Arc::new(ForegroundInner {
                name,
                thread_id: handle.thread().id(),
                tx: Mutex::new(Some(tx)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `job` to run on the foreground thread.
    ///
    /// Returns `false` (and drops the job) if the context has been shut down.
    pub fn invoke_later<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.inner.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    pub fn is_foreground_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Stop accepting jobs. Already queued jobs still run.
    pub fn shutdown(&self) {
        if self.inner.tx.lock().take().is_some() {
            tracing::debug!(
                target: "vespera.foreground",
                foreground = %self.inner.name,
                "shutting down"
            );
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.tx.lock().is_none()
    }
}

impl fmt::Debug for Foreground {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Foreground")
            .field("name", &self.inner.name)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn run_foreground_loop(name: &str, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            let message = panic_payload_to_string(&*panic);
            tracing::error!(
                target: "vespera.foreground",
                foreground = name,
                panic = %message,
                "foreground job panicked"
            );
        }
    }
    tracing::trace!(target: "vespera.foreground", foreground = name, "foreground loop exited");
}
