use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{panic_payload_to_string, CancellationToken};

type Teardown = Box<dyn FnOnce() + Send + 'static>;

/// An owning lifetime boundary.
///
/// Resources bound to a scope register teardown callbacks with [`Scope::on_dispose`]. Disposing
/// the scope runs each callback exactly once, most recently registered first, and cancels
/// [`Scope::token`]. Disposal is idempotent.
///
/// Clones share the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    token: CancellationToken,
    state: Mutex<ScopeState>,
    /// Entry in the parent's teardown list, for scopes made with [`Scope::child`].
    parent: Mutex<Option<Registration>>,
}

#[derive(Default)]
struct ScopeState {
    disposed: bool,
    next_key: u64,
    /// Keys increase with registration order.
    teardown: BTreeMap<u64, Teardown>,
}

/// A teardown callback registered with [`Scope::on_dispose`].
///
/// Dropping the registration keeps the callback registered. Call [`Registration::release`] once
/// the resource is gone so that long-lived scopes do not accumulate stale callbacks.
#[derive(Debug)]
pub struct Registration {
    scope: Weak<ScopeInner>,
    key: Option<u64>,
}

impl Registration {
    /// Remove the callback without running it. Returns `true` if it was still registered.
    pub fn release(self) -> bool {
        let (Some(key), Some(scope)) = (self.key, self.scope.upgrade()) else {
            return false;
        };
        let removed = scope.state.lock().teardown.remove(&key);
        // Dropped outside the lock; the callback may own the last handle to another scope.
        removed.is_some()
    }
}

impl Scope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: CancellationToken::new(),
                state: Mutex::new(ScopeState::default()),
                parent: Mutex::new(None),
            }),
        }
    }

    /// Create a scope that is disposed together with `self`.
    ///
    /// The child can still be disposed on its own earlier, which removes it from `self`.
    pub fn child(&self) -> Scope {
        let child = Scope::new();
        let weak = Arc::downgrade(&child.inner);
        let registration = self.on_dispose(move || {
            if let Some(inner) = weak.upgrade() {
                Scope { inner }.dispose();
            }
        });
        *child.inner.parent.lock() = Some(registration);
        child
    }

    /// Register `f` to run when the scope is disposed.
    ///
    /// If the scope is already disposed, `f` runs immediately on the calling thread and the
    /// returned registration is inert.
    pub fn on_dispose<F>(&self, f: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.disposed {
            drop(state);
            f();
            return Registration {
                scope: Weak::new(),
                key: None,
            };
        }
        let key = state.next_key;
        state.next_key += 1;
        state.teardown.insert(key, Box::new(f));
        Registration {
            scope: Arc::downgrade(&self.inner),
            key: Some(key),
        }
    }

    /// Dispose the scope. Returns `true` only for the call that actually performed the teardown.
    pub fn dispose(&self) -> bool {
        let teardown = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return false;
            }
            state.disposed = true;
            std::mem::take(&mut state.teardown)
        };

        self.inner.token.cancel();
        let parent = self.inner.parent.lock().take();
        if let Some(parent) = parent {
            parent.release();
        }

        for callback in teardown.into_values().rev() {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
                let message = panic_payload_to_string(&*panic);
                tracing::error!(
                    target: "vespera.scope",
                    panic = %message,
                    "teardown callback panicked"
                );
            }
        }
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Token cancelled once the scope is disposed.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.inner.state.lock().teardown.len()
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.get_mut().take() {
            parent.release();
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Scope")
            .field("disposed", &state.disposed)
            .field("teardown", &state.teardown.len())
            .finish()
    }
}
