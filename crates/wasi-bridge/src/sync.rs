use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};

/// The producer side of a call result.
/// Exactly one value is ever stored, later `set` calls are ignored.
pub struct Completion<T> {
    inner: Arc<Slot<T>>,
}

/// The consumer side of a call result.
/// Returned by the worker pool when work is submitted; the caller blocks on it
/// with [`CallHandle::wait`] or polls with [`CallHandle::wait_timeout`].
pub struct CallHandle<T> {
    inner: Arc<Slot<T>>,
}

struct Slot<T> {
    state: Mutex<State<T>>,
    cvar: Condvar,
}

enum State<T> {
    Pending,
    Ready(Result<T>),
    Taken,
}

/// Creates a connected completion/handle pair.
pub fn completion<T>() -> (Completion<T>, CallHandle<T>) {
    let inner = Arc::new(Slot {
        state: Mutex::new(State::Pending),
        cvar: Condvar::new(),
    });
    let handle = CallHandle {
        inner: inner.clone(),
    };
    (Completion { inner }, handle)
}

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Completion<T> {
    /// Stores the result and wakes every waiter.
    /// Returns `false` if a result was already stored.
    pub fn set(&self, value: Result<T>) -> bool {
        let mut state = self.inner.lock();
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Ready(value);
        self.inner.cvar.notify_all();
        true
    }

    /// Returns a guard that fails the completion with `reason` if nothing was
    /// stored by the time the guard is dropped.
    ///
    /// Moving the guard into a work item makes sure that a dropped or panicking
    /// item still wakes its caller.
    pub fn set_guard(&self, reason: &'static str) -> CompletionGuard<T> {
        CompletionGuard {
            completion: self.clone(),
            reason,
        }
    }
}

/// Returned by [`Completion::set_guard`].
pub struct CompletionGuard<T> {
    completion: Completion<T>,
    reason: &'static str,
}

impl<T> CompletionGuard<T> {
    /// Fails the completion now with `err` instead of the drop reason.
    pub fn fail(&self, err: Error) -> bool {
        self.completion.set(Err(err))
    }
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        let _ = self
            .completion
            .set(Err(Error::WorkerDispatch(self.reason.to_string())));
    }
}

impl<T> std::fmt::Debug for CallHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.inner.lock() {
            State::Pending => "pending",
            State::Ready(Ok(_)) => "ready",
            State::Ready(Err(_)) => "failed",
            State::Taken => "taken",
        };
        f.debug_struct("CallHandle").field("state", &state).finish()
    }
}

impl<T> CallHandle<T> {
    /// A handle whose result is already known.
    pub fn ready(value: Result<T>) -> Self {
        let (completion, handle) = completion();
        completion.set(value);
        handle
    }

    /// Whether a result is available without blocking.
    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.lock(), State::Ready(_))
    }

    /// Block until the result is available.
    pub fn wait(mut self) -> Result<T> {
        match self.wait_timeout(None) {
            Some(result) => result,
            // a `None` timeout only returns once a value was stored
            None => Err(Error::WorkerDispatch("call handle already consumed".into())),
        }
    }

    /// Wait for the result with a timeout.
    /// Returns `None` if the timeout is reached with no value; the work keeps
    /// running and the handle can be waited on again.
    pub fn wait_timeout(&mut self, timeout: impl Into<Option<Duration>>) -> Option<Result<T>> {
        let timeout = timeout.into();
        let cvar = &self.inner.cvar;
        let guard = self.inner.lock();
        let pending = |state: &mut State<T>| matches!(state, State::Pending);
        let mut guard = match timeout {
            None => cvar
                .wait_while(guard, pending)
                .unwrap_or_else(PoisonError::into_inner),
            Some(Duration::ZERO) => guard,
            Some(dur) => cvar
                .wait_timeout_while(guard, dur, pending)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|err| err.into_inner().0),
        };
        match std::mem::replace(&mut *guard, State::Taken) {
            State::Ready(value) => Some(value),
            State::Pending => {
                *guard = State::Pending;
                None
            }
            State::Taken => None,
        }
    }
}
