//! Caller and callee session state machines.
//!
//! A session owns every resource of one logical call: devices, models,
//! transport, stage threads. `start()` acquires everything before the state
//! becomes `Active` and rolls back on any failure; `stop()` cancels all
//! blocked stage threads, joins them, and releases resources before it
//! returns; `release()` disposes the session for good. Asynchronous
//! failures park the session in `Failed` with the error retrievable via
//! `last_error()`.

mod callee;
mod caller;
#[cfg(test)]
mod tests;

pub use callee::ServerSession;
pub use caller::CallSession;

use crate::error::WatermarkError;
use crate::lock_or_recover;
use std::sync::{Arc, Mutex};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    /// An unrecoverable error occurred while `Starting` or `Active`;
    /// `stop()` still cleans up and returns to `Idle`.
    Failed,
    /// Released; every further operation fails with `DisposedError`.
    Disposed,
}

/// State plus the single error-reporting cell shared with stage threads.
pub(crate) struct StateCell {
    state: Mutex<SessionState>,
    error: Mutex<Option<WatermarkError>>,
}

impl StateCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState::Idle),
            error: Mutex::new(None),
        })
    }

    pub(crate) fn get(&self) -> SessionState {
        *lock_or_recover(&self.state, "session state")
    }

    pub(crate) fn set(&self, next: SessionState) {
        *lock_or_recover(&self.state, "session state") = next;
    }

    /// Report a cross-cutting failure from a stage thread. Only the first
    /// error is kept; failures during teardown are expected and ignored.
    pub(crate) fn fail(&self, err: WatermarkError) {
        let mut state = lock_or_recover(&self.state, "session state");
        match *state {
            SessionState::Starting | SessionState::Active => {
                tracing::warn!("session failed: {err}");
                *state = SessionState::Failed;
                let mut cell = lock_or_recover(&self.error, "session error");
                if cell.is_none() {
                    *cell = Some(err);
                }
            }
            _ => {
                tracing::debug!("error during teardown ignored: {err}");
            }
        }
    }

    pub(crate) fn store_error(&self, err: WatermarkError) {
        let mut cell = lock_or_recover(&self.error, "session error");
        if cell.is_none() {
            *cell = Some(err);
        }
    }

    pub(crate) fn last_error(&self) -> Option<WatermarkError> {
        lock_or_recover(&self.error, "session error").clone()
    }

    pub(crate) fn clear_error(&self) {
        lock_or_recover(&self.error, "session error").take();
    }
}
