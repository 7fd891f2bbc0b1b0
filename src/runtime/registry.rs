//! Shared registry state.
//!
//! One mutex guards the context map, the two runtime tunables and the
//! shutdown flag. Every actor that reads or writes a task timestamp — caller
//! threads stamping an invocation, the watchdog deciding to interrupt —
//! does so under this lock, so interruption decisions are linearized with
//! registry mutations: a context removed just before a scan is never
//! interrupted.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::engine::InterruptFlag;
use crate::types::{Config, ContextKey, Error, Result};

/// Watchdog view of one registered context. Non-owning: the `Context` handle
/// owns the engine session, the slot only carries what a scan needs.
#[derive(Debug)]
pub(crate) struct Slot {
    /// Set while exactly one invocation runs on the context.
    pub(crate) started_at: Option<Instant>,
    pub(crate) interrupt: InterruptFlag,
}

/// State guarded by the global lock.
#[derive(Debug)]
pub(crate) struct State {
    pub(crate) slots: HashMap<ContextKey, Slot>,
    pub(crate) max_task_duration: Duration,
    pub(crate) max_emit_size: usize,
    pub(crate) shutdown: bool,
}

/// The lock and its wakeup channel, shared by callers and the watchdog.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<State>,
    pub(crate) wake: Condvar,
}

impl Shared {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            state: Mutex::new(State {
                slots: HashMap::new(),
                max_task_duration: config.max_task_duration,
                max_emit_size: config.max_emit_size,
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Acquire the global lock. A poisoned lock is recovered rather than
    /// propagated: the state it guards stays consistent across panics (all
    /// writes are single-field).
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert the context's slot. Re-registering a key replaces the previous
    /// slot; the replaced context keeps running but is no longer supervised.
    pub(crate) fn register(&self, key: ContextKey, interrupt: InterruptFlag) -> Result<()> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(Error::shutdown("cannot register context"));
        }
        state.slots.insert(
            key,
            Slot {
                started_at: None,
                interrupt,
            },
        );
        tracing::debug!(%key, contexts = state.slots.len(), "context registered");
        Ok(())
    }

    /// Remove the context's slot. Removing an absent key is a no-op.
    pub(crate) fn unregister(&self, key: ContextKey) {
        let mut state = self.lock();
        if state.slots.remove(&key).is_some() {
            tracing::debug!(%key, contexts = state.slots.len(), "context unregistered");
        }
    }

    pub(crate) fn is_registered(&self, key: ContextKey) -> bool {
        self.lock().slots.contains_key(&key)
    }

    /// Stamp the start of an invocation and re-arm its interrupt flag.
    ///
    /// Returns the max-emit-size snapshot for this invocation. The stamp is
    /// only written when the slot still belongs to this context (`interrupt`
    /// identity match); a context whose key was re-registered runs
    /// unsupervised, matching the registry's replace-on-duplicate semantics.
    pub(crate) fn begin_task(&self, key: ContextKey, interrupt: &InterruptFlag) -> Result<usize> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(Error::shutdown("cannot start invocation"));
        }
        let snapshot = state.max_emit_size;
        if let Some(slot) = state.slots.get_mut(&key) {
            if slot.interrupt.same_flag(interrupt) {
                interrupt.clear();
                slot.started_at = Some(Instant::now());
                self.wake.notify_all();
            }
        }
        Ok(snapshot)
    }

    /// Clear the invocation stamp, whatever the exit path was.
    pub(crate) fn end_task(&self, key: ContextKey, interrupt: &InterruptFlag) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(&key) {
            if slot.interrupt.same_flag(interrupt) {
                slot.started_at = None;
            }
        }
    }

    pub(crate) fn set_max_task_duration(&self, duration: Duration) {
        let mut state = self.lock();
        state.max_task_duration = duration;
        // Wake the watchdog so a lowered budget is measured against promptly.
        self.wake.notify_all();
    }

    pub(crate) fn max_task_duration(&self) -> Duration {
        self.lock().max_task_duration
    }

    pub(crate) fn set_max_emit_size(&self, bytes: usize) {
        self.lock().max_emit_size = bytes;
    }

    pub(crate) fn request_shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        self.wake.notify_all();
    }
}
