//! Runtime - the invocation protocol and context lifecycle.
//!
//! The `Runtime` owns the shared registry and the watchdog thread; `Context`
//! handles own their engine session and drive map/reduce/rereduce
//! invocations through it. Each invocation is stamped in the registry so the
//! watchdog can measure it, and the stamp is cleared on every exit path via
//! an RAII guard.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::engine::{
    FunctionMapResult, FunctionSource, InterruptFlag, MapOutcome, ScriptEngine, ScriptSession,
    ViewKind,
};
use crate::types::{Config, ContextKey, Error, Result};

mod registry;
mod watchdog;

use registry::Shared;

/// The map/reduce execution runtime.
///
/// Spawns the watchdog on creation; [`shutdown`](Self::shutdown) (also run on
/// drop) signals it and joins the thread before returning, so no scan runs
/// after shutdown.
pub struct Runtime {
    shared: Arc<Shared>,
    engine: Arc<dyn ScriptEngine>,
    watchdog: Option<JoinHandle<()>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("shared", &self.shared)
            .field("watchdog_running", &self.watchdog.is_some())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create a runtime over the given scripting engine and start the
    /// watchdog thread.
    pub fn new(config: Config, engine: Arc<dyn ScriptEngine>) -> Result<Self> {
        let shared = Arc::new(Shared::new(&config));
        let watchdog = std::thread::Builder::new()
            .name("mapreduce-watchdog".to_string())
            .spawn({
                let shared = shared.clone();
                move || watchdog::run(shared)
            })
            .map_err(|e| Error::runtime(format!("failed to spawn watchdog thread: {e}")))?;

        tracing::info!(
            max_task_duration_ms = config.max_task_duration.as_millis() as u64,
            max_emit_size = config.max_emit_size,
            "runtime started"
        );
        Ok(Self {
            shared,
            engine,
            watchdog: Some(watchdog),
        })
    }

    /// Compile map functions into a new registered context.
    pub fn start_map_context<S: AsRef<str>>(
        &self,
        kind: ViewKind,
        sources: &[S],
        key: impl Into<ContextKey>,
    ) -> Result<Context> {
        self.start_context(kind, sources, key.into())
    }

    /// Compile reduce functions into a new registered context.
    pub fn start_reduce_context<S: AsRef<str>>(
        &self,
        sources: &[S],
        key: impl Into<ContextKey>,
    ) -> Result<Context> {
        self.start_context(ViewKind::MapReduce, sources, key.into())
    }

    fn start_context<S: AsRef<str>>(
        &self,
        kind: ViewKind,
        sources: &[S],
        key: ContextKey,
    ) -> Result<Context> {
        let wrapped: Vec<FunctionSource> = sources
            .iter()
            .map(|s| FunctionSource::wrap(s.as_ref()))
            .collect();
        let interrupt = InterruptFlag::new();
        let session = self.engine.compile(kind, &wrapped, interrupt.clone())?;
        self.shared.register(key, interrupt.clone())?;

        Ok(Context {
            shared: self.shared.clone(),
            key,
            kind,
            session: Mutex::new(Some(session)),
            interrupt,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Set the task budget from milliseconds, rounding up to whole seconds.
    /// Takes effect on the watchdog's next scan; an in-flight invocation is
    /// never retroactively shortened below its already-elapsed time.
    pub fn set_timeout(&self, timeout_ms: u64) {
        let secs = timeout_ms.div_ceil(1000);
        self.shared.set_max_task_duration(Duration::from_secs(secs));
    }

    /// Current task budget.
    pub fn max_task_duration(&self) -> Duration {
        self.shared.max_task_duration()
    }

    /// Set the cap on one emitted key/value pair, applied to subsequent map
    /// invocations.
    pub fn set_max_emit_size(&self, bytes: usize) {
        self.shared.set_max_emit_size(bytes);
    }

    /// Whether a context is currently registered under `key`.
    pub fn is_registered(&self, key: impl Into<ContextKey>) -> bool {
        self.shared.is_registered(key.into())
    }

    /// Signal the watchdog and join its thread. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            self.shared.request_shutdown();
            if handle.join().is_err() {
                tracing::error!("watchdog thread panicked");
            }
            tracing::info!("runtime shut down");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to one execution context: a scripting session bound to a compiled
/// function set, registered with the watchdog for its whole lifetime.
///
/// At most one invocation may run on a context at a time; a concurrent
/// attempt fails with [`Error::ContextBusy`]. Callers must not destroy a
/// context while an invocation is outstanding ([`destroy`](Self::destroy)
/// blocks until the session is free).
pub struct Context {
    shared: Arc<Shared>,
    key: ContextKey,
    kind: ViewKind,
    session: Mutex<Option<Box<dyn ScriptSession>>>,
    interrupt: InterruptFlag,
    destroyed: AtomicBool,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Clears the invocation stamp on every exit path.
struct TaskGuard<'a> {
    shared: &'a Shared,
    key: ContextKey,
    interrupt: &'a InterruptFlag,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.shared.end_task(self.key, self.interrupt);
    }
}

type SessionGuard<'a> = MutexGuard<'a, Option<Box<dyn ScriptSession>>>;

impl Context {
    /// The context's registry key.
    pub fn key(&self) -> ContextKey {
        self.key
    }

    /// The view-index kind the context was created for.
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    fn acquire_session(&self) -> Result<SessionGuard<'_>> {
        match self.session.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(Error::context_busy(format!(
                "context {} already has an invocation running",
                self.key
            ))),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    fn begin_task(&self) -> Result<(usize, TaskGuard<'_>)> {
        let max_emit_size = self.shared.begin_task(self.key, &self.interrupt)?;
        let guard = TaskGuard {
            shared: &self.shared,
            key: self.key,
            interrupt: &self.interrupt,
        };
        Ok((max_emit_size, guard))
    }

    /// Run every map function against one document.
    ///
    /// Returns one entry per function in compile order — either the emitted
    /// key/value pairs or a per-function error (thrown, oversized emission,
    /// interrupted) — plus the log messages produced during execution.
    pub fn map_doc(&self, doc: &[u8], meta: &[u8]) -> Result<MapOutcome> {
        let mut guard = self.acquire_session()?;
        let session = session_mut(&mut guard, self.key)?;

        let (max_emit_size, _task) = self.begin_task()?;
        let mut results = session.map_doc(doc, meta)?;
        for result in &mut results {
            enforce_emit_cap(result, max_emit_size);
        }
        let log = session.drain_log();
        Ok(MapOutcome { results, log })
    }

    /// Run every reduce function once over the whole batch; outputs in
    /// function-definition order.
    pub fn reduce_all(&self, keys: &[Bytes], values: &[Bytes]) -> Result<Vec<Bytes>> {
        check_batch(keys, values)?;
        let mut guard = self.acquire_session()?;
        let session = session_mut(&mut guard, self.key)?;

        let (_, _task) = self.begin_task()?;
        let mut outputs = Vec::with_capacity(session.function_count());
        for index in 0..session.function_count() {
            outputs.push(session.reduce(index, keys, values)?);
        }
        Ok(outputs)
    }

    /// Run one reduce function (zero-based `index`) over the whole batch.
    pub fn reduce(&self, index: usize, keys: &[Bytes], values: &[Bytes]) -> Result<Bytes> {
        check_batch(keys, values)?;
        let mut guard = self.acquire_session()?;
        let session = session_mut(&mut guard, self.key)?;
        check_index(index, session.function_count())?;

        let (_, _task) = self.begin_task()?;
        session.reduce(index, keys, values)
    }

    /// Fold previously produced reductions back through reduce function
    /// `index`, with empty keys.
    pub fn rereduce(&self, index: usize, reductions: &[Bytes]) -> Result<Bytes> {
        let mut guard = self.acquire_session()?;
        let session = session_mut(&mut guard, self.key)?;
        check_index(index, session.function_count())?;

        let (_, _task) = self.begin_task()?;
        session.rereduce(index, reductions)
    }

    /// Unregister the context and release the compiled session.
    ///
    /// Idempotent: a second call is a no-op. Blocks until any in-flight
    /// invocation has returned. Also runs on drop, so a leaked handle still
    /// leaves the registry clean.
    pub fn destroy(&self) {
        self.unregister();
        let mut guard = self
            .session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = None;
    }

    fn unregister(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.shared.unregister(self.key);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Borrow the live session out of its guard; a destroyed context has none.
fn session_mut<'a>(
    guard: &'a mut SessionGuard<'_>,
    key: ContextKey,
) -> Result<&'a mut dyn ScriptSession> {
    guard
        .as_mut()
        .map(|session| session.as_mut() as &mut dyn ScriptSession)
        .ok_or_else(|| Error::invalid_argument(format!("context {key} was destroyed")))
}

fn check_batch(keys: &[Bytes], values: &[Bytes]) -> Result<()> {
    if keys.len() != values.len() {
        return Err(Error::invalid_argument(format!(
            "keys/values length mismatch: {} keys, {} values",
            keys.len(),
            values.len()
        )));
    }
    Ok(())
}

fn check_index(index: usize, count: usize) -> Result<()> {
    if index >= count {
        return Err(Error::invalid_argument(format!(
            "invalid reduce function index: {index} (have {count})"
        )));
    }
    Ok(())
}

/// Replace a function's emissions with an error entry if any single pair
/// exceeds the cap. Sibling functions are unaffected.
fn enforce_emit_cap(result: &mut FunctionMapResult, max_emit_size: usize) {
    let FunctionMapResult::Emitted(pairs) = result else {
        return;
    };
    for (key, value) in pairs.iter() {
        let size = key.len() + value.len();
        if size > max_emit_size {
            *result = FunctionMapResult::Error(format!(
                "key-value pair is too long: {size} bytes (max {max_emit_size})"
            ));
            return;
        }
    }
}
