//! Scripting engine interface.
//!
//! The runtime never runs function bodies itself; it drives an engine through
//! the narrow traits below. An engine compiles wrapped function sources into a
//! session, runs map/reduce/rereduce invocations against it, and honors the
//! cooperative [`InterruptFlag`] the runtime hands it at compile time.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::{Error, Result};

pub mod native;

pub use native::NativeEngine;

/// Kind of view index a context serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    MapReduce,
    Spatial,
}

impl std::str::FromStr for ViewKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mapreduce_view" => Ok(Self::MapReduce),
            "spatial_view" => Ok(Self::Spatial),
            _ => Err(Error::invalid_argument(format!("unknown view type: {s}"))),
        }
    }
}

/// One function source string, wrapped so it parses as a standalone
/// expression (`(function (doc) {...})` rather than a bare function
/// statement).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSource(String);

impl FunctionSource {
    /// Wrap a raw function body in parentheses.
    pub fn wrap(source: &str) -> Self {
        let mut wrapped = String::with_capacity(source.len() + 2);
        wrapped.push('(');
        wrapped.push_str(source);
        wrapped.push(')');
        Self(wrapped)
    }

    /// The wrapped source handed to the engine.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The source with the outer wrapping removed.
    pub fn unwrapped(&self) -> &str {
        self.0
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for FunctionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cooperative abort handle shared between the runtime's watchdog and a
/// running engine session.
///
/// The watchdog calls [`trigger`](Self::trigger) when a task exceeds its
/// budget; engines are expected to poll [`is_set`](Self::is_set) at bounded
/// intervals (safepoints) and abandon the running function when it fires.
/// No thread is ever killed.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the running invocation to abort at its next safepoint.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether an abort has been requested.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the flag before a new invocation.
    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether two handles refer to the same flag.
    pub(crate) fn same_flag(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// An emitted key/value byte pair.
pub type KvPair = (Bytes, Bytes);

/// Result of running one map function over one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionMapResult {
    /// Key/value pairs emitted by the function, in emission order.
    Emitted(Vec<KvPair>),
    /// The function threw or was interrupted; carries the diagnostic.
    Error(String),
}

/// Outcome of one map invocation: one entry per configured map function (in
/// the order the functions were supplied at context creation) plus the log
/// messages accumulated during execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapOutcome {
    pub results: Vec<FunctionMapResult>,
    pub log: Vec<String>,
}

/// Compiles function sources into executable sessions.
#[cfg_attr(test, mockall::automock)]
pub trait ScriptEngine: Send + Sync {
    /// Compile the wrapped sources into a new session of the given kind.
    ///
    /// The session must observe `interrupt` at safepoints during every
    /// invocation. Fails with [`Error::Compile`] on invalid source and
    /// [`Error::OutOfMemory`] on engine allocation failure.
    fn compile(
        &self,
        kind: ViewKind,
        sources: &[FunctionSource],
        interrupt: InterruptFlag,
    ) -> Result<Box<dyn ScriptSession>>;
}

/// One live scripting session bound to a compiled function set.
///
/// Sessions are driven by exactly one invocation at a time; the runtime
/// serializes callers before touching the session.
pub trait ScriptSession: Send {
    /// Number of compiled functions.
    fn function_count(&self) -> usize;

    /// Run every compiled map function against one document, returning one
    /// entry per function in compile order. Emission size limits are applied
    /// by the runtime, not the engine.
    fn map_doc(&mut self, doc: &[u8], meta: &[u8]) -> Result<Vec<FunctionMapResult>>;

    /// Run reduce function `index` over parallel key/value batches.
    fn reduce(&mut self, index: usize, keys: &[Bytes], values: &[Bytes]) -> Result<Bytes>;

    /// Fold previously produced reductions back through function `index`.
    fn rereduce(&mut self, index: usize, reductions: &[Bytes]) -> Result<Bytes>;

    /// Drain log messages accumulated since the last drain.
    fn drain_log(&mut self) -> Vec<String>;
}
