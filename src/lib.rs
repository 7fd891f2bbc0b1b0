//! # Mapreduce Core - view-script execution runtime
//!
//! Executes user-supplied, short-lived map/reduce/rereduce scripts against
//! documents as part of a view-indexing pipeline, guaranteeing that no single
//! script invocation can stall the pipeline indefinitely:
//! - Execution contexts: one scripting session per compiled function set
//! - Context registry: shared bookkeeping of every in-flight invocation
//! - Watchdog thread: interrupts invocations that exceed the task budget
//! - Invocation protocol: map, reduce (one or all functions), rereduce
//!
//! ## Architecture
//!
//! ```text
//!   caller threads                        watchdog thread
//!        │ map / reduce / rereduce              │ scan + interrupt
//!        ▼                                      ▼
//!   ┌─────────┐  stamp/clear   ┌──────────────────────────┐
//!   │ Context │ ─────────────▶ │ Registry (one global     │
//!   │ handles │                │ lock: slots + tunables)  │
//!   └─────────┘                └──────────────────────────┘
//!        │
//!        ▼ narrow trait interface
//!   ScriptEngine / ScriptSession (compile, invoke, interrupt, drain log)
//! ```
//!
//! Timeouts are cooperative: the watchdog sets a per-context flag the engine
//! observes at safepoints; a grace period of at most one budget plus one scan
//! interval is guaranteed, but no thread is ever killed.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod engine;
pub mod runtime;
pub mod types;

// Internal utilities
pub mod observability;

pub use engine::{
    FunctionMapResult, FunctionSource, InterruptFlag, KvPair, MapOutcome, NativeEngine,
    ScriptEngine, ScriptSession, ViewKind,
};
pub use runtime::{Context, Runtime};
pub use types::{Config, ContextKey, Error, Result};
