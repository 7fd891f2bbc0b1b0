//! In-process engine backed by registered Rust closures.
//!
//! `NativeEngine` "compiles" a function source by looking its (unwrapped,
//! trimmed) text up in a table of registered closures, so view functions are
//! plain Rust. It implements the full session contract — emission, logging
//! and interrupt safepoints — and is what the test-suite drives the runtime
//! with. Hosts embedding a real scripting engine implement the same traits.

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::engine::{
    FunctionMapResult, FunctionSource, InterruptFlag, KvPair, ScriptEngine, ScriptSession,
    ViewKind,
};
use crate::types::{Error, Result};

/// Execution context handed to a native map function.
#[derive(Debug)]
pub struct MapCtx<'a> {
    emits: &'a mut Vec<KvPair>,
    log: &'a mut Vec<String>,
    interrupt: &'a InterruptFlag,
}

impl MapCtx<'_> {
    /// Emit one key/value pair for the current document.
    pub fn emit(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.emits.push((key.into(), value.into()));
    }

    /// Record a log message, surfaced to the caller after the invocation.
    pub fn log(&mut self, msg: impl Into<String>) {
        self.log.push(msg.into());
    }

    /// Safepoint: whether the watchdog has requested an abort.
    pub fn interrupted(&self) -> bool {
        self.interrupt.is_set()
    }
}

/// Input to a native reduce function.
#[derive(Debug)]
pub struct ReduceInput<'a> {
    /// Parsed keys, one per source row. Empty on rereduce.
    pub keys: &'a [Value],
    /// Parsed values (or prior reductions when `rereduce` is set).
    pub values: &'a [Value],
    /// True when folding previously produced reductions.
    pub rereduce: bool,
    interrupt: &'a InterruptFlag,
}

impl ReduceInput<'_> {
    /// Safepoint: whether the watchdog has requested an abort.
    pub fn interrupted(&self) -> bool {
        self.interrupt.is_set()
    }
}

/// A registered map function. Returns `Err` with a diagnostic to produce an
/// error entry for this function without affecting siblings.
pub type MapFn =
    Arc<dyn Fn(&Value, &Value, &mut MapCtx<'_>) -> std::result::Result<(), String> + Send + Sync>;

/// A registered reduce function. Must handle both the reduce and rereduce
/// shapes of [`ReduceInput`].
pub type ReduceFn =
    Arc<dyn Fn(&ReduceInput<'_>) -> std::result::Result<Value, String> + Send + Sync>;

#[derive(Clone)]
enum NativeFn {
    Map(MapFn),
    Reduce(ReduceFn),
}

/// Closure-backed [`ScriptEngine`].
#[derive(Clone, Default)]
pub struct NativeEngine {
    functions: HashMap<String, NativeFn>,
}

impl fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("NativeEngine").field("functions", &names).finish()
    }
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a map function under the source text that names it.
    pub fn with_map(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&Value, &Value, &mut MapCtx<'_>) -> std::result::Result<(), String>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.functions.insert(name.into(), NativeFn::Map(Arc::new(f)));
        self
    }

    /// Register a reduce function under the source text that names it.
    pub fn with_reduce(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&ReduceInput<'_>) -> std::result::Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.functions.insert(name.into(), NativeFn::Reduce(Arc::new(f)));
        self
    }
}

impl ScriptEngine for NativeEngine {
    fn compile(
        &self,
        _kind: ViewKind,
        sources: &[FunctionSource],
        interrupt: InterruptFlag,
    ) -> Result<Box<dyn ScriptSession>> {
        let mut functions = Vec::with_capacity(sources.len());
        for source in sources {
            let name = source.unwrapped().trim();
            let function = self
                .functions
                .get(name)
                .cloned()
                .ok_or_else(|| Error::compile(format!("undefined function: {name}")))?;
            functions.push((name.to_string(), function));
        }
        Ok(Box::new(NativeSession {
            functions,
            interrupt,
            log: Vec::new(),
        }))
    }
}

struct NativeSession {
    functions: Vec<(String, NativeFn)>,
    interrupt: InterruptFlag,
    log: Vec<String>,
}

impl NativeSession {
    fn reduce_fn(&self, index: usize) -> Result<(&str, &ReduceFn)> {
        match self.functions.get(index) {
            Some((name, NativeFn::Reduce(f))) => Ok((name, f)),
            Some((name, NativeFn::Map(_))) => {
                Err(Error::invalid_argument(format!("not a reduce function: {name}")))
            }
            None => Err(Error::invalid_argument(format!(
                "invalid reduce function index: {index}"
            ))),
        }
    }

    fn run_reduce(&mut self, index: usize, keys: &[Value], values: &[Value], rereduce: bool) -> Result<Bytes> {
        let (name, function) = self.reduce_fn(index)?;
        if self.interrupt.is_set() {
            return Err(Error::runtime(format!("timeout in function {name}")));
        }
        let input = ReduceInput {
            keys,
            values,
            rereduce,
            interrupt: &self.interrupt,
        };
        let output = function(&input).map_err(Error::runtime)?;
        if self.interrupt.is_set() {
            return Err(Error::runtime(format!("timeout in function {name}")));
        }
        let bytes = serde_json::to_vec(&output)
            .map_err(|e| Error::runtime(format!("unserializable reduction: {e}")))?;
        Ok(Bytes::from(bytes))
    }
}

fn parse_batch(what: &str, items: &[Bytes]) -> Result<Vec<Value>> {
    items
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            serde_json::from_slice(raw)
                .map_err(|e| Error::runtime(format!("invalid JSON in {what} {i}: {e}")))
        })
        .collect()
}

impl ScriptSession for NativeSession {
    fn function_count(&self) -> usize {
        self.functions.len()
    }

    fn map_doc(&mut self, doc: &[u8], meta: &[u8]) -> Result<Vec<FunctionMapResult>> {
        let doc: Value = serde_json::from_slice(doc)
            .map_err(|e| Error::runtime(format!("invalid document JSON: {e}")))?;
        let meta: Value = if meta.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(meta)
                .map_err(|e| Error::runtime(format!("invalid metadata JSON: {e}")))?
        };

        let mut results = Vec::with_capacity(self.functions.len());
        for (name, function) in &self.functions {
            if self.interrupt.is_set() {
                results.push(FunctionMapResult::Error(format!("timeout in function {name}")));
                continue;
            }
            let NativeFn::Map(function) = function else {
                results.push(FunctionMapResult::Error(format!("not a map function: {name}")));
                continue;
            };
            let mut emits = Vec::new();
            let mut ctx = MapCtx {
                emits: &mut emits,
                log: &mut self.log,
                interrupt: &self.interrupt,
            };
            match function(&doc, &meta, &mut ctx) {
                Ok(()) => results.push(FunctionMapResult::Emitted(emits)),
                Err(msg) => results.push(FunctionMapResult::Error(msg)),
            }
        }
        Ok(results)
    }

    fn reduce(&mut self, index: usize, keys: &[Bytes], values: &[Bytes]) -> Result<Bytes> {
        let keys = parse_batch("key", keys)?;
        let values = parse_batch("value", values)?;
        self.run_reduce(index, &keys, &values, false)
    }

    fn rereduce(&mut self, index: usize, reductions: &[Bytes]) -> Result<Bytes> {
        let reductions = parse_batch("reduction", reductions)?;
        self.run_reduce(index, &[], &reductions, true)
    }

    fn drain_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.log)
    }
}

/// Sum of numeric values; handles reduce and rereduce identically.
pub fn sum_reduce(input: &ReduceInput<'_>) -> std::result::Result<Value, String> {
    let mut total = 0.0;
    for value in input.values {
        total += value
            .as_f64()
            .ok_or_else(|| format!("not a number: {value}"))?;
    }
    if total.fract() == 0.0 && total.abs() < (i64::MAX as f64) {
        Ok(Value::from(total as i64))
    } else {
        Ok(Value::from(total))
    }
}

/// Row count; on rereduce, sums the partial counts.
pub fn count_reduce(input: &ReduceInput<'_>) -> std::result::Result<Value, String> {
    if input.rereduce {
        sum_reduce(input)
    } else {
        Ok(Value::from(input.values.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(engine: &NativeEngine, names: &[&str]) -> Box<dyn ScriptSession> {
        let sources: Vec<FunctionSource> = names.iter().map(|n| FunctionSource::wrap(n)).collect();
        engine
            .compile(ViewKind::MapReduce, &sources, InterruptFlag::new())
            .unwrap()
    }

    #[test]
    fn unknown_function_fails_compile() {
        let engine = NativeEngine::new();
        let sources = [FunctionSource::wrap("missing")];
        let err = engine
            .compile(ViewKind::MapReduce, &sources, InterruptFlag::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Compile(_)));
    }

    #[test]
    fn map_emits_and_logs() {
        let engine = NativeEngine::new().with_map("emit_id", |doc, _meta, ctx| {
            ctx.log("mapping one doc");
            let id = doc["_id"].as_str().ok_or("missing _id")?;
            ctx.emit(id.to_string(), "1");
            Ok(())
        });
        let mut session = compile(&engine, &["emit_id"]);

        let results = session.map_doc(br#"{"_id":"doc1"}"#, b"").unwrap();
        assert_eq!(
            results,
            vec![FunctionMapResult::Emitted(vec![(
                Bytes::from("doc1"),
                Bytes::from("1")
            )])]
        );
        assert_eq!(session.drain_log(), vec!["mapping one doc".to_string()]);
        assert!(session.drain_log().is_empty());
    }

    #[test]
    fn map_error_does_not_abort_siblings() {
        let engine = NativeEngine::new()
            .with_map("boom", |_, _, _| Err("thrown".into()))
            .with_map("ok", |_, _, ctx| {
                ctx.emit("k", "v");
                Ok(())
            });
        let mut session = compile(&engine, &["boom", "ok"]);

        let results = session.map_doc(b"{}", b"").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], FunctionMapResult::Error("thrown".into()));
        assert!(matches!(results[1], FunctionMapResult::Emitted(ref kvs) if kvs.len() == 1));
    }

    #[test]
    fn invalid_document_is_a_runtime_error() {
        let engine = NativeEngine::new().with_map("noop", |_, _, _| Ok(()));
        let mut session = compile(&engine, &["noop"]);
        assert!(matches!(
            session.map_doc(b"{not json", b""),
            Err(Error::Runtime(_))
        ));
    }

    #[test]
    fn sum_and_count_builtins() {
        let engine = NativeEngine::new()
            .with_reduce("sum", sum_reduce)
            .with_reduce("count", count_reduce);
        let mut session = compile(&engine, &["sum", "count"]);

        let keys: Vec<Bytes> = vec![Bytes::from("null"); 3];
        let values: Vec<Bytes> = ["1", "2", "3"].iter().map(|v| Bytes::from(*v)).collect();

        assert_eq!(session.reduce(0, &keys, &values).unwrap(), Bytes::from("6"));
        assert_eq!(session.reduce(1, &keys, &values).unwrap(), Bytes::from("3"));

        let partials = vec![Bytes::from("6"), Bytes::from("4")];
        assert_eq!(session.rereduce(0, &partials).unwrap(), Bytes::from("10"));
    }

    #[test]
    fn reduce_on_map_function_is_invalid() {
        let engine = NativeEngine::new().with_map("noop", |_, _, _| Ok(()));
        let mut session = compile(&engine, &["noop"]);
        assert!(matches!(
            session.reduce(0, &[], &[]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.reduce(3, &[], &[]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn interrupted_session_reports_timeout() {
        let flag = InterruptFlag::new();
        let engine = NativeEngine::new()
            .with_map("noop", |_, _, _| Ok(()))
            .with_reduce("sum", sum_reduce);
        let sources = [FunctionSource::wrap("noop"), FunctionSource::wrap("sum")];
        let mut session = engine
            .compile(ViewKind::MapReduce, &sources, flag.clone())
            .unwrap();

        flag.trigger();
        let results = session.map_doc(b"{}", b"").unwrap();
        assert!(matches!(results[0], FunctionMapResult::Error(ref msg) if msg.contains("timeout")));
        assert!(matches!(
            session.reduce(1, &[], &[]),
            Err(Error::Runtime(ref msg)) if msg.contains("timeout")
        ));
    }
}
