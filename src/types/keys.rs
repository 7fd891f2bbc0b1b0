//! Strongly-typed registry key.
//!
//! Hosts hand the runtime an opaque reference when creating a context; the
//! runtime interprets it as an unsigned integer and uses it as the context's
//! identity in the registry for its whole lifetime.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Error, Result};

/// Registry key of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextKey(u64);

impl ContextKey {
    pub fn new(key: u64) -> Self {
        Self(key)
    }

    /// Interpret a host-marshaled reference as a context key.
    ///
    /// Accepts an unsigned integer or a string holding one; anything else
    /// fails with `InvalidReference` and no context is created.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(Self)
                .ok_or_else(|| Error::invalid_reference(format!("not an unsigned integer: {n}"))),
            serde_json::Value::String(s) => s.parse(),
            other => Err(Error::invalid_reference(format!(
                "expected numeric reference, got {other}"
            ))),
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ContextKey {
    fn from(key: u64) -> Self {
        Self(key)
    }
}

impl std::str::FromStr for ContextKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| Error::invalid_reference(format!("not an unsigned integer: {s:?}")))
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
