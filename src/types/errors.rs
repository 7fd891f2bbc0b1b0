//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the map/reduce runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: wrong arity/shape, unknown view kind, mismatched
    /// keys/values lengths, invocation on a destroyed context.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A supplied function source failed to compile. Reported at
    /// context-creation time; no context is created.
    #[error("compilation error: {0}")]
    Compile(String),

    /// A function threw, emitted an oversized key/value pair, or was
    /// interrupted by the watchdog. The context remains usable afterwards.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Allocation failure reported by the scripting engine.
    #[error("memory allocation failure: {0}")]
    OutOfMemory(String),

    /// A registration key could not be interpreted as a numeric identifier.
    #[error("invalid context reference: {0}")]
    InvalidReference(String),

    /// An invocation was attempted on a context that is already running one.
    #[error("context busy: {0}")]
    ContextBusy(String),

    /// The runtime has been shut down.
    #[error("runtime shut down: {0}")]
    Shutdown(String),
}

// Convenience constructors
impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn compile(msg: impl Into<String>) -> Self {
        Self::Compile(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    pub fn invalid_reference(msg: impl Into<String>) -> Self {
        Self::InvalidReference(msg.into())
    }

    pub fn context_busy(msg: impl Into<String>) -> Self {
        Self::ContextBusy(msg.into())
    }

    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::Shutdown(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = Error::compile("unexpected token at line 1");
        assert_eq!(
            err.to_string(),
            "compilation error: unexpected token at line 1"
        );

        let err = Error::invalid_reference("not an unsigned integer");
        assert_eq!(
            err.to_string(),
            "invalid context reference: not an unsigned integer"
        );
    }
}
