//! Core types for the map/reduce runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **Keys**: the strongly-typed registry key (`ContextKey`)
//! - **Errors**: application error types with thiserror derives
//! - **Config**: initial values for the runtime tunables

mod config;
mod errors;
mod keys;

pub use config::Config;
pub use errors::{Error, Result};
pub use keys::ContextKey;
