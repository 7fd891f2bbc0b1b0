//! Configuration structures.
//!
//! Initial values for the runtime tunables. Both limits can also be changed
//! at runtime through `Runtime::set_timeout` and `Runtime::set_max_emit_size`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum running time of a single map/reduce/rereduce invocation
    /// before the watchdog interrupts it.
    #[serde(with = "humantime_serde")]
    pub max_task_duration: Duration,

    /// Maximum size in bytes of one emitted key/value pair (key plus value).
    pub max_emit_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_task_duration: Duration::from_secs(5),
            max_emit_size: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = Config::default();
        assert_eq!(cfg.max_task_duration, Duration::from_secs(5));
        assert_eq!(cfg.max_emit_size, 1024 * 1024);
    }

    #[test]
    fn deserializes_humantime_durations() {
        let cfg: Config = serde_json::from_str(
            r#"{"max_task_duration": "2s", "max_emit_size": 4096}"#,
        )
        .unwrap();
        assert_eq!(cfg.max_task_duration, Duration::from_secs(2));
        assert_eq!(cfg.max_emit_size, 4096);
    }
}
