//! Engine configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default wall-clock budget for guest code, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Runtime settings for the execution engine.
///
/// Deserializable so the CLI can read it straight out of the `[engine]`
/// table of `scratchpad.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Budget for the synchronous phase of a run and for every later guest
    /// callback (timers, socket and HTTP events).
    /// Default: 30000
    pub timeout_ms: u64,

    /// How long a returned top-level promise may stay pending before the run
    /// is reported without waiting further.
    /// Default: 30000
    pub await_timeout_ms: u64,

    /// QuickJS heap limit. `None` means unlimited.
    /// Default: 256 MiB
    pub memory_limit_bytes: Option<usize>,

    /// QuickJS stack limit.
    /// Default: 1 MiB
    pub max_stack_bytes: Option<usize>,

    /// Directory containing an application-bundled `node_modules`.
    pub bundled_modules_dir: Option<PathBuf>,

    /// Process name the `kill_port` safety check compares against.
    /// Default: the name of the current executable.
    pub host_process_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            await_timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_limit_bytes: Some(256 * 1024 * 1024),
            max_stack_bytes: Some(1024 * 1024),
            bundled_modules_dir: None,
            host_process_name: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn await_timeout_ms(mut self, ms: u64) -> Self {
        self.await_timeout_ms = ms;
        self
    }

    pub fn memory_limit_bytes(mut self, limit: Option<usize>) -> Self {
        self.memory_limit_bytes = limit;
        self
    }

    pub fn bundled_modules_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundled_modules_dir = Some(dir.into());
        self
    }

    pub fn host_process_name(mut self, name: impl Into<String>) -> Self {
        self.host_process_name = Some(name.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.bundled_modules_dir.is_none());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .timeout_ms(500)
            .await_timeout_ms(100)
            .memory_limit_bytes(None)
            .bundled_modules_dir("/opt/app")
            .host_process_name("scratchpad");

        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.await_timeout(), Duration::from_millis(100));
        assert_eq!(config.memory_limit_bytes, None);
        assert_eq!(config.bundled_modules_dir, Some(PathBuf::from("/opt/app")));
        assert_eq!(config.host_process_name.as_deref(), Some("scratchpad"));
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "timeout_ms": 1000 }"#).unwrap();
        assert_eq!(config.timeout_ms, 1000);
        assert_eq!(config.await_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.max_stack_bytes, Some(1024 * 1024));
    }
}
