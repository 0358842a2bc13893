//! Runtime configuration for the decoding pipeline.
//!
//! Everything is optional in the JSON file; missing fields fall back to the
//! defaults below.
//!
//! ```
//! use rbel_core::config::RbelConfig;
//!
//! let config: RbelConfig =
//!     serde_json::from_str(r#"{ "activate_converters": ["vau"] }"#).unwrap();
//! assert!(config.is_converter_active("vau"));
//! assert_eq!(config.max_conversion_depth, 32);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Default upper bound for a single message that is parsed beyond HTTP framing.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default nesting limit for recursive conversion.
pub const DEFAULT_MAX_CONVERSION_DEPTH: usize = 32;

/// Default byte budget of the message history.
pub const DEFAULT_MAX_HISTORY_BYTES: usize = 256 * 1024 * 1024;

/// Default capacity of each session-correlation map.
pub const DEFAULT_SESSION_CACHE_CAPACITY: usize = 1024;

/// Default timeout for a forwarding future in synchronous mode.
pub const DEFAULT_FORWARD_TIMEOUT_MS: u64 = 10_000;

/// Default upper bound for waiting on predecessor messages.
pub const DEFAULT_PREDECESSOR_TIMEOUT_MS: u64 = 30_000;

/// How the scheduler runs completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// Block the caller until the future resolves, then run the continuation inline.
    Sync,
    /// Attach the continuation and run it on the worker pool later.
    #[default]
    Async,
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Default execution mode.
    pub mode: SchedulerMode,
    /// Worker pool size; `None` sizes the pool from available parallelism.
    pub worker_pool_size: Option<usize>,
    /// Upper bound for synchronous waits on a forwarding future.
    pub forward_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::default(),
            worker_pool_size: None,
            forward_timeout_ms: DEFAULT_FORWARD_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    /// Returns the effective worker pool size (at least one).
    pub fn pool_size(&self) -> usize {
        self.worker_pool_size
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }

    /// Returns the forwarding timeout as a duration.
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

/// Key material supplied directly in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Key name used for lookups.
    pub name: String,
    /// Hex-encoded key material.
    #[serde(default)]
    pub hex: Option<String>,
    /// Base64-encoded key material (used when `hex` is absent).
    #[serde(default)]
    pub base64: Option<String>,
    /// Symmetric algorithm, e.g. `AES-GCM` or `HS256`.
    #[serde(default = "default_key_algorithm")]
    pub algorithm: String,
}

fn default_key_algorithm() -> String {
    "AES-GCM".to_string()
}

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbelConfig {
    /// Names of optional converter families to enable (e.g. `vau`).
    pub activate_converters: Vec<String>,
    /// Folders scanned for symmetric key files at startup.
    pub key_folders: Vec<PathBuf>,
    /// Keys given inline.
    pub keys: Vec<KeyConfig>,
    /// Messages larger than this are framed but not converted further.
    pub max_message_size: usize,
    /// Maximum nesting depth for recursive conversion.
    pub max_conversion_depth: usize,
    /// Byte budget for the message history.
    pub max_history_bytes: usize,
    /// Capacity of each session-correlation map.
    pub session_cache_capacity: usize,
    /// Upper bound for waiting on predecessor messages.
    pub predecessor_timeout_ms: u64,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Optional trace file receiving every finished message.
    pub trace_file: Option<PathBuf>,
}

impl Default for RbelConfig {
    fn default() -> Self {
        Self {
            activate_converters: Vec::new(),
            key_folders: Vec::new(),
            keys: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_conversion_depth: DEFAULT_MAX_CONVERSION_DEPTH,
            max_history_bytes: DEFAULT_MAX_HISTORY_BYTES,
            session_cache_capacity: DEFAULT_SESSION_CACHE_CAPACITY,
            predecessor_timeout_ms: DEFAULT_PREDECESSOR_TIMEOUT_MS,
            scheduler: SchedulerConfig::default(),
            trace_file: None,
        }
    }
}

impl RbelConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.max_conversion_depth == 0 {
            return Err(CoreError::Config(
                "max_conversion_depth must be positive".to_string(),
            ));
        }
        if self.session_cache_capacity == 0 {
            return Err(CoreError::Config(
                "session_cache_capacity must be positive".to_string(),
            ));
        }
        if self.scheduler.worker_pool_size == Some(0) {
            return Err(CoreError::Config(
                "worker_pool_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true if the named converter family is enabled.
    pub fn is_converter_active(&self, name: &str) -> bool {
        self.activate_converters
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
    }

    /// Enables a converter family.
    pub fn with_converter(mut self, name: impl Into<String>) -> Self {
        self.activate_converters.push(name.into());
        self
    }

    /// Adds a key folder.
    pub fn with_key_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_folders.push(path.into());
        self
    }

    /// Adds an inline key.
    pub fn with_key(mut self, key: KeyConfig) -> Self {
        self.keys.push(key);
        self
    }

    /// Sets the scheduler mode.
    pub fn with_scheduler_mode(mut self, mode: SchedulerMode) -> Self {
        self.scheduler.mode = mode;
        self
    }

    /// Sets the worker pool size.
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.scheduler.worker_pool_size = Some(size);
        self
    }

    /// Sets the session cache capacity.
    pub fn with_session_cache_capacity(mut self, capacity: usize) -> Self {
        self.session_cache_capacity = capacity;
        self
    }

    /// Sets the history byte budget.
    pub fn with_max_history_bytes(mut self, bytes: usize) -> Self {
        self.max_history_bytes = bytes;
        self
    }

    /// Sets the trace file.
    pub fn with_trace_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_file = Some(path.into());
        self
    }

    /// Returns the predecessor wait bound as a duration.
    pub fn predecessor_timeout(&self) -> Duration {
        Duration::from_millis(self.predecessor_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RbelConfig::default();
        assert!(config.activate_converters.is_empty());
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.scheduler.mode, SchedulerMode::Async);
        assert!(config.scheduler.pool_size() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn converter_activation_is_case_insensitive() {
        let config = RbelConfig::default().with_converter("VAU");
        assert!(config.is_converter_active("vau"));
        assert!(!config.is_converter_active("jwe"));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let json = r#"{
            "keys": [{ "name": "k", "hex": "00ff" }],
            "scheduler": { "mode": "sync", "worker_pool_size": 3 }
        }"#;
        let config: RbelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.keys[0].algorithm, "AES-GCM");
        assert_eq!(config.scheduler.mode, SchedulerMode::Sync);
        assert_eq!(config.scheduler.pool_size(), 3);
        assert_eq!(
            config.scheduler.forward_timeout_ms,
            DEFAULT_FORWARD_TIMEOUT_MS
        );
        assert_eq!(config.session_cache_capacity, DEFAULT_SESSION_CACHE_CAPACITY);
    }

    #[test]
    fn validate_rejects_zero_pool() {
        let config = RbelConfig::default().with_worker_pool_size(0);
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rbel.json");
        let config = RbelConfig::default()
            .with_converter("vau")
            .with_session_cache_capacity(8);
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = RbelConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let result = RbelConfig::from_file("/definitely/not/here.json");
        assert!(matches!(result, Err(CoreError::Io(_))));
    }
}
