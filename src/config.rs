//! Configuration
//!
//! Every limit the core enforces lives here. Defaults suit a small device;
//! a JSON file can override any subset of fields.
//!
//! ```json
//! {
//!   "registry": { "capacity": 4 },
//!   "fetch": { "timeout_ms": 10000 },
//!   "runtime": { "max_memory_bytes": 131072 },
//!   "store_path": "/var/lib/modvisor/registry.json"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::registry::DEFAULT_CAPACITY;

/// Errors loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub fetch: FetchConfig,
    pub runtime: RuntimeConfig,
    /// Where the registry is persisted; `None` keeps it in memory only
    pub store_path: Option<PathBuf>,
    /// Save the registry after every add/remove/clear
    pub autosave: bool,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-transfer deadline
    pub timeout_ms: u64,
    /// Largest single read from the transport
    pub chunk_size: usize,
    /// Sleep between polls when no bytes are available
    pub poll_interval_ms: u64,
    /// Refuse declared lengths above this
    pub max_module_size: usize,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            chunk_size: 1024,
            poll_interval_ms: 5,
            max_module_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter stack budget in bytes
    pub stack_budget: usize,
    /// Linear memory ceiling in bytes
    pub max_memory_bytes: usize,
    /// Native stack of the execution thread
    pub unit_stack_size: usize,
    /// How long `stop` waits for the unit to wind down
    pub stop_grace_ms: u64,
}

impl RuntimeConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_budget: 128 * 1024,
            max_memory_bytes: 2 * 65536,
            unit_stack_size: 1024 * 1024,
            stop_grace_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_override() {
        let config = Config::from_json(r#"{ "registry": { "capacity": 3 }, "fetch": { "chunk_size": 64 } }"#)
            .unwrap();
        assert_eq!(config.registry.capacity, 3);
        assert_eq!(config.fetch.chunk_size, 64);
        assert_eq!(config.fetch.timeout_ms, FetchConfig::default().timeout_ms);
        assert_eq!(config.runtime, RuntimeConfig::default());
        assert!(config.store_path.is_none());
    }

    #[test]
    fn test_empty_object_is_default() {
        assert_eq!(Config::from_json("{}").unwrap(), Config::default());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            Config::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_stack_fits_thread() {
        let rt = RuntimeConfig::default();
        assert!(rt.stack_budget < rt.unit_stack_size);
    }
}
