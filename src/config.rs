//! Hub configuration
//!
//! All sections have defaults, so an empty JSON object is a valid config.

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top level configuration of a hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Name reported by `std.Host`
    pub hub_name: String,
    /// Default tracing filter, overridden by `RUST_LOG`
    pub log_filter: String,
    pub connections: ConnectionPoolConfig,
    pub memory: MemoryConfig,
    pub cursors: CursorConfig,
    pub pools: PoolConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            hub_name: "sync-hub".to_string(),
            log_filter: "info".to_string(),
            connections: ConnectionPoolConfig::default(),
            memory: MemoryConfig::default(),
            cursors: CursorConfig::default(),
            pools: PoolConfig::default(),
        }
    }
}

impl HubConfig {
    /// Load a config from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> HubResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> HubResult<Self> {
        let config: HubConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HubResult<()> {
        if self.connections.max_size == 0 {
            return Err(HubError::Config("connections.max_size must be greater than 0".to_string()));
        }
        if self.cursors.ttl_secs == 0 {
            return Err(HubError::Config("cursors.ttl_secs must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// Storage connection pool settings (per database)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Maximum number of connections checked out at the same time
    pub max_size: usize,
    /// Idle connections unused for longer are closed on the next checkout
    pub max_idle_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        ConnectionPoolConfig {
            max_size: 64,
            max_idle_secs: 300,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

/// In-memory backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Values at or below this size (bytes) are copied on every read and
    /// write. Larger values are stored by reference.
    pub inline_copy_threshold: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig { inline_copy_threshold: 1024 }
    }
}

/// Query cursor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Idle time after which a cursor is reclaimed
    pub ttl_secs: u64,
}

impl CursorConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        CursorConfig { ttl_secs: 300 } // 5 minutes
    }
}

/// Shared resource pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle instances kept per resource kind
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig { max_idle: 32 }
    }
}
