//! TOML configuration for the chordstore daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chord_engine::{ChordNodeConfig, default_max_lookup_hops};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity and addresses.
    pub node: NodeSection,
    /// Ring membership.
    pub ring: RingSection,
    /// Block device backing the key store.
    pub storage: StorageSection,
    /// Background task intervals and deadlines.
    pub maintenance: MaintenanceSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Address peers reach this node at.
    pub listen_addr: String,
    /// Ring id override. Derived from the listen address when unset.
    pub id: Option<u32>,
    /// Directory holding the block device image.
    pub data_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".chordstore"))
            .unwrap_or_else(|| PathBuf::from(".chordstore"));
        Self {
            listen_addr: "127.0.0.1:4870".to_string(),
            id: None,
            data_dir,
        }
    }
}

/// `[ring]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RingSection {
    /// Any live member to join through. A new ring is created when unset.
    pub bootstrap: Option<String>,
}

/// `[storage]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Backend type: `"file"` (default) or `"memory"`.
    pub backend: String,
    /// Number of pages on the device.
    pub block_count: u32,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            block_count: 1024,
        }
    }
}

/// `[maintenance]` section. Unset values fall back to
/// [`ChordNodeConfig::default_config`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    pub stabilize_interval_ms: Option<u64>,
    pub sync_interval_ms: Option<u64>,
    pub tree_interval_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub child_timeout_factor: Option<u32>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Engine configuration with the `[maintenance]` overrides applied.
    pub fn engine_config(&self) -> ChordNodeConfig {
        let defaults = ChordNodeConfig::default_config();
        let m = &self.maintenance;
        ChordNodeConfig {
            stabilize_interval: m
                .stabilize_interval_ms
                .map_or(defaults.stabilize_interval, Duration::from_millis),
            sync_interval: m
                .sync_interval_ms
                .map_or(defaults.sync_interval, Duration::from_millis),
            tree_interval: m
                .tree_interval_ms
                .map_or(defaults.tree_interval, Duration::from_millis),
            request_timeout: m
                .request_timeout_ms
                .map_or(defaults.request_timeout, Duration::from_millis),
            max_lookup_hops: default_max_lookup_hops(),
            child_timeout_factor: m
                .child_timeout_factor
                .unwrap_or(defaults.child_timeout_factor),
        }
    }

    /// Path of the block device image.
    pub fn device_path(&self) -> PathBuf {
        self.node.data_dir.join("blocks.img")
    }
}
