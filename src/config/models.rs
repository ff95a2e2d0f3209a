//! Configuration data structures for Switchyard.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They
//! include defaults so that minimal configs remain concise. This is the static
//! process configuration; routing data (plugins, selectors, rules) comes from
//! the configuration store at runtime.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:9195".to_string()
}

fn default_poll_interval() -> String {
    "10s".to_string()
}

/// Where routing configuration is read from.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// A JSON routing dump file, watched for changes.
    File { path: String },
    /// An HTTP endpoint returning a routing dump, polled periodically.
    Http {
        url: String,
        #[serde(default = "default_poll_interval")]
        poll_interval: String,
    },
    /// In-process store fed through its API; starts empty.
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::File {
            path: "routes.json".to_string(),
        }
    }
}

/// Synchronizer worker settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of ordered workers events are sharded across
    pub workers: usize,
    /// Bounded queue length per worker
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `switchyard=debug,info`
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Applied when a divide handle carries no timeout
    pub default_timeout: String,
    /// Largest inbound body buffered for matching and forwarding
    pub max_body_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_timeout: "3s".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

impl UpstreamConfig {
    pub fn default_timeout(&self) -> Duration {
        humantime::parse_duration(&self.default_timeout).unwrap_or(Duration::from_secs(3))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SignConfig {
    /// Largest accepted distance between `X-Timestamp` and the gateway clock
    pub max_skew: String,
}

impl Default for SignConfig {
    fn default() -> Self {
        Self {
            max_skew: "5m".to_string(),
        }
    }
}

impl SignConfig {
    pub fn max_skew(&self) -> Duration {
        humantime::parse_duration(&self.max_skew).unwrap_or(Duration::from_secs(300))
    }
}

/// Built-in plugin settings.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PluginsConfig {
    /// Per-plugin order overrides, keyed by plugin name
    pub order: HashMap<String, i32>,
    pub sign: SignConfig,
}

/// Top-level process configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
            upstream: UpstreamConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}
