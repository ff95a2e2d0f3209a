use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::{config::models::GatewayConfig, core::model::ConfigDump};

/// Environment variable prefix for overrides, e.g. `SWITCHYARD__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "SWITCHYARD";

fn format_for(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Toml,
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))
}

/// Load the gateway configuration from a file using the config crate, with
/// environment overrides applied on top.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let path = Path::new(config_path);

    let settings = Config::builder()
        .add_source(File::new(path_str(path)?, format_for(path)))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    let gateway_config: GatewayConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    Ok(gateway_config)
}

/// Load a JSON routing dump (plugins, selectors, rules, app credentials).
pub fn load_dump_sync(dump_path: &Path) -> Result<ConfigDump> {
    let raw = std::fs::read(dump_path)
        .with_context(|| format!("Failed to read routing dump {}", dump_path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to decode routing dump {}", dump_path.display()))
}
