use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use switchyard::{
    adapters::{HttpClientAdapter, HttpHandler, build_store, router},
    config::{
        ConfigDumpValidator, GatewayConfig, GatewayConfigValidator, StoreConfig,
        loader::{load_config, load_dump_sync},
    },
    core::ConfigCache,
    metrics,
    plugin::builtin::default_chain,
    ports::http_client::HttpClient,
    sync::ConfigSynchronizer,
    tracing_setup,
    utils::Shutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "gateway.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate the gateway configuration and, optionally, a routing dump
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "gateway.toml")]
        config: String,
        /// Routing dump (JSON) to validate
        #[clap(short, long)]
        dump: Option<String>,
    },
    /// Write a starter gateway configuration and routing dump
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "gateway.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "gateway.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config, dump }) => {
            validate_config_command(&config, dump.as_deref()).await
        }
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    GatewayConfigValidator::validate(&config).wrap_err("Invalid gateway configuration")?;

    tracing_setup::init_tracing(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    tracing::info!(config = %config_path, "Starting Switchyard");

    let shutdown = Shutdown::new();
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.listen_for_signals().await });

    let cache = Arc::new(ConfigCache::new());
    let store = build_store(&config.store, &config.sync).context("Failed to create config store")?;

    // Readiness gate: nothing is served before the first full load
    let sync = ConfigSynchronizer::new(Arc::clone(&cache), store, config.sync.clone())
        .start(shutdown.token())
        .await
        .wrap_err("Initial configuration load failed")?;
    tracing::info!(
        version = cache.version(),
        plugins = cache.snapshot().plugin_count(),
        selectors = cache.snapshot().selector_count(),
        rules = cache.snapshot().rule_count(),
        "Routing configuration loaded"
    );

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client")?);
    let chain = default_chain(&config, http_client).wrap_err("Failed to build plugin chain")?;
    tracing::info!(plugins = ?chain.names(), "Plugin chain ready");

    let handler = Arc::new(HttpHandler::new(
        Arc::clone(&cache),
        Arc::new(chain),
        config.upstream.max_body_bytes,
        shutdown.token(),
    ));
    let app = router(handler);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Switchyard listening on {}", addr);

    let token = shutdown.token();
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await
    .context("Server error");

    // Stop the synchronizer even when the server failed
    shutdown.trigger();
    shutdown.drain("Config synchronizer", sync.shutdown()).await;
    tracing::info!("Graceful shutdown completed");

    server_result
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str, dump_path: Option<&str>) -> Result<()> {
    tracing_setup::init_console_tracing()?;

    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = GatewayConfigValidator::validate(&config) {
        eprintln!("❌ Configuration validation failed:");
        eprintln!("{e}");
        println!();
        println!("💡 Common fixes:");
        println!("   • Verify listen address format (e.g., '127.0.0.1:9195')");
        println!("   • Use humantime durations such as '500ms', '3s' or '5m'");
        println!("   • Ensure the http store URL starts with http:// or https://");
        std::process::exit(1);
    }
    println!("✅ Configuration validation: OK");
    print_summary(&config);

    if let Some(dump_path) = dump_path {
        println!();
        println!("🔍 Validating routing dump: {dump_path}");
        let dump = match load_dump_sync(Path::new(dump_path)) {
            Ok(dump) => dump,
            Err(e) => {
                eprintln!("❌ Routing dump parsing failed:");
                eprintln!("   {e:#}");
                std::process::exit(1);
            }
        };
        if let Err(e) = ConfigDumpValidator::validate(&dump) {
            eprintln!("❌ Routing dump validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
        println!("✅ Routing dump validation: OK");
        println!(
            "   • Plugins: {}, Selectors: {}, Rules: {}, App credentials: {}",
            dump.plugins.len(),
            dump.selectors.len(),
            dump.rules.len(),
            dump.app_auths.len()
        );
    }

    println!();
    println!("🎉 Configuration is valid and ready to use!");
    Ok(())
}

fn print_summary(config: &GatewayConfig) {
    println!();
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.listen_addr);
    match &config.store {
        StoreConfig::File { path } => println!("   • Store: file ({path})"),
        StoreConfig::Http { url, poll_interval } => {
            println!("   • Store: http ({url}, every {poll_interval})")
        }
        StoreConfig::Memory => println!("   • Store: memory"),
    }
    println!(
        "   • Sync Workers: {} (queue {})",
        config.sync.workers, config.sync.queue_capacity
    );
    if !config.plugins.order.is_empty() {
        println!("   • Plugin Order Overrides: {:?}", config.plugins.order);
    }
}

const STARTER_CONFIG: &str = r#"# Switchyard Gateway Configuration

# The address to listen on
listen_addr = "127.0.0.1:9195"

# Routing data (plugins, selectors, rules) comes from the store
[store]
type = "file"
path = "routes.json"

[sync]
workers = 4
queue_capacity = 1024

[logging]
level = "info"
json = false

[upstream]
default_timeout = "3s"
max_body_bytes = 2097152

[plugins.sign]
max_skew = "5m"

# Per-plugin order overrides
# [plugins.order]
# rewrite = 45
"#;

const STARTER_DUMP: &str = r#"{
  "plugins": [
    {"id": "1", "name": "global", "enabled": true},
    {"id": "2", "name": "sign", "enabled": false},
    {"id": "3", "name": "waf", "enabled": true},
    {"id": "4", "name": "rate_limiter", "enabled": false},
    {"id": "5", "name": "rewrite", "enabled": true},
    {"id": "6", "name": "divide", "enabled": true},
    {"id": "7", "name": "forward", "enabled": true}
  ],
  "selectors": [
    {
      "id": "api",
      "pluginName": "divide",
      "name": "api",
      "matchMode": "and",
      "selectorType": "condition",
      "sort": 1,
      "conditions": [
        {"paramType": "uri", "operator": "match", "paramValue": "/api/**"}
      ]
    }
  ],
  "rules": [
    {
      "id": "api-default",
      "selectorId": "api",
      "name": "api-default",
      "sort": 1,
      "conditions": [
        {"paramType": "uri", "operator": "match", "paramValue": "/api/**"}
      ],
      "handle": {
        "upstreams": [{"url": "http://127.0.0.1:3000", "weight": 1}],
        "loadBalance": "ROUND_ROBIN",
        "timeoutMs": 3000
      }
    }
  ],
  "appAuths": []
}
"#;

/// Initialize a new configuration file and routing dump
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }
    let dump_path = path
        .parent()
        .map(|dir| dir.join("routes.json"))
        .unwrap_or_else(|| Path::new("routes.json").to_path_buf());

    tokio::fs::write(path, STARTER_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");

    if dump_path.exists() {
        println!("   Keeping existing routing dump at: {}", dump_path.display());
    } else {
        tokio::fs::write(&dump_path, STARTER_DUMP)
            .await
            .context("Failed to write routing dump")?;
        println!("✅ Created starter routing dump at: {}", dump_path.display());
    }
    println!("   Run 'switchyard serve --config {config_path}' to start the server");
    Ok(())
}

#[cfg(test)]
mod tests {
    use switchyard::core::model::ConfigDump;

    use super::*;

    #[test]
    fn test_starter_files_are_valid() {
        let config: GatewayConfig = load_starter_config();
        assert!(GatewayConfigValidator::validate(&config).is_ok());

        let dump: ConfigDump = serde_json::from_str(STARTER_DUMP).unwrap();
        assert!(ConfigDumpValidator::validate(&dump).is_ok());
        assert_eq!(dump.plugins.len(), 7);
    }

    fn load_starter_config() -> GatewayConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, STARTER_CONFIG).unwrap();
        switchyard::config::loader::load_config_sync(path.to_str().unwrap()).unwrap()
    }
}
