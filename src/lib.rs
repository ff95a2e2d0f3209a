//! Switchyard - the routing core of a plugin-based API gateway.
//!
//! Requests run through an ordered chain of plugins. Plugins that route look
//! up their selectors and rules in a configuration cache, which is kept in
//! sync with an external store and swapped atomically on every change, so a
//! request never observes a half-applied update.
//!
//! # Features
//! - Tiered plugin chain (BEFORE, FUNCTION, LAST) with per-request skip,
//!   short-circuit, cancellation and panic isolation
//! - Selector/rule matching over method, path, query, header, cookie, host,
//!   client ip and body params with `and`/`or` match modes
//! - Lock-free configuration snapshots (`arc-swap`) with a monotonic version
//! - Store synchronizer with a readiness gate, ordered sharded workers and
//!   fail-safe decoding of change events
//! - File, HTTP and in-memory store adapters
//! - Built-in plugins: request id, signature auth, firewall, rate limiting,
//!   path rewrite, load-balanced upstream selection and forwarding
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use switchyard::{
//!     adapters::MemoryConfigStore,
//!     config::SyncConfig,
//!     core::ConfigCache,
//!     sync::ConfigSynchronizer,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cache = Arc::new(ConfigCache::new());
//! let store = Arc::new(MemoryConfigStore::default());
//! let sync = ConfigSynchronizer::new(Arc::clone(&cache), store, SyncConfig::default())
//!     .start(CancellationToken::new())
//!     .await?;
//! assert!(sync.is_ready());
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping routing logic inside `core`, which performs no I/O. The
//! synchronizer in `sync` and the plugin chain in `plugin` sit between the
//! two.
//!
//! # Error Handling
//! Request-path failures are [`GatewayError`]s and render as JSON error
//! responses; configuration-plane failures are [`SyncError`]s. Bootstrap code
//! returns `eyre::Result` with context attached through `WrapErr`.
pub mod config;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;
pub mod plugin;
pub mod sync;

pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler},
    core::{CacheSnapshot, ConfigCache},
    error::{GatewayError, SyncError},
    plugin::{Exchange, Next, Plugin, PluginChain},
    ports::{config_store::ConfigStore, http_client::HttpClient},
    sync::{ConfigSynchronizer, SyncHandle},
    utils::Shutdown,
};
