pub mod file;
pub mod http;
pub mod memory;

use std::{sync::Arc, time::Duration};

use eyre::{Context, Result};

pub use file::FileConfigStore;
pub use http::HttpConfigStore;
pub use memory::MemoryConfigStore;

use crate::{
    config::models::{StoreConfig, SyncConfig},
    ports::config_store::ConfigStore,
};

/// Build the store selected by configuration.
pub fn build_store(store: &StoreConfig, sync: &SyncConfig) -> Result<Arc<dyn ConfigStore>> {
    let store: Arc<dyn ConfigStore> = match store {
        StoreConfig::File { path } => Arc::new(
            FileConfigStore::new(path, sync.queue_capacity)
                .wrap_err_with(|| format!("Failed to open routing dump {path}"))?,
        ),
        StoreConfig::Http { url, poll_interval } => {
            let interval = humantime::parse_duration(poll_interval)
                .unwrap_or(Duration::from_secs(10));
            Arc::new(HttpConfigStore::new(url.clone(), interval, sync.queue_capacity))
        }
        StoreConfig::Memory => Arc::new(MemoryConfigStore::default()),
    };
    Ok(store)
}
