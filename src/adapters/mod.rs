pub mod config_store;
pub mod http_client;
pub mod http_handler;

/// Re-export commonly used types from adapters
pub use config_store::{FileConfigStore, HttpConfigStore, MemoryConfigStore, build_store};
pub use http_client::HttpClientAdapter;
pub use http_handler::{HttpHandler, router};
