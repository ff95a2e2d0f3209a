pub mod config_store;
pub mod http_client;
