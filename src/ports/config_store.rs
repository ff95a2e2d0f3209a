use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{core::model::ConfigDump, error::SyncError, sync::event::StoreNotification};

/// An external store holding routing configuration.
///
/// The synchronizer performs one `load_all` before the gateway serves traffic
/// and then consumes the notification feed. Session handling, authentication
/// and watch registration are the adapter's business; an adapter that may
/// have missed changes sends [`StoreNotification::Resync`].
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read every plugin, selector, rule and credential currently stored.
    async fn load_all(&self) -> Result<ConfigDump, SyncError>;

    /// Take the change feed. Can be called once per store.
    fn subscribe(&self) -> Result<mpsc::Receiver<StoreNotification>, SyncError>;
}
