use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use tokio::{
    sync::{Mutex, mpsc},
    time::MissedTickBehavior,
};

use crate::{
    core::model::ConfigDump,
    error::SyncError,
    ports::config_store::ConfigStore,
    sync::{
        diff::diff_dumps,
        event::{DEFAULT_ROOT, StoreNotification},
    },
};

/// Store that polls an HTTP endpoint serving a routing dump and turns every
/// difference into change events. After the endpoint has been unreachable it
/// asks for a full resync, since intermediate states were never seen.
pub struct HttpConfigStore {
    url: String,
    client: Client,
    last: Arc<Mutex<ConfigDump>>,
    notifications: std::sync::Mutex<Option<mpsc::Receiver<StoreNotification>>>,
}

impl HttpConfigStore {
    /// Must be called from within a tokio runtime.
    pub fn new(url: String, poll_interval: Duration, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let last = Arc::new(Mutex::new(ConfigDump::default()));

        tokio::spawn(Self::poll(
            client.clone(),
            url.clone(),
            poll_interval,
            Arc::clone(&last),
            tx,
        ));

        Self {
            url,
            client,
            last,
            notifications: std::sync::Mutex::new(Some(rx)),
        }
    }

    async fn poll(
        client: Client,
        url: String,
        poll_interval: Duration,
        last: Arc<Mutex<ConfigDump>>,
        tx: mpsc::Sender<StoreNotification>,
    ) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the initial load covers it
        interval.tick().await;
        let mut failing = false;

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = interval.tick() => {}
            }

            let next = match Self::fetch_dump(&client, &url).await {
                Ok(dump) => dump,
                Err(e) => {
                    if !failing {
                        tracing::warn!(url = %url, error = %e, "Failed to poll routing dump");
                    }
                    failing = true;
                    continue;
                }
            };

            if failing {
                tracing::info!(url = %url, "Routing dump endpoint reachable again");
                failing = false;
                if tx.send(StoreNotification::Resync).await.is_err() {
                    break;
                }
                *last.lock().await = next;
                continue;
            }

            let mut last = last.lock().await;
            let events = match diff_dumps(DEFAULT_ROOT, &last, &next) {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to diff routing dump");
                    continue;
                }
            };
            if !events.is_empty() {
                tracing::info!(url = %url, changes = events.len(), "Remote routing configuration changed");
            }
            *last = next;
            for event in events {
                if tx.send(StoreNotification::Change(event)).await.is_err() {
                    return;
                }
            }
        }
        tracing::debug!(url = %url, "Routing dump poller stopped");
    }

    async fn fetch_dump(client: &Client, url: &str) -> Result<ConfigDump, SyncError> {
        let resp = client
            .get(url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| SyncError::Store(format!("request to {url} failed: {e}")))?;
        resp.json::<ConfigDump>()
            .await
            .map_err(|e| SyncError::Store(format!("invalid routing dump from {url}: {e}")))
    }
}

#[async_trait]
impl ConfigStore for HttpConfigStore {
    async fn load_all(&self) -> Result<ConfigDump, SyncError> {
        let dump = Self::fetch_dump(&self.client, &self.url).await?;
        *self.last.lock().await = dump.clone();
        Ok(dump)
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<StoreNotification>, SyncError> {
        self.notifications
            .lock()
            .map_err(|_| SyncError::Store("http store lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| SyncError::Store("http store already has a subscriber".to_string()))
    }
}
