//! Keeps the [`ConfigCache`] in line with an external [`ConfigStore`].
//!
//! Startup performs a full load before anything is served. Change events are
//! then sharded across a fixed set of workers. Plugin events are keyed by
//! plugin name; selector and rule events by selector id, so a selector and
//! its rules apply in arrival order even when the selector changes plugin.
//! Unrelated keys are applied concurrently. A malformed event is logged and
//! dropped; the cache keeps its previous value.
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::{ConfigDumpValidator, SyncConfig, ValidationError},
    core::{
        cache::{CacheDelta, ConfigCache},
        model::{AppAuth, ConfigDump, PluginData, Rule, Selector},
    },
    error::SyncError,
    metrics,
    ports::config_store::ConfigStore,
    sync::event::{ChangeEvent, EntityKind, EntityPath, EventType, StoreNotification},
    tracing_setup::create_sync_span,
};

enum WorkerMessage {
    Apply(ChangeEvent),
    /// Acknowledged once every earlier message on the worker has been applied
    Flush(oneshot::Sender<()>),
}

pub struct ConfigSynchronizer {
    cache: Arc<ConfigCache>,
    store: Arc<dyn ConfigStore>,
    config: SyncConfig,
}

impl ConfigSynchronizer {
    pub fn new(cache: Arc<ConfigCache>, store: Arc<dyn ConfigStore>, config: SyncConfig) -> Self {
        Self {
            cache,
            store,
            config,
        }
    }

    /// Load everything from the store into the cache, then start following
    /// its change feed. Returns once the cache is populated; an error means
    /// the gateway has no configuration and must not serve.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<SyncHandle, SyncError> {
        let version = full_load(&self.cache, self.store.as_ref())
            .instrument(create_sync_span("initial_load"))
            .await?;
        tracing::info!(version, "Initial configuration loaded");

        let (ready_tx, ready_rx) = watch::channel(true);
        let notifications = self.store.subscribe()?;

        let worker_count = self.config.workers.max(1);
        let capacity = self.config.queue_capacity.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            workers.push(tokio::spawn(
                run_worker(Arc::clone(&self.cache), rx)
                    .instrument(tracing::info_span!("config_sync", component = "worker", index)),
            ));
        }

        let dispatcher = Dispatcher {
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
            senders,
            workers,
            ready: ready_tx,
        };
        let cancel = shutdown.child_token();
        let task = tokio::spawn(
            dispatcher
                .run(notifications, cancel.clone())
                .instrument(create_sync_span("dispatcher")),
        );

        Ok(SyncHandle {
            ready: ready_rx,
            cancel,
            task,
        })
    }
}

/// Running synchronizer.
pub struct SyncHandle {
    ready: watch::Receiver<bool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// True while the cache holds a complete load and events are followed.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    /// Stop following the store. Events already queued on workers are applied
    /// before this returns.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Synchronizer task ended abnormally");
        }
    }
}

struct Dispatcher {
    cache: Arc<ConfigCache>,
    store: Arc<dyn ConfigStore>,
    senders: Vec<mpsc::Sender<WorkerMessage>>,
    workers: Vec<JoinHandle<()>>,
    ready: watch::Sender<bool>,
}

impl Dispatcher {
    async fn run(self, mut notifications: mpsc::Receiver<StoreNotification>, cancel: CancellationToken) {
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Synchronizer shutting down");
                    break;
                }
                notification = notifications.recv() => notification,
            };

            match notification {
                Some(StoreNotification::Change(event)) => {
                    if !self.dispatch(event).await {
                        break;
                    }
                }
                Some(StoreNotification::Resync) => self.resync().await,
                None => {
                    tracing::warn!("Configuration store closed its change feed");
                    break;
                }
            }
        }
        self.stop().await;
    }

    /// Route an event to the worker owning its shard key. Returns false when
    /// the workers are gone.
    async fn dispatch(&self, event: ChangeEvent) -> bool {
        let entity = match EntityPath::parse(event.kind, &event.path) {
            Ok(entity) => entity,
            Err(e) => {
                discard(&event, &e);
                return true;
            }
        };
        let shard = shard_for(entity.shard_key(), self.senders.len());
        if self.senders[shard].send(WorkerMessage::Apply(event)).await.is_err() {
            tracing::error!(shard, "Synchronizer worker stopped unexpectedly");
            return false;
        }
        true
    }

    async fn flush(&self) {
        let mut acks = Vec::with_capacity(self.senders.len());
        for sender in &self.senders {
            let (tx, rx) = oneshot::channel();
            if sender.send(WorkerMessage::Flush(tx)).await.is_ok() {
                acks.push(rx);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }
    }

    async fn resync(&self) {
        tracing::info!("Store requested resynchronization");
        self.flush().await;
        match full_load(&self.cache, self.store.as_ref()).await {
            Ok(version) => {
                metrics::increment_config_event("all", "resync", "applied");
                tracing::info!(version, "Configuration resynchronized");
            }
            Err(e) => {
                // Stale but complete beats empty
                metrics::increment_config_event("all", "resync", "failed");
                tracing::error!(error = %e, "Resynchronization failed; keeping cached configuration");
            }
        }
    }

    async fn stop(self) {
        let _ = self.ready.send(false);
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Synchronizer worker ended abnormally");
            }
        }
    }
}

async fn run_worker(cache: Arc<ConfigCache>, mut rx: mpsc::Receiver<WorkerMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Apply(event) => apply_and_record(&cache, &event),
            WorkerMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

fn discard(event: &ChangeEvent, error: &SyncError) {
    metrics::increment_config_event(event.kind.as_str(), event.event_type.as_str(), "discarded");
    tracing::warn!(
        path = %event.path,
        kind = %event.kind,
        event_type = event.event_type.as_str(),
        error = %error,
        "Discarded configuration event; cached value kept"
    );
}

fn apply_and_record(cache: &ConfigCache, event: &ChangeEvent) {
    match apply_event(cache, event) {
        Ok(version) => {
            metrics::increment_config_event(event.kind.as_str(), event.event_type.as_str(), "applied");
            tracing::debug!(path = %event.path, event_type = event.event_type.as_str(), version, "Applied configuration event");
        }
        Err(e) => discard(event, &e),
    }
}

/// Load the whole store into the cache, dropping entities that fail validation.
pub async fn full_load(cache: &ConfigCache, store: &dyn ConfigStore) -> Result<u64, SyncError> {
    let dump = store.load_all().await?;
    Ok(cache.replace_all(sanitize(dump)))
}

fn sanitize(dump: ConfigDump) -> ConfigDump {
    fn keep<T>(items: Vec<T>, kind: &str, id: impl Fn(&T) -> &str, check: impl Fn(&T) -> Result<(), ValidationError>) -> Vec<T> {
        items
            .into_iter()
            .filter(|item| match check(item) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(kind, id = id(item), error = %e, "Dropping invalid entity from full load");
                    false
                }
            })
            .collect()
    }

    ConfigDump {
        plugins: keep(dump.plugins, "plugin", |p| p.name.as_str(), ConfigDumpValidator::validate_plugin),
        selectors: keep(dump.selectors, "selector", |s| s.id.as_str(), ConfigDumpValidator::validate_selector),
        rules: keep(dump.rules, "rule", |r| r.id.as_str(), ConfigDumpValidator::validate_rule),
        app_auths: keep(dump.app_auths, "app_auth", |a| a.app_key.as_str(), ConfigDumpValidator::validate_app_auth),
    }
}

/// Translate one change event into a cache update and publish it.
///
/// Identity comes from the path. An upsert payload may leave identifying
/// fields empty; if it fills them they must agree with the path.
pub fn apply_event(cache: &ConfigCache, event: &ChangeEvent) -> Result<u64, SyncError> {
    let entity = EntityPath::parse(event.kind, &event.path)?;

    let delta = match event.event_type {
        EventType::Delete => delete_delta(entity),
        EventType::Upsert => upsert_delta(entity, event)?,
    };
    Ok(cache.apply_delta(delta))
}

fn delete_delta(entity: EntityPath) -> CacheDelta {
    match entity {
        EntityPath::Plugin { name } => CacheDelta::DeletePlugin { name },
        EntityPath::Selector { plugin, id } => CacheDelta::DeleteSelector { plugin, id },
        EntityPath::Rule {
            plugin,
            selector_id,
            id,
        } => CacheDelta::DeleteRule {
            plugin,
            selector_id,
            id,
        },
        EntityPath::AppAuth { app_key } => CacheDelta::DeleteAppAuth { app_key },
    }
}

fn upsert_delta(entity: EntityPath, event: &ChangeEvent) -> Result<CacheDelta, SyncError> {
    let kind = entity.kind();
    let decode_failed = |source: serde_json::Error| SyncError::Decode {
        kind: kind.as_str(),
        path: event.path.clone(),
        source,
    };
    let invalid = |id: &str, e: ValidationError| SyncError::Validation {
        kind: kind.as_str(),
        id: id.to_string(),
        reason: e.to_string(),
    };

    let delta = match entity {
        EntityPath::Plugin { name } => {
            let mut plugin: PluginData =
                serde_json::from_slice(&event.payload).map_err(decode_failed)?;
            reconcile(kind, &name, "name", &mut plugin.name, &name)?;
            ConfigDumpValidator::validate_plugin(&plugin).map_err(|e| invalid(&name, e))?;
            CacheDelta::UpsertPlugin(plugin)
        }
        EntityPath::Selector { plugin, id } => {
            let mut selector: Selector =
                serde_json::from_slice(&event.payload).map_err(decode_failed)?;
            reconcile(kind, &id, "id", &mut selector.id, &id)?;
            reconcile(kind, &id, "pluginName", &mut selector.plugin_name, &plugin)?;
            ConfigDumpValidator::validate_selector(&selector).map_err(|e| invalid(&id, e))?;
            CacheDelta::UpsertSelector(selector)
        }
        EntityPath::Rule { selector_id, id, .. } => {
            let mut rule: Rule =
                serde_json::from_slice(&event.payload).map_err(decode_failed)?;
            reconcile(kind, &id, "id", &mut rule.id, &id)?;
            reconcile(kind, &id, "selectorId", &mut rule.selector_id, &selector_id)?;
            ConfigDumpValidator::validate_rule(&rule).map_err(|e| invalid(&id, e))?;
            CacheDelta::UpsertRule(rule)
        }
        EntityPath::AppAuth { app_key } => {
            let mut auth: AppAuth =
                serde_json::from_slice(&event.payload).map_err(decode_failed)?;
            reconcile(kind, &app_key, "appKey", &mut auth.app_key, &app_key)?;
            ConfigDumpValidator::validate_app_auth(&auth).map_err(|e| invalid(&app_key, e))?;
            CacheDelta::UpsertAppAuth(auth)
        }
    };
    Ok(delta)
}

fn reconcile(
    kind: EntityKind,
    id: &str,
    field: &str,
    value: &mut String,
    from_path: &str,
) -> Result<(), SyncError> {
    if value.is_empty() {
        *value = from_path.to_string();
        return Ok(());
    }
    if value != from_path {
        return Err(SyncError::Validation {
            kind: kind.as_str(),
            id: id.to_string(),
            reason: format!("{field} '{value}' disagrees with store path ('{from_path}')"),
        });
    }
    Ok(())
}
