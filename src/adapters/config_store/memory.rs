use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::{
    core::model::{AppAuth, ConfigDump, PluginData, Rule, Selector},
    error::SyncError,
    ports::config_store::ConfigStore,
    sync::{
        diff::diff_dumps,
        event::{ChangeEvent, DEFAULT_ROOT, EntityPath, StoreNotification},
    },
};

const FEED_CAPACITY: usize = 1024;

/// In-process store. Every mutation updates the stored dump and is pushed to
/// the subscriber as a change event, in call order.
pub struct MemoryConfigStore {
    root: String,
    state: Mutex<ConfigDump>,
    tx: mpsc::Sender<StoreNotification>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<StoreNotification>>>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new(ConfigDump::default())
    }
}

impl MemoryConfigStore {
    pub fn new(initial: ConfigDump) -> Self {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        Self {
            root: DEFAULT_ROOT.to_string(),
            state: Mutex::new(initial),
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    async fn send(&self, notification: StoreNotification) -> Result<(), SyncError> {
        self.tx
            .send(notification)
            .await
            .map_err(|_| SyncError::Store("memory store subscriber has gone away".to_string()))
    }

    pub async fn upsert_plugin(&self, plugin: PluginData) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let event = ChangeEvent::upsert_plugin(&self.root, &plugin)?;
        upsert_by(&mut state.plugins, plugin, |p| p.name.as_str());
        self.send(StoreNotification::Change(event)).await
    }

    pub async fn upsert_selector(&self, selector: Selector) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let event = ChangeEvent::upsert_selector(&self.root, &selector)?;
        upsert_by(&mut state.selectors, selector, |s| s.id.as_str());
        self.send(StoreNotification::Change(event)).await
    }

    /// The rule's selector must already be stored; its plugin names the path.
    pub async fn upsert_rule(&self, rule: Rule) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let plugin = state
            .selectors
            .iter()
            .find(|s| s.id == rule.selector_id)
            .map(|s| s.plugin_name.clone())
            .ok_or_else(|| SyncError::Validation {
                kind: "rule",
                id: rule.id.clone(),
                reason: format!("unknown selector '{}'", rule.selector_id),
            })?;
        let event = ChangeEvent::upsert_rule(&self.root, &plugin, &rule)?;
        upsert_by(&mut state.rules, rule, |r| r.id.as_str());
        self.send(StoreNotification::Change(event)).await
    }

    pub async fn upsert_app_auth(&self, auth: AppAuth) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let event = ChangeEvent::upsert_app_auth(&self.root, &auth)?;
        upsert_by(&mut state.app_auths, auth, |a| a.app_key.as_str());
        self.send(StoreNotification::Change(event)).await
    }

    /// Remove an entity and everything under it.
    pub async fn delete(&self, entity: EntityPath) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        remove_entity(&mut state, &entity);
        self.send(StoreNotification::Change(ChangeEvent::delete_entity(&self.root, &entity)))
            .await
    }

    /// Swap the whole stored dump, announcing the difference entity by entity.
    pub async fn replace(&self, dump: ConfigDump) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let events = diff_dumps(&self.root, &state, &dump)?;
        *state = dump;
        for event in events {
            self.send(StoreNotification::Change(event)).await?;
        }
        Ok(())
    }

    /// Forward an event verbatim without touching the stored dump.
    pub async fn push_raw(&self, event: ChangeEvent) -> Result<(), SyncError> {
        let _state = self.state.lock().await;
        self.send(StoreNotification::Change(event)).await
    }

    /// Ask the subscriber to reload everything.
    pub async fn resync(&self) -> Result<(), SyncError> {
        let _state = self.state.lock().await;
        self.send(StoreNotification::Resync).await
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load_all(&self) -> Result<ConfigDump, SyncError> {
        Ok(self.state.lock().await.clone())
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<StoreNotification>, SyncError> {
        self.rx
            .lock()
            .map_err(|_| SyncError::Store("memory store lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| SyncError::Store("memory store already has a subscriber".to_string()))
    }
}

fn upsert_by<T>(items: &mut Vec<T>, item: T, key: impl Fn(&T) -> &str) {
    match items.iter().position(|existing| key(existing) == key(&item)) {
        Some(at) => items[at] = item,
        None => items.push(item),
    }
}

fn remove_entity(dump: &mut ConfigDump, entity: &EntityPath) {
    match entity {
        EntityPath::Plugin { name } => {
            let gone: Vec<String> = dump
                .selectors
                .iter()
                .filter(|s| &s.plugin_name == name)
                .map(|s| s.id.clone())
                .collect();
            dump.plugins.retain(|p| &p.name != name);
            dump.selectors.retain(|s| &s.plugin_name != name);
            dump.rules.retain(|r| !gone.contains(&r.selector_id));
        }
        EntityPath::Selector { id, .. } => {
            dump.selectors.retain(|s| &s.id != id);
            dump.rules.retain(|r| &r.selector_id != id);
        }
        EntityPath::Rule { id, .. } => dump.rules.retain(|r| &r.id != id),
        EntityPath::AppAuth { app_key } => dump.app_auths.retain(|a| &a.app_key != app_key),
    }
}
