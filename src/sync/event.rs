//! Change events delivered by a configuration store.
//!
//! Every event names the entity it concerns through a store path:
//!
//! ```text
//! /<root>/plugin/{plugin}
//! /<root>/selector/{plugin}/{selectorId}
//! /<root>/rule/{plugin}/{selectorId}/{ruleId}
//! /<root>/auth/{appKey}
//! ```
//!
//! Only the trailing segments identify the entity, so any root prefix is
//! accepted. The event's kind says how many trailing segments to read.
use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use crate::{
    core::model::{AppAuth, PluginData, Rule, Selector},
    error::SyncError,
};

/// Default root under which store paths are written.
pub const DEFAULT_ROOT: &str = "/switchyard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Plugin,
    Selector,
    Rule,
    AppAuth,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plugin => "plugin",
            Self::Selector => "selector",
            Self::Rule => "rule",
            Self::AppAuth => "app_auth",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Upsert,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

/// Identity of an entity, parsed from its store path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityPath {
    Plugin {
        name: String,
    },
    Selector {
        plugin: String,
        id: String,
    },
    Rule {
        plugin: String,
        selector_id: String,
        id: String,
    },
    AppAuth {
        app_key: String,
    },
}

impl EntityPath {
    /// Parse a store path for an entity of `kind`. The kind marker sits at a
    /// fixed offset from the end, so a root that itself contains `rule` or
    /// `selector` segments is read unambiguously.
    pub fn parse(kind: EntityKind, path: &str) -> Result<Self, SyncError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (marker, arity) = match kind {
            EntityKind::Plugin => ("plugin", 1),
            EntityKind::Selector => ("selector", 2),
            EntityKind::Rule => ("rule", 3),
            EntityKind::AppAuth => ("auth", 1),
        };
        let Some(at) = segments.len().checked_sub(arity + 1) else {
            return Err(SyncError::Path(path.to_string()));
        };
        if segments[at] != marker {
            return Err(SyncError::Path(path.to_string()));
        }
        let tail = &segments[at + 1..];
        Ok(match kind {
            EntityKind::Plugin => Self::plugin(tail[0]),
            EntityKind::Selector => Self::selector(tail[0], tail[1]),
            EntityKind::Rule => Self::rule(tail[0], tail[1], tail[2]),
            EntityKind::AppAuth => Self::app_auth(tail[0]),
        })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Plugin { .. } => EntityKind::Plugin,
            Self::Selector { .. } => EntityKind::Selector,
            Self::Rule { .. } => EntityKind::Rule,
            Self::AppAuth { .. } => EntityKind::AppAuth,
        }
    }

    /// Key events are sharded by. A selector and its rules share the
    /// selector id, so their events apply in order even when the selector
    /// moves to another plugin.
    pub fn shard_key(&self) -> &str {
        match self {
            Self::Plugin { name } => name,
            Self::Selector { id, .. } => id,
            Self::Rule { selector_id, .. } => selector_id,
            Self::AppAuth { app_key } => app_key,
        }
    }

    pub fn to_path(&self, root: &str) -> String {
        let root = root.trim_end_matches('/');
        match self {
            Self::Plugin { name } => format!("{root}/plugin/{name}"),
            Self::Selector { plugin, id } => format!("{root}/selector/{plugin}/{id}"),
            Self::Rule {
                plugin,
                selector_id,
                id,
            } => format!("{root}/rule/{plugin}/{selector_id}/{id}"),
            Self::AppAuth { app_key } => format!("{root}/auth/{app_key}"),
        }
    }
}

/// One change notification from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub path: String,
    pub event_type: EventType,
    /// JSON payload for upserts; ignored for deletes.
    pub payload: Bytes,
}

impl ChangeEvent {
    pub fn upsert(kind: EntityKind, path: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            path: path.into(),
            event_type: EventType::Upsert,
            payload: payload.into(),
        }
    }

    pub fn delete(kind: EntityKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            event_type: EventType::Delete,
            payload: Bytes::new(),
        }
    }

    fn upsert_entity<T: Serialize>(entity: EntityPath, root: &str, value: &T) -> Result<Self, SyncError> {
        let payload = serde_json::to_vec(value).map_err(|source| SyncError::Decode {
            kind: entity.kind().as_str(),
            path: entity.to_path(root),
            source,
        })?;
        Ok(Self::upsert(entity.kind(), entity.to_path(root), payload))
    }

    pub fn upsert_plugin(root: &str, plugin: &PluginData) -> Result<Self, SyncError> {
        Self::upsert_entity(EntityPath::plugin(&plugin.name), root, plugin)
    }

    pub fn upsert_selector(root: &str, selector: &Selector) -> Result<Self, SyncError> {
        Self::upsert_entity(
            EntityPath::selector(&selector.plugin_name, &selector.id),
            root,
            selector,
        )
    }

    pub fn upsert_rule(root: &str, plugin: &str, rule: &Rule) -> Result<Self, SyncError> {
        Self::upsert_entity(EntityPath::rule(plugin, &rule.selector_id, &rule.id), root, rule)
    }

    pub fn upsert_app_auth(root: &str, auth: &AppAuth) -> Result<Self, SyncError> {
        Self::upsert_entity(EntityPath::app_auth(&auth.app_key), root, auth)
    }

    pub fn delete_entity(root: &str, entity: &EntityPath) -> Self {
        Self::delete(entity.kind(), entity.to_path(root))
    }
}

impl EntityPath {
    pub fn plugin(name: &str) -> Self {
        Self::Plugin {
            name: name.to_string(),
        }
    }

    pub fn selector(plugin: &str, id: &str) -> Self {
        Self::Selector {
            plugin: plugin.to_string(),
            id: id.to_string(),
        }
    }

    pub fn rule(plugin: &str, selector_id: &str, id: &str) -> Self {
        Self::Rule {
            plugin: plugin.to_string(),
            selector_id: selector_id.to_string(),
            id: id.to_string(),
        }
    }

    pub fn app_auth(app_key: &str) -> Self {
        Self::AppAuth {
            app_key: app_key.to_string(),
        }
    }
}

/// What a store subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreNotification {
    Change(ChangeEvent),
    /// The store may have dropped events; reload everything.
    Resync,
}
