//! Turn two whole routing dumps into per-entity change events.
//!
//! Stores that only ever see complete dumps (a watched file, a polled HTTP
//! endpoint) use this to feed the same event path as stores that push
//! individual changes. Deletes are emitted before upserts, children before
//! parents for deletes and parents before children for upserts.
use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::{
    core::model::ConfigDump,
    error::SyncError,
    sync::event::{ChangeEvent, EntityPath},
};

fn fingerprint<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Per-entity fingerprints of a dump, keyed by entity path.
fn index<'a>(dump: &'a ConfigDump) -> BTreeMap<EntityKey, (EntityPath, Entity<'a>)> {
    let selector_plugin: HashMap<&str, &str> = dump
        .selectors
        .iter()
        .map(|s| (s.id.as_str(), s.plugin_name.as_str()))
        .collect();

    let mut entries = BTreeMap::new();
    for plugin in &dump.plugins {
        let path = EntityPath::plugin(&plugin.name);
        entries.insert(EntityKey::of(0, &path), (path, Entity::Plugin(plugin)));
    }
    for selector in &dump.selectors {
        let path = EntityPath::selector(&selector.plugin_name, &selector.id);
        entries.insert(EntityKey::of(1, &path), (path, Entity::Selector(selector)));
    }
    for rule in &dump.rules {
        // A rule whose selector is absent cannot be addressed by path
        let Some(plugin) = selector_plugin.get(rule.selector_id.as_str()) else {
            tracing::warn!(rule.id = %rule.id, selector.id = %rule.selector_id, "Rule references unknown selector; skipped");
            continue;
        };
        let path = EntityPath::rule(plugin, &rule.selector_id, &rule.id);
        entries.insert(EntityKey::of(2, &path), (path, Entity::Rule(rule)));
    }
    for auth in &dump.app_auths {
        let path = EntityPath::app_auth(&auth.app_key);
        entries.insert(EntityKey::of(3, &path), (path, Entity::AppAuth(auth)));
    }
    entries
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EntityKey {
    depth: u8,
    path: String,
}

impl EntityKey {
    fn of(depth: u8, path: &EntityPath) -> Self {
        Self {
            depth,
            path: path.to_path(""),
        }
    }
}

enum Entity<'a> {
    Plugin(&'a crate::core::model::PluginData),
    Selector(&'a crate::core::model::Selector),
    Rule(&'a crate::core::model::Rule),
    AppAuth(&'a crate::core::model::AppAuth),
}

impl Entity<'_> {
    fn fingerprint(&self) -> Vec<u8> {
        match self {
            Entity::Plugin(p) => fingerprint(p),
            Entity::Selector(s) => fingerprint(s),
            Entity::Rule(r) => fingerprint(r),
            Entity::AppAuth(a) => fingerprint(a),
        }
    }

    fn upsert_event(&self, root: &str, path: &EntityPath) -> Result<ChangeEvent, SyncError> {
        match (self, path) {
            (Entity::Plugin(p), _) => ChangeEvent::upsert_plugin(root, p),
            (Entity::Selector(s), _) => ChangeEvent::upsert_selector(root, s),
            (Entity::Rule(r), EntityPath::Rule { plugin, .. }) => {
                ChangeEvent::upsert_rule(root, plugin, r)
            }
            (Entity::Rule(_), other) => Err(SyncError::Path(other.to_path(root))),
            (Entity::AppAuth(a), _) => ChangeEvent::upsert_app_auth(root, a),
        }
    }
}

/// Events that transform `old` into `new`.
pub fn diff_dumps(root: &str, old: &ConfigDump, new: &ConfigDump) -> Result<Vec<ChangeEvent>, SyncError> {
    let before = index(old);
    let after = index(new);
    let mut events = Vec::new();

    // Deepest entities first so rules go before their selectors
    for (key, (path, _)) in before.iter().rev() {
        if !after.contains_key(key) {
            events.push(ChangeEvent::delete_entity(root, path));
        }
    }

    for (key, (path, entity)) in &after {
        let changed = match before.get(key) {
            Some((_, previous)) => previous.fingerprint() != entity.fingerprint(),
            None => true,
        };
        if changed {
            events.push(entity.upsert_event(root, path)?);
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::model::{PluginData, Rule, Selector},
        sync::event::{EntityKind, EventType},
    };

    fn base() -> ConfigDump {
        ConfigDump {
            plugins: vec![PluginData::new("1", "divide", true)],
            selectors: vec![Selector::new("s1", "divide", 1)],
            rules: vec![Rule::new("r1", "s1", 1)],
            app_auths: vec![],
        }
    }

    fn summary(events: &[ChangeEvent]) -> Vec<(EntityKind, EventType, String)> {
        events
            .iter()
            .map(|e| (e.kind, e.event_type, e.path.clone()))
            .collect()
    }

    #[test]
    fn test_identical_dumps_produce_nothing() {
        assert!(diff_dumps("/r", &base(), &base()).unwrap().is_empty());
    }

    #[test]
    fn test_initial_dump_upserts_parents_first() {
        let events = diff_dumps("/r", &ConfigDump::default(), &base()).unwrap();
        assert_eq!(
            summary(&events),
            vec![
                (EntityKind::Plugin, EventType::Upsert, "/r/plugin/divide".to_string()),
                (EntityKind::Selector, EventType::Upsert, "/r/selector/divide/s1".to_string()),
                (EntityKind::Rule, EventType::Upsert, "/r/rule/divide/s1/r1".to_string()),
            ]
        );
    }

    #[test]
    fn test_changed_and_removed_entities() {
        let mut next = base();
        next.selectors[0].sort = 7;
        next.rules.clear();
        let events = diff_dumps("/r", &base(), &next).unwrap();
        assert_eq!(
            summary(&events),
            vec![
                (EntityKind::Rule, EventType::Delete, "/r/rule/divide/s1/r1".to_string()),
                (EntityKind::Selector, EventType::Upsert, "/r/selector/divide/s1".to_string()),
            ]
        );
        let payload: Selector = serde_json::from_slice(&events[1].payload).unwrap();
        assert_eq!(payload.sort, 7);
    }
}
