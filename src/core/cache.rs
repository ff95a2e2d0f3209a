//! In-memory routing configuration with lock-free reads.
//!
//! The whole configuration lives in one immutable [`CacheSnapshot`] behind an
//! [`ArcSwap`]. Readers take a snapshot once at request start and keep it for
//! the rest of the request; writers build the next snapshot from the current
//! one and publish it with a compare-and-swap loop, so a concurrent reader sees
//! either the old or the new value of a key and never a partially built list.
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use arc_swap::ArcSwap;

use crate::{
    core::{
        evaluator::{Evaluable, evaluation_order},
        model::{AppAuth, ConfigDump, PluginData, Rule, Selector},
    },
    metrics,
};

/// One incremental change to the cache.
#[derive(Debug, Clone)]
pub enum CacheDelta {
    UpsertPlugin(PluginData),
    /// Removes the plugin together with its selectors and their rules.
    DeletePlugin { name: String },
    UpsertSelector(Selector),
    /// Removes the selector together with its rules. A no-op when the
    /// selector is cached under another plugin.
    DeleteSelector { plugin: String, id: String },
    /// Replaces the full selector list of one plugin.
    ReplaceSelectors { plugin: String, selectors: Vec<Selector> },
    UpsertRule(Rule),
    /// A no-op when the selector is cached under another plugin.
    DeleteRule {
        plugin: String,
        selector_id: String,
        id: String,
    },
    UpsertAppAuth(AppAuth),
    DeleteAppAuth { app_key: String },
}

/// Immutable view of the routing configuration at one version.
///
/// Selector lists are keyed by plugin name and rule lists by selector id; both
/// are kept sorted by `(sort, id)` and hold at most one item per id.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    version: u64,
    plugins: HashMap<String, Arc<PluginData>>,
    selectors: HashMap<String, Arc<[Selector]>>,
    rules: HashMap<String, Arc<[Rule]>>,
    app_auths: HashMap<String, Arc<AppAuth>>,
    enabled_plugins: Arc<BTreeSet<String>>,
}

impl CacheSnapshot {
    /// Build a snapshot from a full configuration dump. Later duplicates of an
    /// id replace earlier ones.
    pub fn from_dump(dump: ConfigDump) -> Self {
        let plugins: HashMap<String, Arc<PluginData>> = dump
            .plugins
            .into_iter()
            .map(|p| (p.name.clone(), Arc::new(p)))
            .collect();

        let mut selectors_by_plugin: HashMap<String, Vec<Selector>> = HashMap::new();
        for selector in dump.selectors {
            selectors_by_plugin
                .entry(selector.plugin_name.clone())
                .or_default()
                .push(selector);
        }
        let mut rules_by_selector: HashMap<String, Vec<Rule>> = HashMap::new();
        for rule in dump.rules {
            rules_by_selector
                .entry(rule.selector_id.clone())
                .or_default()
                .push(rule);
        }

        let mut snapshot = Self {
            version: 0,
            plugins,
            selectors: selectors_by_plugin
                .into_iter()
                .map(|(plugin, list)| (plugin, sorted_unique(list)))
                .collect(),
            rules: rules_by_selector
                .into_iter()
                .map(|(selector_id, list)| (selector_id, sorted_unique(list)))
                .collect(),
            app_auths: dump
                .app_auths
                .into_iter()
                .map(|a| (a.app_key.clone(), Arc::new(a)))
                .collect(),
            enabled_plugins: Arc::default(),
        };
        snapshot.refresh_enabled();
        snapshot
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn plugin(&self, name: &str) -> Option<&Arc<PluginData>> {
        self.plugins.get(name)
    }

    /// A plugin without a record counts as disabled.
    pub fn is_plugin_enabled(&self, name: &str) -> bool {
        self.enabled_plugins.contains(name)
    }

    pub fn enabled_plugins(&self) -> &Arc<BTreeSet<String>> {
        &self.enabled_plugins
    }

    /// Selectors of a plugin in evaluation order; empty when none are cached.
    pub fn selectors(&self, plugin: &str) -> &[Selector] {
        self.selectors.get(plugin).map(|s| &s[..]).unwrap_or(&[])
    }

    /// Rules of a selector in evaluation order; empty when none are cached.
    pub fn rules(&self, selector_id: &str) -> &[Rule] {
        self.rules.get(selector_id).map(|r| &r[..]).unwrap_or(&[])
    }

    pub fn app_auth(&self, app_key: &str) -> Option<&Arc<AppAuth>> {
        self.app_auths.get(app_key)
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    pub fn selector_count(&self) -> usize {
        self.selectors.values().map(|s| s.len()).sum()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(|r| r.len()).sum()
    }

    /// Export the snapshot back into dump form, in evaluation order.
    pub fn to_dump(&self) -> ConfigDump {
        let mut plugins: Vec<PluginData> = self.plugins.values().map(|p| (**p).clone()).collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));

        let mut plugin_names: Vec<&String> = self.selectors.keys().collect();
        plugin_names.sort();
        let selectors: Vec<Selector> = plugin_names
            .into_iter()
            .flat_map(|name| self.selectors(name).iter().cloned())
            .collect();

        let mut selector_ids: Vec<&String> = self.rules.keys().collect();
        selector_ids.sort();
        let rules: Vec<Rule> = selector_ids
            .into_iter()
            .flat_map(|id| self.rules(id).iter().cloned())
            .collect();

        let mut app_auths: Vec<AppAuth> = self.app_auths.values().map(|a| (**a).clone()).collect();
        app_auths.sort_by(|a, b| a.app_key.cmp(&b.app_key));

        ConfigDump {
            plugins,
            selectors,
            rules,
            app_auths,
        }
    }

    /// The snapshot that results from applying `delta`, one version later.
    pub fn with_delta(&self, delta: &CacheDelta) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        match delta {
            CacheDelta::UpsertPlugin(plugin) => {
                next.plugins
                    .insert(plugin.name.clone(), Arc::new(plugin.clone()));
            }
            CacheDelta::DeletePlugin { name } => {
                next.plugins.remove(name);
                if let Some(selectors) = next.selectors.remove(name) {
                    for selector in selectors.iter() {
                        next.rules.remove(&selector.id);
                    }
                }
            }
            CacheDelta::UpsertSelector(selector) => {
                // An id belongs to exactly one plugin
                remove_from_other_lists(&mut next.selectors, &selector.plugin_name, &selector.id);
                upsert_into(&mut next.selectors, &selector.plugin_name, selector.clone());
            }
            CacheDelta::DeleteSelector { plugin, id } => {
                if remove_from(&mut next.selectors, plugin, id)
                    || self.selector_owner(id).is_none()
                {
                    next.rules.remove(id);
                }
            }
            CacheDelta::ReplaceSelectors { plugin, selectors } => {
                let replaced = sorted_unique(selectors.clone());
                if let Some(previous) = next.selectors.get(plugin) {
                    for old in previous.iter() {
                        if !replaced.iter().any(|s| s.id == old.id) {
                            next.rules.remove(&old.id);
                        }
                    }
                }
                if replaced.is_empty() {
                    next.selectors.remove(plugin);
                } else {
                    next.selectors.insert(plugin.clone(), replaced);
                }
            }
            CacheDelta::UpsertRule(rule) => {
                remove_from_other_lists(&mut next.rules, &rule.selector_id, &rule.id);
                upsert_into(&mut next.rules, &rule.selector_id, rule.clone());
            }
            CacheDelta::DeleteRule {
                plugin,
                selector_id,
                id,
            } => {
                // The selector may have moved to another plugin since
                if self
                    .selector_owner(selector_id)
                    .is_none_or(|owner| owner == plugin)
                {
                    remove_from(&mut next.rules, selector_id, id);
                }
            }
            CacheDelta::UpsertAppAuth(auth) => {
                next.app_auths
                    .insert(auth.app_key.clone(), Arc::new(auth.clone()));
            }
            CacheDelta::DeleteAppAuth { app_key } => {
                next.app_auths.remove(app_key);
            }
        }
        next.refresh_enabled();
        next
    }

    /// Name of the plugin whose selector list holds `selector_id`.
    fn selector_owner(&self, selector_id: &str) -> Option<&str> {
        self.selectors
            .iter()
            .find(|(_, list)| list.iter().any(|s| s.id == selector_id))
            .map(|(plugin, _)| plugin.as_str())
    }

    fn refresh_enabled(&mut self) {
        let enabled: BTreeSet<String> = self
            .plugins
            .values()
            .filter(|p| p.enabled)
            .map(|p| p.name.clone())
            .collect();
        if *self.enabled_plugins != enabled {
            self.enabled_plugins = Arc::new(enabled);
        }
    }
}

fn sorted_unique<T: Evaluable>(items: Vec<T>) -> Arc<[T]> {
    let mut by_id: HashMap<String, T> = HashMap::with_capacity(items.len());
    for item in items {
        by_id.insert(item.id().to_string(), item);
    }
    let mut list: Vec<T> = by_id.into_values().collect();
    list.sort_by(evaluation_order);
    Arc::from(list)
}

fn upsert_into<T: Evaluable + Clone>(map: &mut HashMap<String, Arc<[T]>>, key: &str, item: T) {
    let mut list: Vec<T> = map
        .get(key)
        .map(|existing| {
            existing
                .iter()
                .filter(|e| e.id() != item.id())
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    let at = list
        .binary_search_by(|probe| evaluation_order(probe, &item))
        .unwrap_or_else(|insert_at| insert_at);
    list.insert(at, item);
    map.insert(key.to_string(), Arc::from(list));
}

/// Returns whether `id` was found under `key` and removed.
fn remove_from<T: Evaluable + Clone>(map: &mut HashMap<String, Arc<[T]>>, key: &str, id: &str) -> bool {
    let Some(existing) = map.get(key) else {
        return false;
    };
    if !existing.iter().any(|e| e.id() == id) {
        return false;
    }
    let list: Vec<T> = existing.iter().filter(|e| e.id() != id).cloned().collect();
    if list.is_empty() {
        map.remove(key);
    } else {
        map.insert(key.to_string(), Arc::from(list));
    }
    true
}

fn remove_from_other_lists<T: Evaluable + Clone>(
    map: &mut HashMap<String, Arc<[T]>>,
    keep_key: &str,
    id: &str,
) {
    let stale: Vec<String> = map
        .iter()
        .filter(|(key, list)| key.as_str() != keep_key && list.iter().any(|e| e.id() == id))
        .map(|(key, _)| key.clone())
        .collect();
    for key in stale {
        remove_from(map, &key, id);
    }
}

/// Everything a plugin needs from the cache, taken from one snapshot.
#[derive(Debug, Clone)]
pub struct PluginView {
    pub plugin: Option<Arc<PluginData>>,
    pub enabled: bool,
    pub selectors: Arc<[Selector]>,
}

/// Process-wide routing configuration cache.
#[derive(Debug, Default)]
pub struct ConfigCache {
    current: ArcSwap<CacheSnapshot>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dump(dump: ConfigDump) -> Self {
        let cache = Self::new();
        cache.replace_all(dump);
        cache
    }

    /// The current snapshot. Hold on to it for the whole request.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    pub fn enabled_plugins(&self) -> Arc<BTreeSet<String>> {
        Arc::clone(&self.current.load().enabled_plugins)
    }

    /// Plugin record, enablement and selectors of one plugin at one version.
    pub fn get(&self, plugin: &str) -> PluginView {
        let snapshot = self.current.load();
        PluginView {
            plugin: snapshot.plugins.get(plugin).cloned(),
            enabled: snapshot.is_plugin_enabled(plugin),
            selectors: snapshot
                .selectors
                .get(plugin)
                .cloned()
                .unwrap_or_else(|| Arc::from(Vec::new())),
        }
    }

    /// Replace all selectors of one plugin atomically.
    pub fn replace(&self, plugin: &str, selectors: Vec<Selector>) -> u64 {
        self.apply_delta(CacheDelta::ReplaceSelectors {
            plugin: plugin.to_string(),
            selectors,
        })
    }

    /// Replace the whole configuration atomically. Returns the new version.
    pub fn replace_all(&self, dump: ConfigDump) -> u64 {
        let fresh = CacheSnapshot::from_dump(dump);
        let previous = self.current.rcu(|current| {
            let mut next = fresh.clone();
            next.version = current.version + 1;
            next
        });
        self.published(previous.version + 1)
    }

    /// Apply one incremental change. Returns the new version.
    pub fn apply_delta(&self, delta: CacheDelta) -> u64 {
        let previous = self.current.rcu(|current| current.with_delta(&delta));
        self.published(previous.version + 1)
    }

    fn published(&self, version: u64) -> u64 {
        metrics::set_config_version(version);
        tracing::trace!(version, "Published configuration snapshot");
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump() -> ConfigDump {
        ConfigDump {
            plugins: vec![
                PluginData::new("1", "divide", true),
                PluginData::new("2", "waf", false),
            ],
            selectors: vec![
                Selector::new("s2", "divide", 2),
                Selector::new("s1", "divide", 1),
                Selector::new("w1", "waf", 1),
            ],
            rules: vec![
                Rule::new("r2", "s1", 5),
                Rule::new("r1", "s1", 5),
                Rule::new("r3", "s2", 1),
            ],
            app_auths: vec![],
        }
    }

    fn ids<T: Evaluable>(items: &[T]) -> Vec<&str> {
        items.iter().map(|i| i.id()).collect()
    }

    #[test]
    fn test_from_dump_sorts_and_groups() {
        let snapshot = CacheSnapshot::from_dump(dump());
        assert_eq!(ids(snapshot.selectors("divide")), vec!["s1", "s2"]);
        assert_eq!(ids(snapshot.rules("s1")), vec!["r1", "r2"]);
        assert!(snapshot.is_plugin_enabled("divide"));
        assert!(!snapshot.is_plugin_enabled("waf"));
        assert!(!snapshot.is_plugin_enabled("unknown"));
        assert!(snapshot.selectors("unknown").is_empty());
    }

    #[test]
    fn test_upsert_selector_replaces_by_id() {
        let cache = ConfigCache::from_dump(dump());
        let mut moved = Selector::new("s1", "divide", 10);
        moved.name = "renamed".into();
        cache.apply_delta(CacheDelta::UpsertSelector(moved));

        let snapshot = cache.snapshot();
        assert_eq!(ids(snapshot.selectors("divide")), vec!["s2", "s1"]);
        assert_eq!(snapshot.selectors("divide")[1].name, "renamed");
    }

    #[test]
    fn test_delete_plugin_cascades() {
        let cache = ConfigCache::from_dump(dump());
        cache.apply_delta(CacheDelta::DeletePlugin {
            name: "divide".into(),
        });
        let snapshot = cache.snapshot();
        assert!(snapshot.plugin("divide").is_none());
        assert!(snapshot.selectors("divide").is_empty());
        assert!(snapshot.rules("s1").is_empty());
        assert!(snapshot.rules("s2").is_empty());
        assert_eq!(ids(snapshot.selectors("waf")), vec!["w1"]);
    }

    #[test]
    fn test_delete_selector_drops_rules() {
        let cache = ConfigCache::from_dump(dump());
        cache.apply_delta(CacheDelta::DeleteSelector {
            plugin: "divide".into(),
            id: "s1".into(),
        });
        let snapshot = cache.snapshot();
        assert_eq!(ids(snapshot.selectors("divide")), vec!["s2"]);
        assert!(snapshot.rules("s1").is_empty());
        assert_eq!(ids(snapshot.rules("s2")), vec!["r3"]);
    }

    #[test]
    fn test_delete_under_wrong_plugin_is_noop() {
        let cache = ConfigCache::from_dump(dump());
        cache.apply_delta(CacheDelta::DeleteSelector {
            plugin: "waf".into(),
            id: "s1".into(),
        });
        cache.apply_delta(CacheDelta::DeleteRule {
            plugin: "waf".into(),
            selector_id: "s1".into(),
            id: "r1".into(),
        });
        let snapshot = cache.snapshot();
        assert_eq!(ids(snapshot.selectors("divide")), vec!["s1", "s2"]);
        assert_eq!(ids(snapshot.rules("s1")), vec!["r1", "r2"]);
    }

    #[test]
    fn test_delete_rule_of_uncached_selector() {
        let cache = ConfigCache::from_dump(dump());
        cache.apply_delta(CacheDelta::UpsertRule(Rule::new("orphan", "gone", 1)));
        cache.apply_delta(CacheDelta::DeleteRule {
            plugin: "divide".into(),
            selector_id: "gone".into(),
            id: "orphan".into(),
        });
        assert!(cache.snapshot().rules("gone").is_empty());
    }

    #[test]
    fn test_rule_moves_between_selectors() {
        let cache = ConfigCache::from_dump(dump());
        cache.apply_delta(CacheDelta::UpsertRule(Rule::new("r1", "s2", 0)));
        let snapshot = cache.snapshot();
        assert_eq!(ids(snapshot.rules("s1")), vec!["r2"]);
        assert_eq!(ids(snapshot.rules("s2")), vec!["r1", "r3"]);
    }

    #[test]
    fn test_replace_selectors_drops_orphaned_rules() {
        let cache = ConfigCache::from_dump(dump());
        cache.replace("divide", vec![Selector::new("s2", "divide", 1)]);
        let snapshot = cache.snapshot();
        assert_eq!(ids(snapshot.selectors("divide")), vec!["s2"]);
        assert!(snapshot.rules("s1").is_empty());
        assert_eq!(ids(snapshot.rules("s2")), vec!["r3"]);
    }

    #[test]
    fn test_enabled_set_tracks_plugin_updates() {
        let cache = ConfigCache::from_dump(dump());
        cache.apply_delta(CacheDelta::UpsertPlugin(PluginData::new("2", "waf", true)));
        assert!(cache.enabled_plugins().contains("waf"));
        cache.apply_delta(CacheDelta::UpsertPlugin(PluginData::new("1", "divide", false)));
        let view = cache.get("divide");
        assert!(!view.enabled);
        assert_eq!(view.selectors.len(), 2);
    }

    #[test]
    fn test_versions_increase_per_swap() {
        let cache = ConfigCache::new();
        assert_eq!(cache.version(), 0);
        assert_eq!(cache.replace_all(dump()), 1);
        let v = cache.apply_delta(CacheDelta::DeleteAppAuth {
            app_key: "none".into(),
        });
        assert_eq!(v, 2);
        assert_eq!(cache.version(), 2);
    }

    #[test]
    fn test_snapshot_is_stable_across_swaps() {
        let cache = ConfigCache::from_dump(dump());
        let before = cache.snapshot();
        cache.replace_all(ConfigDump::default());
        assert_eq!(ids(before.selectors("divide")), vec!["s1", "s2"]);
        assert!(cache.snapshot().selectors("divide").is_empty());
    }

    #[test]
    fn test_to_dump_round_trips_content() {
        let snapshot = CacheSnapshot::from_dump(dump());
        let exported = snapshot.to_dump();
        assert_eq!(exported.plugins.len(), 2);
        assert_eq!(exported.selectors.len(), 3);
        assert_eq!(exported.rules.len(), 3);
    }
}
