use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use http::StatusCode;

use crate::{
    core::{
        cache::CacheSnapshot,
        evaluator::RouteMatcher,
        handle::{RateLimiterHandle, decode_handle},
        model::PluginRole,
        rate_limiter::{RateLimitError, RateLimiterRegistry},
    },
    error::GatewayError,
    plugin::{Exchange, Next, Plugin, PluginResult},
};

const NAME: &str = "rate_limiter";

/// Token bucket per matched rule. Every selector match along a `continued`
/// run is charged, so one request may consume from several buckets.
pub struct RateLimiterPlugin {
    registry: RateLimiterRegistry,
    pruned_at: AtomicU64,
}

impl Default for RateLimiterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterPlugin {
    pub fn new() -> Self {
        Self {
            registry: RateLimiterRegistry::new(),
            pruned_at: AtomicU64::new(0),
        }
    }

    /// Drop buckets of deleted rules once per configuration version.
    async fn prune_if_stale(&self, snapshot: &CacheSnapshot) {
        let version = snapshot.version();
        if self.pruned_at.fetch_max(version, Ordering::AcqRel) >= version {
            return;
        }
        let live: HashSet<&str> = snapshot
            .selectors(NAME)
            .iter()
            .flat_map(|selector| snapshot.rules(&selector.id).iter().map(|rule| rule.id.as_str()))
            .collect();
        self.registry.prune(|rule_id| live.contains(rule_id)).await;
    }
}

#[async_trait]
impl Plugin for RateLimiterPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn role(&self) -> PluginRole {
        PluginRole::Before
    }

    fn order(&self) -> i32 {
        30
    }

    async fn execute(&self, exchange: &mut Exchange, next: Next<'_>) -> PluginResult {
        let snapshot = exchange.snapshot_arc();
        self.prune_if_stale(&snapshot).await;

        let buckets: Vec<(String, RateLimiterHandle)> =
            RouteMatcher::all(&snapshot, NAME, exchange.view())
                .into_iter()
                .filter_map(|matched| {
                    match decode_handle::<RateLimiterHandle>(matched.rule.handle.as_ref()) {
                        Ok(handle) => Some((matched.rule.id.clone(), handle)),
                        Err(e) => {
                            tracing::warn!(rule.id = %matched.rule.id, error = %e, "Unusable rate limiter handle; rule bypassed");
                            None
                        }
                    }
                })
                .collect();

        for (rule_id, handle) in buckets {
            match self.registry.check(&rule_id, handle).await {
                Ok(()) => {}
                Err(RateLimitError::Exceeded { .. }) => {
                    tracing::debug!(rule.id = %rule_id, "Rate limit exceeded");
                    return Err(GatewayError::rejected(
                        StatusCode::TOO_MANY_REQUESTS,
                        "too many requests",
                    ));
                }
                Err(e @ RateLimitError::InvalidQuota(_)) => {
                    tracing::warn!(rule.id = %rule_id, error = %e, "Invalid rate limiter quota; rule bypassed");
                }
            }
        }
        next.run(exchange).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        core::model::{ConfigDump, Rule, Selector},
        plugin::builtin::test_support::*,
    };

    fn dump(first: serde_json::Value, second: Option<serde_json::Value>) -> ConfigDump {
        let mut s1 = Selector::new("s1", NAME, 1);
        s1.continued = second.is_some();
        let mut r1 = Rule::new("r1", "s1", 1);
        r1.handle = Some(first);
        let mut selectors = vec![s1];
        let mut rules = vec![r1];
        if let Some(handle) = second {
            selectors.push(Selector::new("s2", NAME, 2));
            let mut r2 = Rule::new("r2", "s2", 1);
            r2.handle = Some(handle);
            rules.push(r2);
        }
        with_plugins(
            ConfigDump {
                selectors,
                rules,
                ..Default::default()
            },
            &[NAME],
        )
    }

    #[tokio::test]
    async fn test_exhausted_bucket_returns_429() {
        let chain = chain_of(RateLimiterPlugin::new());
        let dump = dump(json!({"burstCapacity": 2, "replenishRate": 1}), None);
        for _ in 0..2 {
            let mut exchange = exchange(dump.clone(), get("/"));
            assert!(chain.execute(&mut exchange).await.is_ok());
        }
        let mut exchange = exchange(dump, get("/"));
        let err = chain.execute(&mut exchange).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_continued_selectors_are_all_charged() {
        let chain = chain_of(RateLimiterPlugin::new());
        let dump = dump(
            json!({"burstCapacity": 100, "replenishRate": 1}),
            Some(json!({"burstCapacity": 1, "replenishRate": 1})),
        );
        let mut first = exchange(dump.clone(), get("/"));
        assert!(chain.execute(&mut first).await.is_ok());
        // Second selector's bucket is empty now
        let mut second = exchange(dump, get("/"));
        assert!(chain.execute(&mut second).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_handle_bypasses() {
        let chain = chain_of(RateLimiterPlugin::new());
        let dump = dump(json!({"burstCapacity": "lots"}), None);
        for _ in 0..5 {
            let mut exchange = exchange(dump.clone(), get("/"));
            assert!(chain.execute(&mut exchange).await.is_ok());
        }
    }
}
