use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    core::{
        cache::CacheSnapshot,
        evaluator::{RouteMatcher, SelectorEvaluator},
        handle::{DivideHandle, DivideUpstream, LoadBalance},
        load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
        model::PluginRole,
    },
    error::GatewayError,
    plugin::{Exchange, Next, Plugin, PluginResult, UpstreamTarget},
};

const NAME: &str = "divide";

/// Chooses the upstream for HTTP forwarding.
///
/// Upstreams and balancing come from the matched rule's handle, with the
/// upstream list falling back to the selector's handle. Balancer state such as
/// the round-robin cursor is kept per rule.
pub struct DividePlugin {
    balancers: scc::HashMap<String, Arc<dyn LoadBalancingStrategy>>,
    pruned_at: AtomicU64,
}

impl Default for DividePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl DividePlugin {
    pub fn new() -> Self {
        Self {
            balancers: scc::HashMap::new(),
            pruned_at: AtomicU64::new(0),
        }
    }

    async fn balancer(&self, rule_id: &str, strategy: LoadBalance) -> Arc<dyn LoadBalancingStrategy> {
        let key = format!("{rule_id}/{strategy:?}");
        let entry = self
            .balancers
            .entry_async(key)
            .await
            .or_insert_with(|| Arc::from(LoadBalancerFactory::create_strategy(strategy)));
        Arc::clone(entry.get())
    }

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
        self.balancers
            .retain_async(|key, _| {
                key.rsplit_once('/')
                    .is_some_and(|(rule_id, _)| live.contains(rule_id))
            })
            .await;
    }
}

fn base_url(upstream: &DivideUpstream) -> String {
    let raw = if upstream.url.trim().is_empty() {
        upstream.host.trim()
    } else {
        upstream.url.trim()
    };
    let raw = raw.trim_end_matches('/');
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    }
}

#[async_trait]
impl Plugin for DividePlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn role(&self) -> PluginRole {
        PluginRole::Function
    }

    fn order(&self) -> i32 {
        50
    }

    async fn execute(&self, exchange: &mut Exchange, next: Next<'_>) -> PluginResult {
        let snapshot = exchange.snapshot_arc();
        self.prune_if_stale(&snapshot).await;

        let Some(selector) = SelectorEvaluator::evaluate(snapshot.selectors(NAME), exchange.view())
        else {
            return next.run(exchange).await;
        };
        // The selector claimed the request; it must also route it
        let Some(matched) = RouteMatcher::within(&snapshot, NAME, selector, exchange.view()) else {
            return Err(GatewayError::NoMatch {
                plugin: NAME.to_string(),
                selector: selector.id.clone(),
            });
        };

        let handle = DivideHandle::resolve(
            matched.rule.handle.as_ref(),
            matched.selector.handle.as_ref(),
        )
        .map_err(|source| {
            tracing::warn!(rule.id = %matched.rule.id, error = %source, "Unusable divide handle");
            GatewayError::HandleType {
                plugin: NAME.to_string(),
                source,
            }
        })?;

        let balancer = self.balancer(&matched.rule.id, handle.load_balance).await;
        let upstream = balancer
            .select(&handle.upstreams, exchange.view().client_ip())
            .ok_or_else(|| GatewayError::NoUpstream {
                selector: matched.selector.id.clone(),
            })?;

        let target = UpstreamTarget {
            base_url: base_url(upstream),
            timeout: Duration::from_millis(handle.timeout_ms),
            retries: handle.retries,
            selector_id: matched.selector.id.clone(),
            rule_id: matched.rule.id.clone(),
        };
        tracing::debug!(upstream = %target.base_url, rule.id = %target.rule_id, "Upstream selected");
        exchange.insert(target);
        next.run(exchange).await
    }
}
