use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;
use thiserror::Error;
use tracing::Instrument;

use crate::{
    error::GatewayError,
    metrics,
    plugin::{Exchange, Plugin, PluginResult},
    tracing_setup::create_plugin_span,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainBuildError {
    #[error("plugin '{0}' is registered more than once")]
    DuplicatePlugin(String),
}

struct Registered {
    plugin: Arc<dyn Plugin>,
    order: i32,
}

/// Continuation handed to a plugin: the plugins still ahead of it.
pub struct Next<'a> {
    remaining: &'a [Registered],
}

impl Next<'_> {
    /// Invoke the next eligible plugin. Plugins disabled in the request's
    /// snapshot, or whose `skip` says so, are passed over without being
    /// invoked. Running past the last plugin yields [`GatewayError::Unhandled`].
    pub async fn run(self, exchange: &mut Exchange) -> PluginResult {
        let mut remaining = self.remaining;
        while let Some((entry, rest)) = remaining.split_first() {
            remaining = rest;
            if exchange.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }

            let plugin = &entry.plugin;
            let name = plugin.name();
            if !exchange.snapshot().is_plugin_enabled(name) {
                tracing::trace!(plugin = name, "Plugin disabled; skipped");
                continue;
            }
            if plugin.skip(exchange) {
                tracing::trace!(plugin = name, "Plugin opted out; skipped");
                metrics::increment_plugin_execution(name, "skipped");
                continue;
            }

            exchange.enter_plugin(name);
            let role = plugin.role().to_string();
            let result = plugin
                .execute(exchange, Next { remaining: rest })
                .instrument(create_plugin_span(name, &role))
                .await;
            let outcome = match &result {
                Ok(_) => "ok",
                Err(GatewayError::Rejected { .. }) => "rejected",
                Err(_) => "error",
            };
            metrics::increment_plugin_execution(name, outcome);
            return result;
        }
        Err(GatewayError::Unhandled)
    }
}

/// Ordered plugins, run in tier order (BEFORE, FUNCTION, LAST), then by
/// order, then by registration order.
pub struct PluginChain {
    plugins: Vec<Registered>,
}

impl PluginChain {
    pub fn builder() -> PluginChainBuilder {
        PluginChainBuilder::default()
    }

    /// Plugin names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|r| r.plugin.name()).collect()
    }

    /// Effective order of a registered plugin, after overrides.
    pub fn order_of(&self, name: &str) -> Option<i32> {
        self.plugins
            .iter()
            .find(|r| r.plugin.name() == name)
            .map(|r| r.order)
    }

    /// Run the chain for one request. Cancellation of the exchange's token
    /// stops the chain; a panicking plugin fails only this request.
    pub async fn execute(&self, exchange: &mut Exchange) -> PluginResult {
        let cancel = exchange.cancellation().clone();
        let run = AssertUnwindSafe(Next {
            remaining: &self.plugins,
        }
        .run(exchange))
        .catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = run => Some(outcome),
        };

        match outcome {
            None => {
                tracing::debug!("Request cancelled; chain stopped");
                Err(GatewayError::Cancelled)
            }
            Some(Ok(result)) => result,
            Some(Err(panic)) => {
                let plugin = exchange.current_plugin().unwrap_or("unknown").to_string();
                let message = panic_message(panic.as_ref());
                tracing::error!(plugin = %plugin, panic = %message, "Plugin panicked");
                metrics::increment_plugin_execution(&plugin, "panic");
                Err(GatewayError::ChainExecution { plugin, message })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "plugin panicked".to_string()
    }
}

#[derive(Default)]
pub struct PluginChainBuilder {
    plugins: Vec<Arc<dyn Plugin>>,
    overrides: HashMap<String, i32>,
}

impl PluginChainBuilder {
    pub fn register(mut self, plugin: impl Plugin) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn register_arc(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Replace declared orders by plugin name.
    pub fn order_overrides(mut self, overrides: HashMap<String, i32>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn build(self) -> Result<PluginChain, ChainBuildError> {
        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            if !seen.insert(plugin.name().to_string()) {
                return Err(ChainBuildError::DuplicatePlugin(plugin.name().to_string()));
            }
        }

        let mut plugins: Vec<Registered> = self
            .plugins
            .into_iter()
            .map(|plugin| {
                let order = self
                    .overrides
                    .get(plugin.name())
                    .copied()
                    .unwrap_or_else(|| plugin.order());
                Registered { plugin, order }
            })
            .collect();
        // Stable sort keeps registration order among equals
        plugins.sort_by_key(|r| (r.plugin.role(), r.order));

        tracing::debug!(
            plugins = ?plugins.iter().map(|r| r.plugin.name()).collect::<Vec<_>>(),
            "Plugin chain built"
        );
        Ok(PluginChain { plugins })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::{body::Body, response::Response};
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::core::{
        cache::ConfigCache,
        model::{ConfigDump, PluginData, PluginRole},
        request::HttpRequestView,
    };

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        role: PluginRole,
        order: i32,
        log: Log,
        respond: bool,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        fn role(&self) -> PluginRole {
            self.role
        }
        fn order(&self) -> i32 {
            self.order
        }
        async fn execute(&self, exchange: &mut Exchange, next: Next<'_>) -> PluginResult {
            self.log.lock().unwrap().push(self.name.to_string());
            if self.respond {
                return Ok(Response::new(Body::from(self.name)));
            }
            next.run(exchange).await
        }
    }

    struct Panicker;

    #[async_trait]
    impl Plugin for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }
        fn role(&self) -> PluginRole {
            PluginRole::Function
        }
        fn order(&self) -> i32 {
            0
        }
        async fn execute(&self, _exchange: &mut Exchange, _next: Next<'_>) -> PluginResult {
            panic!("boom");
        }
    }

    /// Announces that it started, then waits far longer than any test runs.
    struct Stall {
        started: Arc<tokio::sync::Notify>,
        log: Log,
    }

    #[async_trait]
    impl Plugin for Stall {
        fn name(&self) -> &str {
            "stall"
        }
        fn role(&self) -> PluginRole {
            PluginRole::Before
        }
        fn order(&self) -> i32 {
            0
        }
        async fn execute(&self, exchange: &mut Exchange, next: Next<'_>) -> PluginResult {
            self.log.lock().unwrap().push("stall".to_string());
            self.started.notify_one();
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            next.run(exchange).await
        }
    }

    fn recorder(name: &'static str, role: PluginRole, order: i32, log: &Log) -> Recorder {
        Recorder {
            name,
            role,
            order,
            log: Arc::clone(log),
            respond: false,
        }
    }

    fn exchange_with(enabled: &[&str]) -> Exchange {
        let cache = ConfigCache::from_dump(ConfigDump {
            plugins: enabled
                .iter()
                .enumerate()
                .map(|(i, name)| PluginData::new(i.to_string(), *name, true))
                .collect(),
            ..Default::default()
        });
        let req = http::Request::builder().uri("/").body(Bytes::new()).unwrap();
        Exchange::new(
            HttpRequestView::from_request(req, None),
            cache.snapshot(),
            "test",
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_tier_then_order_then_registration() {
        let log = Log::default();
        let chain = PluginChain::builder()
            .register(recorder("last", PluginRole::Last, 0, &log))
            .register(recorder("fn_b", PluginRole::Function, 5, &log))
            .register(recorder("fn_a", PluginRole::Function, 5, &log))
            .register(recorder("before", PluginRole::Before, 100, &log))
            .build()
            .unwrap();
        assert_eq!(chain.names(), vec!["before", "fn_b", "fn_a", "last"]);

        let mut exchange = exchange_with(&["last", "fn_a", "fn_b", "before"]);
        let result = chain.execute(&mut exchange).await;
        assert!(matches!(result, Err(GatewayError::Unhandled)));
        assert_eq!(*log.lock().unwrap(), vec!["before", "fn_b", "fn_a", "last"]);
    }

    #[tokio::test]
    async fn test_disabled_and_missing_plugins_are_skipped() {
        let log = Log::default();
        let chain = PluginChain::builder()
            .register(recorder("a", PluginRole::Before, 0, &log))
            .register(recorder("b", PluginRole::Before, 1, &log))
            .register(recorder("c", PluginRole::Before, 2, &log))
            .build()
            .unwrap();
        let mut exchange = exchange_with(&["a", "c"]);
        let _ = chain.execute(&mut exchange).await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_short_circuit_stops_chain() {
        let log = Log::default();
        let mut gate = recorder("gate", PluginRole::Before, 0, &log);
        gate.respond = true;
        let chain = PluginChain::builder()
            .register(gate)
            .register(recorder("after", PluginRole::Last, 0, &log))
            .build()
            .unwrap();
        let mut exchange = exchange_with(&["gate", "after"]);
        assert!(chain.execute(&mut exchange).await.is_ok());
        assert_eq!(*log.lock().unwrap(), vec!["gate"]);
    }

    #[tokio::test]
    async fn test_order_override_and_duplicates() {
        let log = Log::default();
        let chain = PluginChain::builder()
            .register(recorder("x", PluginRole::Function, 1, &log))
            .register(recorder("y", PluginRole::Function, 2, &log))
            .order_overrides(HashMap::from([("x".to_string(), 10)]))
            .build()
            .unwrap();
        assert_eq!(chain.names(), vec!["y", "x"]);
        assert_eq!(chain.order_of("x"), Some(10));

        let err = PluginChain::builder()
            .register(recorder("x", PluginRole::Function, 1, &log))
            .register(recorder("x", PluginRole::Last, 1, &log))
            .build()
            .err();
        assert_eq!(err, Some(ChainBuildError::DuplicatePlugin("x".into())));
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let chain = PluginChain::builder().register(Panicker).build().unwrap();
        let mut exchange = exchange_with(&["panicker"]);
        match chain.execute(&mut exchange).await {
            Err(GatewayError::ChainExecution { plugin, message }) => {
                assert_eq!(plugin, "panicker");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_exchange_runs_nothing() {
        let log = Log::default();
        let chain = PluginChain::builder()
            .register(recorder("a", PluginRole::Before, 0, &log))
            .build()
            .unwrap();
        let mut exchange = exchange_with(&["a"]);
        exchange.cancellation().cancel();
        assert!(matches!(
            chain.execute(&mut exchange).await,
            Err(GatewayError::Cancelled)
        ));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_plugin_suspended() {
        let log = Log::default();
        let started = Arc::new(tokio::sync::Notify::new());
        let chain = PluginChain::builder()
            .register(Stall {
                started: Arc::clone(&started),
                log: Arc::clone(&log),
            })
            .register(recorder("after", PluginRole::Function, 0, &log))
            .build()
            .unwrap();
        let mut exchange = exchange_with(&["stall", "after"]);
        let token = exchange.cancellation().clone();

        let (result, ()) = tokio::join!(chain.execute(&mut exchange), async {
            started.notified().await;
            token.cancel();
        });
        assert!(matches!(result, Err(GatewayError::Cancelled)));
        assert_eq!(*log.lock().unwrap(), vec!["stall".to_string()]);
    }
}
