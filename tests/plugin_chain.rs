// Integration tests for plugin chain ordering, skipping and short-circuiting
#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::{body::Body, response::Response};
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use serde_json::json;
    use switchyard::{
        adapters::MemoryConfigStore,
        config::SyncConfig,
        core::{
            ConfigCache, HttpRequestView,
            model::{ConfigDump, PluginData, PluginRole, Rule, Selector},
        },
        error::GatewayError,
        plugin::{Exchange, Next, Plugin, PluginChain, PluginResult, builtin::WafPlugin},
        ports::config_store::ConfigStore,
        sync::ConfigSynchronizer,
    };
    use tokio_util::sync::CancellationToken;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    /// Records its invocation and passes the request on.
    struct Step {
        name: &'static str,
        role: PluginRole,
        order: i32,
        log: Log,
        skip_header: Option<&'static str>,
    }

    #[async_trait]
    impl Plugin for Step {
        fn name(&self) -> &str {
            self.name
        }
        fn role(&self) -> PluginRole {
            self.role
        }
        fn order(&self) -> i32 {
            self.order
        }
        fn skip(&self, exchange: &Exchange) -> bool {
            self.skip_header
                .is_some_and(|name| exchange.request().headers().contains_key(name))
        }
        async fn execute(&self, exchange: &mut Exchange, next: Next<'_>) -> PluginResult {
            self.log.lock().unwrap().push(self.name);
            next.run(exchange).await
        }
    }

    /// Terminal plugin producing the response.
    struct Respond {
        log: Log,
    }

    #[async_trait]
    impl Plugin for Respond {
        fn name(&self) -> &str {
            "respond"
        }
        fn role(&self) -> PluginRole {
            PluginRole::Last
        }
        fn order(&self) -> i32 {
            100
        }
        async fn execute(&self, _exchange: &mut Exchange, _next: Next<'_>) -> PluginResult {
            self.log.lock().unwrap().push("respond");
            Ok(Response::new(Body::from("done")))
        }
    }

    fn step(name: &'static str, role: PluginRole, order: i32, log: &Log) -> Step {
        Step {
            name,
            role,
            order,
            log: Arc::clone(log),
            skip_header: None,
        }
    }

    fn enabled(names: &[&str]) -> ConfigDump {
        ConfigDump {
            plugins: names
                .iter()
                .map(|name| PluginData::new(*name, *name, true))
                .collect(),
            ..Default::default()
        }
    }

    fn exchange(cache: &ConfigCache, req: Request<Bytes>) -> Exchange {
        Exchange::new(
            HttpRequestView::from_request(req, None),
            cache.snapshot(),
            "it",
            CancellationToken::new(),
        )
    }

    fn get(path: &str) -> Request<Bytes> {
        Request::builder().uri(path).body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn test_last_tier_never_runs_before_before_tier() {
        let log = Log::default();
        // Registered out of order on purpose
        let chain = PluginChain::builder()
            .register(Respond {
                log: Arc::clone(&log),
            })
            .register(step("function", PluginRole::Function, -100, &log))
            .register(step("before-late", PluginRole::Before, 900, &log))
            .register(step("before-early", PluginRole::Before, 1, &log))
            .build()
            .unwrap();
        let cache = ConfigCache::from_dump(enabled(&[
            "respond",
            "function",
            "before-late",
            "before-early",
        ]));

        let mut exchange = exchange(&cache, get("/"));
        let response = chain.execute(&mut exchange).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before-early", "before-late", "function", "respond"]
        );
    }

    #[tokio::test]
    async fn test_skip_predicate_prevents_invocation() {
        let log = Log::default();
        let mut optional = step("optional", PluginRole::Function, 1, &log);
        optional.skip_header = Some("x-skip-optional");
        let chain = PluginChain::builder()
            .register(optional)
            .register(Respond {
                log: Arc::clone(&log),
            })
            .build()
            .unwrap();
        let cache = ConfigCache::from_dump(enabled(&["optional", "respond"]));

        let req = Request::builder()
            .uri("/")
            .header("x-skip-optional", "1")
            .body(Bytes::new())
            .unwrap();
        let mut skipped = exchange(&cache, req);
        chain.execute(&mut skipped).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["respond"]);

        log.lock().unwrap().clear();
        let mut invoked = exchange(&cache, get("/"));
        chain.execute(&mut invoked).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["optional", "respond"]);
    }

    #[tokio::test]
    async fn test_waf_reject_short_circuits_chain() {
        let log = Log::default();
        let chain = PluginChain::builder()
            .register(WafPlugin)
            .register(step("after", PluginRole::Function, 0, &log))
            .register(Respond {
                log: Arc::clone(&log),
            })
            .build()
            .unwrap();

        let mut rule = Rule::new("deny", "admin", 1);
        rule.handle = Some(json!({"permission": "reject", "statusCode": 418}));
        let mut dump = enabled(&["waf", "after", "respond"]);
        dump.selectors.push(Selector::new("admin", "waf", 1));
        dump.rules.push(rule);
        let cache = ConfigCache::from_dump(dump);

        let mut exchange = exchange(&cache, get("/admin"));
        match chain.execute(&mut exchange).await {
            Err(e @ GatewayError::Rejected { .. }) => assert_eq!(e.status_code().as_u16(), 418),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plugin_disabled_by_store_never_executes() {
        let log = Log::default();
        let chain = PluginChain::builder()
            .register(step("divide", PluginRole::Function, 50, &log))
            .register(Respond {
                log: Arc::clone(&log),
            })
            .build()
            .unwrap();

        let mut dump = enabled(&["divide", "respond"]);
        dump.selectors.push(Selector::new("s1", "divide", 1));
        dump.rules.push(Rule::new("r1", "s1", 1));

        let cache = Arc::new(ConfigCache::new());
        let store = Arc::new(MemoryConfigStore::new(dump));
        let feed: Arc<dyn ConfigStore> = store.clone();
        let sync = ConfigSynchronizer::new(Arc::clone(&cache), feed, SyncConfig::default())
            .start(CancellationToken::new())
            .await
            .unwrap();

        let mut before = exchange(&cache, get("/"));
        chain.execute(&mut before).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["divide", "respond"]);

        // Pushed disabled; its selector and rule still match everything
        store
            .upsert_plugin(PluginData::new("divide", "divide", false))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while cache.snapshot().is_plugin_enabled("divide") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        log.lock().unwrap().clear();
        let mut after = exchange(&cache, get("/"));
        chain.execute(&mut after).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["respond"]);
        assert_eq!(cache.snapshot().rules("s1").len(), 1);
        sync.shutdown().await;
    }
}
