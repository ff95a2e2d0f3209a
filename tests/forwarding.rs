// End-to-end tests: gateway handler, default chain and a local upstream
#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use axum::{Json, Router, body::Body, extract::Request};
    use http::StatusCode;
    use serde_json::{Value, json};
    use switchyard::{
        adapters::{HttpClientAdapter, HttpHandler, router},
        config::GatewayConfig,
        core::{
            ConfigCache,
            model::{Condition, ConfigDump, Operator, ParamType, PluginData, Rule, Selector},
        },
        plugin::builtin::default_chain,
    };
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    async fn echo(req: Request) -> Json<Value> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Json(json!({
            "method": parts.method.as_str(),
            "path": parts.uri.path(),
            "query": parts.uri.query(),
            "requestId": header("x-request-id"),
            "forwardedFor": header("x-forwarded-for"),
            "body": String::from_utf8_lossy(&body),
        }))
    }

    async fn start_upstream() -> eyre::Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(echo))
                .await
                .unwrap();
        });
        Ok(format!("http://{addr}"))
    }

    fn routes(upstream: &str) -> ConfigDump {
        let plugins = ["global", "waf", "rewrite", "divide", "forward"]
            .iter()
            .enumerate()
            .map(|(i, name)| PluginData::new(i.to_string(), *name, true))
            .chain([
                PluginData::new("90", "sign", false),
                PluginData::new("91", "rate_limiter", false),
            ])
            .collect();

        let mut api = Selector::new("api", "divide", 1);
        api.conditions = vec![Condition::new(ParamType::Path, "", Operator::StartsWith, "/api")];
        let mut api_rule = Rule::new("api-rule", "api", 1);
        api_rule.handle = Some(json!({
            "upstreams": [{"url": upstream, "weight": 1}],
            "loadBalance": "ROUND_ROBIN",
            "timeoutMs": 2000
        }));

        let mut legacy = Selector::new("legacy", "rewrite", 1);
        legacy.conditions = vec![Condition::new(ParamType::Path, "", Operator::Eq, "/api/old")];
        let mut legacy_rule = Rule::new("legacy-rule", "legacy", 1);
        legacy_rule.handle = Some(json!({"targetURI": "/v2/echo"}));

        let mut blocked = Selector::new("blocked", "waf", 1);
        blocked.conditions = vec![Condition::new(ParamType::Path, "", Operator::StartsWith, "/api/admin")];
        let mut blocked_rule = Rule::new("blocked-rule", "blocked", 1);
        blocked_rule.handle = Some(json!({"permission": "reject"}));

        ConfigDump {
            plugins,
            selectors: vec![api, legacy, blocked],
            rules: vec![api_rule, legacy_rule, blocked_rule],
            ..Default::default()
        }
    }

    fn handler(dump: ConfigDump) -> eyre::Result<Arc<HttpHandler>> {
        let config = GatewayConfig::default();
        let chain = default_chain(&config, Arc::new(HttpClientAdapter::new()?))?;
        Ok(Arc::new(HttpHandler::new(
            Arc::new(ConfigCache::from_dump(dump)),
            Arc::new(chain),
            config.upstream.max_body_bytes,
            CancellationToken::new(),
        )))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_is_forwarded_through_gateway_server() -> eyre::Result<()> {
        let upstream = start_upstream().await?;
        let app = router(handler(routes(&upstream))?);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let gateway = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let client = reqwest::Client::builder().no_proxy().build()?;
        let response = client
            .post(format!("http://{gateway}/api/orders?id=7"))
            .header("x-request-id", "e2e-1")
            .body("hello")
            .send()
            .await?;
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.headers()["x-request-id"], "e2e-1");

        let seen: Value = response.json().await?;
        assert_eq!(seen["method"], "POST");
        assert_eq!(seen["path"], "/api/orders");
        assert_eq!(seen["query"], "id=7");
        assert_eq!(seen["requestId"], "e2e-1");
        assert_eq!(seen["forwardedFor"], "127.0.0.1");
        assert_eq!(seen["body"], "hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_rewrite_changes_upstream_path() -> eyre::Result<()> {
        let upstream = start_upstream().await?;
        let handler = handler(routes(&upstream))?;

        let req = http::Request::builder()
            .uri("/api/old?x=1")
            .body(Body::empty())?;
        let response = handler.handle_request(req, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let seen = body_json(response).await;
        assert_eq!(seen["path"], "/v2/echo");
        assert_eq!(seen["query"], "x=1");
        Ok(())
    }

    #[tokio::test]
    async fn test_firewall_rejects_before_forwarding() -> eyre::Result<()> {
        let upstream = start_upstream().await?;
        let handler = handler(routes(&upstream))?;

        let req = http::Request::builder()
            .uri("/api/admin/users")
            .body(Body::empty())?;
        let response = handler.handle_request(req, None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["code"], 403);
        Ok(())
    }

    #[tokio::test]
    async fn test_unrouted_request_is_not_found() -> eyre::Result<()> {
        let upstream = start_upstream().await?;
        let handler = handler(routes(&upstream))?;

        let req = http::Request::builder().uri("/other").body(Body::empty())?;
        let response = handler.handle_request(req, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key("x-request-id"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() -> eyre::Result<()> {
        let handler = handler(routes("http://127.0.0.1:1"))?;

        let req = http::Request::builder().uri("/api/orders").body(Body::empty())?;
        let response = handler.handle_request(req, None).await;
        assert!(matches!(
            response.status(),
            StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT
        ));
        Ok(())
    }
}
