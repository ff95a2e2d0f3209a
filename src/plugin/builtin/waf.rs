use async_trait::async_trait;
use http::StatusCode;

use crate::{
    core::{
        evaluator::RouteMatcher,
        handle::{WafHandle, WafPermission, decode_handle},
        model::PluginRole,
    },
    error::GatewayError,
    plugin::{Exchange, Next, Plugin, PluginResult},
};

const NAME: &str = "waf";

/// Rejects requests matched by a `reject` rule.
pub struct WafPlugin;

impl WafPlugin {
    /// `Some(status)` when the request must be refused.
    fn verdict(exchange: &Exchange) -> Option<StatusCode> {
        let matched = RouteMatcher::first(exchange.snapshot(), NAME, exchange.view())?;
        match decode_handle::<WafHandle>(matched.rule.handle.as_ref()) {
            Ok(WafHandle {
                permission: WafPermission::Allow,
                ..
            }) => None,
            Ok(WafHandle {
                permission: WafPermission::Reject,
                status_code,
            }) => Some(
                status_code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::FORBIDDEN),
            ),
            Err(e) => {
                tracing::warn!(rule.id = %matched.rule.id, error = %e, "Unusable WAF handle; rejecting");
                Some(StatusCode::FORBIDDEN)
            }
        }
    }
}

#[async_trait]
impl Plugin for WafPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn role(&self) -> PluginRole {
        PluginRole::Before
    }

    fn order(&self) -> i32 {
        20
    }

    async fn execute(&self, exchange: &mut Exchange, next: Next<'_>) -> PluginResult {
        if let Some(status) = Self::verdict(exchange) {
            return Err(GatewayError::rejected(status, "request blocked by firewall"));
        }
        next.run(exchange).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        core::model::{Condition, ConfigDump, Operator, ParamType, Rule, Selector},
        plugin::builtin::test_support::*,
    };

    fn dump(handle: serde_json::Value) -> ConfigDump {
        let mut selector = Selector::new("s1", NAME, 1);
        selector.conditions = vec![Condition::new(
            ParamType::Path,
            "",
            Operator::StartsWith,
            "/admin",
        )];
        let mut rule = Rule::new("r1", "s1", 1);
        rule.handle = Some(handle);
        with_plugins(
            ConfigDump {
                selectors: vec![selector],
                rules: vec![rule],
                ..Default::default()
            },
            &[NAME],
        )
    }

    #[tokio::test]
    async fn test_reject_with_configured_status() {
        let chain = chain_of(WafPlugin);
        let mut exchange = exchange(
            dump(json!({"permission": "reject", "statusCode": "451"})),
            get("/admin/users"),
        );
        let err = chain.execute(&mut exchange).await.unwrap_err();
        assert_eq!(err.status_code().as_u16(), 451);
    }

    #[tokio::test]
    async fn test_allow_and_unmatched_pass_through() {
        let chain = chain_of(WafPlugin);
        let mut allowed = exchange(dump(json!({"permission": "allow"})), get("/admin"));
        assert!(chain.execute(&mut allowed).await.is_ok());

        let mut unmatched = exchange(dump(json!({"permission": "reject"})), get("/public"));
        assert!(chain.execute(&mut unmatched).await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_handle_fails_closed() {
        let chain = chain_of(WafPlugin);
        let mut exchange = exchange(dump(json!({"permission": "maybe"})), get("/admin"));
        let err = chain.execute(&mut exchange).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }
}
