use async_trait::async_trait;

use crate::{
    core::{
        evaluator::RouteMatcher,
        handle::{RewriteHandle, decode_handle},
        model::PluginRole,
    },
    plugin::{Exchange, Next, Plugin, PluginResult, RewrittenPath},
};

const NAME: &str = "rewrite";

/// Replaces the forwarded path with the matched rule's target.
pub struct RewritePlugin;

#[async_trait]
impl Plugin for RewritePlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn role(&self) -> PluginRole {
        PluginRole::Function
    }

    fn order(&self) -> i32 {
        40
    }

    async fn execute(&self, exchange: &mut Exchange, next: Next<'_>) -> PluginResult {
        let target = RouteMatcher::first(exchange.snapshot(), NAME, exchange.view()).and_then(
            |matched| match decode_handle::<RewriteHandle>(matched.rule.handle.as_ref()) {
                Ok(handle) => Some(handle.target_uri),
                Err(e) => {
                    // Forward unmodified
                    tracing::warn!(rule.id = %matched.rule.id, error = %e, "Unusable rewrite handle; path kept");
                    None
                }
            },
        );
        if let Some(target) = target {
            let target = if target.starts_with('/') {
                target
            } else {
                format!("/{target}")
            };
            tracing::debug!(to = %target, "Path rewritten");
            exchange.insert(RewrittenPath(target));
        }
        next.run(exchange).await
    }
}
