use async_trait::async_trait;
use http::HeaderValue;

use crate::{
    core::model::PluginRole,
    plugin::{Exchange, Next, Plugin, PluginResult},
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Propagates the request id to the upstream and back to the caller.
pub struct GlobalPlugin;

#[async_trait]
impl Plugin for GlobalPlugin {
    fn name(&self) -> &str {
        "global"
    }

    fn role(&self) -> PluginRole {
        PluginRole::Before
    }

    fn order(&self) -> i32 {
        0
    }

    async fn execute(&self, exchange: &mut Exchange, next: Next<'_>) -> PluginResult {
        match HeaderValue::from_str(exchange.request_id()) {
            Ok(value) => {
                exchange
                    .forward_headers_mut()
                    .insert(REQUEST_ID_HEADER, value.clone());
                exchange
                    .response_headers_mut()
                    .insert(REQUEST_ID_HEADER, value);
            }
            Err(_) => tracing::debug!("Request id is not a valid header value; not propagated"),
        }
        next.run(exchange).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::model::ConfigDump, plugin::builtin::test_support::*};

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let chain = chain_of(GlobalPlugin);
        let dump = with_plugins(ConfigDump::default(), &["global"]);
        let mut exchange = exchange(dump, get("/"));

        let response = chain.execute(&mut exchange).await.unwrap();
        assert_eq!(body_text(response).await, "terminal");
        assert_eq!(
            exchange.forward_headers().get(REQUEST_ID_HEADER).unwrap(),
            "test-request"
        );
        assert_eq!(
            exchange.response_headers().get(REQUEST_ID_HEADER).unwrap(),
            "test-request"
        );
    }
}
