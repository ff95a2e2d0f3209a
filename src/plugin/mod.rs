//! Request-handling plugins and the chain that runs them.
pub mod builtin;
pub mod chain;
pub mod exchange;

use async_trait::async_trait;
use axum::response::Response;

pub use chain::{ChainBuildError, Next, PluginChain, PluginChainBuilder};
pub use exchange::{Exchange, RewrittenPath, UpstreamTarget};

use crate::{core::model::PluginRole, error::GatewayError};

pub type PluginResult = Result<Response, GatewayError>;

/// A named unit of request handling.
///
/// `execute` either produces the response itself (short-circuiting the chain)
/// or calls `next.run(exchange)` to hand over to the next eligible plugin.
/// Plugins that route on selectors and rules look them up in the exchange's
/// snapshot under their own name.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn role(&self) -> PluginRole;

    /// Position within the role's tier; lower runs first.
    fn order(&self) -> i32;

    /// Opt out for this request without being invoked.
    fn skip(&self, _exchange: &Exchange) -> bool {
        false
    }

    async fn execute(&self, exchange: &mut Exchange, next: Next<'_>) -> PluginResult;
}
