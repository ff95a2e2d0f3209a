//! Plugins shipped with the gateway.
//!
//! | name           | role     | order |
//! |----------------|----------|-------|
//! | `global`       | BEFORE   | 0     |
//! | `sign`         | BEFORE   | 10    |
//! | `waf`          | BEFORE   | 20    |
//! | `rate_limiter` | BEFORE   | 30    |
//! | `rewrite`      | FUNCTION | 40    |
//! | `divide`       | FUNCTION | 50    |
//! | `forward`      | LAST     | 100   |
pub mod divide;
pub mod forward;
pub mod global;
pub mod rate_limiter;
pub mod rewrite;
pub mod sign;
pub mod waf;

use std::sync::Arc;

pub use divide::DividePlugin;
pub use forward::ForwardPlugin;
pub use global::GlobalPlugin;
pub use rate_limiter::RateLimiterPlugin;
pub use rewrite::RewritePlugin;
pub use sign::SignPlugin;
pub use waf::WafPlugin;

use crate::{
    config::models::GatewayConfig,
    plugin::{ChainBuildError, PluginChain},
    ports::http_client::HttpClient,
};

/// The default chain with every built-in plugin registered.
pub fn default_chain(
    config: &GatewayConfig,
    http_client: Arc<dyn HttpClient>,
) -> Result<PluginChain, ChainBuildError> {
    PluginChain::builder()
        .register(GlobalPlugin)
        .register(SignPlugin::new(config.plugins.sign.max_skew()))
        .register(WafPlugin)
        .register(RateLimiterPlugin::new())
        .register(RewritePlugin)
        .register(DividePlugin::new())
        .register(ForwardPlugin::new(http_client))
        .order_overrides(config.plugins.order.clone())
        .build()
}
