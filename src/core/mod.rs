//! Pure routing logic: data model, condition matching, evaluation and the
//! configuration cache. Nothing in here performs I/O.
pub mod cache;
pub mod condition;
pub mod evaluator;
pub mod handle;
pub mod load_balancer;
pub mod model;
pub mod rate_limiter;
pub mod request;

pub use cache::{CacheDelta, CacheSnapshot, ConfigCache, PluginView};
pub use condition::ConditionMatcher;
pub use evaluator::{RouteMatch, RouteMatcher, RuleEvaluator, SelectorEvaluator};
pub use load_balancer::LoadBalancerFactory;
pub use rate_limiter::RateLimiterRegistry;
pub use request::{HttpRequestView, RequestView};
