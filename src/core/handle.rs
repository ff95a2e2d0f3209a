//! Plugin-specific payloads carried in `handle` fields.
//!
//! Handles are stored untyped on selectors and rules and decoded lazily by the
//! plugin that owns them. A handle may be a JSON value or a string containing
//! JSON; both forms decode to the same type. Decoding never panics and never
//! produces a partially-filled value: either the whole handle decodes or the
//! caller gets a [`HandleError`].
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("handle is missing")]
    Missing,
    #[error("handle does not decode as {target}: {source}")]
    Invalid {
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a handle into the type its plugin expects.
pub fn decode_handle<T: DeserializeOwned>(handle: Option<&Value>) -> Result<T, HandleError> {
    let target = std::any::type_name::<T>()
        .rsplit("::")
        .next()
        .unwrap_or("handle");
    let invalid = |source: serde_json::Error| HandleError::Invalid { target, source };
    match handle {
        None | Some(Value::Null) => Err(HandleError::Missing),
        Some(Value::String(raw)) if raw.trim().is_empty() => Err(HandleError::Missing),
        Some(Value::String(raw)) => serde_json::from_str(raw).map_err(invalid),
        Some(value) => T::deserialize(value).map_err(invalid),
    }
}

fn default_weight() -> u32 {
    50
}

fn default_timeout_ms() -> u64 {
    3000
}

/// One upstream of a divide handle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivideUpstream {
    #[serde(default, alias = "upstreamHost")]
    pub host: String,
    /// Base URL of the upstream, e.g. `http://10.0.0.5:8080`.
    #[serde(alias = "upstreamUrl")]
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalance {
    #[default]
    #[serde(alias = "roundRobin", alias = "round_robin", alias = "roundrobin")]
    RoundRobin,
    #[serde(alias = "random")]
    Random,
    /// Consistent choice per client IP.
    #[serde(alias = "hash", alias = "ip_hash")]
    Hash,
}

/// Upstream selection for the divide plugin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivideHandle {
    #[serde(default)]
    pub upstreams: Vec<DivideUpstream>,
    #[serde(default, rename = "loadBalance")]
    pub load_balance: LoadBalance,
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
}

impl Default for DivideHandle {
    fn default() -> Self {
        Self {
            upstreams: Vec::new(),
            load_balance: LoadBalance::default(),
            timeout_ms: default_timeout_ms(),
            retries: 0,
        }
    }
}

impl DivideHandle {
    /// Rule handle with upstreams falling back to the selector handle, which
    /// may carry the upstream list as a bare array.
    pub fn resolve(
        rule_handle: Option<&Value>,
        selector_handle: Option<&Value>,
    ) -> Result<Self, HandleError> {
        let mut handle: DivideHandle = match decode_handle(rule_handle) {
            Ok(handle) => handle,
            Err(HandleError::Missing) if selector_handle.is_some() => DivideHandle::default(),
            Err(e) => return Err(e),
        };
        if handle.upstreams.is_empty() && selector_handle.is_some() {
            handle.upstreams = match decode_handle::<Vec<DivideUpstream>>(selector_handle) {
                Ok(list) => list,
                Err(_) => decode_handle::<DivideHandle>(selector_handle)?.upstreams,
            };
        }
        Ok(handle)
    }
}

/// Token bucket parameters for the rate limiter plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterHandle {
    pub burst_capacity: u32,
    pub replenish_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WafPermission {
    #[serde(alias = "ALLOW")]
    Allow,
    #[serde(alias = "REJECT")]
    Reject,
}

fn status_code<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u16),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Num(code)) => Ok(Some(code)),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WafHandle {
    pub permission: WafPermission,
    #[serde(default, deserialize_with = "status_code")]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewriteHandle {
    #[serde(rename = "targetURI", alias = "rewriteURI", alias = "targetUri")]
    pub target_uri: String,
}

/// Per-rule call settings for RPC-style upstreams.
///
/// Only the contract is defined here; no plugin in this crate forwards RPC calls.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHandle {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, rename = "loadBalance")]
    pub load_balance: LoadBalance,
}

/// Selector-level RPC settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcSelectorHandle {
    pub app_name: String,
    #[serde(default)]
    pub registry: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_divide_handle_from_string_and_object() {
        let raw = json!(r#"{"upstreams":[{"url":"http://a:1","weight":10}],"loadBalance":"RANDOM","timeout":500}"#);
        let from_string: DivideHandle = decode_handle(Some(&raw)).unwrap();
        let object = json!({"upstreams":[{"url":"http://a:1","weight":10}],"loadBalance":"random","timeoutMs":500});
        let from_object: DivideHandle = decode_handle(Some(&object)).unwrap();
        assert_eq!(from_string, from_object);
        assert_eq!(from_string.load_balance, LoadBalance::Random);
        assert_eq!(from_string.timeout_ms, 500);
    }

    #[test]
    fn test_defaults_apply() {
        let handle: DivideHandle = decode_handle(Some(&json!({}))).unwrap();
        assert!(handle.upstreams.is_empty());
        assert_eq!(handle.load_balance, LoadBalance::RoundRobin);
        assert_eq!(handle.timeout_ms, 3000);
        let upstream: DivideUpstream = decode_handle(Some(&json!({"url": "http://x"}))).unwrap();
        assert_eq!(upstream.weight, 50);
    }

    #[test]
    fn test_missing_and_invalid() {
        assert!(matches!(
            decode_handle::<RateLimiterHandle>(None),
            Err(HandleError::Missing)
        ));
        assert!(matches!(
            decode_handle::<RateLimiterHandle>(Some(&json!(""))),
            Err(HandleError::Missing)
        ));
        let err = decode_handle::<RateLimiterHandle>(Some(&json!({"burstCapacity": "many"})))
            .unwrap_err();
        assert!(err.to_string().contains("RateLimiterHandle"));
    }

    #[test]
    fn test_wrong_shape_fails_closed() {
        // A waf handle is not a rate limiter handle
        let waf = json!({"permission": "reject", "statusCode": "403"});
        assert!(decode_handle::<RateLimiterHandle>(Some(&waf)).is_err());
        let decoded: WafHandle = decode_handle(Some(&waf)).unwrap();
        assert_eq!(decoded.permission, WafPermission::Reject);
        assert_eq!(decoded.status_code, Some(403));
    }

    #[test]
    fn test_selector_upstream_fallback() {
        let rule = json!({"loadBalance": "hash"});
        let selector = json!(r#"[{"host":"h1","url":"http://h1:80","weight":90}]"#);
        let handle = DivideHandle::resolve(Some(&rule), Some(&selector)).unwrap();
        assert_eq!(handle.load_balance, LoadBalance::Hash);
        assert_eq!(handle.upstreams.len(), 1);
        assert_eq!(handle.upstreams[0].weight, 90);
    }

    #[test]
    fn test_rewrite_and_rpc_handles() {
        let rewrite: RewriteHandle = decode_handle(Some(&json!({"rewriteURI": "/v2"}))).unwrap();
        assert_eq!(rewrite.target_uri, "/v2");
        let rpc: RpcHandle = decode_handle(Some(&json!({"group": "g", "retries": 2}))).unwrap();
        assert_eq!(rpc.retries, 2);
        assert_eq!(rpc.timeout_ms, 3000);
        let sel: RpcSelectorHandle =
            decode_handle(Some(&json!({"appName": "orders", "registry": "zk://r"}))).unwrap();
        assert_eq!(sel.app_name, "orders");
    }
}
