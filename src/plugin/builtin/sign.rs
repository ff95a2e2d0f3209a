use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use sha1::{Digest, Sha1};

use crate::{
    core::{model::PluginRole, request::RequestView},
    error::GatewayError,
    plugin::{Exchange, Next, Plugin, PluginResult},
};

pub const APP_KEY_HEADER: &str = "x-app-key";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGN_HEADER: &str = "x-sign";

/// Lower-hex SHA-1 of `app_key + timestamp + path + app_secret`.
pub fn compute_sign(app_key: &str, timestamp: &str, path: &str, app_secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(app_key.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(path.as_bytes());
    hasher.update(app_secret.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Verifies application signatures against cached credentials.
pub struct SignPlugin {
    max_skew: Duration,
}

impl SignPlugin {
    pub fn new(max_skew: Duration) -> Self {
        Self { max_skew }
    }

    fn verify(&self, exchange: &Exchange, now_millis: i64) -> Result<(), &'static str> {
        let request = exchange.view();
        let (Some(app_key), Some(timestamp), Some(sign)) = (
            request.header(APP_KEY_HEADER),
            request.header(TIMESTAMP_HEADER),
            request.header(SIGN_HEADER),
        ) else {
            return Err("missing signature headers");
        };

        let auth = exchange
            .snapshot()
            .app_auth(app_key)
            .filter(|auth| auth.enabled)
            .ok_or("unknown application key")?;

        let sent_at: i64 = timestamp.parse().map_err(|_| "malformed timestamp")?;
        let skew = now_millis.abs_diff(sent_at);
        if u128::from(skew) > self.max_skew.as_millis() {
            return Err("timestamp outside accepted window");
        }

        let expected = compute_sign(app_key, timestamp, request.path(), &auth.app_secret);
        if !expected.eq_ignore_ascii_case(sign) {
            return Err("signature mismatch");
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for SignPlugin {
    fn name(&self) -> &str {
        "sign"
    }

    fn role(&self) -> PluginRole {
        PluginRole::Before
    }

    fn order(&self) -> i32 {
        10
    }

    async fn execute(&self, exchange: &mut Exchange, next: Next<'_>) -> PluginResult {
        if let Err(reason) = self.verify(exchange, chrono::Utc::now().timestamp_millis()) {
            tracing::info!(reason, path = exchange.view().path(), "Signature check failed");
            return Err(GatewayError::rejected(StatusCode::UNAUTHORIZED, reason));
        }
        next.run(exchange).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        core::model::{AppAuth, ConfigDump},
        plugin::builtin::test_support::*,
    };

    fn dump() -> ConfigDump {
        with_plugins(
            ConfigDump {
                app_auths: vec![AppAuth {
                    app_key: "app".into(),
                    app_secret: "s3cret".into(),
                    enabled: true,
                }],
                ..Default::default()
            },
            &["sign"],
        )
    }

    fn signed(path: &str, timestamp: i64, sign: &str) -> http::Request<Bytes> {
        http::Request::builder()
            .uri(path)
            .header(APP_KEY_HEADER, "app")
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGN_HEADER, sign)
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn test_compute_sign_is_sha1_hex() {
        // sha1("") is a well-known constant
        assert_eq!(
            compute_sign("", "", "", ""),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert_eq!(compute_sign("a", "1", "/p", "s").len(), 40);
    }

    #[tokio::test]
    async fn test_valid_signature_passes() {
        let now = chrono::Utc::now().timestamp_millis();
        let sign = compute_sign("app", &now.to_string(), "/orders", "s3cret");
        let chain = chain_of(SignPlugin::new(Duration::from_secs(300)));
        let mut exchange = exchange(dump(), signed("/orders?x=1", now, &sign));
        assert!(chain.execute(&mut exchange).await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_signatures_are_rejected() {
        let now = chrono::Utc::now().timestamp_millis();
        let chain = chain_of(SignPlugin::new(Duration::from_secs(300)));

        let cases = [
            get("/orders"),
            signed("/orders", now, "deadbeef"),
            signed(
                "/orders",
                now - 3_600_000,
                &compute_sign("app", &(now - 3_600_000).to_string(), "/orders", "s3cret"),
            ),
        ];
        for req in cases {
            let mut exchange = exchange(dump(), req);
            let err = chain.execute(&mut exchange).await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_disabled_app_is_rejected() {
        let mut dump = dump();
        dump.app_auths[0].enabled = false;
        let now = chrono::Utc::now().timestamp_millis();
        let sign = compute_sign("app", &now.to_string(), "/", "s3cret");
        let chain = chain_of(SignPlugin::new(Duration::from_secs(300)));
        let mut exchange = exchange(dump, signed("/", now, &sign));
        assert!(chain.execute(&mut exchange).await.is_err());
    }
}
