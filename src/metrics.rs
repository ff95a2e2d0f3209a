//! Lightweight metrics helpers for Switchyard.
//!
//! Thin wrappers around the `metrics` crate macros. No exporter is embedded;
//! the embedding application installs whichever recorder it wants and these
//! calls become no-ops when none is installed.
//!
//! Provided metrics (labels vary by family):
//! * `switchyard_requests_total` (counter)
//! * `switchyard_request_duration_seconds` (histogram)
//! * `switchyard_plugin_executions_total` (counter, `plugin`, `outcome`)
//! * `switchyard_config_events_total` (counter, `kind`, `event_type`, `result`)
//! * `switchyard_config_version` (gauge)
//! * `switchyard_upstream_requests_total` (counter)
//! * `switchyard_upstream_request_duration_seconds` (histogram)
use std::time::{Duration, Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const SWITCHYARD_REQUESTS_TOTAL: &str = "switchyard_requests_total";
pub const SWITCHYARD_REQUEST_DURATION_SECONDS: &str = "switchyard_request_duration_seconds";
pub const SWITCHYARD_PLUGIN_EXECUTIONS_TOTAL: &str = "switchyard_plugin_executions_total";
pub const SWITCHYARD_CONFIG_EVENTS_TOTAL: &str = "switchyard_config_events_total";
pub const SWITCHYARD_CONFIG_VERSION: &str = "switchyard_config_version";
pub const SWITCHYARD_UPSTREAM_REQUESTS_TOTAL: &str = "switchyard_upstream_requests_total";
pub const SWITCHYARD_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "switchyard_upstream_request_duration_seconds";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        SWITCHYARD_PLUGIN_EXECUTIONS_TOTAL,
        Unit::Count,
        "Plugin invocations by plugin name and outcome."
    );
    describe_counter!(
        SWITCHYARD_CONFIG_EVENTS_TOTAL,
        Unit::Count,
        "Configuration change events by entity kind, event type and result."
    );
    describe_gauge!(
        SWITCHYARD_CONFIG_VERSION,
        "Version of the currently published configuration snapshot."
    );
    describe_counter!(
        SWITCHYARD_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests forwarded to upstream services."
    );
    describe_histogram!(
        SWITCHYARD_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests forwarded to upstream services."
    );
});

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(method: &str, status: u16) {
    counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(method: &str, duration: Duration) {
    histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Count one plugin invocation. `outcome` is `ok`, `skipped` or an error kind.
pub fn increment_plugin_execution(plugin: &str, outcome: &str) {
    counter!(
        SWITCHYARD_PLUGIN_EXECUTIONS_TOTAL,
        "plugin" => plugin.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Count one configuration change event.
pub fn increment_config_event(kind: &str, event_type: &str, result: &str) {
    counter!(
        SWITCHYARD_CONFIG_EVENTS_TOTAL,
        "kind" => kind.to_string(),
        "event_type" => event_type.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn set_config_version(version: u64) {
    gauge!(SWITCHYARD_CONFIG_VERSION).set(version as f64);
}

/// Increment total count of forwarded upstream requests.
pub fn increment_upstream_request_total(upstream: &str, method: &str, status: u16) {
    counter!(
        SWITCHYARD_UPSTREAM_REQUESTS_TOTAL,
        "upstream" => upstream.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed upstream request duration.
pub fn record_upstream_request_duration(upstream: &str, duration: Duration) {
    histogram!(
        SWITCHYARD_UPSTREAM_REQUEST_DURATION_SECONDS,
        "upstream" => upstream.to_string()
    )
    .record(duration.as_secs_f64());
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    method: String,
}

impl RequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.method, self.start.elapsed());
    }
}

/// Register metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&DESCRIBED);
    tracing::debug!("Switchyard metric descriptions registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timer() {
        let timer = RequestTimer::new("GET");
        // Timer will record duration when dropped
        drop(timer);
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_without_recorder() {
        increment_plugin_execution("divide", "ok");
        increment_config_event("selector", "upsert", "applied");
        set_config_version(3);
    }
}
