//! Metrics collection. Adapted from the teacher's `metrics/mod.rs`: same
//! `metrics` + `metrics-exporter-prometheus` stack and feature gate, with the
//! OpenTelemetry fanout path dropped (no otel feature in this crate) and the
//! tool/MCP/plugin series replaced by OIDC endpoint series.

use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
static PROM_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Installs the global metrics recorder when the `prometheus` feature is
/// enabled. No-op otherwise.
pub fn init() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        use std::time::Duration;
        use tracing::debug;

        debug!("prometheus metrics endpoint is enabled");
        if let Ok(handle) = PrometheusBuilder::new().install_recorder() {
            let _ = PROM_HANDLE.set(handle.clone());
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(30));
                loop {
                    tick.tick().await;
                    handle.run_upkeep();
                }
            });
        }
    }
}

/// Renders the current Prometheus text exposition, if metrics are enabled.
pub fn render() -> Option<String> {
    #[cfg(feature = "prometheus")]
    {
        PROM_HANDLE.get().map(|h| h.render())
    }
    #[cfg(not(feature = "prometheus"))]
    {
        None
    }
}

/// Records one HTTP request against an OIDC endpoint.
pub fn record_http(endpoint: &str, method: &str, status: u16, latency_ms: f64) {
    #[cfg(feature = "prometheus")]
    {
        use metrics::{counter, histogram};
        let status_s = status.to_string();
        counter!(
            "idpd_http_requests_total",
            "endpoint" => endpoint.to_string(),
            "method" => method.to_string(),
            "status" => status_s.clone()
        )
        .increment(1);
        histogram!(
            "idpd_http_latency_ms",
            "endpoint" => endpoint.to_string(),
            "method" => method.to_string(),
            "status" => status_s
        )
        .record(latency_ms);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (endpoint, method, status, latency_ms);
    }
}

/// Records one authorization-code/refresh-token minting event.
pub fn record_token_issued(grant_type: &str) {
    #[cfg(feature = "prometheus")]
    {
        use metrics::counter;
        counter!("idpd_tokens_issued_total", "grant_type" => grant_type.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = grant_type;
    }
}
