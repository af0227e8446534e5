//! Tracing configuration types.

use serde::Deserialize;

/// Configuration for the OpenTelemetry tracing subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    /// The service name reported to the OTLP collector.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OTLP collector endpoint (e.g. "http://localhost:4317").
    /// When `None`, spans are still created and propagated but never exported.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Transport protocol for OTLP export.
    #[serde(default)]
    pub protocol: OtlpProtocol,

    /// Log level filter (e.g. "info", "fetch_instrumentation=debug,info").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Install the W3C trace-context propagator as the global propagator.
    /// Without it no propagation headers are injected into outgoing requests.
    #[serde(default = "default_true")]
    pub propagate_trace_context: bool,
}

/// OTLP transport protocol.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

fn default_service_name() -> String {
    "fetch-probe".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
            protocol: OtlpProtocol::default(),
            log_level: default_log_level(),
            propagate_trace_context: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_table() {
        let config: TracingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.service_name, "fetch-probe");
        assert_eq!(config.otlp_endpoint, None);
        assert_eq!(config.protocol, OtlpProtocol::Grpc);
        assert_eq!(config.log_level, "info");
        assert!(config.propagate_trace_context);
    }

    #[test]
    fn test_protocol_is_lowercase() {
        let config: TracingConfig =
            serde_json::from_str(r#"{"protocol": "http", "otlp_endpoint": "http://c:4318"}"#)
                .unwrap();
        assert_eq!(config.protocol, OtlpProtocol::Http);
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://c:4318"));
    }
}
