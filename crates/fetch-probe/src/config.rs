//! Configuration types and loading logic.

use fetch_instrumentation::InstrumentationConfig;
use fetch_tracing::TracingConfig;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

/// Top-level probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub instrumentation: InstrumentationConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// What to request and how.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSettings {
    /// Absolute URLs, or paths relative to `instrumentation.origin`.
    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            method: default_method(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl ProbeConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (FETCH_PROBE_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let config = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("FETCH_PROBE_").split("__"))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetch_instrumentation::UrlPattern;

    fn from_toml(toml: &str) -> ProbeConfig {
        Figment::new().merge(Toml::string(toml)).extract().unwrap()
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = from_toml("");
        assert!(config.probe.targets.is_empty());
        assert_eq!(config.probe.method, "GET");
        assert_eq!(config.probe.timeout_secs, 30);
        assert_eq!(config.instrumentation.tracer_name, "fetch-instrumentation");
        assert_eq!(config.tracing.service_name, "fetch-probe");
    }

    #[test]
    fn test_full_file() {
        let config = from_toml(
            r#"
            [probe]
            targets = ["/api/health", "https://partner.test/v1/items"]
            method = "post"

            [instrumentation]
            origin = "http://localhost:8080"
            ignore_network_events = true
            ignore_urls = ["http://localhost:8080/metrics", { pattern = "/health$" }]
            propagate_trace_header_cors_urls = [{ pattern = "^https://partner\\.test/" }]

            [tracing]
            otlp_endpoint = "http://localhost:4317"
            "#,
        );
        assert_eq!(config.probe.targets.len(), 2);
        assert_eq!(config.probe.method, "post");
        assert_eq!(
            config.instrumentation.origin.as_deref(),
            Some("http://localhost:8080")
        );
        assert!(config.instrumentation.ignore_network_events);
        assert_eq!(
            config.instrumentation.ignore_urls,
            vec![
                UrlPattern::literal("http://localhost:8080/metrics"),
                UrlPattern::regex("/health$"),
            ]
        );
        assert_eq!(
            config.instrumentation.propagate_trace_header_cors_urls,
            vec![UrlPattern::regex(r"^https://partner\.test/")]
        );
        assert_eq!(
            config.tracing.otlp_endpoint.as_deref(),
            Some("http://localhost:4317")
        );
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let config = ProbeConfig::load("/nonexistent/fetch-probe.toml").unwrap();
        assert_eq!(config.probe.method, "GET");
    }
}
