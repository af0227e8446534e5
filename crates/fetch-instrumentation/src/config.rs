//! Instrumentation configuration and URL matchers.

use std::fmt;

use regex::Regex;
use serde::Deserialize;

use crate::error::InstrumentationError;
use crate::hooks::{RequestHook, ResponseHook};

/// Configuration of a [`crate::FetchInstrumentation`]. Every field is optional.
#[derive(Clone, Deserialize)]
pub struct InstrumentationConfig {
    /// URLs that are never instrumented: no span, no header injection.
    #[serde(default)]
    pub ignore_urls: Vec<UrlPattern>,

    /// Cross-origin URLs that still receive propagation headers.
    #[serde(default)]
    pub propagate_trace_header_cors_urls: Vec<UrlPattern>,

    /// Clear the timing buffer and the consumed-sample set whenever no
    /// request is in flight.
    #[serde(default)]
    pub clear_timing_resources: bool,

    /// Skip phase events and CORS preflight child spans.
    #[serde(default)]
    pub ignore_network_events: bool,

    /// Origin the caller runs on (e.g. "http://localhost:8080"). Relative
    /// URLs resolve against it. When absent every URL is cross-origin.
    #[serde(default)]
    pub origin: Option<String>,

    /// Instrumentation scope name passed to the global tracer provider.
    #[serde(default = "default_tracer_name")]
    pub tracer_name: String,

    /// Runs after the span is created, before the request is sent.
    #[serde(skip)]
    pub apply_custom_attributes_on_req: Option<RequestHook>,

    /// Runs once the response body copy is drained, or right after a failure.
    #[serde(skip)]
    pub apply_custom_attributes_on_res: Option<ResponseHook>,
}

fn default_tracer_name() -> String {
    "fetch-instrumentation".to_string()
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            ignore_urls: Vec::new(),
            propagate_trace_header_cors_urls: Vec::new(),
            clear_timing_resources: false,
            ignore_network_events: false,
            origin: None,
            tracer_name: default_tracer_name(),
            apply_custom_attributes_on_req: None,
            apply_custom_attributes_on_res: None,
        }
    }
}

impl fmt::Debug for InstrumentationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentationConfig")
            .field("ignore_urls", &self.ignore_urls)
            .field(
                "propagate_trace_header_cors_urls",
                &self.propagate_trace_header_cors_urls,
            )
            .field("clear_timing_resources", &self.clear_timing_resources)
            .field("ignore_network_events", &self.ignore_network_events)
            .field("origin", &self.origin)
            .field("tracer_name", &self.tracer_name)
            .field(
                "apply_custom_attributes_on_req",
                &self.apply_custom_attributes_on_req.is_some(),
            )
            .field(
                "apply_custom_attributes_on_res",
                &self.apply_custom_attributes_on_res.is_some(),
            )
            .finish()
    }
}

/// A URL matcher as written in configuration: either a literal URL
/// (`"https://api.test/health"`) or a regex table (`{ pattern = "^https://" }`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum UrlPattern {
    Literal(String),
    Regex { pattern: String },
}

impl UrlPattern {
    pub fn literal(url: impl Into<String>) -> Self {
        UrlPattern::Literal(url.into())
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        UrlPattern::Regex {
            pattern: pattern.into(),
        }
    }
}

/// Compiled form of a [`UrlPattern`].
#[derive(Debug, Clone)]
pub enum UrlMatcher {
    Literal(String),
    Regex(Regex),
}

impl UrlMatcher {
    pub fn compile(pattern: &UrlPattern) -> Result<Self, InstrumentationError> {
        match pattern {
            UrlPattern::Literal(url) => Ok(UrlMatcher::Literal(url.clone())),
            UrlPattern::Regex { pattern } => Regex::new(pattern)
                .map(UrlMatcher::Regex)
                .map_err(|source| InstrumentationError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                }),
        }
    }

    pub fn compile_all(patterns: &[UrlPattern]) -> Result<Vec<Self>, InstrumentationError> {
        patterns.iter().map(Self::compile).collect()
    }

    /// Literals match the whole URL exactly; regexes match anywhere in it.
    pub fn matches(&self, url: &str) -> bool {
        match self {
            UrlMatcher::Literal(literal) => literal == url,
            UrlMatcher::Regex(regex) => regex.is_match(url),
        }
    }
}

/// Whether any matcher accepts `url`.
pub fn url_matches_any(url: &str, matchers: &[UrlMatcher]) -> bool {
    matchers.iter().any(|m| m.matches(url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_mixed_patterns() {
        let config: InstrumentationConfig = serde_json::from_str(
            r#"{
                "ignore_urls": ["http://localhost:4318/v1/traces", {"pattern": "/health$"}],
                "propagate_trace_header_cors_urls": [{"pattern": "^https://api\\.test/"}],
                "ignore_network_events": true
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.ignore_urls,
            vec![
                UrlPattern::literal("http://localhost:4318/v1/traces"),
                UrlPattern::regex("/health$"),
            ]
        );
        assert_eq!(config.propagate_trace_header_cors_urls.len(), 1);
        assert!(config.ignore_network_events);
        assert!(!config.clear_timing_resources);
        assert_eq!(config.tracer_name, "fetch-instrumentation");
        assert!(config.apply_custom_attributes_on_req.is_none());
    }

    #[test]
    fn test_literal_matches_exactly() {
        let matcher = UrlMatcher::compile(&UrlPattern::literal("https://api.test/a")).unwrap();
        assert!(matcher.matches("https://api.test/a"));
        assert!(!matcher.matches("https://api.test/a?b=1"));
    }

    #[test]
    fn test_regex_matches_anywhere() {
        let matchers = UrlMatcher::compile_all(&[UrlPattern::regex("/health$")]).unwrap();
        assert!(url_matches_any("http://svc.local/health", &matchers));
        assert!(!url_matches_any("http://svc.local/health/deep", &matchers));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let err = UrlMatcher::compile(&UrlPattern::regex("(unclosed")).unwrap_err();
        assert!(matches!(err, InstrumentationError::InvalidPattern { .. }));
    }
}
