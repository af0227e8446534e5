//! Span lifecycle: creation, settle-time attributes, and error recording.
//!
//! One CLIENT span per request attempt. Attributes are written while the span
//! is open; the end timestamp is captured at settle but only applied by the
//! finalize task once correlation has run (see [`crate::correlation`]).

use std::error::Error as StdError;
use std::time::SystemTime;

use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode};
use opentelemetry::global::{self, BoxedSpan};
use opentelemetry::trace::{Span, SpanKind, Status, Tracer};
use opentelemetry::{Context, KeyValue};
use url::Url;

use crate::attributes::*;
use crate::fetch::FetchResponse;

/// Minimal descriptor of a settled response: what survives when the live
/// response must not be touched.
#[derive(Debug, Clone)]
pub struct ResponseSummary {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub url: String,
}

impl ResponseSummary {
    pub fn from_response(response: &FetchResponse) -> Self {
        Self {
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            url: response.url.clone(),
        }
    }

    /// Statuses in `[200, 400)` get their body drained before finalizing.
    pub fn is_success_range(&self) -> bool {
        (200..400).contains(&self.status.as_u16())
    }
}

/// Span name for a request method: upper-cased, `GET` when empty.
pub fn span_name(method: &Method) -> String {
    let name = method.as_str().to_uppercase();
    if name.is_empty() {
        "GET".to_string()
    } else {
        name
    }
}

/// `host:port` with the scheme default (443 for secure schemes, 80
/// otherwise) when the URL has no explicit port.
pub fn host_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url.port().unwrap_or(match url.scheme() {
        "https" | "wss" => 443,
        _ => 80,
    });
    format!("{host}:{port}")
}

/// Path plus query, as sent on the request line.
pub fn target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

/// Start the CLIENT span for a request under `parent`.
pub fn start_span(
    tracer_name: &str,
    url: &Url,
    method: &Method,
    start_time: SystemTime,
    parent: &Context,
) -> BoxedSpan {
    let name = span_name(method);
    let tracer = global::tracer(tracer_name.to_string());
    let attributes = vec![
        KeyValue::new(HTTP_METHOD, name.clone()),
        KeyValue::new(HTTP_URL, url.to_string()),
        KeyValue::new(HTTP_TARGET, target(url)),
        KeyValue::new(NET_PEER_NAME, url.host_str().unwrap_or_default().to_string()),
        KeyValue::new(HTTP_HOST, host_port(url)),
    ];

    tracer
        .span_builder(name)
        .with_kind(SpanKind::Client)
        .with_start_time(start_time)
        .with_attributes(attributes)
        .start_with_context(&tracer, parent)
}

/// Record status attributes, plus the content length when the header has it.
///
/// Returns whether a content-length attribute was written, so the caller can
/// fall back to the drained byte count.
pub fn record_response(span: &mut BoxedSpan, response: &ResponseSummary) -> bool {
    span.set_attribute(KeyValue::new(
        HTTP_STATUS_CODE,
        i64::from(response.status.as_u16()),
    ));
    span.set_attribute(KeyValue::new(HTTP_STATUS_TEXT, response.status_text.clone()));

    match header_content_length(&response.headers) {
        Some(length) => {
            record_content_length(span, &response.headers, length);
            true
        }
        None => false,
    }
}

/// Write exactly one of the compressed/uncompressed length attributes.
pub fn record_content_length(span: &mut BoxedSpan, headers: &HeaderMap, length: u64) {
    let key = if is_compressed(headers) {
        HTTP_RESPONSE_CONTENT_LENGTH
    } else {
        HTTP_RESPONSE_CONTENT_LENGTH_UNCOMPRESSED
    };
    span.set_attribute(KeyValue::new(key, length as i64));
}

fn header_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Whether the body travels with a non-identity `content-encoding`.
pub fn is_compressed(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .is_some_and(|encoding| !encoding.is_empty() && !encoding.eq_ignore_ascii_case("identity"))
}

/// Record a failure: error attributes, ERROR status, one exception event.
pub fn record_error(span: &mut BoxedSpan, name: &str, message: &str, stacktrace: &str) {
    span.set_attribute(KeyValue::new(HTTP_ERROR_NAME, name.to_string()));
    span.set_attribute(KeyValue::new(HTTP_ERROR_MESSAGE, message.to_string()));
    span.set_status(Status::error(message.to_string()));
    span.add_event(
        EXCEPTION_EVENT,
        vec![
            KeyValue::new(EXCEPTION_MESSAGE, message.to_string()),
            KeyValue::new(EXCEPTION_TYPE, name.to_string()),
            KeyValue::new(EXCEPTION_STACKTRACE, stacktrace.to_string()),
        ],
    );
}

/// [`record_error`] for any error type, using its source chain as the trace.
pub fn record_exception(span: &mut BoxedSpan, name: &str, error: &(dyn StdError + 'static)) {
    let stacktrace = crate::error::error_chain(error);
    record_error(span, name, &error.to_string(), &stacktrace);
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    #[test]
    fn test_span_name_is_uppercase() {
        assert_eq!(span_name(&Method::GET), "GET");
        assert_eq!(span_name(&Method::from_bytes(b"patch").unwrap()), "PATCH");
    }

    #[test]
    fn test_host_port_defaults() {
        let cases = [
            ("https://api.test/a", "api.test:443"),
            ("http://api.test/a", "api.test:80"),
            ("http://localhost:8080/a", "localhost:8080"),
            ("https://api.test:8443", "api.test:8443"),
        ];
        for (url, expected) in cases {
            assert_eq!(host_port(&Url::parse(url).unwrap()), expected, "{url}");
        }
    }

    #[test]
    fn test_target_keeps_query() {
        let url = Url::parse("https://api.test/v1/items?page=2").unwrap();
        assert_eq!(target(&url), "/v1/items?page=2");
        assert_eq!(target(&Url::parse("https://api.test").unwrap()), "/");
    }

    #[test]
    fn test_compression_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_compressed(&headers));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        assert!(!is_compressed(&headers));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(is_compressed(&headers));
    }

    #[test]
    fn test_success_range() {
        let summary = |status| ResponseSummary {
            status,
            status_text: String::new(),
            headers: HeaderMap::new(),
            url: String::new(),
        };
        assert!(summary(StatusCode::OK).is_success_range());
        assert!(summary(StatusCode::PERMANENT_REDIRECT).is_success_range());
        assert!(!summary(StatusCode::NOT_FOUND).is_success_range());
        assert!(!summary(StatusCode::CONTINUE).is_success_range());
    }
}
