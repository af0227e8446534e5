//! Trace header injection gated by origin and a CORS allow-list.
//!
//! Same-origin requests and cross-origin requests matching the allow-list get
//! the global propagator's headers. Anything else goes out untouched so trace
//! identifiers never cross a trust boundary by accident.

use http::HeaderMap;
use opentelemetry::Context;
use opentelemetry_http::HeaderInjector;
use url::{Origin, Url};

use crate::config::{url_matches_any, UrlMatcher};
use crate::fetch::{HeadersInit, RequestInput, RequestInit};

/// Outcome of the injection policy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderInjectionDecision {
    SameOrigin,
    AllowListed,
    Blocked,
}

impl HeaderInjectionDecision {
    pub fn should_inject(self) -> bool {
        !matches!(self, HeaderInjectionDecision::Blocked)
    }
}

#[derive(Debug, Clone)]
pub struct HeaderInjectionPolicy {
    origin: Option<Origin>,
    allow_list: Vec<UrlMatcher>,
}

impl HeaderInjectionPolicy {
    pub fn new(origin: Option<&Url>, allow_list: Vec<UrlMatcher>) -> Self {
        Self {
            origin: origin.map(Url::origin),
            allow_list,
        }
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        self.origin.as_ref().is_some_and(|origin| *origin == url.origin())
    }

    pub fn decide(&self, url: &Url) -> HeaderInjectionDecision {
        if self.is_same_origin(url) {
            HeaderInjectionDecision::SameOrigin
        } else if url_matches_any(url.as_str(), &self.allow_list) {
            HeaderInjectionDecision::AllowListed
        } else {
            HeaderInjectionDecision::Blocked
        }
    }

    /// Inject `cx` into the outgoing headers when the policy allows it.
    pub fn apply(
        &self,
        cx: &Context,
        url: &Url,
        input: &mut RequestInput,
        init: &mut Option<RequestInit>,
    ) -> HeaderInjectionDecision {
        let decision = self.decide(url);
        let headers = propagation_headers(cx);
        if !decision.should_inject() {
            if !headers.is_empty() {
                tracing::debug!(url = %url, "Trace header injection skipped due to CORS policy");
            }
            return decision;
        }
        merge_propagation_headers(input, init, &headers);
        decision
    }
}

/// Headers the global text-map propagator produces for `cx`.
///
/// Empty values are dropped: the W3C propagator writes `tracestate` even when
/// the trace state is empty.
pub fn propagation_headers(cx: &Context) -> HeaderMap {
    let mut headers = HeaderMap::new();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderInjector(&mut headers));
    });
    headers
        .into_iter()
        .filter_map(|(name, value)| Some((name?, value)))
        .filter(|(_, value)| !value.is_empty())
        .collect()
}

/// Merge `injected` into whichever header representation the call uses,
/// keeping every value the caller already set.
///
/// Init headers win over a descriptor's own headers, so they are the ones
/// extended when present.
pub fn merge_propagation_headers(
    input: &mut RequestInput,
    init: &mut Option<RequestInit>,
    injected: &HeaderMap,
) {
    if injected.is_empty() {
        return;
    }

    if let Some(headers) = init.as_mut().and_then(|i| i.headers.as_mut()) {
        match headers {
            HeadersInit::Map(map) => merge_into_map(map, injected),
            HeadersInit::Pairs(pairs) => {
                for (name, value) in injected {
                    let present = pairs.iter().any(|(k, _)| k.eq_ignore_ascii_case(name.as_str()));
                    if present {
                        continue;
                    }
                    if let Ok(value) = value.to_str() {
                        pairs.push((name.as_str().to_string(), value.to_string()));
                    }
                }
            }
        }
        return;
    }

    match input {
        RequestInput::Request(request) => merge_into_map(&mut request.headers, injected),
        RequestInput::Url(_) => {
            init.get_or_insert_with(RequestInit::default).headers =
                Some(HeadersInit::Map(injected.clone()));
        }
    }
}

fn merge_into_map(target: &mut HeaderMap, injected: &HeaderMap) {
    for (name, value) in injected {
        if !target.contains_key(name) {
            target.insert(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UrlPattern;
    use crate::fetch::FetchRequest;
    use http::header::{HeaderName, HeaderValue};
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    const CALLER_TRACEPARENT: &str = "00-0000000000000000000000000000000a-000000000000000b-01";

    fn active_context() -> Context {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        let span_context = SpanContext::new(
            TraceId::from_bytes([7; 16]),
            SpanId::from_bytes([9; 8]),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );
        Context::new().with_remote_span_context(span_context)
    }

    fn policy(allow: Vec<UrlPattern>) -> HeaderInjectionPolicy {
        let origin = Url::parse("http://localhost:8080").unwrap();
        HeaderInjectionPolicy::new(Some(&origin), UrlMatcher::compile_all(&allow).unwrap())
    }

    #[test]
    fn test_decisions() {
        let policy = policy(vec![UrlPattern::regex(r"^https://api\.partner\.test/")]);
        let same = Url::parse("http://localhost:8080/items").unwrap();
        let listed = Url::parse("https://api.partner.test/v1").unwrap();
        let other = Url::parse("https://evil.test/").unwrap();
        let other_port = Url::parse("http://localhost:9090/items").unwrap();

        assert_eq!(policy.decide(&same), HeaderInjectionDecision::SameOrigin);
        assert_eq!(policy.decide(&listed), HeaderInjectionDecision::AllowListed);
        assert_eq!(policy.decide(&other), HeaderInjectionDecision::Blocked);
        assert_eq!(policy.decide(&other_port), HeaderInjectionDecision::Blocked);
    }

    #[test]
    fn test_without_origin_everything_is_cross_origin() {
        let policy = HeaderInjectionPolicy::new(None, Vec::new());
        let url = Url::parse("http://localhost:8080/").unwrap();
        assert!(!policy.is_same_origin(&url));
        assert_eq!(policy.decide(&url), HeaderInjectionDecision::Blocked);
    }

    #[test]
    fn test_positional_url_gets_init_headers() {
        let cx = active_context();
        let url = Url::parse("http://localhost:8080/items").unwrap();
        let mut input = RequestInput::from(url.clone());
        let mut init = None;

        let decision = policy(vec![]).apply(&cx, &url, &mut input, &mut init);
        assert_eq!(decision, HeaderInjectionDecision::SameOrigin);
        match init.and_then(|i| i.headers) {
            Some(HeadersInit::Map(map)) => assert!(map.contains_key("traceparent")),
            other => panic!("unexpected headers: {other:?}"),
        }
    }

    #[test]
    fn test_descriptor_headers_keep_caller_values() {
        let cx = active_context();
        let url = Url::parse("http://localhost:8080/items").unwrap();
        let request = FetchRequest::get(url.as_str())
            .with_header(
                HeaderName::from_static("traceparent"),
                HeaderValue::from_static(CALLER_TRACEPARENT),
            )
            .with_header(
                HeaderName::from_static("x-caller"),
                HeaderValue::from_static("1"),
            );
        let mut input = RequestInput::from(request);
        let mut init = None;

        policy(vec![]).apply(&cx, &url, &mut input, &mut init);
        let RequestInput::Request(request) = input else {
            panic!("input changed shape");
        };
        assert_eq!(request.headers["traceparent"], CALLER_TRACEPARENT);
        assert_eq!(request.headers["x-caller"], "1");
        assert!(init.is_none());
    }

    #[test]
    fn test_pairs_are_extended_case_insensitively() {
        let cx = active_context();
        let url = Url::parse("http://localhost:8080/items").unwrap();
        let mut input = RequestInput::from(url.clone());
        let mut init = Some(RequestInit::default().with_headers(HeadersInit::Pairs(vec![(
            "Accept".into(),
            "application/json".into(),
        )])));

        policy(vec![]).apply(&cx, &url, &mut input, &mut init);
        let Some(HeadersInit::Pairs(pairs)) = init.and_then(|i| i.headers) else {
            panic!("pairs representation lost");
        };
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().any(|(k, _)| k == "traceparent"));

        let mut init = Some(RequestInit::default().with_headers(HeadersInit::Pairs(vec![(
            "TraceParent".into(),
            CALLER_TRACEPARENT.into(),
        )])));
        policy(vec![]).apply(&cx, &url, &mut input, &mut init);
        let Some(HeadersInit::Pairs(pairs)) = init.and_then(|i| i.headers) else {
            panic!("pairs representation lost");
        };
        assert_eq!(pairs, vec![("TraceParent".to_string(), CALLER_TRACEPARENT.to_string())]);
    }

    #[test]
    fn test_init_map_preferred_over_descriptor() {
        let cx = active_context();
        let url = Url::parse("https://api.partner.test/v1").unwrap();
        let mut input = RequestInput::from(FetchRequest::get(url.as_str()));
        let mut init = Some(RequestInit::default().with_headers(HeadersInit::Map(HeaderMap::new())));

        let decision = policy(vec![UrlPattern::literal("https://api.partner.test/v1")])
            .apply(&cx, &url, &mut input, &mut init);
        assert_eq!(decision, HeaderInjectionDecision::AllowListed);
        let Some(HeadersInit::Map(map)) = init.and_then(|i| i.headers) else {
            panic!("map representation lost");
        };
        assert!(map.contains_key("traceparent"));
        let RequestInput::Request(request) = input else {
            panic!("input changed shape");
        };
        assert!(request.headers.is_empty());
    }

    #[test]
    fn test_empty_trace_state_is_not_injected() {
        let headers = propagation_headers(&active_context());
        assert!(headers.contains_key("traceparent"));
        assert!(!headers.contains_key("tracestate"));

        let span_context = SpanContext::new(
            TraceId::from_bytes([7; 16]),
            SpanId::from_bytes([9; 8]),
            TraceFlags::SAMPLED,
            false,
            TraceState::from_key_value([("vendor", "abc")]).unwrap(),
        );
        let cx = Context::new().with_remote_span_context(span_context);
        assert_eq!(propagation_headers(&cx)["tracestate"], "vendor=abc");
    }

    #[test]
    fn test_blocked_cross_origin_untouched() {
        let cx = active_context();
        let url = Url::parse("https://evil.test/").unwrap();
        let mut input = RequestInput::from(url.clone());
        let mut init = None;

        let decision = policy(vec![]).apply(&cx, &url, &mut input, &mut init);
        assert_eq!(decision, HeaderInjectionDecision::Blocked);
        assert!(init.is_none());
    }
}
