//! The fetch capability: request/response types and the global scope that
//! holds the patchable `fetch` property.
//!
//! A [`GlobalScope`] plays the role of a runtime's global object. Code that
//! issues requests calls [`GlobalScope::fetch`], which dispatches to whatever
//! [`Fetch`] implementation currently sits in the `fetch` property. The
//! instrumentation swaps that property for a decorator and back.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::FetchError;
use crate::timing::ResourceTimeline;

/// Name of the property holding the request function.
pub const FETCH: &str = "fetch";

/// Future returned by every [`Fetch`] implementation.
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchResponse, FetchError>> + Send>>;

/// A request function: the capability the instrumentation decorates.
pub trait Fetch: Send + Sync + 'static {
    fn fetch(&self, input: RequestInput, init: Option<RequestInit>) -> FetchFuture;
}

impl<F> Fetch for F
where
    F: Fn(RequestInput, Option<RequestInit>) -> FetchFuture + Send + Sync + 'static,
{
    fn fetch(&self, input: RequestInput, init: Option<RequestInit>) -> FetchFuture {
        self(input, init)
    }
}

/// A self-contained request descriptor.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl FetchRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Merge a descriptor-or-URL input with its init options into one request.
    ///
    /// Init values take precedence over the descriptor's own.
    pub fn from_parts(input: RequestInput, init: Option<RequestInit>) -> Result<Self, FetchError> {
        let mut request = match input {
            RequestInput::Url(url) => FetchRequest::get(url),
            RequestInput::Request(request) => request,
        };
        if let Some(init) = init {
            if let Some(method) = init.method {
                request.method = method;
            }
            if let Some(headers) = init.headers {
                request.headers = headers.to_header_map()?;
            }
            if let Some(body) = init.body {
                request.body = Some(body);
            }
        }
        Ok(request)
    }
}

/// First argument of a fetch call: a bare URL or a full descriptor.
#[derive(Debug, Clone)]
pub enum RequestInput {
    Url(String),
    Request(FetchRequest),
}

impl RequestInput {
    pub fn url(&self) -> &str {
        match self {
            RequestInput::Url(url) => url,
            RequestInput::Request(request) => &request.url,
        }
    }
}

impl From<&str> for RequestInput {
    fn from(url: &str) -> Self {
        RequestInput::Url(url.to_string())
    }
}

impl From<String> for RequestInput {
    fn from(url: String) -> Self {
        RequestInput::Url(url)
    }
}

impl From<Url> for RequestInput {
    fn from(url: Url) -> Self {
        RequestInput::Url(url.into())
    }
}

impl From<FetchRequest> for RequestInput {
    fn from(request: FetchRequest) -> Self {
        RequestInput::Request(request)
    }
}

/// Optional second argument of a fetch call.
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
    pub method: Option<Method>,
    pub headers: Option<HeadersInit>,
    pub body: Option<Bytes>,
}

impl RequestInit {
    pub fn method(method: Method) -> Self {
        Self {
            method: Some(method),
            ..Self::default()
        }
    }

    pub fn with_headers(mut self, headers: HeadersInit) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Header option of [`RequestInit`]: a typed map or plain string pairs.
#[derive(Debug, Clone)]
pub enum HeadersInit {
    Map(HeaderMap),
    Pairs(Vec<(String, String)>),
}

impl HeadersInit {
    /// Whether a header is present, ignoring ASCII case.
    pub fn contains(&self, name: &str) -> bool {
        match self {
            HeadersInit::Map(map) => map.contains_key(name),
            HeadersInit::Pairs(pairs) => pairs.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)),
        }
    }

    pub fn to_header_map(&self) -> Result<HeaderMap, FetchError> {
        match self {
            HeadersInit::Map(map) => Ok(map.clone()),
            HeadersInit::Pairs(pairs) => {
                let mut map = HeaderMap::with_capacity(pairs.len());
                for (name, value) in pairs {
                    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                        FetchError::InvalidRequest(format!("invalid header name `{name}`"))
                    })?;
                    let value = HeaderValue::from_str(value).map_err(|_| {
                        FetchError::InvalidRequest(format!("invalid value for header `{name}`"))
                    })?;
                    map.append(name, value);
                }
                Ok(map)
            }
        }
    }
}

/// What the instrumentation knows about a request before it is sent.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl RequestSummary {
    /// Resolve URL, method, and effective headers of a call without consuming it.
    pub fn resolve(
        input: &RequestInput,
        init: Option<&RequestInit>,
        base: Option<&Url>,
    ) -> Result<Self, FetchError> {
        let url = resolve_url(input.url(), base)?;
        let (mut method, mut headers) = match input {
            RequestInput::Url(_) => (Method::GET, HeaderMap::new()),
            RequestInput::Request(request) => (request.method.clone(), request.headers.clone()),
        };
        if let Some(init) = init {
            if let Some(m) = &init.method {
                method = m.clone();
            }
            if let Some(h) = &init.headers {
                headers = h.to_header_map()?;
            }
        }
        Ok(Self {
            method,
            url,
            headers,
        })
    }
}

/// Parse `raw`, resolving it against `base` when it is relative.
pub fn resolve_url(raw: &str, base: Option<&Url>) -> Result<Url, FetchError> {
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => match base {
            Some(base) => base
                .join(raw)
                .map_err(|e| FetchError::InvalidRequest(format!("invalid url `{raw}`: {e}"))),
            None => Err(FetchError::InvalidRequest(format!(
                "relative url `{raw}` without an origin"
            ))),
        },
        Err(e) => Err(FetchError::InvalidRequest(format!("invalid url `{raw}`: {e}"))),
    }
}

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// A streamed response body.
pub struct ResponseBody {
    inner: BodyStream,
}

impl ResponseBody {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, FetchError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::from_stream(Once(Some(bytes.into())))
    }

    /// Poll the next chunk.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, FetchError>> {
        std::future::poll_fn(|cx| self.inner.as_mut().poll_next(cx)).await
    }

    /// Read the rest of the body into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes, FetchError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody").finish_non_exhaustive()
    }
}

struct Once(Option<Bytes>);

impl Stream for Once {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.0.take().map(Ok))
    }
}

/// A settled response. The body is `None` when the response carries none.
#[derive(Debug)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub url: String,
    pub body: Option<ResponseBody>,
}

impl FetchResponse {
    pub fn new(status: StatusCode, url: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
            url: url.into(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub async fn bytes(self) -> Result<Bytes, FetchError> {
        match self.body {
            Some(body) => body.bytes().await,
            None => Ok(Bytes::new()),
        }
    }

    pub async fn text(self) -> Result<String, FetchError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// The runtime's global object: named properties holding request functions,
/// plus the optional resource-timing timeline.
pub struct GlobalScope {
    name: String,
    properties: RwLock<HashMap<String, Arc<dyn Fetch>>>,
    performance: Option<Arc<ResourceTimeline>>,
}

impl GlobalScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: RwLock::new(HashMap::new()),
            performance: None,
        }
    }

    pub fn with_fetch(self, fetch: impl Fetch) -> Self {
        self.set(FETCH, Arc::new(fetch));
        self
    }

    pub fn with_performance(mut self, timeline: Arc<ResourceTimeline>) -> Self {
        self.performance = Some(timeline);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resource-timing timeline, when the runtime has one.
    pub fn performance(&self) -> Option<&Arc<ResourceTimeline>> {
        self.performance.as_ref()
    }

    pub fn get(&self, property: &str) -> Option<Arc<dyn Fetch>> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(property)
            .cloned()
    }

    /// Replace a property, returning the previous value.
    pub fn set(&self, property: &str, value: Arc<dyn Fetch>) -> Option<Arc<dyn Fetch>> {
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(property.to_string(), value)
    }

    pub fn remove(&self, property: &str) -> Option<Arc<dyn Fetch>> {
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(property)
    }

    /// Call whatever currently sits in the `fetch` property.
    pub fn fetch(&self, input: impl Into<RequestInput>, init: Option<RequestInit>) -> FetchFuture {
        match self.get(FETCH) {
            Some(fetch) => fetch.fetch(input.into(), init),
            None => {
                let err = FetchError::Unavailable {
                    scope: self.name.clone(),
                    property: FETCH.to_string(),
                };
                Box::pin(async move { Err(err) })
            }
        }
    }
}

impl fmt::Debug for GlobalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let properties: Vec<String> = self
            .properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("GlobalScope")
            .field("name", &self.name)
            .field("properties", &properties)
            .field("performance", &self.performance.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{ACCEPT, CONTENT_TYPE};

    #[test]
    fn test_resolve_positional_url_defaults_to_get() {
        let input = RequestInput::from("https://api.example.com/v1/items?page=2");
        let summary = RequestSummary::resolve(&input, None, None).unwrap();
        assert_eq!(summary.method, Method::GET);
        assert_eq!(summary.url.path(), "/v1/items");
        assert!(summary.headers.is_empty());
    }

    #[test]
    fn test_resolve_descriptor_with_init_override() {
        let request = FetchRequest::new(Method::POST, "https://api.example.com/items")
            .with_header(ACCEPT, HeaderValue::from_static("text/plain"));
        let init = RequestInit::method(Method::PUT).with_headers(HeadersInit::Pairs(vec![(
            "Content-Type".into(),
            "application/json".into(),
        )]));

        let summary = RequestSummary::resolve(&request.into(), Some(&init), None).unwrap();
        assert_eq!(summary.method, Method::PUT);
        assert!(summary.headers.get(ACCEPT).is_none());
        assert_eq!(summary.headers[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_relative_url_needs_origin() {
        let base = Url::parse("http://localhost:8080").unwrap();
        let input = RequestInput::from("/health");
        let summary = RequestSummary::resolve(&input, None, Some(&base)).unwrap();
        assert_eq!(summary.url.as_str(), "http://localhost:8080/health");

        let err = RequestSummary::resolve(&input, None, None).unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }

    #[test]
    fn test_from_parts_applies_init() {
        let init = RequestInit {
            method: Some(Method::DELETE),
            headers: None,
            body: Some(Bytes::from_static(b"x")),
        };
        let request = FetchRequest::from_parts("https://a.test/x".into(), Some(init)).unwrap();
        assert_eq!(request.method, Method::DELETE);
        assert_eq!(request.body.as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn test_invalid_pair_header_is_rejected() {
        let init = HeadersInit::Pairs(vec![("bad header".into(), "v".into())]);
        assert!(matches!(
            init.to_header_map(),
            Err(FetchError::InvalidRequest(_))
        ));
        assert!(HeadersInit::Pairs(vec![("X-Token".into(), "1".into())]).contains("x-token"));
    }

    #[tokio::test]
    async fn test_scope_without_fetch_is_unavailable() {
        let scope = GlobalScope::new("worker");
        let err = scope.fetch("https://a.test/", None).await.unwrap_err();
        assert!(matches!(err, FetchError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_scope_dispatches_to_property() {
        let scope = GlobalScope::new("worker").with_fetch(
            |input: RequestInput, _init: Option<RequestInit>| -> FetchFuture {
                let url = input.url().to_string();
                Box::pin(async move {
                    Ok(FetchResponse::new(StatusCode::OK, url)
                        .with_body(ResponseBody::from_bytes("pong")))
                })
            },
        );
        let response = scope.fetch("https://a.test/ping", None).await.unwrap();
        assert_eq!(response.status_text, "OK");
        assert_eq!(response.text().await.unwrap(), "pong");
    }
}
