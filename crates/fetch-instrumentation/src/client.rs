//! reqwest-backed [`Fetch`] implementation.
//!
//! Besides sending the request, it plays the role of the runtime's network
//! stack for resource timing: when the response body stream ends it records a
//! [`TimingRecord`] into the scope's timeline. That sample shows up after the
//! response itself has settled, on its own schedule.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use bytes::Bytes;
use futures_core::Stream;

use crate::error::FetchError;
use url::Url;

use crate::fetch::{
    resolve_url, Fetch, FetchFuture, FetchRequest, FetchResponse, RequestInit, RequestInput,
    ResponseBody,
};
use crate::timing::{ResourceTimeline, TimingRecord, FETCH_INITIATOR};

/// Phase times known once the response head has arrived.
#[derive(Clone)]
struct PartialTiming {
    url: String,
    fetch_start: SystemTime,
    response_start: SystemTime,
}

/// A stream wrapper that passes body chunks through unchanged, counting
/// bytes. When the inner stream completes it records the timing sample.
struct TimedBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    timeline: Option<Arc<ResourceTimeline>>,
    timing: Option<PartialTiming>,
    received: u64,
}

impl TimedBody {
    fn finish(&mut self) {
        // Recorded at most once, even if polled again after the end.
        let (Some(timing), Some(timeline)) = (self.timing.take(), self.timeline.as_ref()) else {
            return;
        };
        let mut record = TimingRecord::new(
            timing.url,
            FETCH_INITIATOR,
            timing.fetch_start,
            SystemTime::now(),
        );
        // reqwest does not expose connection phases; a reused or opaque
        // connection reports them as starting at fetch start.
        record.domain_lookup_start = Some(timing.fetch_start);
        record.domain_lookup_end = Some(timing.fetch_start);
        record.connect_start = Some(timing.fetch_start);
        record.connect_end = Some(timing.fetch_start);
        record.request_start = Some(timing.fetch_start);
        record.response_start = Some(timing.response_start);
        record.encoded_body_size = self.received;
        record.decoded_body_size = self.received;
        timeline.record(record);
    }
}

impl Stream for TimedBody {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.received += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(FetchError::Body(e)))),
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sends fetch calls through a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestFetch {
    client: reqwest::Client,
    timeline: Option<Arc<ResourceTimeline>>,
    origin: Option<Url>,
}

impl ReqwestFetch {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeline: None,
            origin: None,
        }
    }

    /// Record a timing sample per completed response body into `timeline`.
    pub fn with_timeline(mut self, timeline: Arc<ResourceTimeline>) -> Self {
        self.timeline = Some(timeline);
        self
    }

    /// Resolve relative request URLs against `origin`.
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }
}

impl Fetch for ReqwestFetch {
    fn fetch(&self, input: RequestInput, init: Option<RequestInit>) -> FetchFuture {
        let client = self.client.clone();
        let timeline = self.timeline.clone();
        let origin = self.origin.clone();

        Box::pin(async move {
            let request = FetchRequest::from_parts(input, init)?;
            let url = resolve_url(&request.url, origin.as_ref())?.to_string();

            let mut req_builder = client
                .request(request.method, url.as_str())
                .headers(request.headers);
            if let Some(body) = request.body {
                req_builder = req_builder.body(body);
            }

            let fetch_start = SystemTime::now();
            let upstream = req_builder
                .send()
                .await
                .map_err(|e| FetchError::from_reqwest(&url, e))?;
            let response_start = SystemTime::now();

            let status = upstream.status();
            let headers = upstream.headers().clone();
            let final_url = upstream.url().to_string();

            let body = TimedBody {
                inner: Box::pin(upstream.bytes_stream()),
                timeline,
                timing: Some(PartialTiming {
                    url,
                    fetch_start,
                    response_start,
                }),
                received: 0,
            };

            let mut response = FetchResponse::new(status, final_url)
                .with_body(ResponseBody::from_stream(body));
            response.headers = headers;
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_records_timing_after_body_ends() {
        let base = serve(Router::new().route("/hello", get(|| async { "hello world" }))).await;
        let timeline = Arc::new(ResourceTimeline::new());
        let fetch = ReqwestFetch::new(reqwest::Client::new()).with_timeline(timeline.clone());

        let url = format!("{base}/hello");
        let response = fetch.fetch(url.clone().into(), None).await.unwrap();
        assert_eq!(response.status, http::StatusCode::OK);
        assert!(timeline.is_empty());

        assert_eq!(response.text().await.unwrap(), "hello world");
        let entries = timeline.entries();
        assert_eq!(entries.len(), 1);
        let record = &entries[0];
        assert_eq!(record.name, url);
        assert_eq!(record.initiator_type, "fetch");
        assert_eq!(record.decoded_body_size, 11);
        assert!(record.fetch_start <= record.response_end);
    }

    #[tokio::test]
    async fn test_relative_url_resolves_against_origin() {
        let base = serve(Router::new().route("/hello", get(|| async { "hello world" }))).await;
        let timeline = Arc::new(ResourceTimeline::new());
        let fetch = ReqwestFetch::new(reqwest::Client::new())
            .with_timeline(timeline.clone())
            .with_origin(Url::parse(&base).unwrap());

        let response = fetch.fetch("/hello".into(), None).await.unwrap();
        assert_eq!(response.status, http::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "hello world");

        let entries = timeline.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, format!("{base}/hello"));
    }

    #[tokio::test]
    async fn test_relative_url_without_origin_is_rejected() {
        let fetch = ReqwestFetch::new(reqwest::Client::new());
        let err = fetch.fetch("/hello".into(), None).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let fetch = ReqwestFetch::new(reqwest::Client::new());
        let err = fetch
            .fetch("http://127.0.0.1:1/".into(), None)
            .await
            .unwrap_err();
        assert_eq!(err.name(), "NetworkError");
    }

    #[tokio::test]
    async fn test_invalid_header_pair_is_rejected_before_sending() {
        let fetch = ReqwestFetch::new(reqwest::Client::new());
        let init = RequestInit::default().with_headers(crate::fetch::HeadersInit::Pairs(vec![(
            "bad header".into(),
            "1".into(),
        )]));
        let err = fetch
            .fetch("http://127.0.0.1:1/".into(), Some(init))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }
}
