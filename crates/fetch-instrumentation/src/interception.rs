//! Interception: swapping a scope's `fetch` for an instrumented decorator.
//!
//! The decorator starts a span, injects propagation headers, and forwards the
//! call to the original function with the span active. Once the call settles
//! it hands the span to a detached finalize task that drains a copy of the
//! body, waits for timing samples, correlates them, and ends the span.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context as TaskContext, Poll};
use std::time::SystemTime;

use bytes::Bytes;
use futures_core::Stream;
use opentelemetry::global::BoxedSpan;
use opentelemetry::trace::{Span, TraceContextExt};
use opentelemetry::Context;
use tokio::sync::mpsc;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use url::Url;

use crate::config::{url_matches_any, InstrumentationConfig, UrlMatcher};
use crate::correlation::{Correlator, PendingRequest, OBSERVER_WAIT_TIME};
use crate::error::{error_chain, FetchError, InstrumentationError};
use crate::fetch::{
    Fetch, FetchFuture, FetchResponse, GlobalScope, RequestInit, RequestInput, RequestSummary,
    ResponseBody, FETCH,
};
use crate::hooks::{run_hook, FetchOutcome, RequestHook, ResponseHook};
use crate::lifecycle::{self, ResponseSummary};
use crate::propagation::HeaderInjectionPolicy;
use crate::timing::ResourceTimeline;

const REQUEST_HOOK: &str = "apply_custom_attributes_on_req";
const RESPONSE_HOOK: &str = "apply_custom_attributes_on_res";

// ---------------------------------------------------------------------------
// Patch registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatchKey {
    scope: String,
    property: String,
}

impl PatchKey {
    fn new(scope: &GlobalScope, property: &str) -> Self {
        Self {
            scope: scope.name().to_string(),
            property: property.to_string(),
        }
    }
}

struct Patch {
    original: Arc<dyn Fetch>,
    patched: Arc<dyn Fetch>,
}

/// Remembers, per (scope, property), the original function and the decorator
/// that replaced it, so a patch can be undone exactly once.
#[derive(Default)]
pub(crate) struct PatchRegistry {
    patches: Mutex<HashMap<PatchKey, Patch>>,
}

impl PatchRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<PatchKey, Patch>> {
        self.patches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace `property` with `decorate(original)`. Returns false when the
    /// scope has nothing to patch.
    pub(crate) fn wrap<F>(&self, scope: &GlobalScope, property: &str, decorate: F) -> bool
    where
        F: FnOnce(Arc<dyn Fetch>) -> Arc<dyn Fetch>,
    {
        let mut patches = self.lock();
        let Some(original) = scope.get(property) else {
            return false;
        };
        let patched = decorate(original.clone());
        scope.set(property, patched.clone());
        patches.insert(PatchKey::new(scope, property), Patch { original, patched });
        true
    }

    /// Restore the original function. Returns false when nothing was patched.
    ///
    /// If someone replaced the decorator in the meantime, their function is
    /// left in place.
    pub(crate) fn unwrap(&self, scope: &GlobalScope, property: &str) -> bool {
        let mut patches = self.lock();
        let Some(patch) = patches.remove(&PatchKey::new(scope, property)) else {
            return false;
        };
        match scope.get(property) {
            Some(current) if same_fetch(&current, &patch.patched) => {
                scope.set(property, patch.original);
            }
            _ => {
                tracing::warn!(
                    scope = scope.name(),
                    property,
                    "Patched function was replaced, not restoring the original"
                );
            }
        }
        true
    }

    pub(crate) fn is_wrapped(&self, scope: &GlobalScope, property: &str) -> bool {
        let patches = self.lock();
        match (patches.get(&PatchKey::new(scope, property)), scope.get(property)) {
            (Some(patch), Some(current)) => same_fetch(&current, &patch.patched),
            _ => false,
        }
    }
}

fn same_fetch(a: &Arc<dyn Fetch>, b: &Arc<dyn Fetch>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

// ---------------------------------------------------------------------------
// Active context
// ---------------------------------------------------------------------------

/// Polls the inner future with `cx` attached as the current context, so work
/// done inside the original fetch sees the request span as its parent.
struct WithActiveContext<F> {
    inner: F,
    cx: Context,
}

impl<F: Future + Unpin> Future for WithActiveContext<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, task: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let _guard = self.cx.clone().attach();
        Pin::new(&mut self.inner).poll(task)
    }
}

/// Parent for a new request span: the current `tracing` span when it is
/// bridged to OpenTelemetry, otherwise the current OpenTelemetry context.
fn parent_context() -> Context {
    let bridged = tracing::Span::current().context();
    if bridged.span().span_context().is_valid() {
        bridged
    } else {
        Context::current()
    }
}

// ---------------------------------------------------------------------------
// Body copy
// ---------------------------------------------------------------------------

type Chunk = Result<Bytes, FetchError>;

/// The caller's half of a tee'd body.
struct ChannelBody(mpsc::UnboundedReceiver<Chunk>);

impl Stream for ChannelBody {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Chunk>> {
        self.0.poll_recv(cx)
    }
}

/// The instrumentation's half: reads the original body and forwards every
/// chunk to the caller.
struct BodyCopy {
    source: ResponseBody,
    sink: mpsc::UnboundedSender<Chunk>,
}

struct DrainFailure {
    name: &'static str,
    message: String,
    stacktrace: String,
}

impl BodyCopy {
    /// Pump the body to the end. The caller may drop its half at any point;
    /// draining continues so timing still completes.
    async fn drain(mut self) -> Result<u64, DrainFailure> {
        let mut received = 0u64;
        while let Some(chunk) = self.source.next_chunk().await {
            match chunk {
                Ok(bytes) => {
                    received += bytes.len() as u64;
                    let _ = self.sink.send(Ok(bytes));
                }
                Err(e) => {
                    let failure = DrainFailure {
                        name: e.name(),
                        message: e.to_string(),
                        stacktrace: error_chain(&e),
                    };
                    let _ = self.sink.send(Err(e));
                    return Err(failure);
                }
            }
        }
        Ok(received)
    }
}

fn tee(body: ResponseBody) -> (ResponseBody, BodyCopy) {
    let (sink, receiver) = mpsc::unbounded_channel();
    (
        ResponseBody::from_stream(ChannelBody(receiver)),
        BodyCopy { source: body, sink },
    )
}

// ---------------------------------------------------------------------------
// Instrumenter
// ---------------------------------------------------------------------------

/// Counts one request as in flight until dropped. Dropped after the span
/// ends, or with the caller's future if that is dropped before settling.
struct InFlightGuard {
    core: Arc<Instrumenter>,
}

impl InFlightGuard {
    fn start(core: &Arc<Instrumenter>) -> Self {
        core.correlator.task_started();
        Self { core: core.clone() }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.core
            .correlator
            .task_finished(self.core.timeline.as_ref());
    }
}

/// How a request settled, carried into the finalize task.
enum Settled {
    Response {
        summary: ResponseSummary,
        copy: Option<BodyCopy>,
        has_length: bool,
    },
    Failed,
}

/// Per-instrumentation state shared by every decorated call.
pub(crate) struct Instrumenter {
    tracer_name: String,
    origin: Option<Url>,
    ignore_urls: Vec<UrlMatcher>,
    policy: HeaderInjectionPolicy,
    correlator: Correlator,
    timeline: Option<Arc<ResourceTimeline>>,
    request_hook: Option<RequestHook>,
    response_hook: Option<ResponseHook>,
}

impl Instrumenter {
    fn new(
        config: InstrumentationConfig,
        timeline: Option<Arc<ResourceTimeline>>,
    ) -> Result<Self, InstrumentationError> {
        let origin = config
            .origin
            .as_deref()
            .map(|origin| {
                Url::parse(origin).map_err(|source| InstrumentationError::InvalidOrigin {
                    origin: origin.to_string(),
                    source,
                })
            })
            .transpose()?;
        let ignore_urls = UrlMatcher::compile_all(&config.ignore_urls)?;
        let allow_list = UrlMatcher::compile_all(&config.propagate_trace_header_cors_urls)?;

        Ok(Self {
            policy: HeaderInjectionPolicy::new(origin.as_ref(), allow_list),
            correlator: Correlator::new(
                config.tracer_name.clone(),
                config.clear_timing_resources,
                config.ignore_network_events,
            ),
            tracer_name: config.tracer_name,
            origin,
            ignore_urls,
            timeline,
            request_hook: config.apply_custom_attributes_on_req,
            response_hook: config.apply_custom_attributes_on_res,
        })
    }

    fn on_response(
        self: &Arc<Self>,
        mut span: BoxedSpan,
        pending: PendingRequest,
        cross_origin: bool,
        in_flight: InFlightGuard,
        mut response: FetchResponse,
    ) -> FetchResponse {
        let summary = ResponseSummary::from_response(&response);
        let has_length = lifecycle::record_response(&mut span, &summary);
        let runtime = tokio::runtime::Handle::try_current().ok();

        // Only bodies in the success range are read by the instrumentation;
        // anything else is described from the head alone. Without a runtime
        // nothing would pump the copy, so the body stays untouched.
        let copy = if runtime.is_some() && summary.is_success_range() {
            response.body.take().map(|body| {
                let (caller, copy) = tee(body);
                response.body = Some(caller);
                copy
            })
        } else {
            None
        };

        self.schedule_finalize(
            runtime,
            span,
            pending,
            cross_origin,
            in_flight,
            Settled::Response {
                summary,
                copy,
                has_length,
            },
        );
        response
    }

    fn on_error(
        self: &Arc<Self>,
        mut span: BoxedSpan,
        pending: PendingRequest,
        cross_origin: bool,
        in_flight: InFlightGuard,
        error: &FetchError,
    ) {
        lifecycle::record_exception(&mut span, error.name(), error);
        if let Some(hook) = &self.response_hook {
            run_hook(RESPONSE_HOOK, || hook(&mut span, FetchOutcome::Error(error)));
        }
        let runtime = tokio::runtime::Handle::try_current().ok();
        self.schedule_finalize(
            runtime,
            span,
            pending,
            cross_origin,
            in_flight,
            Settled::Failed,
        );
    }

    fn schedule_finalize(
        self: &Arc<Self>,
        runtime: Option<tokio::runtime::Handle>,
        mut span: BoxedSpan,
        pending: PendingRequest,
        cross_origin: bool,
        in_flight: InFlightGuard,
        settled: Settled,
    ) {
        match runtime {
            Some(handle) => {
                handle.spawn(
                    self.clone()
                        .finalize(span, pending, cross_origin, in_flight, settled),
                );
            }
            None => {
                tracing::warn!(
                    url = pending.url(),
                    "No async runtime to finalize the span, ending it without timing"
                );
                if let (Settled::Response { summary, .. }, Some(hook)) =
                    (&settled, &self.response_hook)
                {
                    run_hook(RESPONSE_HOOK, || {
                        hook(&mut span, FetchOutcome::Response(summary))
                    });
                }
                span.end();
                drop(in_flight);
            }
        }
    }

    async fn finalize(
        self: Arc<Self>,
        mut span: BoxedSpan,
        pending: PendingRequest,
        cross_origin: bool,
        in_flight: InFlightGuard,
        settled: Settled,
    ) {
        let mut unsized_response = None;
        if let Settled::Response {
            summary,
            copy,
            has_length,
        } = settled
        {
            let mut length_known = has_length;
            if let Some(copy) = copy {
                match copy.drain().await {
                    Ok(received) if !has_length => {
                        lifecycle::record_content_length(&mut span, &summary.headers, received);
                        length_known = true;
                    }
                    Ok(_) => {}
                    Err(failure) => {
                        lifecycle::record_error(
                            &mut span,
                            failure.name,
                            &failure.message,
                            &failure.stacktrace,
                        );
                    }
                }
            }
            if let Some(hook) = &self.response_hook {
                run_hook(RESPONSE_HOOK, || {
                    hook(&mut span, FetchOutcome::Response(&summary))
                });
            }
            if !length_known {
                unsized_response = Some(summary.headers);
            }
        }

        let end_time = SystemTime::now();
        tokio::time::sleep(OBSERVER_WAIT_TIME).await;

        let selection =
            self.correlator
                .annotate(&mut span, &pending, end_time, self.timeline.as_ref(), cross_origin);
        // The timing sample's body sizes stand in for a missing length.
        if let (Some(headers), Some(selection)) = (&unsized_response, &selection) {
            let record = &selection.main_request;
            let size = if lifecycle::is_compressed(headers) {
                record.encoded_body_size
            } else {
                record.decoded_body_size
            };
            if size > 0 {
                lifecycle::record_content_length(&mut span, headers, size);
            }
        }
        tracing::trace!(
            url = pending.url(),
            matched = selection.is_some(),
            "Finalized fetch span"
        );

        span.end_with_timestamp(end_time);
        drop(in_flight);
    }
}

/// The decorator installed in place of the original `fetch`.
struct InstrumentedFetch {
    original: Arc<dyn Fetch>,
    core: Arc<Instrumenter>,
}

impl Fetch for InstrumentedFetch {
    fn fetch(&self, mut input: RequestInput, mut init: Option<RequestInit>) -> FetchFuture {
        let core = &self.core;

        let request = match RequestSummary::resolve(&input, init.as_ref(), core.origin.as_ref()) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "Request could not be resolved, not instrumenting");
                return self.original.fetch(input, init);
            }
        };
        if url_matches_any(request.url.as_str(), &core.ignore_urls) {
            tracing::debug!(url = %request.url, "Ignoring span as url matches ignored url");
            return self.original.fetch(input, init);
        }

        let start_time = SystemTime::now();
        let parent = parent_context();
        let mut span = lifecycle::start_span(
            &core.tracer_name,
            &request.url,
            &request.method,
            start_time,
            &parent,
        );
        let active = parent.with_remote_span_context(span.span_context().clone());

        core.policy.apply(&active, &request.url, &mut input, &mut init);
        if let Some(hook) = &core.request_hook {
            run_hook(REQUEST_HOOK, || hook(&mut span, &request));
        }

        let pending = PendingRequest::begin(&request.url, start_time, core.timeline.as_ref());
        let cross_origin = !core.policy.is_same_origin(&request.url);
        let in_flight = InFlightGuard::start(core);

        let call = {
            let _guard = active.clone().attach();
            self.original.fetch(input, init)
        };
        let call = WithActiveContext { inner: call, cx: active };
        let core = self.core.clone();

        Box::pin(async move {
            match call.await {
                Ok(response) => Ok(core.on_response(
                    span,
                    pending,
                    cross_origin,
                    in_flight,
                    response,
                )),
                Err(error) => {
                    core.on_error(span, pending, cross_origin, in_flight, &error);
                    Err(error)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Instruments the `fetch` property of one [`GlobalScope`].
///
/// ```no_run
/// # use std::sync::Arc;
/// # use fetch_instrumentation::{FetchInstrumentation, GlobalScope, InstrumentationConfig, ReqwestFetch};
/// # async fn run() -> anyhow::Result<()> {
/// let scope = Arc::new(GlobalScope::new("main").with_fetch(ReqwestFetch::new(reqwest::Client::new())));
/// let instrumentation = FetchInstrumentation::new(scope.clone(), InstrumentationConfig::default())?;
/// instrumentation.enable();
/// let response = scope.fetch("https://example.com/", None).await?;
/// # let _ = response;
/// instrumentation.wait_idle().await;
/// # Ok(())
/// # }
/// ```
pub struct FetchInstrumentation {
    scope: Arc<GlobalScope>,
    core: Arc<Instrumenter>,
    registry: PatchRegistry,
}

impl FetchInstrumentation {
    pub fn new(
        scope: Arc<GlobalScope>,
        config: InstrumentationConfig,
    ) -> Result<Self, InstrumentationError> {
        let timeline = scope.performance().cloned();
        let core = Arc::new(Instrumenter::new(config, timeline)?);
        Ok(Self {
            scope,
            core,
            registry: PatchRegistry::default(),
        })
    }

    /// Install the decorator. Enabling twice leaves a single layer.
    pub fn enable(&self) {
        if self.registry.unwrap(&self.scope, FETCH) {
            tracing::debug!(scope = self.scope.name(), "Removing previous patch from fetch");
        }
        let core = self.core.clone();
        let wrapped = self.registry.wrap(&self.scope, FETCH, |original| {
            Arc::new(InstrumentedFetch { original, core }) as Arc<dyn Fetch>
        });
        if wrapped {
            tracing::debug!(scope = self.scope.name(), "Patched fetch");
        } else {
            tracing::warn!(
                scope = self.scope.name(),
                "No fetch function available, instrumentation not enabled"
            );
        }
    }

    /// Restore the original `fetch`. Requests already in flight still finish
    /// their spans.
    pub fn disable(&self) {
        if self.registry.unwrap(&self.scope, FETCH) {
            tracing::debug!(scope = self.scope.name(), "Removed patch from fetch");
        }
        self.core.correlator.reset();
    }

    pub fn is_wrapped(&self) -> bool {
        self.registry.is_wrapped(&self.scope, FETCH)
    }

    pub fn scope(&self) -> &Arc<GlobalScope> {
        &self.scope
    }

    /// Number of requests whose spans are not yet ended.
    pub fn in_flight(&self) -> usize {
        self.core.correlator.in_flight()
    }

    /// Wait until every started span has been finalized and ended.
    pub async fn wait_idle(&self) {
        self.core.correlator.wait_idle().await;
    }
}

impl Drop for FetchInstrumentation {
    fn drop(&mut self) {
        self.registry.unwrap(&self.scope, FETCH);
    }
}
