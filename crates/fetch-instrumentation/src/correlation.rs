//! Resource correlation: attach resource-timing detail to a settled request.
//!
//! Timing samples arrive on their own schedule, so each request registers an
//! observer when it starts and, after the grace window, picks its samples
//! from the observer buffer (or the whole timeline when the observer saw
//! nothing). Picked samples are marked consumed so a later request to the same
//! URL cannot claim them again.
//!
//! Matching is best effort. Two concurrent requests to one URL whose windows
//! both contain both samples may swap samples; nothing here can tell them
//! apart.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use opentelemetry::global::{self, BoxedSpan};
use opentelemetry::trace::{Span, TraceContextExt, Tracer};
use opentelemetry::Context;
use tokio::sync::Notify;
use url::Url;

use crate::attributes::*;
use crate::timing::{ResourceObserver, ResourceTimeline, TimingRecord, FETCH_INITIATOR};

/// How long a settled request waits for its timing samples.
pub const OBSERVER_WAIT_TIME: Duration = Duration::from_millis(300);

/// Per-request correlation input, created when the span starts.
pub struct PendingRequest {
    url: String,
    start_time: SystemTime,
    observer: Option<ResourceObserver>,
}

impl PendingRequest {
    pub fn begin(url: &Url, start_time: SystemTime, timeline: Option<&Arc<ResourceTimeline>>) -> Self {
        let url = url.to_string();
        let observer = timeline.and_then(|t| t.observe(&url, FETCH_INITIATOR));
        Self {
            url,
            start_time,
            observer,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Stop observing and return what the observer buffered.
    fn take_buffered(&self) -> Vec<Arc<TimingRecord>> {
        match &self.observer {
            Some(observer) => {
                observer.disconnect();
                observer.entries()
            }
            None => Vec::new(),
        }
    }
}

/// The samples attributed to one request.
#[derive(Debug, Clone)]
pub struct ResourceSelection {
    pub main_request: Arc<TimingRecord>,
    pub cors_preflight: Option<Arc<TimingRecord>>,
}

fn nanos(time: SystemTime) -> i128 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
    }
}

/// Pick the main sample and an optional CORS preflight for a request to
/// `span_url` that ran within `[start, end]`.
///
/// Candidates must be `fetch` samples for exactly this URL, lie inside the
/// window, and not be consumed. With several candidates a same-origin request
/// takes the one that started last; a cross-origin request treats the
/// earliest as a preflight when the main sample starts after it ended.
pub fn select_resources(
    span_url: &str,
    start: SystemTime,
    end: SystemTime,
    resources: &[Arc<TimingRecord>],
    consumed: &HashSet<u64>,
    cross_origin: bool,
) -> Option<ResourceSelection> {
    let mut candidates: Vec<Arc<TimingRecord>> = resources
        .iter()
        .filter(|r| {
            r.initiator_type.eq_ignore_ascii_case(FETCH_INITIATOR)
                && r.name == span_url
                && r.fetch_start >= start
                && r.response_end <= end
                && !consumed.contains(&r.id())
        })
        .cloned()
        .collect();

    match candidates.len() {
        0 => return None,
        1 => {
            return Some(ResourceSelection {
                main_request: candidates.remove(0),
                cors_preflight: None,
            })
        }
        _ => {}
    }

    candidates.sort_by_key(|r| r.fetch_start);

    if !cross_origin {
        let main_request = candidates.pop()?;
        return Some(ResourceSelection {
            main_request,
            cors_preflight: None,
        });
    }

    let preflight = candidates[0].clone();
    let main_request = find_main_request(&candidates, preflight.response_end, end);
    if main_request.fetch_start < preflight.response_end {
        return Some(ResourceSelection {
            main_request: preflight,
            cors_preflight: None,
        });
    }
    Some(ResourceSelection {
        main_request,
        cors_preflight: Some(preflight),
    })
}

/// Among `sorted[1..]`, the sample starting at or after `preflight_end` whose
/// end is closest to `span_end`. Defaults to `sorted[1]`.
fn find_main_request(
    sorted: &[Arc<TimingRecord>],
    preflight_end: SystemTime,
    span_end: SystemTime,
) -> Arc<TimingRecord> {
    let mut main_request = sorted[1].clone();
    let mut best_gap: Option<i128> = None;
    for resource in &sorted[1..] {
        let gap = nanos(span_end) - nanos(resource.response_end);
        if resource.fetch_start >= preflight_end && best_gap.map_or(true, |best| gap < best) {
            best_gap = Some(gap);
            main_request = resource.clone();
        }
    }
    main_request
}

/// Add one event per known phase of `record`, stamped with the phase time.
pub fn add_network_events<S: Span>(span: &mut S, record: &TimingRecord) {
    let phases = [
        (FETCH_START, Some(record.fetch_start)),
        (DOMAIN_LOOKUP_START, record.domain_lookup_start),
        (DOMAIN_LOOKUP_END, record.domain_lookup_end),
        (CONNECT_START, record.connect_start),
        (SECURE_CONNECTION_START, record.secure_connection_start),
        (CONNECT_END, record.connect_end),
        (REQUEST_START, record.request_start),
        (RESPONSE_START, record.response_start),
        (RESPONSE_END, Some(record.response_end)),
    ];
    for (name, time) in phases {
        if let Some(time) = time {
            span.add_event_with_timestamp(name, time, Vec::new());
        }
    }
}

#[derive(Default)]
struct CorrelationState {
    consumed: HashSet<u64>,
    in_flight: usize,
}

/// Shared correlation state: the consumed-sample set and the in-flight
/// finalize counter, behind one lock that is never held across an await.
pub struct Correlator {
    state: Mutex<CorrelationState>,
    idle: Notify,
    tracer_name: String,
    clear_timing_resources: bool,
    ignore_network_events: bool,
}

impl Correlator {
    pub fn new(tracer_name: String, clear_timing_resources: bool, ignore_network_events: bool) -> Self {
        Self {
            state: Mutex::new(CorrelationState::default()),
            idle: Notify::new(),
            tracer_name,
            clear_timing_resources,
            ignore_network_events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CorrelationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task_started(&self) {
        self.lock().in_flight += 1;
    }

    /// Count a finalize task out; at zero, optionally clear timing state.
    pub fn task_finished(&self, timeline: Option<&Arc<ResourceTimeline>>) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight > 0 {
            return;
        }
        if self.clear_timing_resources {
            if let Some(timeline) = timeline {
                timeline.clear();
            }
            state.consumed.clear();
        }
        drop(state);
        self.idle.notify_waiters();
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    #[cfg(test)]
    fn consumed_len(&self) -> usize {
        self.lock().consumed.len()
    }

    /// Forget which samples were consumed.
    pub fn reset(&self) {
        self.lock().consumed.clear();
    }

    /// Resolve once no finalize task is pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Select samples for a request and mark them consumed in one step.
    pub fn claim(
        &self,
        pending: &PendingRequest,
        end_time: SystemTime,
        resources: &[Arc<TimingRecord>],
        cross_origin: bool,
    ) -> Option<ResourceSelection> {
        let mut state = self.lock();
        let selection = select_resources(
            &pending.url,
            pending.start_time,
            end_time,
            resources,
            &state.consumed,
            cross_origin,
        )?;
        state.consumed.insert(selection.main_request.id());
        if let Some(preflight) = &selection.cors_preflight {
            state.consumed.insert(preflight.id());
        }
        Some(selection)
    }

    /// Find the request's samples and write them onto `span`: a preflight
    /// child span and phase events, unless network events are ignored.
    pub fn annotate(
        &self,
        span: &mut BoxedSpan,
        pending: &PendingRequest,
        end_time: SystemTime,
        timeline: Option<&Arc<ResourceTimeline>>,
        cross_origin: bool,
    ) -> Option<ResourceSelection> {
        let mut resources = pending.take_buffered();
        if resources.is_empty() {
            resources = timeline?.entries();
        }

        let selection = self.claim(pending, end_time, &resources, cross_origin)?;
        if self.ignore_network_events {
            return Some(selection);
        }

        if let Some(preflight) = &selection.cors_preflight {
            self.record_preflight(span, preflight);
        }
        add_network_events(span, &selection.main_request);
        Some(selection)
    }

    fn record_preflight(&self, parent: &BoxedSpan, preflight: &TimingRecord) {
        let tracer = global::tracer(self.tracer_name.clone());
        let parent_cx = Context::new().with_remote_span_context(parent.span_context().clone());
        let mut child = tracer
            .span_builder(CORS_PREFLIGHT_SPAN)
            .with_start_time(preflight.fetch_start)
            .start_with_context(&tracer, &parent_cx);
        add_network_events(&mut child, preflight);
        child.end_with_timestamp(preflight.response_end);
    }
}
