//! Resource timing: the buffer of per-fetch phase samples and its observers.
//!
//! Samples reach the timeline independently of request completion (a
//! [`crate::ReqwestFetch`] records one when its body stream ends), so the
//! instrumentation never assumes a sample is present when a request settles.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::SystemTime;

use url::Url;

/// Default number of samples the timeline buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 250;

/// Initiator type of samples produced by fetch calls.
pub const FETCH_INITIATOR: &str = "fetch";

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Phase timestamps of one completed network fetch.
///
/// Phases the producer could not observe are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingRecord {
    id: u64,
    pub name: String,
    pub initiator_type: String,
    pub fetch_start: SystemTime,
    pub domain_lookup_start: Option<SystemTime>,
    pub domain_lookup_end: Option<SystemTime>,
    pub connect_start: Option<SystemTime>,
    pub secure_connection_start: Option<SystemTime>,
    pub connect_end: Option<SystemTime>,
    pub request_start: Option<SystemTime>,
    pub response_start: Option<SystemTime>,
    pub response_end: SystemTime,
    pub encoded_body_size: u64,
    pub decoded_body_size: u64,
}

impl TimingRecord {
    /// A sample spanning `fetch_start..response_end` with no intermediate phases.
    pub fn new(
        name: impl Into<String>,
        initiator_type: impl Into<String>,
        fetch_start: SystemTime,
        response_end: SystemTime,
    ) -> Self {
        Self {
            id: NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            initiator_type: initiator_type.into(),
            fetch_start,
            domain_lookup_start: None,
            domain_lookup_end: None,
            connect_start: None,
            secure_connection_start: None,
            connect_end: None,
            request_start: None,
            response_start: None,
            response_end,
            encoded_body_size: 0,
            decoded_body_size: 0,
        }
    }

    /// Identity of this sample. Clones share it.
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct ObserverState {
    url: String,
    initiator_type: String,
    connected: AtomicBool,
    entries: Mutex<Vec<Arc<TimingRecord>>>,
}

impl ObserverState {
    fn accepts(&self, record: &TimingRecord) -> bool {
        self.connected.load(Ordering::Acquire)
            && record.name == self.url
            && record.initiator_type.eq_ignore_ascii_case(&self.initiator_type)
    }
}

/// Buffers samples matching one URL and initiator type until disconnected.
pub struct ResourceObserver {
    state: Arc<ObserverState>,
}

impl ResourceObserver {
    /// Samples delivered so far, in arrival order.
    pub fn entries(&self) -> Vec<Arc<TimingRecord>> {
        self.state
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop receiving samples. Already buffered entries stay readable.
    pub fn disconnect(&self) {
        self.state.connected.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct TimelineInner {
    entries: Vec<Arc<TimingRecord>>,
    observers: Vec<Weak<ObserverState>>,
}

/// Process-wide resource-timing buffer.
pub struct ResourceTimeline {
    inner: Mutex<TimelineInner>,
    buffer_size: usize,
    observers_supported: bool,
}

impl ResourceTimeline {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            inner: Mutex::new(TimelineInner::default()),
            buffer_size,
            observers_supported: true,
        }
    }

    /// A timeline that only buffers: [`ResourceTimeline::observe`] always
    /// returns `None`, so consumers must scan [`ResourceTimeline::entries`].
    pub fn without_observers() -> Self {
        Self {
            observers_supported: false,
            ..Self::new()
        }
    }

    /// Add a sample: deliver it to matching observers and buffer it while
    /// there is room.
    pub fn record(&self, mut record: TimingRecord) -> Arc<TimingRecord> {
        if let Ok(url) = Url::parse(&record.name) {
            record.name = url.into();
        }
        let record = Arc::new(record);

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.observers.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                if observer.accepts(&record) {
                    observer
                        .entries
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(record.clone());
                }
                observer.connected.load(Ordering::Acquire)
            }
            None => false,
        });

        if inner.entries.len() < self.buffer_size {
            inner.entries.push(record.clone());
        } else {
            tracing::debug!(
                url = %record.name,
                buffer_size = self.buffer_size,
                "Resource timing buffer full, sample not buffered"
            );
        }
        record
    }

    /// Register an observer for samples with exactly this URL and initiator.
    pub fn observe(&self, url: &str, initiator_type: &str) -> Option<ResourceObserver> {
        if !self.observers_supported {
            return None;
        }
        let state = Arc::new(ObserverState {
            url: url.to_string(),
            initiator_type: initiator_type.to_string(),
            connected: AtomicBool::new(true),
            entries: Mutex::new(Vec::new()),
        });
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .push(Arc::downgrade(&state));
        Some(ResourceObserver { state })
    }

    /// Snapshot of the buffered samples, in insertion order.
    pub fn entries(&self) -> Vec<Arc<TimingRecord>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    /// Drop all buffered samples. Observers keep what they already received.
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResourceTimeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(url: &str, initiator: &str) -> TimingRecord {
        let start = SystemTime::now();
        TimingRecord::new(url, initiator, start, start + Duration::from_millis(5))
    }

    #[test]
    fn test_observer_receives_only_matching_samples() {
        let timeline = ResourceTimeline::new();
        let observer = timeline
            .observe("https://api.test/a", FETCH_INITIATOR)
            .unwrap();

        timeline.record(sample("https://api.test/a", "fetch"));
        timeline.record(sample("https://api.test/b", "fetch"));
        timeline.record(sample("https://api.test/a", "xmlhttprequest"));
        timeline.record(sample("https://api.test/a", "FETCH"));

        let entries = observer.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.name == "https://api.test/a"));
        assert_eq!(timeline.len(), 4);
    }

    #[test]
    fn test_disconnected_observer_stops_buffering() {
        let timeline = ResourceTimeline::new();
        let observer = timeline.observe("https://api.test/", FETCH_INITIATOR).unwrap();
        timeline.record(sample("https://api.test/", "fetch"));
        observer.disconnect();
        timeline.record(sample("https://api.test/", "fetch"));
        assert_eq!(observer.entries().len(), 1);
    }

    #[test]
    fn test_names_are_normalized() {
        let timeline = ResourceTimeline::new();
        let record = timeline.record(sample("https://API.test", "fetch"));
        assert_eq!(record.name, "https://api.test/");
    }

    #[test]
    fn test_full_buffer_still_notifies_observers() {
        let timeline = ResourceTimeline::with_buffer_size(1);
        let observer = timeline.observe("https://api.test/", FETCH_INITIATOR).unwrap();
        timeline.record(sample("https://api.test/", "fetch"));
        timeline.record(sample("https://api.test/", "fetch"));
        assert_eq!(timeline.len(), 1);
        assert_eq!(observer.entries().len(), 2);
    }

    #[test]
    fn test_without_observers_and_clear() {
        let timeline = ResourceTimeline::without_observers();
        assert!(timeline.observe("https://api.test/", FETCH_INITIATOR).is_none());
        timeline.record(sample("https://api.test/", "fetch"));
        assert!(!timeline.is_empty());
        timeline.clear();
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_record_ids_are_unique() {
        let a = sample("https://api.test/", "fetch");
        let b = sample("https://api.test/", "fetch");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }
}
