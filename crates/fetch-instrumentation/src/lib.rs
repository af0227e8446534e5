//! Automatic OpenTelemetry spans for requests issued through a scope's
//! `fetch` capability, with resource-timing correlation.

pub mod attributes;
pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod fetch;
pub mod hooks;
pub mod interception;
pub mod lifecycle;
pub mod propagation;
pub mod timing;

pub use client::ReqwestFetch;
pub use config::{InstrumentationConfig, UrlPattern};
pub use error::{FetchError, InstrumentationError};
pub use fetch::{
    Fetch, FetchFuture, FetchRequest, FetchResponse, GlobalScope, HeadersInit, RequestInit,
    RequestInput, ResponseBody, FETCH,
};
pub use hooks::{FetchOutcome, RequestHook, ResponseHook};
pub use interception::FetchInstrumentation;
pub use timing::{ResourceTimeline, TimingRecord};
