//! OTLP tracing bootstrap shared by fetch-instrumented services.
//!
//! Besides the subscriber stack, [`init_tracing`] installs the SDK tracer
//! provider and the W3C trace-context propagator globally, which is where
//! `fetch-instrumentation` looks them up.

pub mod config;
pub mod otlp;
pub mod spans;

pub use config::{OtlpProtocol, TracingConfig};
pub use otlp::{init_tracing, TracingGuard};
