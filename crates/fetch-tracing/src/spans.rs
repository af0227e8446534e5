//! Span builder helpers for fetch-probe instrumentation.

/// Create a tracing span for one probe run.
///
/// Usage: `let _span = probe_run_span!(target_count).entered();`
///
/// Fields recorded once every request has settled:
/// - `failed`: number of targets whose request or body read failed
/// - `total_duration_ms`: milliseconds from the first request to idle
#[macro_export]
macro_rules! probe_run_span {
    ($target_count:expr) => {
        tracing::info_span!(
            "probe_run",
            target_count = $target_count,
            failed = tracing::field::Empty,
            total_duration_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span around a single probed target.
///
/// Instrumented fetch spans started inside it use it as their parent when the
/// OpenTelemetry layer is installed.
#[macro_export]
macro_rules! probe_target_span {
    ($method:expr, $url:expr) => {
        tracing::info_span!(
            "probe_target",
            method = %$method,
            url = %$url,
            status = tracing::field::Empty,
            body_bytes = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
