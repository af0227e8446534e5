//! fetch-probe: issues the configured requests through an instrumented fetch
//! scope, waits for every span to finalize, and reports what it saw.

mod config;
mod stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use fetch_instrumentation::{
    FetchInstrumentation, GlobalScope, ReqwestFetch, RequestInit, ResourceTimeline,
};
use http::Method;
use tokio::task::JoinSet;
use tracing::Instrument;
use url::Url;

use config::ProbeConfig;
use stats::ProbeStats;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // Determine config path
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        // Fall back to positional arg
        .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
        .or_else(|| std::env::var("FETCH_PROBE_CONFIG").ok())
        .unwrap_or_else(|| "fetch-probe.toml".to_string());

    let extra_targets: Vec<String> = args
        .windows(2)
        .filter(|pair| pair[0] == "--url")
        .map(|pair| pair[1].clone())
        .collect();

    let mut config = ProbeConfig::load(&config_path)?;
    config.probe.targets.extend(extra_targets);

    // Build the tokio runtime first: the tonic gRPC exporter needs a reactor context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Initialize tracing (OTLP export is optional and falls back to fmt-only)
        let tracing_guard = fetch_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            targets = config.probe.targets.len(),
            method = %config.probe.method,
            exporting = tracing_guard.is_exporting(),
            "Starting fetch-probe"
        );

        run(config).await
    })
}

async fn run(config: ProbeConfig) -> anyhow::Result<()> {
    if config.probe.targets.is_empty() {
        anyhow::bail!("no targets configured: set probe.targets or pass --url");
    }
    let method = Method::from_bytes(config.probe.method.to_uppercase().as_bytes())?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.probe.timeout_secs))
        .build()?;

    // The client reports timing samples into the same timeline the
    // instrumentation correlates against.
    let timeline = Arc::new(ResourceTimeline::new());
    let mut fetch = ReqwestFetch::new(client).with_timeline(timeline.clone());
    if let Some(origin) = config.instrumentation.origin.as_deref() {
        fetch = fetch.with_origin(Url::parse(origin)?);
    }
    let scope = Arc::new(
        GlobalScope::new("probe")
            .with_fetch(fetch)
            .with_performance(timeline),
    );

    let instrumentation = FetchInstrumentation::new(scope.clone(), config.instrumentation.clone())?;
    instrumentation.enable();

    let stats = ProbeStats::new();
    let run_span = fetch_tracing::probe_run_span!(config.probe.targets.len());
    let started = Instant::now();

    let mut tasks = JoinSet::new();
    for target in &config.probe.targets {
        let span = run_span.in_scope(|| fetch_tracing::probe_target_span!(method, target));
        tasks.spawn(
            probe_target(scope.clone(), method.clone(), target.clone(), stats.clone())
                .instrument(span),
        );
    }
    while let Some(result) = tasks.join_next().await {
        result?;
    }

    instrumentation.wait_idle().await;
    instrumentation.disable();

    let snapshot = stats.snapshot();
    run_span.record("failed", snapshot.failures);
    run_span.record("total_duration_ms", started.elapsed().as_millis() as u64);
    tracing::info!(
        stats = %serde_json::to_string(&snapshot)?,
        "Probe finished"
    );
    Ok(())
}

async fn probe_target(scope: Arc<GlobalScope>, method: Method, target: String, stats: ProbeStats) {
    let started = Instant::now();
    let current = tracing::Span::current();
    stats.inc_requests();

    match scope.fetch(target.as_str(), Some(RequestInit::method(method))).await {
        Ok(response) => {
            let status = response.status;
            current.record("status", status.as_u16());
            match response.bytes().await {
                Ok(body) => {
                    stats.add_body_bytes(body.len() as u64);
                    current.record("body_bytes", body.len() as u64);
                    if !status.is_success() {
                        stats.inc_failures();
                    }
                    tracing::info!(url = %target, status = status.as_u16(), "Target responded");
                }
                Err(e) => {
                    stats.inc_failures();
                    tracing::warn!(url = %target, error = %e, "Reading response body failed");
                }
            }
        }
        Err(e) => {
            stats.inc_failures();
            tracing::warn!(
                url = %target,
                error_name = e.name(),
                error = %e,
                "Request failed"
            );
        }
    }

    current.record("latency_ms", started.elapsed().as_millis() as u64);
}
