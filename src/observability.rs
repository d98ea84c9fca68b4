use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
static START_TIME: OnceCell<Instant> = OnceCell::new();

/// Install the process-wide Prometheus recorder. Safe to call more than once.
pub fn init() -> Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("adtrack_http_request_duration_seconds".into()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )
        .map_err(|err| anyhow!("failed to configure prometheus exporter: {err}"))?
        .set_buckets_for_metric(
            Matcher::Full("adtrack_buffer_flush_duration_seconds".into()),
            &[0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0],
        )
        .map_err(|err| anyhow!("failed to configure prometheus exporter: {err}"))?
        .set_buckets_for_metric(
            Matcher::Full("adtrack_buffer_flush_events".into()),
            &[1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0],
        )
        .map_err(|err| anyhow!("failed to configure prometheus exporter: {err}"))?;
    let handle = builder
        .install_recorder()
        .map_err(|err| anyhow!("failed to initialise prometheus recorder: {err}"))?;

    describe_counter!(
        "adtrack_events_received_total",
        "Total number of events received on the ingestion API."
    );
    describe_counter!(
        "adtrack_events_admitted_total",
        "Total number of events durably committed."
    );
    describe_counter!(
        "adtrack_events_duplicate_total",
        "Total number of events suppressed as duplicates."
    );
    describe_counter!(
        "adtrack_validation_errors_total",
        "Total number of events rejected by validation, by error kind."
    );
    describe_counter!(
        "adtrack_events_overloaded_total",
        "Total number of events turned away with a retryable overloaded status."
    );
    describe_histogram!(
        "adtrack_buffer_flush_duration_seconds",
        "Time from batch start to durable commit, including retries."
    );
    describe_histogram!(
        "adtrack_buffer_flush_events",
        "Number of events committed per batch."
    );
    describe_counter!(
        "adtrack_buffer_commit_failures_total",
        "Total number of failed batch commit attempts."
    );
    describe_gauge!(
        "adtrack_buffer_queue_depth",
        "Commands waiting in a partition's write-ahead queue."
    );
    describe_gauge!(
        "adtrack_aggregation_lag",
        "Committed events not yet folded into aggregates, per partition."
    );
    describe_gauge!(
        "adtrack_aggregation_checkpoint",
        "Last sequence folded into aggregates, per partition."
    );
    describe_gauge!(
        "adtrack_dedup_records",
        "Live records held by the deduplicator."
    );
    describe_counter!(
        "adtrack_http_requests_total",
        "HTTP requests by route template and status class."
    );
    describe_histogram!(
        "adtrack_http_request_duration_seconds",
        "HTTP request latency by route template."
    );

    let _ = PROMETHEUS_HANDLE.set(handle);
    let _ = START_TIME.set(Instant::now());
    Ok(())
}

/// `GET /metrics` on the metrics listener
pub async fn metrics_handler() -> Response {
    match try_render_metrics() {
        Some(body) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

/// Route label: the matched route template, so ids in paths
/// (`/campaigns/:campaign_id/aggregates`) never become label values
fn route_label(req: &Request<Body>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned())
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        200..=299 => "2xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

/// Per-route request count and latency; applied as a route layer
pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let route = route_label(&req);
    let started = Instant::now();
    let response = next.run(req).await;
    let status = status_class(response.status());

    counter!("adtrack_http_requests_total", 1, "route" => route.clone(), "status" => status);
    histogram!(
        "adtrack_http_request_duration_seconds",
        started.elapsed().as_secs_f64(),
        "route" => route
    );

    response
}

pub fn record_received(count: usize) {
    counter!("adtrack_events_received_total", count as u64);
}

pub fn record_duplicate() {
    counter!("adtrack_events_duplicate_total", 1);
}

pub fn record_validation_error(kind: &str) {
    counter!("adtrack_validation_errors_total", 1, "kind" => kind.to_owned());
}

pub fn record_overloaded() {
    counter!("adtrack_events_overloaded_total", 1);
}

pub fn record_flush(partition: u32, committed: usize, elapsed: Duration) {
    let partition = partition.to_string();
    counter!("adtrack_events_admitted_total", committed as u64);
    histogram!(
        "adtrack_buffer_flush_duration_seconds",
        elapsed.as_secs_f64(),
        "partition" => partition.clone()
    );
    histogram!(
        "adtrack_buffer_flush_events",
        committed as f64,
        "partition" => partition
    );
}

pub fn record_commit_failure(partition: u32) {
    counter!(
        "adtrack_buffer_commit_failures_total",
        1,
        "partition" => partition.to_string()
    );
}

pub fn set_queue_depth(partition: u32, depth: usize) {
    gauge!(
        "adtrack_buffer_queue_depth",
        depth as f64,
        "partition" => partition.to_string()
    );
}

pub fn set_aggregation_progress(partition: u32, checkpoint: u64, lag: u64) {
    let partition = partition.to_string();
    gauge!(
        "adtrack_aggregation_checkpoint",
        checkpoint as f64,
        "partition" => partition.clone()
    );
    gauge!("adtrack_aggregation_lag", lag as f64, "partition" => partition);
}

pub fn set_dedup_records(records: usize) {
    gauge!("adtrack_dedup_records", records as f64);
}

/// Prometheus text exposition; empty before `init`
pub fn render_metrics() -> String {
    try_render_metrics().unwrap_or_default()
}

fn try_render_metrics() -> Option<String> {
    let mut body = PROMETHEUS_HANDLE.get()?.render();
    if let Some(start) = START_TIME.get() {
        body.push_str(&format!(
            "# TYPE adtrack_uptime_seconds gauge\nadtrack_uptime_seconds {}\n",
            start.elapsed().as_secs_f64()
        ));
    }
    Some(body)
}
