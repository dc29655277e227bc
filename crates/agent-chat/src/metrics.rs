// agent-chat/crates/agent-chat/src/metrics.rs

use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::error;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_STREAMS: OnceLock<IntGauge> = OnceLock::new();
static TOOL_EXECUTIONS: OnceLock<IntCounterVec> = OnceLock::new();
static AGENT_ITERATIONS: OnceLock<Histogram> = OnceLock::new();
static CONVERSION_JOBS: OnceLock<IntCounterVec> = OnceLock::new();
static CONVERSION_QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .unwrap()
    });

    let active_streams = ACTIVE_STREAMS.get_or_init(|| {
        IntGauge::new("active_streams", "Chat streams currently in progress").unwrap()
    });

    let tool_executions = TOOL_EXECUTIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("tool_executions_total", "Tool executions by tool and outcome"),
            &["tool", "success"],
        )
        .unwrap()
    });

    let agent_iterations = AGENT_ITERATIONS.get_or_init(|| {
        Histogram::with_opts(
            prometheus::HistogramOpts::new("agent_iterations", "Model invocations per chat turn")
                .buckets(vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0, 50.0]),
        )
        .unwrap()
    });

    let conversion_jobs = CONVERSION_JOBS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("conversion_jobs_total", "Document conversion jobs by outcome"),
            &["outcome"],
        )
        .unwrap()
    });

    let conversion_queue_depth = CONVERSION_QUEUE_DEPTH.get_or_init(|| {
        IntGauge::new("conversion_queue_depth", "Conversion jobs waiting for a worker").unwrap()
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(active_streams.clone())).ok();
    REGISTRY.register(Box::new(tool_executions.clone())).ok();
    REGISTRY.register(Box::new(agent_iterations.clone())).ok();
    REGISTRY.register(Box::new(conversion_jobs.clone())).ok();
    REGISTRY.register(Box::new(conversion_queue_depth.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_streams() {
    if let Some(gauge) = ACTIVE_STREAMS.get() {
        gauge.inc();
    }
}

pub fn dec_streams() {
    if let Some(gauge) = ACTIVE_STREAMS.get() {
        gauge.dec();
    }
}

pub fn inc_tool_execution(tool: &str, success: bool) {
    if let Some(counter) = TOOL_EXECUTIONS.get() {
        counter
            .with_label_values(&[tool, if success { "true" } else { "false" }])
            .inc();
    }
}

/// Executions recorded under `tool`, across both outcomes.
#[cfg(test)]
pub(crate) fn tool_execution_count(tool: &str) -> u64 {
    REGISTRY
        .gather()
        .iter()
        .filter(|family| family.get_name() == "tool_executions_total")
        .flat_map(|family| family.get_metric())
        .filter(|metric| {
            metric
                .get_label()
                .iter()
                .any(|pair| pair.get_name() == "tool" && pair.get_value() == tool)
        })
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum()
}

pub fn observe_iterations(iterations: u32) {
    if let Some(histogram) = AGENT_ITERATIONS.get() {
        histogram.observe(iterations as f64);
    }
}

pub fn inc_conversion_job(outcome: &str) {
    if let Some(counter) = CONVERSION_JOBS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_conversion_queue() {
    if let Some(gauge) = CONVERSION_QUEUE_DEPTH.get() {
        gauge.inc();
    }
}

pub fn dec_conversion_queue() {
    if let Some(gauge) = CONVERSION_QUEUE_DEPTH.get() {
        gauge.dec();
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; version=0.0.4")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
