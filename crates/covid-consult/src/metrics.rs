//! Prometheus metrics exposed on `/metrics`.
//!
//! Collectors are created once by [`init_metrics`]; the recording helpers are
//! no-ops until then, so library callers and tests never need a registry.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static TURN_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static RETRY_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static EXTRACTION_FAILURES: OnceLock<IntCounter> = OnceLock::new();
static RETRIEVAL_SECONDS: OnceLock<Histogram> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .expect("valid requests_total definition")
    });

    let turn_counter = TURN_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("consultation_turns_total", "Consultation turns by outcome"),
            &["status"],
        )
        .expect("valid consultation_turns_total definition")
    });

    let retry_counter = RETRY_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("upstream_retries_total", "Retried calls per operation"),
            &["operation"],
        )
        .expect("valid upstream_retries_total definition")
    });

    let extraction_failures = EXTRACTION_FAILURES.get_or_init(|| {
        IntCounter::new(
            "profile_extraction_failures_total",
            "Turns whose profile extraction was skipped",
        )
        .expect("valid profile_extraction_failures_total definition")
    });

    let retrieval_seconds = RETRIEVAL_SECONDS.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "retrieval_seconds",
            "Time spent embedding the question and searching the index",
        ))
        .expect("valid retrieval_seconds definition")
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(turn_counter.clone())).ok();
    REGISTRY.register(Box::new(retry_counter.clone())).ok();
    REGISTRY.register(Box::new(extraction_failures.clone())).ok();
    REGISTRY.register(Box::new(retrieval_seconds.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_turn(status: &str) {
    if let Some(counter) = TURN_COUNTER.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn inc_retry(operation: &str) {
    if let Some(counter) = RETRY_COUNTER.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn inc_extraction_failure() {
    if let Some(counter) = EXTRACTION_FAILURES.get() {
        counter.inc();
    }
}

pub fn observe_retrieval(seconds: f64) {
    if let Some(histogram) = RETRIEVAL_SECONDS.get() {
        histogram.observe(seconds);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            e.to_string().into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
