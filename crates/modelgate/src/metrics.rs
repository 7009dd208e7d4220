// crates/modelgate/src/metrics.rs
use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::error;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static LOAD_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static DOWNLOAD_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static EVICTIONS: OnceLock<IntCounter> = OnceLock::new();
static RESIDENT_INSTANCES: OnceLock<IntGauge> = OnceLock::new();
static LOAD_DURATION: OnceLock<Histogram> = OnceLock::new();

fn install<T>(cell: &OnceLock<T>, built: prometheus::Result<T>)
where
    T: Collector + Clone + 'static,
{
    match built {
        Ok(metric) => {
            if cell.set(metric.clone()).is_ok() {
                REGISTRY.register(Box::new(metric)).ok();
            }
        }
        Err(e) => error!("Failed to create metric: {}", e),
    }
}

pub fn init_metrics() {
    install(
        &REQ_COUNTER,
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        ),
    );
    install(
        &LOAD_COUNTER,
        IntCounterVec::new(
            prometheus::opts!("model_loads_total", "Model loads by outcome"),
            &["outcome"],
        ),
    );
    install(
        &DOWNLOAD_COUNTER,
        IntCounterVec::new(
            prometheus::opts!("model_downloads_total", "Model downloads by outcome"),
            &["outcome"],
        ),
    );
    install(
        &EVICTIONS,
        IntCounter::new("model_evictions_total", "Instances evicted to make room"),
    );
    install(
        &RESIDENT_INSTANCES,
        IntGauge::new("resident_instances", "Instances currently serving"),
    );
    install(
        &LOAD_DURATION,
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "model_load_duration_seconds",
                "Time from first request to a serving instance",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
        ),
    );
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_load(outcome: &str) {
    if let Some(counter) = LOAD_COUNTER.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_download(outcome: &str) {
    if let Some(counter) = DOWNLOAD_COUNTER.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_eviction() {
    if let Some(counter) = EVICTIONS.get() {
        counter.inc();
    }
}

pub fn set_resident_instances(count: usize) {
    if let Some(gauge) = RESIDENT_INSTANCES.get() {
        gauge.set(count as i64);
    }
}

pub fn observe_load_duration(seconds: f64) {
    if let Some(histogram) = LOAD_DURATION.get() {
        histogram.observe(seconds);
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
