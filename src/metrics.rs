//! Prometheus metrics

use axum::{body::Body, http::Request, response::Response};
use lazy_static::lazy_static;
use prometheus::{self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).unwrap();
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).unwrap();
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &[],
    ).unwrap();
    // Submissions by application and whether a new request was created
    pub static ref SUBMITTED_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("submitted_requests", "The number of request submissions"),
        &["application", "created"]
    ).unwrap();
    // Chunk units placed on the queue
    pub static ref DISPATCHED_CHUNKS: IntCounterVec = IntCounterVec::new(
        Opts::new("dispatched_chunks", "The number of chunk units dispatched"),
        &["application"]
    ).unwrap();
    // Chunk units processed, by outcome
    pub static ref PROCESSED_CHUNKS: IntCounterVec = IntCounterVec::new(
        Opts::new("processed_chunks", "The number of chunk units processed"),
        &["application", "outcome"]
    ).unwrap();
    // Requests reaching a terminal status
    pub static ref FINISHED_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("finished_requests", "The number of requests finished"),
        &["application", "status"]
    ).unwrap();
    // Chunk processing time
    pub static ref CHUNK_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("chunk_time", "The time taken to process each chunk unit"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &["application"],
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(INCOMING_REQUESTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_CODE_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_TIME_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SUBMITTED_REQUESTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DISPATCHED_CHUNKS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PROCESSED_CHUNKS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FINISHED_REQUESTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHUNK_TIME_COLLECTOR.clone()))
        .unwrap();
}

pub async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    encoder.encode(&REGISTRY.gather(), &mut buffer).unwrap();

    String::from_utf8(buffer).unwrap()
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}
