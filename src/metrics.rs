use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, register_counter, register_counter_vec, register_gauge,
    register_histogram,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("ensemble_requests_total", "Total number of generation requests")
            .expect("register ensemble_requests_total");
    pub static ref REQUEST_REJECTED: CounterVec = register_counter_vec!(
        "ensemble_requests_rejected_total",
        "Requests rejected before streaming, by reason",
        &["reason"]
    )
    .expect("register ensemble_requests_rejected_total");
    pub static ref MODEL_STREAMS: CounterVec = register_counter_vec!(
        "ensemble_model_streams_total",
        "Finished model instances, by outcome",
        &["outcome"]
    )
    .expect("register ensemble_model_streams_total");
    pub static ref STREAM_RETRIES: Counter =
        register_counter!("ensemble_stream_retries_total", "Provider stream retries")
            .expect("register ensemble_stream_retries_total");
    pub static ref SYNTHESIS_TOTAL: CounterVec = register_counter_vec!(
        "ensemble_synthesis_total",
        "Synthesis calls, by outcome",
        &["outcome"]
    )
    .expect("register ensemble_synthesis_total");
    pub static ref STORE_FAILURES: CounterVec = register_counter_vec!(
        "ensemble_store_failures_total",
        "Limiter or lock store errors that were failed open",
        &["store"]
    )
    .expect("register ensemble_store_failures_total");
    pub static ref ACTIVE_GENERATIONS: Gauge =
        register_gauge!("ensemble_active_generations", "Generations currently streaming")
            .expect("register ensemble_active_generations");
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "ensemble_request_latency_seconds",
        "Time from admission to the final event",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("register ensemble_request_latency_seconds");
}
