//! Metrics collection for observability

use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, register_int_gauge_with_registry, Counter, CounterVec,
    Encoder, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Metrics collector.
///
/// Each instance owns its registry; share it between components with `Arc`.
pub struct Metrics {
    registry: Registry,

    // Request pipeline metrics
    pub api_requests: CounterVec,
    pub api_retries: CounterVec,
    pub api_request_duration: HistogramVec,
    pub stream_events: CounterVec,
    pub response_cache_hits: Counter,

    // Context buffer metrics
    pub buffer_evictions: Counter,
    pub buffer_overflows: Counter,
    pub buffer_used_tokens: IntGauge,
    pub summarizations: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let api_requests = register_counter_vec_with_registry!(
            Opts::new("relay_api_requests_total", "Total LLM API calls"),
            &["operation", "outcome"],
            registry
        )?;

        let api_retries = register_counter_vec_with_registry!(
            Opts::new("relay_api_retries_total", "Retries scheduled by the retry policy"),
            &["cause"],
            registry
        )?;

        let api_request_duration = register_histogram_vec_with_registry!(
            "relay_api_request_duration_seconds",
            "LLM API call duration in seconds",
            &["operation"],
            registry
        )?;

        let stream_events = register_counter_vec_with_registry!(
            Opts::new("relay_stream_events_total", "Decoded stream events"),
            &["event"],
            registry
        )?;

        let response_cache_hits = register_counter_with_registry!(
            Opts::new("relay_response_cache_hits_total", "Single-shot responses served from cache"),
            registry
        )?;

        let buffer_evictions = register_counter_with_registry!(
            Opts::new("relay_buffer_evictions_total", "Context items evicted to make room"),
            registry
        )?;

        let buffer_overflows = register_counter_with_registry!(
            Opts::new("relay_buffer_overflows_total", "Items rejected with a context overflow"),
            registry
        )?;

        let buffer_used_tokens = register_int_gauge_with_registry!(
            Opts::new("relay_buffer_used_tokens", "Tokens currently held by the context buffer"),
            registry
        )?;

        let summarizations = register_counter_with_registry!(
            Opts::new("relay_summarizations_total", "Summarize-then-retry operations"),
            registry
        )?;

        Ok(Self {
            registry,
            api_requests,
            api_retries,
            api_request_duration,
            stream_events,
            response_cache_hits,
            buffer_evictions,
            buffer_overflows,
            buffer_used_tokens,
            summarizations,
        })
    }

    /// Get the registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
