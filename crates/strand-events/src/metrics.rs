//! Cache gauges exposed in Prometheus text format.

use prometheus::{Encoder, IntGauge, Registry, TextEncoder};

use crate::error::{StreamError, StreamResult};

/// Gauges describing the stream cache, refreshed by each cleanup sweep.
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    registry: Registry,
    /// Streams in the cache.
    pub streams: IntGauge,
    /// Streams whose view is not in memory; -1 while eviction is disabled.
    pub unloaded: IntGauge,
    /// Streams hosted elsewhere.
    pub remote: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> StreamResult<Self> {
        let registry = Registry::new();
        let streams = gauge(&registry, "stream_cache_size", "Number of streams in the stream cache")?;
        let unloaded = gauge(
            &registry,
            "stream_cache_unloaded",
            "Number of streams in the stream cache with an unloaded view",
        )?;
        let remote = gauge(
            &registry,
            "stream_cache_remote",
            "Number of streams in the stream cache hosted on other nodes",
        )?;
        Ok(Self {
            registry,
            streams,
            unloaded,
            remote,
        })
    }

    /// Renders every gauge in the text exposition format.
    pub fn render(&self) -> StreamResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| StreamError::Internal(e.to_string()))
    }
}

fn gauge(registry: &Registry, name: &str, help: &str) -> StreamResult<IntGauge> {
    let gauge = IntGauge::new(name, help).map_err(metrics_error)?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(metrics_error)?;
    Ok(gauge)
}

fn metrics_error(e: prometheus::Error) -> StreamError {
    StreamError::Internal(format!("metrics: {e}"))
}
