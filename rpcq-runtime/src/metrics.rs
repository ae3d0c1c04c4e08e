//! Prometheus metrics for the RPC queue.
//!
//! [`Metrics`] is a [`StatsSink`], so it can be handed straight to the
//! queue processor. Rendering is left to the caller via [`Metrics::encode`].

use prometheus::{Counter, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use rpcq_history::{Direction, StatsSink};

/// Frame size histogram buckets (in bytes).
const SIZE_BUCKETS: &[f64] = &[
    64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 131072.0, 262144.0,
];

/// Prometheus metrics for one node.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Size of each dirty frame when its slot rolls, by direction.
    pub queue_size_bytes: HistogramVec,
    /// Inbound items dispatched to handlers.
    pub items_processed_total: Counter,
    /// Bytes handed to the transport.
    pub bytes_sent_total: Counter,
    /// Batches flushed to the transport.
    pub batches_sent_total: Counter,
    /// Internal messages dropped for outliving their lifetime.
    pub internal_messages_expired_total: Counter,
}

impl Metrics {
    /// Creates metrics under the `rpcq` namespace.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_namespace("rpcq")
    }

    /// Creates a new Metrics instance with all metrics registered.
    pub fn with_namespace(namespace: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let queue_size_bytes = HistogramVec::new(
            HistogramOpts::new("queue_size_bytes", "Frame size in bytes when its slot rolls")
                .namespace(namespace)
                .buckets(SIZE_BUCKETS.to_vec()),
            &["direction"],
        )?;
        registry.register(Box::new(queue_size_bytes.clone()))?;

        let items_processed_total = Counter::with_opts(
            Opts::new("items_processed_total", "Inbound items dispatched to handlers")
                .namespace(namespace),
        )?;
        registry.register(Box::new(items_processed_total.clone()))?;

        let bytes_sent_total = Counter::with_opts(
            Opts::new("bytes_sent_total", "Bytes handed to the transport").namespace(namespace),
        )?;
        registry.register(Box::new(bytes_sent_total.clone()))?;

        let batches_sent_total = Counter::with_opts(
            Opts::new("batches_sent_total", "Batches flushed to the transport")
                .namespace(namespace),
        )?;
        registry.register(Box::new(batches_sent_total.clone()))?;

        let internal_messages_expired_total = Counter::with_opts(
            Opts::new(
                "internal_messages_expired_total",
                "Internal messages dropped for outliving their lifetime",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(internal_messages_expired_total.clone()))?;

        Ok(Self {
            registry,
            queue_size_bytes,
            items_processed_total,
            bytes_sent_total,
            batches_sent_total,
            internal_messages_expired_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl StatsSink for Metrics {
    fn record_queue_size(&self, direction: Direction, bytes: usize) {
        self.queue_size_bytes
            .with_label_values(&[direction.as_str()])
            .observe(bytes as f64);
    }

    fn record_item_processed(&self) {
        self.items_processed_total.inc();
    }

    fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent_total.inc_by(bytes as f64);
    }

    fn record_batch_sent(&self) {
        self.batches_sent_total.inc();
    }

    fn record_internal_expired(&self) {
        self.internal_messages_expired_total.inc();
    }
}
