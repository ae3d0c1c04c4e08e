//! # rpcq-runtime
//!
//! Runtime pieces around the rpcq queue engine.
//!
//! This crate provides:
//! - Configuration loaded from YAML with environment overrides
//! - Prometheus-backed queue statistics
//! - A batching transport adapter over a raw datagram/stream transport
//! - An in-memory network for simulations and tests
//! - The per-node tick pump

pub mod adapter;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod node;

pub use adapter::{BatchingTransport, RawTransport};
pub use config::{Config, ConfigError, InternalConfig, MetricsConfig, QueueConfig, TransportConfig};
pub use error::RuntimeError;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use metrics::Metrics;
pub use node::NetworkNode;

/// Default capacity of one per-(peer, channel) send queue (bytes).
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 64 * 1024;
