//! Per-node tick pump.

use crate::adapter::{BatchingTransport, RawTransport};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::metrics::Metrics;
use rpcq_core::{
    Clock, HandlerTable, QueueProcessor, StatsSink, Transport, TransportEvent,
};
use rpcq_protocol::PeerId;
use std::sync::Arc;
use tracing::{debug, info};

/// One network node: a queue processor fed from a raw transport.
///
/// Each [`tick`](Self::tick) drains transport events into the processor,
/// then runs every update stage, which ends with the send pass flushing the
/// adapter.
pub struct NetworkNode<R: RawTransport, H: HandlerTable> {
    processor: QueueProcessor<BatchingTransport<R>, H>,
    metrics: Option<Metrics>,
    ticks: u64,
}

impl<R: RawTransport, H: HandlerTable> NetworkNode<R, H> {
    pub fn new(config: &Config, local_peer: PeerId, raw: R, handlers: H) -> Result<Self, RuntimeError> {
        config.validate()?;

        let transport = BatchingTransport::new(
            raw,
            config.transport.send_queue_capacity,
            config.transport.max_receive_message(),
        );
        let mut processor =
            QueueProcessor::new(config.processor_config(local_peer), transport, handlers)?;

        let metrics = if config.metrics.enabled {
            let metrics = Metrics::with_namespace(&config.metrics.namespace)?;
            processor = processor.with_stats(Arc::new(metrics.clone()));
            Some(metrics)
        } else {
            None
        };

        info!(
            "Node {} ready ({})",
            local_peer,
            if processor.config().is_server() { "server" } else { "client" }
        );

        Ok(Self {
            processor,
            metrics,
            ticks: 0,
        })
    }

    /// Replaces the stats sink. Metrics created from the config stop
    /// receiving updates.
    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.processor = self.processor.with_stats(stats);
        self.metrics = None;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.processor = self.processor.with_clock(clock);
        self
    }

    pub fn local_peer(&self) -> PeerId {
        self.processor.config().local_peer
    }

    pub fn processor(&self) -> &QueueProcessor<BatchingTransport<R>, H> {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut QueueProcessor<BatchingTransport<R>, H> {
        &mut self.processor
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Marks `peer` as loaded so internal messages start flowing to it.
    pub fn mark_peer_ready(&mut self, peer: PeerId) -> bool {
        self.processor.peer_ready(peer)
    }

    /// Drains pending transport events. Returns how many were handled.
    pub fn poll_events(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.processor.transport_mut().poll_event() {
            handled += 1;
            match event {
                TransportEvent::Connected(peer) => self.processor.peer_connected(peer),
                TransportEvent::Disconnected(peer) => self.processor.peer_disconnected(peer),
                TransportEvent::Data {
                    peer,
                    channel,
                    payload,
                } => {
                    self.processor.receive(peer, channel, payload);
                }
            }
        }
        handled
    }

    /// Runs one network tick.
    pub fn tick(&mut self) {
        let events = self.poll_events();
        self.processor.run_tick();
        self.ticks += 1;
        if events > 0 {
            debug!("Tick {}: {} transport events", self.ticks, events);
        }
    }

    /// Flushes everything queued and stops the processor.
    pub fn shutdown(&mut self) {
        self.poll_events();
        self.processor.shutdown();
        info!("Node {} stopped after {} ticks", self.local_peer(), self.ticks);
    }
}
