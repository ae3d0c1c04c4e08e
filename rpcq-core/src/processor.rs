//! The queue processor.
//!
//! Ties the frame history, the batcher, the internal message queue and the
//! collaborators together. One processor runs per network node and is driven
//! once per update stage per tick:
//!
//! ```text
//! network_update(stage)
//!   ├── process_receive_queue(stage)   dispatch inbound items for the stage
//!   │     └── (last stage) advance the inbound slot
//!   └── (send stage) process_send_queue()
//!         ├── RPC items, in write order, per target
//!         ├── internal messages for ready peers
//!         ├── remaining batches
//!         └── advance the outbound slot
//! ```

use crate::batcher::Batcher;
use crate::clock::{Clock, SystemClock};
use crate::error::CoreError;
use crate::handler::{CallContext, HandlerTable};
use crate::internal::InternalMessageQueue;
use crate::peers::PeerDirectory;
use crate::transport::Transport;
use crate::writer::RpcWriter;
use crate::{DEFAULT_BATCH_THRESHOLD, DEFAULT_INTERNAL_LIFETIME, SERVER_PEER_ID};
use bytes::Bytes;
use rpcq_history::{
    Direction, FrameHistoryTable, HistoryConfig, NullStats, SlotTarget, StatsSink,
};
use rpcq_protocol::{
    Channel, ItemFlags, ItemHeader, ItemKind, MessageHeader, PeerId, UpdateStage,
    MESSAGE_HEADER_SIZE,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub history: HistoryConfig,
    /// Coalesce outbound messages per (peer, channel). Both ends must agree.
    pub batching_enabled: bool,
    /// Stream size that triggers an early flush (bytes).
    pub batch_threshold: usize,
    /// How long an internal message is retried before it is dropped.
    pub internal_lifetime: Duration,
    /// Peer id of this node.
    pub local_peer: PeerId,
    /// Peer id that server RPCs without explicit targets go to.
    pub server_peer: PeerId,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            history: HistoryConfig::default(),
            batching_enabled: true,
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            internal_lifetime: DEFAULT_INTERNAL_LIFETIME,
            local_peer: SERVER_PEER_ID,
            server_peer: SERVER_PEER_ID,
        }
    }
}

impl ProcessorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching_enabled = enabled;
        self
    }

    pub fn with_batch_threshold(mut self, threshold: usize) -> Self {
        self.batch_threshold = threshold;
        self
    }

    pub fn with_internal_lifetime(mut self, lifetime: Duration) -> Self {
        self.internal_lifetime = lifetime;
        self
    }

    pub fn with_local_peer(mut self, peer: PeerId) -> Self {
        self.local_peer = peer;
        self
    }

    pub fn with_server_peer(mut self, peer: PeerId) -> Self {
        self.server_peer = peer;
        self
    }

    pub fn is_server(&self) -> bool {
        self.local_peer == self.server_peer
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.history.validate()?;
        if self.internal_lifetime.is_zero() {
            return Err(CoreError::InvalidConfig(
                "internal message lifetime must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Routes outbound messages either straight to the transport or through
/// the batcher.
struct Outlet<'a, T: Transport> {
    batcher: &'a mut Batcher,
    transport: &'a mut T,
    stats: &'a dyn StatsSink,
    /// `None` when batching is disabled.
    threshold: Option<usize>,
}

impl<T: Transport> Outlet<'_, T> {
    fn send(&mut self, peer: PeerId, channel: Channel, message: &[u8]) {
        match self.threshold {
            Some(threshold) => {
                self.batcher.queue_item(peer, channel, message);
                let transport = &mut *self.transport;
                let stats = self.stats;
                self.batcher
                    .send_if_over_threshold(threshold, |p, c, batch| {
                        deliver(transport, stats, p, c, batch, true)
                    });
            }
            None => deliver(self.transport, self.stats, peer, channel, message, false),
        }
    }

    fn flush(&mut self) {
        if self.threshold.is_some() {
            let transport = &mut *self.transport;
            let stats = self.stats;
            self.batcher
                .send_all(|p, c, batch| deliver(transport, stats, p, c, batch, true));
        }
        self.transport.flush();
    }
}

fn deliver<T: Transport>(
    transport: &mut T,
    stats: &dyn StatsSink,
    peer: PeerId,
    channel: Channel,
    bytes: &[u8],
    batched: bool,
) {
    transport.send(peer, bytes, channel);
    stats.record_bytes_sent(bytes.len());
    if batched {
        stats.record_batch_sent();
    }
}

/// RPC queue processor for one network node.
pub struct QueueProcessor<T: Transport, H: HandlerTable> {
    config: ProcessorConfig,
    /// `None` once shut down.
    table: Option<FrameHistoryTable>,
    batcher: Batcher,
    internal: InternalMessageQueue,
    peers: PeerDirectory,
    transport: T,
    handlers: H,
    stats: Arc<dyn StatsSink>,
    clock: Arc<dyn Clock>,
    /// An inbound item was dispatched since the last inbound advance.
    inbound_seen: bool,
    route_buf: Vec<PeerId>,
    loopback_scratch: Vec<u8>,
}

impl<T: Transport, H: HandlerTable> QueueProcessor<T, H> {
    pub fn new(config: ProcessorConfig, transport: T, handlers: H) -> Result<Self, CoreError> {
        config.validate()?;
        let table = FrameHistoryTable::new(config.history.clone())?;
        let internal = InternalMessageQueue::new(config.internal_lifetime);

        info!(
            "RPC queue initialized (peer {}, depth {}, batching {})",
            config.local_peer,
            config.history.depth,
            if config.batching_enabled { "on" } else { "off" }
        );

        Ok(Self {
            config,
            table: Some(table),
            batcher: Batcher::new(),
            internal,
            peers: PeerDirectory::new(),
            transport,
            handlers,
            stats: Arc::new(NullStats),
            clock: Arc::new(SystemClock::new()),
            inbound_seen: false,
            route_buf: Vec::new(),
            loopback_scratch: Vec::new(),
        })
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.table.is_some()
    }

    pub fn table(&self) -> Option<&FrameHistoryTable> {
        self.table.as_ref()
    }

    pub fn frames_processed(&self, direction: Direction) -> u64 {
        self.table
            .as_ref()
            .map_or(0, |table| table.frames_processed(direction))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn handlers(&self) -> &H {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut H {
        &mut self.handlers
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// Internal messages still waiting for their targets.
    pub fn internal_len(&self) -> usize {
        self.internal.len()
    }

    fn now(&self) -> Duration {
        self.clock.now()
    }

    // Writing

    /// Opens an RPC for writing its arguments.
    ///
    /// A server RPC with no targets goes to the server peer. Targets equal to
    /// the local peer are delivered in-process. Logs and returns `None` when
    /// the queue is shut down or nothing would receive the RPC.
    pub fn begin_rpc(
        &mut self,
        kind: ItemKind,
        channel: Channel,
        targets: &[PeerId],
        stage: UpdateStage,
        method_id: u64,
    ) -> Option<RpcWriter<'_>> {
        match self.try_begin_rpc(kind, channel, targets, stage, method_id) {
            Ok(writer) => Some(writer),
            Err(CoreError::NotInitialized) => {
                error!("Cannot queue RPC {:#x}: RPC queue is not initialized", method_id);
                None
            }
            Err(e) => {
                warn!("Cannot queue RPC {:#x}: {}", method_id, e);
                None
            }
        }
    }

    fn try_begin_rpc(
        &mut self,
        kind: ItemKind,
        channel: Channel,
        targets: &[PeerId],
        stage: UpdateStage,
        method_id: u64,
    ) -> Result<RpcWriter<'_>, CoreError> {
        let timestamp = self.now().as_secs_f32();
        let table = self.table.as_mut().ok_or(CoreError::NotInitialized)?;

        let requested: &[PeerId] = if targets.is_empty() && kind == ItemKind::ServerRpc {
            std::slice::from_ref(&self.config.server_peer)
        } else {
            targets
        };

        let local = self.config.local_peer;
        let mut loopback = false;
        self.route_buf.clear();
        for &peer in requested {
            if peer == local {
                loopback = true;
            } else {
                self.route_buf.push(peer);
            }
        }

        let header = ItemHeader::new(kind, local, timestamp);
        let message = MessageHeader::new(kind, stage, method_id);

        if self.route_buf.is_empty() {
            if !loopback {
                return Err(CoreError::NoTargets);
            }
            return RpcWriter::local(table, &mut self.loopback_scratch, header, message);
        }

        RpcWriter::outbound(
            table,
            &mut self.loopback_scratch,
            header,
            channel,
            &self.route_buf,
            message,
            loopback,
        )
    }

    /// Queues an RPC whose arguments are already serialized.
    ///
    /// Returns the message length in bytes.
    pub fn queue_rpc(
        &mut self,
        kind: ItemKind,
        channel: Channel,
        targets: &[PeerId],
        stage: UpdateStage,
        method_id: u64,
        args: &[u8],
    ) -> Result<usize, CoreError> {
        let mut writer = self.try_begin_rpc(kind, channel, targets, stage, method_id)?;
        writer.write_bytes(args);
        writer.finish()
    }

    /// Queues a lifecycle message that waits until each target is ready.
    pub fn queue_internal(
        &mut self,
        kind: ItemKind,
        channel: Channel,
        targets: &[PeerId],
        stage: UpdateStage,
        method_id: u64,
        args: &[u8],
    ) -> Result<(), CoreError> {
        if self.table.is_none() {
            return Err(CoreError::NotInitialized);
        }
        if targets.is_empty() {
            return Err(CoreError::NoTargets);
        }
        let message = MessageHeader::new(kind, stage, method_id).encode_message(args);
        let now = self.now();
        self.internal.push(kind, channel, message, targets, now);
        Ok(())
    }

    // Receiving

    /// Accepts a transport payload from `peer`.
    ///
    /// With batching enabled the payload is split into its records first.
    /// Each message is copied into the current inbound frame for its stage.
    /// Returns the number of messages queued.
    pub fn receive(&mut self, peer: PeerId, channel: Channel, payload: Bytes) -> usize {
        if self.table.is_none() {
            error!("Dropping data from peer {}: RPC queue is not initialized", peer);
            return 0;
        }

        if !self.config.batching_enabled {
            return usize::from(self.enqueue_inbound(peer, channel, &payload));
        }

        match Batcher::receive_items(&payload) {
            Ok(messages) => messages
                .iter()
                .filter(|message| self.enqueue_inbound(peer, channel, message))
                .count(),
            Err(e) => {
                warn!("Dropping malformed batch from peer {}: {}", peer, e);
                0
            }
        }
    }

    fn enqueue_inbound(&mut self, peer: PeerId, channel: Channel, message: &[u8]) -> bool {
        let Some(table) = self.table.as_mut() else {
            return false;
        };

        let routing = match MessageHeader::peek(message) {
            Ok(routing) => routing,
            Err(e) => {
                warn!("Dropping message from peer {} on {}: {}", peer, channel, e);
                return false;
            }
        };

        let mut flags = ItemFlags::new();
        if routing.kind.is_lifecycle() {
            flags = flags.with_internal();
        }
        let timestamp = self.clock.now().as_secs_f32();
        let header = ItemHeader::new(routing.kind, peer, timestamp).with_flags(flags);

        let frame = table.inbound_mut(routing.stage, SlotTarget::Current);
        match frame.push_inbound(&header, message, MESSAGE_HEADER_SIZE) {
            Ok(_) => true,
            Err(e) => {
                warn!("Dropping message from peer {} for {}: {}", peer, routing.stage, e);
                false
            }
        }
    }

    /// Dispatches every inbound item queued for `stage`.
    ///
    /// Handler failures are logged and do not stop the pass. On the last
    /// stage of the tick the inbound slot advances. Returns the number of
    /// items dispatched.
    pub fn process_receive_queue(&mut self, stage: UpdateStage) -> usize {
        let Some(table) = self.table.as_mut() else {
            error!("Cannot process {} receive queue: RPC queue is not initialized", stage);
            return 0;
        };

        let frame = table.inbound_mut(stage, SlotTarget::Current);
        let mut dispatched = 0;

        if frame.is_dirty() {
            let mut first = true;
            loop {
                let item = if first {
                    frame.first_item()
                } else {
                    frame.next_item()
                };
                first = false;
                let Some(item) = item else {
                    break;
                };

                dispatched += 1;
                self.stats.record_item_processed();

                let ctx = CallContext {
                    sender: item.sender,
                    kind: item.kind,
                    stage,
                    timestamp: item.timestamp,
                    loopback: item.flags.is_loopback(),
                };
                let result = MessageHeader::peek(item.payload)
                    .map_err(CoreError::from)
                    .and_then(|routing| {
                        let mut reader = item.reader();
                        self.handlers.invoke(routing.method_id, &mut reader, &ctx)
                    });
                if let Err(e) = result {
                    warn!(
                        "{:?} from peer {} failed at {}: {}",
                        item.kind, item.sender, stage, e
                    );
                }
            }
            frame.close();
            if frame.has_loopback_data() {
                frame.clear_loopback_data();
            }
        }

        if dispatched > 0 {
            self.inbound_seen = true;
        }
        if stage.is_send_stage() {
            self.advance_inbound_if_needed();
        }
        dispatched
    }

    fn advance_inbound_if_needed(&mut self) -> bool {
        let Some(table) = self.table.as_mut() else {
            return false;
        };
        let needed = self.inbound_seen || table.has_pending_loopback(Direction::Inbound);
        self.inbound_seen = false;
        if needed {
            table.advance(Direction::Inbound, self.stats.as_ref());
        }
        needed
    }

    // Sending

    /// Sends every queued RPC, then internal messages, then flushes batches.
    ///
    /// Returns the number of RPC items sent.
    pub fn process_send_queue(&mut self) -> usize {
        let Some(table) = self.table.as_mut() else {
            error!("Cannot process send queue: RPC queue is not initialized");
            return 0;
        };

        let threshold = self
            .config
            .batching_enabled
            .then_some(self.config.batch_threshold);
        let mut outlet = Outlet {
            batcher: &mut self.batcher,
            transport: &mut self.transport,
            stats: self.stats.as_ref(),
            threshold,
        };

        let frame = table.outbound_mut(SlotTarget::Current);
        let mut seen = 0;
        if frame.is_dirty() {
            let mut first = true;
            loop {
                let item = if first {
                    frame.first_item()
                } else {
                    frame.next_item()
                };
                first = false;
                let Some(item) = item else {
                    break;
                };

                seen += 1;
                let channel = item.channel.unwrap_or(Channel::ReliableRpc);
                for &peer in item.targets {
                    outlet.send(peer, channel, item.payload);
                }
            }
            frame.close();
        }

        let now = self.clock.now();
        let report = self
            .internal
            .send_pass(now, &self.peers, |peer, channel, message| {
                outlet.send(peer, channel, message)
            });
        for _ in 0..report.expired {
            self.stats.record_internal_expired();
        }
        let internal = &self.internal;
        self.peers.prune_departed(|peer| internal.targets(peer));
        if report.sent > 0 || report.expired > 0 {
            debug!(
                "Internal pass: {} sent, {} completed, {} expired",
                report.sent, report.completed, report.expired
            );
        }

        outlet.flush();

        if seen > 0 {
            table.advance(Direction::Outbound, self.stats.as_ref());
        }
        seen
    }

    /// Runs the work for one update stage.
    pub fn network_update(&mut self, stage: UpdateStage) {
        self.process_receive_queue(stage);
        if stage.is_send_stage() {
            self.process_send_queue();
        }
    }

    /// Runs every update stage in order.
    pub fn run_tick(&mut self) {
        for stage in UpdateStage::ALL {
            self.network_update(stage);
        }
    }

    // Peers

    pub fn peer_connected(&mut self, peer: PeerId) {
        debug!("Peer {} connected", peer);
        self.peers.connect(peer);
    }

    /// Marks a peer as able to receive internal messages.
    pub fn peer_ready(&mut self, peer: PeerId) -> bool {
        let ready = self.peers.mark_ready(peer);
        if !ready {
            warn!("Cannot mark unknown peer {} as ready", peer);
        }
        ready
    }

    pub fn peer_disconnected(&mut self, peer: PeerId) {
        let dropped = self.batcher.drop_peer(peer);
        self.peers.disconnect(peer);
        debug!("Peer {} disconnected ({} batched bytes dropped)", peer, dropped);
    }

    /// Sends everything still queued and releases the frame history.
    ///
    /// Later calls log and do nothing.
    pub fn shutdown(&mut self) {
        if self.table.is_none() {
            warn!("RPC queue already shut down");
            return;
        }

        self.process_send_queue();

        let threshold = self
            .config
            .batching_enabled
            .then_some(self.config.batch_threshold);
        let mut outlet = Outlet {
            batcher: &mut self.batcher,
            transport: &mut self.transport,
            stats: self.stats.as_ref(),
            threshold,
        };
        let flushed = self
            .internal
            .flush(&self.peers, |peer, channel, message| {
                outlet.send(peer, channel, message)
            });
        outlet.flush();

        self.table = None;
        self.inbound_seen = false;
        info!("RPC queue shut down ({} internal messages flushed)", flushed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rpcq_protocol::WireReader;

    type Sent = Vec<(PeerId, Channel, Vec<u8>)>;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Sent,
        flushes: usize,
    }

    impl Transport for RecordingTransport {
        fn send(&mut self, peer: PeerId, payload: &[u8], channel: Channel) {
            self.sent.push((peer, channel, payload.to_vec()));
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        method_id: u64,
        sender: PeerId,
        stage: UpdateStage,
        args: Vec<u8>,
        loopback: bool,
    }

    /// Records every call. Method 0xBAD always fails.
    #[derive(Default)]
    struct RecordingHandlers {
        calls: Vec<Call>,
    }

    impl HandlerTable for RecordingHandlers {
        fn invoke(
            &mut self,
            method_id: u64,
            reader: &mut WireReader<'_>,
            ctx: &CallContext,
        ) -> Result<(), CoreError> {
            if method_id == 0xBAD {
                return Err(CoreError::UnknownMethod(method_id));
            }
            self.calls.push(Call {
                method_id,
                sender: ctx.sender,
                stage: ctx.stage,
                args: reader.rest().to_vec(),
                loopback: ctx.loopback,
            });
            Ok(())
        }
    }

    type Processor = QueueProcessor<RecordingTransport, RecordingHandlers>;

    fn processor(config: ProcessorConfig) -> Processor {
        QueueProcessor::new(config, RecordingTransport::default(), RecordingHandlers::default())
            .unwrap()
    }

    fn server(batching: bool) -> Processor {
        processor(ProcessorConfig::new().with_batching(batching))
    }

    fn client(peer: PeerId, batching: bool) -> Processor {
        processor(
            ProcessorConfig::new()
                .with_batching(batching)
                .with_local_peer(peer),
        )
    }

    #[test]
    fn test_unbatched_send_per_target() {
        let mut p = server(false);
        p.queue_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[7, 9], UpdateStage::Update, 1, &[1, 2, 3])
            .unwrap();
        p.queue_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[7, 9], UpdateStage::Update, 2, &[4])
            .unwrap();

        assert_eq!(p.process_send_queue(), 2);

        let first = MessageHeader::new(ItemKind::ClientRpc, UpdateStage::Update, 1).encode_message(&[1, 2, 3]);
        let second = MessageHeader::new(ItemKind::ClientRpc, UpdateStage::Update, 2).encode_message(&[4]);
        assert_eq!(
            p.transport().sent,
            vec![
                (7, Channel::ReliableRpc, first.clone()),
                (9, Channel::ReliableRpc, first),
                (7, Channel::ReliableRpc, second.clone()),
                (9, Channel::ReliableRpc, second),
            ]
        );
        assert_eq!(p.frames_processed(Direction::Outbound), 1);
        assert_eq!(p.transport().flushes, 1);
    }

    #[test]
    fn test_empty_send_pass_does_not_advance() {
        let mut p = server(false);
        assert_eq!(p.process_send_queue(), 0);
        assert_eq!(p.frames_processed(Direction::Outbound), 0);
        assert!(p.transport().sent.is_empty());
    }

    #[test]
    fn test_writer_streams_args() {
        let mut p = server(false);
        {
            let mut writer = p
                .begin_rpc(ItemKind::ClientRpc, Channel::UnreliableRpc, &[5], UpdateStage::FixedUpdate, 3)
                .unwrap();
            assert_eq!(writer.stage(), UpdateStage::FixedUpdate);
            writer.write_u32(0xDEADBEEF);
            writer.write_str("hi");
            writer.finish().unwrap();
        }
        p.process_send_queue();

        let (peer, channel, message) = &p.transport().sent[0];
        assert_eq!((*peer, *channel), (5, Channel::UnreliableRpc));
        let routing = MessageHeader::peek(message).unwrap();
        assert_eq!(routing.stage, UpdateStage::FixedUpdate);
        let mut reader = WireReader::new(&message[MESSAGE_HEADER_SIZE..]);
        assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.read_str().unwrap(), "hi");
    }

    #[test]
    fn test_dropped_writer_discards_item() {
        let mut p = server(false);
        {
            let mut writer = p
                .begin_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[5], UpdateStage::Update, 3)
                .unwrap();
            writer.write_u64(1);
        }
        assert_eq!(p.process_send_queue(), 0);
        assert!(p.transport().sent.is_empty());
    }

    #[test]
    fn test_no_targets() {
        let mut p = server(false);
        assert!(p
            .begin_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[], UpdateStage::Update, 1)
            .is_none());
        assert!(matches!(
            p.queue_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[], UpdateStage::Update, 1, &[1]),
            Err(CoreError::NoTargets)
        ));
    }

    #[test]
    fn test_server_rpc_defaults_to_server_peer() {
        let mut c = client(7, false);
        c.queue_rpc(ItemKind::ServerRpc, Channel::ReliableRpc, &[], UpdateStage::Update, 4, &[9])
            .unwrap();
        c.process_send_queue();
        assert_eq!(c.transport().sent.len(), 1);
        assert_eq!(c.transport().sent[0].0, SERVER_PEER_ID);
    }

    #[test]
    fn test_client_to_server_roundtrip_batched() {
        let mut c = client(7, true);
        let mut s = server(true);

        for method in 1..=3u64 {
            c.queue_rpc(ItemKind::ServerRpc, Channel::ReliableRpc, &[], UpdateStage::Update, method, &[method as u8])
                .unwrap();
        }
        c.process_send_queue();
        assert_eq!(c.transport().sent.len(), 1, "below threshold, one batch");

        let (_, channel, batch) = c.transport_mut().sent.remove(0);
        assert_eq!(s.receive(7, channel, Bytes::from(batch)), 3);
        s.run_tick();

        let calls = &s.handlers().calls;
        assert_eq!(calls.iter().map(|c| c.method_id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(calls.iter().all(|c| c.sender == 7 && !c.loopback));
        assert_eq!(calls[2].args, vec![3]);
        assert_eq!(s.frames_processed(Direction::Inbound), 1);
    }

    #[test]
    fn test_batching_threshold_flushes_early() {
        let mut p = processor(ProcessorConfig::new().with_batch_threshold(64));
        for method in 0..4 {
            p.queue_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[3], UpdateStage::Update, method, &[0u8; 40])
                .unwrap();
        }
        p.process_send_queue();

        // Each record is 54 bytes, so every second record crosses 64.
        let sent = &p.transport().sent;
        assert_eq!(sent.len(), 2);
        let total: usize = sent.iter().map(|(_, _, b)| b.len()).sum();
        assert_eq!(total, 4 * (4 + MESSAGE_HEADER_SIZE + 40));
    }

    #[test]
    fn test_receive_dispatches_per_stage() {
        let mut s = server(false);
        let fixed = MessageHeader::new(ItemKind::ServerRpc, UpdateStage::FixedUpdate, 10).encode_message(&[1]);
        let update = MessageHeader::new(ItemKind::ServerRpc, UpdateStage::Update, 11).encode_message(&[2]);
        s.receive(3, Channel::ReliableRpc, Bytes::from(fixed));
        s.receive(3, Channel::ReliableRpc, Bytes::from(update));

        assert_eq!(s.process_receive_queue(UpdateStage::Update), 1);
        assert_eq!(s.handlers().calls[0].method_id, 11);
        assert_eq!(s.process_receive_queue(UpdateStage::Update), 0);
        assert_eq!(s.process_receive_queue(UpdateStage::FixedUpdate), 1);
        assert_eq!(s.handlers().calls[1].stage, UpdateStage::FixedUpdate);
    }

    #[test]
    fn test_malformed_inbound_is_dropped() {
        let mut s = server(false);
        assert_eq!(s.receive(3, Channel::ReliableRpc, Bytes::from_static(&[1, 42, 0])), 0);
        assert_eq!(s.receive(3, Channel::ReliableRpc, Bytes::new()), 0);

        let mut bad = Vec::new();
        bad.extend_from_slice(&(-1i32).to_le_bytes());
        let mut batched = server(true);
        assert_eq!(batched.receive(3, Channel::ReliableRpc, Bytes::from(bad)), 0);

        s.run_tick();
        assert!(s.handlers().calls.is_empty());
        assert_eq!(s.frames_processed(Direction::Inbound), 0);
    }

    #[test]
    fn test_handler_failure_does_not_stop_pass() {
        let mut s = server(false);
        let bad = MessageHeader::new(ItemKind::ServerRpc, UpdateStage::Update, 0xBAD).encode_message(&[1]);
        let good = MessageHeader::new(ItemKind::ServerRpc, UpdateStage::Update, 5).encode_message(&[2]);
        s.receive(3, Channel::ReliableRpc, Bytes::from(bad));
        s.receive(3, Channel::ReliableRpc, Bytes::from(good));

        assert_eq!(s.process_receive_queue(UpdateStage::Update), 2);
        assert_eq!(s.handlers().calls.len(), 1);
        assert_eq!(s.handlers().calls[0].method_id, 5);
    }

    #[test]
    fn test_host_loopback_runs_next_tick() {
        let mut s = server(false);
        s.queue_rpc(ItemKind::ServerRpc, Channel::ReliableRpc, &[], UpdateStage::Update, 8, &[4, 2])
            .unwrap();
        assert!(s.transport().sent.is_empty());

        // The loopback slot becomes current at the end of this tick.
        s.run_tick();
        assert!(s.handlers().calls.is_empty());
        assert!(s.transport().sent.is_empty());

        s.run_tick();
        assert_eq!(
            s.handlers().calls,
            vec![Call {
                method_id: 8,
                sender: SERVER_PEER_ID,
                stage: UpdateStage::Update,
                args: vec![4, 2],
                loopback: true,
            }]
        );

        for _ in 0..4 {
            s.run_tick();
        }
        assert_eq!(s.handlers().calls.len(), 1);
        assert!(!s.table().unwrap().has_pending_loopback(Direction::Inbound));
    }

    #[test]
    fn test_loopback_survives_slot_rotation() {
        let mut s = server(false);
        s.queue_rpc(ItemKind::ServerRpc, Channel::ReliableRpc, &[], UpdateStage::Update, 8, &[1])
            .unwrap();
        s.process_receive_queue(UpdateStage::SEND);
        assert_eq!(s.frames_processed(Direction::Inbound), 1);

        // Keep the inbound history moving without running the Update stage.
        let slots = s.table().unwrap().total_slots();
        for _ in 0..slots {
            let fixed = MessageHeader::new(ItemKind::ServerRpc, UpdateStage::FixedUpdate, 10)
                .encode_message(&[2]);
            s.receive(3, Channel::ReliableRpc, Bytes::from(fixed));
            s.process_receive_queue(UpdateStage::FixedUpdate);
            s.process_receive_queue(UpdateStage::SEND);
        }
        assert_eq!(s.frames_processed(Direction::Inbound), 1 + slots as u64);

        assert_eq!(s.process_receive_queue(UpdateStage::Update), 1);
        let last = s.handlers().calls.last().unwrap();
        assert_eq!(last.method_id, 8);
        assert!(last.loopback);
        assert!(s
            .table()
            .unwrap()
            .frames(Direction::Inbound)
            .all(|frame| !frame.has_loopback_data()));
    }

    #[test]
    fn test_client_rpc_to_host_and_remote() {
        let mut s = server(false);
        s.queue_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[SERVER_PEER_ID, 7], UpdateStage::PreUpdate, 6, &[1])
            .unwrap();

        s.run_tick();
        assert_eq!(s.transport().sent.len(), 1);
        assert_eq!(s.transport().sent[0].0, 7);
        assert!(s.handlers().calls.is_empty());

        s.run_tick();
        assert_eq!(s.handlers().calls.len(), 1);
        assert!(s.handlers().calls[0].loopback);
        assert_eq!(s.handlers().calls[0].stage, UpdateStage::PreUpdate);
    }

    #[test]
    fn test_internal_waits_for_ready_and_follows_rpcs() {
        let mut s = server(false);
        s.peer_connected(7);
        s.queue_internal(ItemKind::CreateObject, Channel::Internal, &[7], UpdateStage::Update, 20, &[1])
            .unwrap();

        s.process_send_queue();
        assert!(s.transport().sent.is_empty());
        assert_eq!(s.internal_len(), 1);

        assert!(s.peer_ready(7));
        s.queue_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[7], UpdateStage::Update, 21, &[2])
            .unwrap();
        s.process_send_queue();

        let channels: Vec<_> = s.transport().sent.iter().map(|(_, c, _)| *c).collect();
        assert_eq!(channels, vec![Channel::ReliableRpc, Channel::Internal]);
        assert_eq!(s.internal_len(), 0);
    }

    #[test]
    fn test_internal_message_expires_for_unknown_peer() {
        let clock = Arc::new(ManualClock::new());
        let mut s = server(false).with_clock(clock.clone());
        s.queue_internal(ItemKind::CreateObject, Channel::Internal, &[42], UpdateStage::Update, 1, &[0])
            .unwrap();

        s.process_send_queue();
        assert_eq!(s.internal_len(), 1);

        clock.advance(Duration::from_secs(61));
        s.process_send_queue();
        assert_eq!(s.internal_len(), 0);

        s.peer_connected(42);
        s.peer_ready(42);
        s.process_send_queue();
        assert!(s.transport().sent.is_empty());
    }

    #[test]
    fn test_departed_peers_forgotten_after_send_pass() {
        let mut s = server(false);
        for peer in 1..=50 {
            s.peer_connected(peer);
            s.peer_disconnected(peer);
        }
        assert_eq!(s.peers().departed_len(), 50);

        s.queue_internal(ItemKind::DestroyObject, Channel::Internal, &[3], UpdateStage::Update, 5, &[1])
            .unwrap();
        s.process_send_queue();
        assert_eq!(s.peers().departed_len(), 0);
        assert_eq!(s.internal_len(), 0);
        assert!(s.transport().sent.is_empty());
    }

    #[test]
    fn test_internal_lifecycle_received_with_internal_flag() {
        let mut s = server(false);
        let create = MessageHeader::new(ItemKind::CreateObject, UpdateStage::Initialization, 30).encode_message(&[1]);
        s.receive(7, Channel::Internal, Bytes::from(create));

        let table = s.table().unwrap();
        let frame = table.inbound(UpdateStage::Initialization, SlotTarget::Current);
        assert_eq!(frame.item_count(), 1);

        s.process_receive_queue(UpdateStage::Initialization);
        assert_eq!(s.handlers().calls[0].method_id, 30);
    }

    #[test]
    fn test_shutdown() {
        let mut s = server(true);
        s.peer_connected(7);
        s.peer_ready(7);
        s.queue_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[7], UpdateStage::Update, 1, &[1])
            .unwrap();
        s.queue_internal(ItemKind::DestroyObject, Channel::Internal, &[7], UpdateStage::Update, 2, &[2])
            .unwrap();

        s.shutdown();
        assert!(!s.is_initialized());
        // One batch per channel.
        assert_eq!(s.transport().sent.len(), 2);

        assert!(s
            .begin_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[7], UpdateStage::Update, 1)
            .is_none());
        assert!(matches!(
            s.queue_rpc(ItemKind::ClientRpc, Channel::ReliableRpc, &[7], UpdateStage::Update, 1, &[1]),
            Err(CoreError::NotInitialized)
        ));
        assert_eq!(s.process_send_queue(), 0);
        assert_eq!(s.process_receive_queue(UpdateStage::Update), 0);
        assert_eq!(s.frames_processed(Direction::Outbound), 0);
        s.shutdown();
    }

    #[test]
    fn test_invalid_config() {
        let config = ProcessorConfig::new().with_internal_lifetime(Duration::ZERO);
        assert!(matches!(
            QueueProcessor::new(config, RecordingTransport::default(), RecordingHandlers::default()),
            Err(CoreError::InvalidConfig(_))
        ));

        let config = ProcessorConfig::new().with_history(HistoryConfig::new(1000));
        assert!(matches!(
            QueueProcessor::new(config, RecordingTransport::default(), RecordingHandlers::default()),
            Err(CoreError::History(_))
        ));
    }
}
