//! rpcq - RPC queue simulation
//!
//! Runs a host and a set of clients over the in-memory network at a fixed
//! tick rate. The host pings every client (itself included, through the
//! loopback path) each tick, spawns an object on each client once it has
//! finished loading, and clients answer every ping.

use clap::Parser;
use parking_lot::Mutex;
use rpcq_core::MethodRegistry;
use rpcq_protocol::{Channel, ItemKind, PeerId, UpdateStage};
use rpcq_runtime::{Config, MemoryNetwork, MemoryTransport, NetworkNode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const PING: u64 = 0x01;
const PONG: u64 = 0x02;
const LOADED: u64 = 0x03;
const SPAWN: u64 = 0x10;

#[derive(Parser, Debug)]
#[command(name = "rpcq", version, about = "Runs an rpcq host and clients in-process")]
struct Args {
    /// Number of clients.
    #[arg(long, default_value_t = 4)]
    clients: u64,

    /// Ticks to run (0 = until Ctrl-C).
    #[arg(long, default_value_t = 300)]
    ticks: u64,

    /// Tick interval in milliseconds.
    #[arg(long, default_value_t = 33)]
    tick_ms: u64,

    /// Split reliable deliveries into chunks of this many bytes.
    #[arg(long)]
    chunk_size: Option<usize>,
}

type Node = NetworkNode<MemoryTransport, MethodRegistry>;

#[derive(Default)]
struct Counters {
    pongs: AtomicU64,
    spawns: AtomicU64,
    host_pings: AtomicU64,
}

struct Client {
    node: Node,
    pongs: Arc<Mutex<Vec<u32>>>,
    load_at: u64,
}

struct Simulation {
    host: Node,
    clients: Vec<Client>,
    targets: Vec<PeerId>,
    loaded: Arc<Mutex<Vec<PeerId>>>,
    counters: Arc<Counters>,
}

impl Simulation {
    fn new(config: &Config, args: &Args) -> Result<Self, Box<dyn std::error::Error>> {
        let network = match args.chunk_size {
            Some(size) => MemoryNetwork::with_chunk_size(size),
            None => MemoryNetwork::new(),
        };
        let counters = Arc::new(Counters::default());
        let loaded = Arc::new(Mutex::new(Vec::new()));

        let mut host_handlers = MethodRegistry::new();
        {
            let counters = counters.clone();
            host_handlers.register(PONG, move |_, _| {
                counters.pongs.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })?;
        }
        {
            let counters = counters.clone();
            host_handlers.register(PING, move |_, ctx| {
                if ctx.loopback {
                    counters.host_pings.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })?;
        }
        {
            let loaded = loaded.clone();
            host_handlers.register(LOADED, move |_, ctx| {
                loaded.lock().push(ctx.sender);
                Ok(())
            })?;
        }

        let host_peer = config.queue.server_peer_id;
        let host = NetworkNode::new(config, host_peer, network.join(host_peer), host_handlers)?;

        let mut clients = Vec::new();
        let mut targets = vec![host_peer];
        for peer in (1..=args.clients).map(|n| host_peer + n) {
            let pongs = Arc::new(Mutex::new(Vec::new()));
            let mut handlers = MethodRegistry::new();
            {
                let pongs = pongs.clone();
                handlers.register(PING, move |reader, _| {
                    pongs.lock().push(reader.read_u32()?);
                    Ok(())
                })?;
            }
            {
                let counters = counters.clone();
                handlers.register(SPAWN, move |reader, ctx| {
                    let object = reader.read_u64()?;
                    tracing::debug!("Peer spawned object {} from {}", object, ctx.sender);
                    counters.spawns.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })?;
            }

            let node = NetworkNode::new(config, peer, network.join(peer), handlers)?;
            network.connect(host_peer, peer);
            targets.push(peer);
            clients.push(Client {
                node,
                pongs,
                load_at: 5 + peer,
            });
        }

        Ok(Self {
            host,
            clients,
            targets,
            loaded,
            counters,
        })
    }

    fn step(&mut self, tick: u64) {
        if tick == 1 {
            let clients: Vec<PeerId> = self.targets[1..].to_vec();
            for (object, &peer) in clients.iter().enumerate() {
                let args = (object as u64 + 100).to_le_bytes();
                if let Err(e) = self.host.processor_mut().queue_internal(
                    ItemKind::CreateObject,
                    Channel::Internal,
                    &[peer],
                    UpdateStage::Initialization,
                    SPAWN,
                    &args,
                ) {
                    tracing::warn!("Failed to queue spawn for peer {}: {}", peer, e);
                }
            }
        }

        if let Some(mut writer) = self.host.processor_mut().begin_rpc(
            ItemKind::ClientRpc,
            Channel::UnreliableRpc,
            &self.targets,
            UpdateStage::Update,
            PING,
        ) {
            writer.write_u32(tick as u32);
            if let Err(e) = writer.finish() {
                tracing::warn!("Failed to queue ping: {}", e);
            }
        }

        self.host.tick();
        let loaded = std::mem::take(&mut *self.loaded.lock());
        for peer in loaded {
            self.host.mark_peer_ready(peer);
        }

        for client in self.clients.iter_mut() {
            if tick == client.load_at {
                queue_server_rpc(&mut client.node, LOADED, &[]);
            }
            client.node.tick();
            let pings = std::mem::take(&mut *client.pongs.lock());
            for seq in pings {
                queue_server_rpc(&mut client.node, PONG, &seq.to_le_bytes());
            }
        }
    }

    fn shutdown(&mut self) {
        for client in self.clients.iter_mut() {
            client.node.shutdown();
        }
        self.host.tick();
        self.host.shutdown();
    }
}

fn queue_server_rpc(node: &mut Node, method_id: u64, args: &[u8]) {
    if let Err(e) = node.processor_mut().queue_rpc(
        ItemKind::ServerRpc,
        Channel::ReliableRpc,
        &[],
        UpdateStage::Update,
        method_id,
        args,
    ) {
        tracing::warn!("Peer {} failed to queue RPC {:#x}: {}", node.local_peer(), method_id, e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration (from file if RPCQ_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("RPCQ_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if std::env::var("RPCQ_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting rpcq simulation");
    tracing::info!("  Clients: {}", args.clients);
    tracing::info!("  History depth: {}", config.queue.history_depth);
    tracing::info!(
        "  Batching: {}",
        if config.queue.batching_enabled { "enabled" } else { "disabled" }
    );

    let mut sim = Simulation::new(&config, &args)?;

    let mut interval = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut tick = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut shutdown => {
                tracing::info!("Received shutdown signal, stopping simulation...");
                break;
            }
        }

        tick += 1;
        sim.step(tick);
        if args.ticks > 0 && tick >= args.ticks {
            break;
        }
    }

    sim.shutdown();

    tracing::info!(
        "Ran {} ticks: {} pongs, {} spawns, {} loopback pings",
        tick,
        sim.counters.pongs.load(Ordering::Relaxed),
        sim.counters.spawns.load(Ordering::Relaxed),
        sim.counters.host_pings.load(Ordering::Relaxed)
    );
    if let Some(metrics) = sim.host.metrics() {
        tracing::info!("Host metrics:\n{}", String::from_utf8_lossy(&metrics.encode()));
    }

    Ok(())
}
