use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use peermesh::{MemoryNetwork, MemorySettingsStore, Mesh, MeshConfig, MeshEvent, PeerId, PutOptions};

#[derive(Parser, Debug)]
#[command(name = "peermesh")]
#[command(author, version, about = "Run an in-process peermesh simulation", long_about = None)]
struct Args {
    /// Number of simulated nodes.
    #[arg(short, long, default_value = "8")]
    nodes: usize,

    #[arg(long, default_value = "2")]
    min_peers: usize,

    #[arg(long, default_value = "3")]
    max_peers: usize,

    /// Stop after this many seconds. Runs until Ctrl+C when 0.
    #[arg(short, long, default_value = "0")]
    seconds: u64,

    #[arg(short, long, default_value = "5")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = MeshConfig {
        min_peers: args.min_peers,
        max_peers: args.max_peers,
        ..MeshConfig::default()
    }
    .normalized();

    let network = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        let id = PeerId::random();
        let mesh = Mesh::builder()
            .peer_id(id.to_hex())
            .config(config.clone())
            .signaling(network.signaling(id))
            .channels(network.channels(id))
            .settings_store(Arc::new(MemorySettingsStore::new()))
            .build()?;
        network.attach(&mesh)?;
        nodes.push(mesh);
    }
    info!(nodes = nodes.len(), min_peers = config.min_peers, max_peers = config.max_peers, "starting simulation");

    let first = nodes.first().cloned().context("simulation needs at least one node")?;
    let mut events = first.events().await?;
    for mesh in &nodes {
        mesh.connect().await?;
    }

    let mut telemetry = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    let deadline = (args.seconds > 0).then(|| time::Instant::now() + Duration::from_secs(args.seconds));
    let mut round: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = async {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                info!("simulation time elapsed");
                break;
            }
            Some(event) = events.recv() => {
                match event {
                    MeshEvent::MessageReceived(msg) => {
                        info!(origin = %msg.origin.short(), hops = msg.hops, text = %String::from_utf8_lossy(&msg.content), "node 0 received message");
                    }
                    MeshEvent::DhtValueChanged { key, version, .. } => {
                        info!(%key, version, "node 0 saw DHT change");
                    }
                    _ => {}
                }
            }
            _ = telemetry.tick() => {
                round += 1;
                for mesh in &nodes {
                    let status = mesh.status().await?;
                    info!(
                        peer = %status.peer_id.short(),
                        connected = status.connected_count,
                        total = status.total_peer_count,
                        discovered = status.discovered_count,
                        "status snapshot"
                    );
                }
                info!(open_channels = network.open_channels(), "network snapshot");

                if let Some(sender) = nodes.last() {
                    let text = format!("round {round} from {}", sender.peer_id().short());
                    if let Err(e) = sender.send_message(text.into_bytes()).await {
                        warn!(error = %e, "broadcast failed");
                    }
                    if let Err(e) = sender.dht_put("sim/round", round.to_be_bytes().to_vec(), PutOptions::default()).await {
                        warn!(error = %e, "DHT put failed");
                    }
                }
            }
        }
    }

    for mesh in &nodes {
        if let Err(e) = mesh.shutdown().await {
            warn!(peer = %mesh.peer_id().short(), error = %e, "shutdown failed");
        }
    }
    Ok(())
}
