use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use wgmesh_core::config::MeshConfig;
use wgmesh_core::manager::AllocationManager;
use wgmesh_core::pool::MeshPool;
use wgmesh_core::store::MemoryNodeStore;
use wgmesh_core::watcher::{AllocationService, NodeEvent};

#[derive(Parser)]
#[command(name = "wgmesh")]
#[command(about = "Mesh address allocation tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Validate a configuration file and report pool capacity
    Check {
        /// Path to the TOML configuration
        #[arg(long)]
        config: PathBuf,
    },
    /// Replay a recorded node-event log against a fresh allocation state
    Replay {
        /// Path to the TOML configuration
        #[arg(long)]
        config: PathBuf,

        /// JSON file holding the recorded node events
        #[arg(long)]
        events: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wgmesh=info,wgmesh_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Check { config } => check(&config),
        Commands::Replay { config, events } => replay(&config, &events).await,
    }
}

fn check(config_path: &Path) -> anyhow::Result<()> {
    let config = MeshConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let pool = MeshPool::new(config.subnet, config.reserved.clone())?;

    println!("subnet: {}", config.subnet);
    println!("reserved addresses: {}", config.reserved.len());
    println!("allocatable addresses: {}", pool.capacity());
    Ok(())
}

async fn replay(config_path: &Path, events_path: &Path) -> anyhow::Result<()> {
    let config = MeshConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let raw = std::fs::read_to_string(events_path)
        .with_context(|| format!("reading {}", events_path.display()))?;
    let events: Vec<NodeEvent> =
        serde_json::from_str(&raw).context("decoding node event log")?;

    let store = Arc::new(MemoryNodeStore::new());
    let manager = Arc::new(AllocationManager::new(&config, store.clone())?);
    let (tx, rx) = mpsc::channel(64);
    let service = tokio::spawn(AllocationService::new(manager.clone(), rx).run());

    for event in events {
        // The live event source watches the store, so objects exist there
        // before their events arrive; seed the store the same way.
        match &event {
            NodeEvent::Added { node } | NodeEvent::Updated { node } => {
                store.put(node.clone()).await;
            }
            NodeEvent::Deleted { node } => {
                store.remove(&node.name).await;
            }
            NodeEvent::Resync => {}
        }

        if tx.send(event).await.is_err() {
            warn!("allocation service stopped early, dropping remaining events");
            break;
        }
    }
    drop(tx);

    service.await.context("allocation service panicked")??;

    let mut assignments = serde_json::Map::new();
    for node in store.list().await {
        if let Some(ip) = node.mesh_ipv4() {
            assignments.insert(node.name, serde_json::Value::String(ip.to_string()));
        }
    }
    println!("{}", serde_json::to_string_pretty(&assignments)?);

    let stats = manager.stats().await;
    println!(
        "allocated {} of {} addresses in {}",
        stats.allocated,
        stats.capacity,
        config.subnet
    );
    Ok(())
}
