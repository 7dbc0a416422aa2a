//! merkelfs entrypoint: loads a replica's config, opens its K-Tree and Inode Store, serves the
//! sync HTTP API, and periodically fsyncs local state and pushes it to configured peers.
//!
//! Grounded in `calimero-network-core`'s `chat-p0c` binary for the clap/tracing-subscriber/
//! CancellationToken shutdown shape, with the periodic-task spawning pattern adapted to this
//! crate's fsync/sync-push cadence instead of chat message delivery.

mod adapter;
mod config;
mod crdt;
mod dag;
mod inode;
mod ktree;
mod register;
mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, PeerConfig};
use crate::inode::InodeStore;
use crate::ktree::KTree;
use crate::sync::peer::PeerClient;
use crate::sync::SyncState;

#[derive(Parser, Debug)]
#[command(name = "merkelfs", about = "Peer-to-peer filesystem over Merkle-CRDTs")]
struct Cli {
    /// Path to the replica's JSON config file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    std::fs::create_dir_all(&config.basepath)
        .with_context(|| format!("creating basepath {}", config.basepath.display()))?;

    let ktree_path = config.basepath.join("ktree.json");
    let ktree = KTree::open(ktree_path, config.replica)
        .await
        .context("opening k-tree snapshot")?;
    let ktree = Arc::new(Mutex::new(ktree));

    let inode_store = InodeStore::new(config.basepath.join("inodes"), config.replica);
    std::fs::create_dir_all(config.basepath.join("inodes")).context("creating inode directory")?;
    let inode_store = Arc::new(Mutex::new(inode_store));

    // `adapter::Filesystem` wraps `ktree`/`inode_store` for an external kernel binding (FUSE,
    // WinFSP, ...) to drive; this binary only runs the replication side (sync server, fsync and
    // push loops) and never constructs it.

    let shutdown = CancellationToken::new();

    let sync_state = SyncState {
        ktree: ktree.clone(),
        inode_store: inode_store.clone(),
        replica: config.replica,
    };
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding sync server to {}:{}", config.host, config.port))?;
    info!(host = %config.host, port = config.port, replica = config.replica, "sync server listening");
    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        let router = sync::server::router(sync_state);
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(err) = result {
            error!(%err, "sync server exited with error");
        }
    });

    let fsync_task = spawn_fsync_task(
        ktree.clone(),
        inode_store.clone(),
        Duration::from_secs(config.fsync_interval_secs),
        shutdown.clone(),
    );

    let mut peer_tasks = Vec::new();
    for peer in &config.peers {
        peer_tasks.push(spawn_peer_push_task(
            peer.clone(),
            ktree.clone(),
            inode_store.clone(),
            Duration::from_secs(config.sync_interval_secs),
            shutdown.clone(),
        ));
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = server_task.await;
    let _ = fsync_task.await;
    for task in peer_tasks {
        let _ = task.await;
    }

    Ok(())
}

fn spawn_fsync_task(
    ktree: Arc<Mutex<KTree>>,
    inode_store: Arc<Mutex<InodeStore>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let tree = ktree.lock().await;
                    if let Err(err) = tree.fsync().await {
                        warn!(%err, "periodic fsync of k-tree failed");
                    }
                    drop(tree);
                    let mut store = inode_store.lock().await;
                    if let Err(err) = store.fsync().await {
                        warn!(%err, "periodic fsync of inode store failed");
                    }
                }
            }
        }
    })
}

fn spawn_peer_push_task(
    peer: PeerConfig,
    ktree: Arc<Mutex<KTree>>,
    inode_store: Arc<Mutex<InodeStore>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut client = PeerClient::new(peer.host.clone(), peer.port);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = client.push_all(&ktree, &inode_store).await {
                        warn!(host = %peer.host, port = peer.port, %err, "peer push failed");
                    }
                }
            }
        }
    })
}
