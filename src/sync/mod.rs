//! Peer sync: an HTTP server (this module's [`server`] submodule) and per-peer push client
//! ([`peer`]) that reconcile the K-Tree and per-inode registers between replicas.
//!
//! Replaces the teacher's QUIC (`quinn`/`rustls`) transport with `axum` + `reqwest` — the
//! ecosystem's standard request/response pairing, also seen in `calimero-network-core`'s
//! `server`/`client` split — because this protocol is push/reply, not a persistent stream.

pub mod peer;
pub mod server;

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::crdt::{Crdt, CrdtState};
use crate::dag::{DagError, Hash, OpNode};
use crate::inode::InodeStore;
use crate::ktree::KTree;

/// Reserved changelist name for the namespace tree; every other name is a base-10 inode id.
pub const FS_TREE: &str = "root";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("dag error: {0}")]
    Dag(#[from] DagError),
}

#[derive(Clone)]
pub struct SyncState {
    pub ktree: Arc<Mutex<KTree>>,
    pub inode_store: Arc<Mutex<InodeStore>>,
    pub replica: i64,
}

/// For a batch of incoming `nodes`, the subset of referenced hashes (each node itself plus its
/// declared children) not yet present in `crdt`'s local DAG. Deduplicated.
pub(crate) fn missing_children<S: CrdtState>(crdt: &Crdt<S>, nodes: &[OpNode]) -> Vec<Hash> {
    let mut missing = HashSet::new();
    for node in nodes {
        if !crdt.has_node(&node.hash_value) {
            missing.insert(node.hash_value.clone());
        }
        for child in &node.children {
            if !crdt.has_node(child) {
                missing.insert(child.clone());
            }
        }
    }
    missing.into_iter().collect()
}

pub(crate) fn insert_nodes<S: CrdtState>(crdt: &mut Crdt<S>, nodes: Vec<OpNode>) {
    for node in nodes {
        crdt.insert_node(node);
    }
}
