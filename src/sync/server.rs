//! Server-side sync endpoints. Grounded in `original_source/src/networking/api_server.py`'s
//! `APIHandler` — same four operations, same name-resolution rule (`"root"` is the K-Tree,
//! anything else is parsed as an inode id) — rebuilt as `axum` handlers over JSON bodies.

use std::collections::HashMap;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::warn;

use crate::dag::Hash;

use super::{insert_nodes, missing_children, SyncState, FS_TREE};

pub fn router(state: SyncState) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/bulk_get_nodes_to_add", post(bulk_get_nodes_to_add))
        .route("/bulk_add", post(bulk_add))
        .route("/bulk_root", post(bulk_root))
        .with_state(state)
}

async fn healthcheck(State(state): State<SyncState>) -> String {
    state.replica.to_string()
}

async fn bulk_get_nodes_to_add(
    State(state): State<SyncState>,
    Json(payload): Json<HashMap<String, Vec<crate::dag::OpNode>>>,
) -> Json<HashMap<String, Vec<Hash>>> {
    let mut reply = HashMap::new();
    for (name, nodes) in payload {
        let missing = if name == FS_TREE {
            let tree = state.ktree.lock().await;
            missing_children(&tree, &nodes)
        } else {
            match name.parse::<i64>() {
                Ok(inode) => {
                    let mut store = state.inode_store.lock().await;
                    match store.open(inode).await {
                        Ok(reg) => missing_children(reg, &nodes),
                        Err(err) => {
                            warn!(%inode, %err, "bulk_get_nodes_to_add: failed to open inode register");
                            Vec::new()
                        }
                    }
                }
                Err(_) => {
                    warn!(%name, "bulk_get_nodes_to_add: unrecognized crdt name");
                    Vec::new()
                }
            }
        };
        reply.insert(name, missing);
    }
    Json(reply)
}

async fn bulk_add(
    State(state): State<SyncState>,
    Json(payload): Json<HashMap<String, Vec<crate::dag::OpNode>>>,
) {
    for (name, nodes) in payload {
        if name == FS_TREE {
            let mut tree = state.ktree.lock().await;
            insert_nodes(&mut tree, nodes);
        } else {
            match name.parse::<i64>() {
                Ok(inode) => {
                    let mut store = state.inode_store.lock().await;
                    match store.open(inode).await {
                        Ok(reg) => insert_nodes(reg, nodes),
                        Err(err) => warn!(%inode, %err, "bulk_add: failed to open inode register"),
                    }
                }
                Err(_) => warn!(%name, "bulk_add: unrecognized crdt name"),
            }
        }
    }
}

async fn bulk_root(State(state): State<SyncState>, Json(payload): Json<HashMap<String, Hash>>) {
    for (name, root) in payload {
        if name == FS_TREE {
            let mut tree = state.ktree.lock().await;
            if !tree.has_node(&root) {
                warn!(%root, "bulk_root: root references a node never sent via bulk_add, skipping");
                continue;
            }
            tree.add_root(root);
            if let Err(err) = tree.fsync().await {
                warn!(%err, "bulk_root: failed to fsync k-tree");
            }
            continue;
        }
        let Ok(inode) = name.parse::<i64>() else {
            warn!(%name, "bulk_root: unrecognized crdt name");
            continue;
        };
        let mut store = state.inode_store.lock().await;
        let already_applied = match store.open(inode).await {
            Ok(reg) => reg.is_applied(&root),
            Err(err) => {
                warn!(%inode, %err, "bulk_root: failed to open inode register");
                continue;
            }
        };
        if !already_applied {
            store.signal_write(inode);
        }
        if let Ok(reg) = store.open(inode).await {
            if !reg.has_node(&root) {
                warn!(%inode, %root, "bulk_root: root references a node never sent via bulk_add, skipping");
                continue;
            }
            reg.add_root(root);
            if let Err(err) = reg.fsync().await {
                warn!(%inode, %err, "bulk_root: failed to fsync inode register");
            }
        }
    }
}
