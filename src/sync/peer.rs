//! Per-peer push client. Grounded in `original_source/src/networking/peer.py`'s `Peer` — same
//! widening-depth `bulk_get_nodes_to_add`/`bulk_add`/`bulk_root` round trip, same doubling `depth`
//! used both to bound the eager-prefetch walk and as the round counter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::dag::{Hash, OpNode};
use crate::inode::InodeStore;
use crate::ktree::KTree;

use super::{SyncError, FS_TREE};

pub struct PeerClient {
    host: String,
    port: u16,
    client: reqwest::Client,
    last_time: u128,
}

impl PeerClient {
    pub fn new(host: String, port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with default TLS backend");
        PeerClient {
            host,
            port,
            client,
            last_time: 0,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    pub async fn healthcheck(&self) -> Result<(), SyncError> {
        self.client
            .get(self.url("/healthcheck"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Builds the changelist (K-Tree plus every inode touched since the last successful push)
    /// and reconciles it with this peer.
    pub async fn push_all(
        &mut self,
        ktree: &Arc<Mutex<KTree>>,
        inode_store: &Arc<Mutex<InodeStore>>,
    ) -> Result<(), SyncError> {
        self.healthcheck().await?;
        let mut names = vec![FS_TREE.to_string()];
        let (changed, now) = {
            let store = inode_store.lock().await;
            store.changes_since(self.last_time)
        };
        self.last_time = now;
        names.extend(changed.into_iter().map(|inode| inode.to_string()));
        self.push_changelist(&names, ktree, inode_store).await
    }

    async fn push_changelist(
        &mut self,
        names: &[String],
        ktree: &Arc<Mutex<KTree>>,
        inode_store: &Arc<Mutex<InodeStore>>,
    ) -> Result<(), SyncError> {
        // Cut any pending local writes and take an immutable snapshot of each CRDT's nodes. Nodes
        // are append-only, so it's safe to read them outside the lock for the rest of this push.
        let mut roots: HashMap<String, Hash> = HashMap::new();
        let mut nodes: HashMap<String, HashMap<Hash, OpNode>> = HashMap::new();
        for name in names {
            if name == FS_TREE {
                let tree = ktree.lock().await;
                roots.insert(name.clone(), tree.root().clone());
                nodes.insert(name.clone(), tree.nodes().clone());
            } else {
                let inode: i64 = name.parse().expect("changelist names are either \"root\" or inode ids");
                let mut store = inode_store.lock().await;
                let reg = store.open(inode).await?;
                reg.cut_root();
                roots.insert(name.clone(), reg.root().clone());
                nodes.insert(name.clone(), reg.nodes().clone());
            }
        }

        let mut frontier: HashMap<String, HashSet<Hash>> = roots
            .iter()
            .map(|(name, root)| (name.clone(), HashSet::from([root.clone()])))
            .collect();
        let mut accumulated: HashMap<String, HashMap<Hash, OpNode>> =
            names.iter().map(|n| (n.clone(), HashMap::new())).collect();
        let mut depth: u64 = 1;

        while !frontier.is_empty() {
            let request: HashMap<String, Vec<OpNode>> = frontier
                .iter()
                .map(|(name, hashes)| {
                    let local = &nodes[name];
                    let serialized = hashes.iter().filter_map(|h| local.get(h).cloned()).collect();
                    (name.clone(), serialized)
                })
                .collect();

            let response: HashMap<String, Vec<Hash>> = self
                .client
                .post(self.url("/bulk_get_nodes_to_add"))
                .json(&request)
                .send()
                .await?
                .json()
                .await?;

            let mut next_frontier: HashMap<String, HashSet<Hash>> = HashMap::new();
            for (name, missing_hashes) in response {
                if missing_hashes.is_empty() {
                    continue;
                }
                let local = &nodes[&name];
                let acc = accumulated.get_mut(&name).expect("accumulated seeded for every name");

                let mut new_frontier = HashSet::new();
                for hash in &missing_hashes {
                    if acc.contains_key(hash) {
                        continue;
                    }
                    if let Some(node) = local.get(hash) {
                        acc.insert(hash.clone(), node.clone());
                        new_frontier.insert(hash.clone());
                    }
                }

                // Eager prefetch: walk `depth - 1` more levels down through children so a
                // far-behind peer catches up in fewer round trips.
                let mut level = new_frontier.clone();
                for _ in 0..depth.saturating_sub(1) {
                    let mut next_level = HashSet::new();
                    for hash in &level {
                        let Some(node) = local.get(hash) else { continue };
                        for child in &node.children {
                            if acc.contains_key(child) {
                                continue;
                            }
                            if let Some(child_node) = local.get(child) {
                                acc.insert(child.clone(), child_node.clone());
                                next_level.insert(child.clone());
                            }
                        }
                    }
                    level = next_level;
                }

                if !new_frontier.is_empty() {
                    next_frontier.insert(name, new_frontier);
                }
            }
            frontier = next_frontier;
            depth = depth.saturating_mul(2);
        }

        let bulk_add_body: HashMap<String, Vec<OpNode>> = accumulated
            .into_iter()
            .map(|(name, by_hash)| (name, by_hash.into_values().collect()))
            .collect();
        self.client
            .post(self.url("/bulk_add"))
            .json(&bulk_add_body)
            .send()
            .await?
            .error_for_status()?;
        self.client
            .post(self.url("/bulk_root"))
            .json(&roots)
            .send()
            .await?
            .error_for_status()?;
        info!(peer = %self.host, "pushed changelist");
        Ok(())
    }
}
