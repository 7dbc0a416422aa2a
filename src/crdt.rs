//! Generic Merkle-CRDT engine: the replay/merge machinery shared by every concrete CRDT in this
//! crate. A [`Crdt<S>`] owns a [`Dag`] and drives it; `S` supplies the derived-state logic (what
//! an operation actually *means*) through the [`CrdtState`] trait. This is composition standing
//! in for the single-base-class-per-CRDT split the reference implementation uses.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use tracing::debug;

use crate::dag::{Dag, DagError, Hash, OpNode};

/// The derived, queryable state a concrete CRDT builds out of a stream of operations.
///
/// `apply_operation` interprets a single op value (the `Vec<String>` payload carried by an
/// [`OpNode`]); `apply_operations` additionally gets to see a whole causally-sorted batch at
/// once, which matters for CRDTs (like the move-tree) whose conflict resolution depends on
/// undoing and redoing a run of operations together rather than folding them one at a time.
pub trait CrdtState: Default {
    /// Applies one op to derived state. Returns any follow-up op values (as bare domain fields,
    /// without the height/replica prefix `Crdt::commit_move` adds) this state wants committed
    /// locally as a consequence — e.g. the move-tree renaming the loser of a name conflict it
    /// just discovered. Most states never produce follow-ups.
    fn apply_operation(&mut self, op: &[String]) -> Vec<Vec<String>>;

    fn apply_operations(&mut self, ops: &[Vec<String>]) -> Vec<Vec<String>> {
        let mut follow_ups = Vec::new();
        for op in ops {
            follow_ups.extend(self.apply_operation(op));
        }
        follow_ups
    }
}

/// Generic engine wrapping a [`Dag`] with the bookkeeping (applied-op set, replica id, snapshot
/// path) every concrete CRDT needs identically, plus the `S`-specific derived state.
///
/// Not internally synchronized — callers share a `Crdt<S>` across tasks behind an
/// `Arc<tokio::sync::Mutex<Crdt<S>>>`, one mutex per CRDT instance, matching the per-register /
/// per-tree locking the reference implementation uses.
pub struct Crdt<S: CrdtState> {
    dag: Dag,
    applied_ops: HashSet<Hash>,
    replica: i64,
    path: PathBuf,
    pub state: S,
}

impl<S: CrdtState> Crdt<S> {
    pub fn new(path: PathBuf, replica: i64) -> Self {
        Crdt {
            dag: Dag::genesis(replica),
            applied_ops: HashSet::new(),
            replica,
            path,
            state: S::default(),
        }
    }

    pub fn replica(&self) -> i64 {
        self.replica
    }

    pub fn root(&self) -> &Hash {
        &self.dag.root
    }

    pub fn node(&self, hash: &str) -> Option<&OpNode> {
        self.dag.nodes.get(hash)
    }

    pub fn nodes(&self) -> &std::collections::HashMap<Hash, OpNode> {
        &self.dag.nodes
    }

    pub fn has_node(&self, hash: &str) -> bool {
        self.dag.nodes.contains_key(hash)
    }

    /// True if `hash` has already been folded into this CRDT's derived state (stronger than
    /// [`Crdt::has_node`], which is also true for nodes received via `insert_node` but not yet
    /// replayed by `add_root`/`fload`).
    pub fn is_applied(&self, hash: &str) -> bool {
        self.applied_ops.contains(hash)
    }

    pub fn insert_node(&mut self, node: OpNode) {
        self.dag.nodes.insert(node.hash_value.clone(), node);
    }

    /// Depth-first post-order walk from `hash`, skipping anything already applied. Mutates
    /// `applied_ops` as it goes so re-entrant walks (e.g. a merge whose frontier overlaps an
    /// earlier one) terminate.
    fn topo_collect(&mut self, hash: &Hash, acc: &mut Vec<OpNode>) {
        if self.applied_ops.contains(hash) {
            return;
        }
        let node = match self.dag.nodes.get(hash) {
            Some(n) => n.clone(),
            None => return,
        };
        for child in node.children.clone() {
            self.topo_collect(&child, acc);
        }
        self.applied_ops.insert(node.hash_value.clone());
        acc.push(node);
    }

    /// Collects every not-yet-applied ancestor of `root` in causal order, sorts by
    /// `(height, replica)` to approximate a total order across concurrent branches, and feeds the
    /// resulting operation stream to `state.apply_operations`.
    fn apply_from(&mut self, root: &Hash) {
        let mut ordered = Vec::new();
        self.topo_collect(root, &mut ordered);
        ordered.sort_by_key(|n| (n.height, n.replica));
        let ops: Vec<Vec<String>> = ordered.into_iter().map(|n| n.value).collect();
        let follow_ups = self.state.apply_operations(&ops);
        for follow_up in follow_ups {
            self.commit_move(follow_up);
        }
    }

    /// True if walking from `from` down through its children reaches `target` without first
    /// hitting a node we've already fully applied (a dead end — it was already determined not to
    /// reach `target` by an earlier call).
    fn reaches(&self, from: &Hash, target: &Hash) -> bool {
        if from == target {
            return true;
        }
        if self.applied_ops.contains(from) {
            return false;
        }
        match self.dag.nodes.get(from) {
            Some(node) => node.children.iter().any(|c| self.reaches(c, target)),
            None => false,
        }
    }

    /// Merges in a remote root. Precondition: every node reachable from `root` has already been
    /// added to this DAG (via [`Crdt::insert_node`]) by the caller — this method only replays and
    /// reconciles, it never fetches missing nodes itself.
    pub fn add_root(&mut self, root: Hash) {
        if self.applied_ops.contains(&root) {
            debug!(%root, "add_root: already applied, skipping");
            return;
        }
        // Decide, before replay mutates applied_ops, whether the incoming root is a causal
        // descendant of our current root (in which case it simply supersedes it) rather than a
        // genuinely concurrent branch (which needs a synthetic merge node).
        let incoming_supersedes_ours = self.reaches(&root, &self.dag.root.clone());
        self.apply_from(&root);
        if incoming_supersedes_ours {
            self.dag.root = root;
            return;
        }
        let mut children = BTreeSet::new();
        children.insert(root);
        children.insert(self.dag.root.clone());
        let merge_node = self.dag.new_node(self.replica, Vec::new(), children);
        let hash = merge_node.hash_value.clone();
        self.dag.nodes.insert(hash.clone(), merge_node);
        self.dag.root = hash;
    }

    /// Applies `value` to local state immediately, then wraps it in a new node whose sole parent
    /// is the current root and advances the root to it. Used for every locally-originated write
    /// (register writes, tree moves) — as opposed to [`Crdt::add_root`], which replays a batch of
    /// remote operations in causal order before deciding on a root.
    pub fn commit_local(&mut self, value: Vec<String>) -> Hash {
        let follow_ups = self.state.apply_operation(&value);
        let mut children = BTreeSet::new();
        children.insert(self.dag.root.clone());
        let node = self.dag.new_node(self.replica, value, children);
        let hash = node.hash_value.clone();
        self.dag.nodes.insert(hash.clone(), node);
        self.dag.root = hash.clone();
        self.applied_ops.insert(hash.clone());
        for follow_up in follow_ups {
            self.commit_move(follow_up);
        }
        hash
    }

    /// Commits `domain_fields` as `[height, replica, ...domain_fields]`, where `height` is one
    /// more than the current root's height. For CRDTs (the move-tree) whose op format embeds a
    /// `(height, replica)` prefix used for causal sorting on merge.
    pub fn commit_move(&mut self, domain_fields: Vec<String>) -> Hash {
        let next_height = self
            .dag
            .nodes
            .get(&self.dag.root)
            .map(|n| n.height)
            .unwrap_or(0)
            + 1;
        let mut value = vec![next_height.to_string(), self.replica.to_string()];
        value.extend(domain_fields);
        self.commit_local(value)
    }

    pub async fn fsync(&self) -> Result<(), DagError> {
        let bytes = serde_json::to_vec(&self.dag)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    pub async fn fload(&mut self) -> Result<(), DagError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.dag = serde_json::from_slice(&bytes)?;
        let root = self.dag.root.clone();
        self.apply_from(&root);
        Ok(())
    }
}
