//! Content-addressed operation DAG (Merkle-CRDT substrate).
//!
//! A [`Dag`] is nothing more than a hash-keyed mapping of immutable [`OpNode`]s plus a single
//! `root` hash that transitively reaches every node currently held. Nodes refer to their causal
//! predecessors by hash (the `children` field, named for the algorithm this crate follows rather
//! than for tree structure) — never by in-memory pointer — so the whole thing is flat, trivially
//! serializable, and safe to replicate by exchanging individual nodes.
//!
//! This module only knows how to build and hash nodes. The replay/merge semantics that make a
//! [`Dag`] into a CRDT live in [`crate::crdt`].

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hex-encoded content hash identifying an [`OpNode`].
pub type Hash = String;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("io error persisting dag: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize dag: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Immutable, content-addressed operation record — the unit of replication.
///
/// `hash_value` is derived from `(value, children)` alone, so two replicas that independently
/// construct a node with the same value and the same causal predecessors always agree on its
/// identity. `children` holds the hashes of direct causal predecessors (not tree children); it is
/// empty only for the synthetic genesis node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpNode {
    pub hash_value: Hash,
    pub replica: i64,
    pub height: u64,
    pub value: Vec<String>,
    pub children: BTreeSet<Hash>,
}

/// A mapping from hash to node, plus the single root hash that reaches every node in the map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    pub root: Hash,
    pub nodes: HashMap<Hash, OpNode>,
}

impl Dag {
    /// Builds the synthetic genesis node and a `Dag` containing only it.
    pub fn genesis(replica: i64) -> Self {
        let mut dag = Dag {
            root: String::new(),
            nodes: HashMap::new(),
        };
        let genesis = dag.new_node(replica, Vec::new(), BTreeSet::new());
        dag.root = genesis.hash_value.clone();
        dag.nodes.insert(genesis.hash_value.clone(), genesis);
        dag
    }

    /// Computes a node's content hash: every `value` element fed into the hasher in order,
    /// followed by every child hash in sorted (lexicographic) order. Deterministic across
    /// replicas given the same inputs.
    fn hash_of(value: &[String], children: &BTreeSet<Hash>) -> Hash {
        let mut hasher = blake3::Hasher::new();
        for item in value {
            hasher.update(item.as_bytes());
        }
        // BTreeSet already iterates in sorted order.
        for child in children {
            hasher.update(child.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Constructs a new node bound to `replica`, deriving its hash and height from `value` and
    /// `children`. Height is `1 + max(child.height)`, or `1` for a childless (leaf/genesis) node.
    ///
    /// Does not insert the node into `self.nodes` or advance `self.root` — callers decide when a
    /// freshly built node becomes part of the committed state.
    pub fn new_node(&self, replica: i64, value: Vec<String>, children: BTreeSet<Hash>) -> OpNode {
        let height = children
            .iter()
            .filter_map(|c| self.nodes.get(c))
            .map(|n| n.height)
            .max()
            .unwrap_or(0)
            + 1;
        let hash_value = Self::hash_of(&value, &children);
        OpNode {
            hash_value,
            replica,
            height,
            value,
            children,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hash_is_deterministic_across_equivalent_construction() {
        let dag = Dag::genesis(1);
        let a = dag.new_node(1, vec!["put".into(), "x".into()], BTreeSet::new());
        let b = dag.new_node(2, vec!["put".into(), "x".into()], BTreeSet::new());
        assert_eq!(a.hash_value, b.hash_value, "hash must not depend on replica");
    }

    #[test]
    fn height_is_one_plus_max_child_height() {
        let mut dag = Dag::genesis(1);
        let leaf = dag.new_node(1, vec!["a".into()], BTreeSet::new());
        assert_eq!(leaf.height, 1);
        dag.nodes.insert(leaf.hash_value.clone(), leaf.clone());

        let mut children = BTreeSet::new();
        children.insert(leaf.hash_value.clone());
        let parent = dag.new_node(1, vec!["b".into()], children);
        assert!(parent.height > leaf.height);
        assert_eq!(parent.height, leaf.height + 1);
    }

    #[test]
    fn differing_children_yield_differing_hashes() {
        let dag = Dag::genesis(1);
        let a = dag.new_node(1, vec!["op".into()], BTreeSet::new());
        let mut children = BTreeSet::new();
        children.insert("deadbeef".to_string());
        let b = dag.new_node(1, vec!["op".into()], children);
        assert_ne!(a.hash_value, b.hash_value);
    }

    proptest! {
        #[test]
        fn hash_is_deterministic_regardless_of_originating_replica(
            value in prop::collection::vec("[a-z0-9]{0,8}", 0..4),
            replica_a in 1i64..1000,
            replica_b in 1i64..1000,
        ) {
            let dag = Dag::genesis(1);
            let a = dag.new_node(replica_a, value.clone(), BTreeSet::new());
            let b = dag.new_node(replica_b, value, BTreeSet::new());
            prop_assert_eq!(a.hash_value, b.hash_value);
        }

        #[test]
        fn height_always_exceeds_every_child(
            leaf_values in prop::collection::vec(prop::collection::vec("[a-z]{0,4}", 0..3), 1..6),
        ) {
            let mut dag = Dag::genesis(1);
            let mut children = BTreeSet::new();
            for value in leaf_values {
                let leaf = dag.new_node(1, value, BTreeSet::new());
                dag.nodes.insert(leaf.hash_value.clone(), leaf.clone());
                children.insert(leaf.hash_value);
            }
            let parent = dag.new_node(1, vec!["parent".into()], children.clone());
            for child_hash in &children {
                let child = &dag.nodes[child_hash];
                prop_assert!(parent.height > child.height);
            }
        }
    }
}
