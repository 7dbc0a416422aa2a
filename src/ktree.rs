//! Replicated move-tree CRDT backing the filesystem namespace (directories, files, renames).
//!
//! Every change — create, rename, move, delete — is represented as a single `move` primitive:
//! "give `child` the parent `parent` and the name `meta`". Concurrent moves are reconciled by
//! undoing every locally-recorded move causally after the earliest incoming one, replaying the
//! whole run (incoming plus undone) in `(height, replica)` order, and then detecting and
//! resolving any resulting name collisions by renaming the loser. This is the
//! Kleppmann/Wiggins/et al. replicated move-operation algorithm; `other_examples` carries a
//! direct Rust port of it (`crdt-tree`'s `State::do_op`/`undo_op`/`redo_op`) which this module
//! follows for the undo/redo log shape.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::crdt::Crdt;
use crate::crdt::CrdtState;

/// Inode id of the tree root. Fixed rather than randomly allocated so every replica agrees on it
/// without needing to synchronize first.
pub const ROOT_ID: i64 = 1;
/// Inode id of the trash bin. Like `ROOT_ID`, a well-known constant rather than an allocated id;
/// `remove` reparents to here instead of deleting outright, so a disconnect-then-reconnect peer
/// can still causally order the deletion against concurrent edits under the old parent.
pub const TRASH_ID: i64 = 3;

#[derive(Debug, Error)]
pub enum KTreeError {
    #[error("no such parent inode {0}")]
    NoSuchParent(i64),
}

struct LogEntry {
    time: (i64, i64),
    old_parent: Option<(i64, String)>,
    parent: i64,
    meta: String,
    child: i64,
}

#[derive(Default)]
pub struct KTreeState {
    /// child id -> (parent id, name)
    tree: HashMap<i64, (i64, String)>,
    /// parent id -> set of (name, child id)
    children: HashMap<i64, HashSet<(String, i64)>>,
    oplog: Vec<LogEntry>,
    /// child id -> indices into `oplog` of moves that last placed it, in the order recorded.
    childlogs: HashMap<i64, Vec<usize>>,
}

impl KTreeState {
    fn ancestor(&self, parent: i64, child: i64) -> bool {
        if parent == child {
            return true;
        }
        match self.children.get(&parent) {
            None => false,
            Some(set) => set.iter().any(|(_, c)| self.ancestor(*c, child)),
        }
    }

    fn parent_exists(&self, id: i64) -> bool {
        id == TRASH_ID || self.tree.contains_key(&id)
    }

    pub fn parent_of(&self, id: i64) -> Option<i64> {
        self.tree.get(&id).map(|(p, _)| *p)
    }

    pub fn name_of(&self, id: i64) -> Option<&str> {
        self.tree.get(&id).map(|(_, m)| m.as_str())
    }

    pub fn lookup(&self, parent: i64, name: &str) -> Option<i64> {
        self.children
            .get(&parent)?
            .iter()
            .find(|(m, _)| m == name)
            .map(|(_, c)| *c)
    }

    pub fn list(&self, parent: i64) -> Vec<(String, i64)> {
        self.children
            .get(&parent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether moving `child` under `new_parent` would make `new_parent` one of `child`'s own
    /// descendants — detectable synchronously, unlike the general conflict case.
    pub fn would_create_cycle(&self, child: i64, new_parent: i64) -> bool {
        self.ancestor(child, new_parent)
    }
}

impl CrdtState for KTreeState {
    fn apply_operation(&mut self, op: &[String]) -> Vec<Vec<String>> {
        self.apply_operations(std::slice::from_ref(&op.to_vec()))
    }

    fn apply_operations(&mut self, ops: &[Vec<String>]) -> Vec<Vec<String>> {
        if ops.is_empty() {
            return Vec::new();
        }

        struct Parsed {
            time: (i64, i64),
            parent: i64,
            meta: String,
            child: i64,
        }

        let mut processed: Vec<Parsed> = ops
            .iter()
            .rev()
            .filter(|op| !op.is_empty())
            .filter_map(|op| {
                Some(Parsed {
                    time: (op[0].parse().ok()?, op[1].parse().ok()?),
                    parent: op[2].parse().ok()?,
                    meta: op[3].clone(),
                    child: op[4].parse().ok()?,
                })
            })
            .collect();

        if processed.is_empty() {
            return Vec::new();
        }

        let mut visited_parents: HashSet<i64> = HashSet::new();

        // Undo every locally-recorded move causally after the earliest incoming one, so the
        // whole run can be replayed together in a single causal order. Pinned to the earliest
        // incoming op's time up front — each undo only ever shrinks the remaining oplog's
        // maximum, so re-reading a moving target here would stop after a single pop.
        let earliest_incoming_time = processed.last().expect("checked non-empty above").time;
        while let Some(top) = self.oplog.last() {
            if top.time <= earliest_incoming_time {
                break;
            }
            let item = self.oplog.pop().expect("checked above");
            let idx_removed = self.oplog.len();
            if let Some(marks) = self.childlogs.get_mut(&item.child) {
                if marks.last() == Some(&idx_removed) {
                    marks.pop();
                }
            }
            if let Some(set) = self.children.get_mut(&item.parent) {
                set.remove(&(item.meta.clone(), item.child));
            }
            match item.old_parent.clone() {
                Some(old_parent) => {
                    self.children
                        .entry(old_parent.0)
                        .or_default()
                        .insert((old_parent.1.clone(), item.child));
                    visited_parents.insert(old_parent.0);
                    self.tree.insert(item.child, old_parent);
                }
                None => {
                    self.tree.remove(&item.child);
                }
            }
            processed.push(Parsed {
                time: item.time,
                parent: item.parent,
                meta: item.meta,
                child: item.child,
            });
        }

        processed.sort_by_key(|p| p.time);

        for i in 0..processed.len() {
            if i != 0 {
                let (prev, cur) = (&processed[i - 1], &processed[i]);
                if prev.time == cur.time
                    && prev.parent == cur.parent
                    && prev.meta == cur.meta
                    && prev.child == cur.child
                {
                    continue;
                }
            }
            let v = &processed[i];
            let old_parent = self.tree.get(&v.child).cloned();
            self.oplog.push(LogEntry {
                time: v.time,
                old_parent: old_parent.clone(),
                parent: v.parent,
                meta: v.meta.clone(),
                child: v.child,
            });
            self.children.entry(v.child).or_default();

            // Moving a node under its own descendant would create a cycle; record the attempt in
            // the log (so it undoes cleanly) but don't act on it.
            if self.ancestor(v.child, v.parent) {
                continue;
            }

            let new_idx = self.oplog.len() - 1;
            self.childlogs.entry(v.child).or_default().push(new_idx);
            self.tree.insert(v.child, (v.parent, v.meta.clone()));
            if let Some(old) = &old_parent {
                if let Some(set) = self.children.get_mut(&old.0) {
                    set.remove(&(old.1.clone(), v.child));
                }
            }
            self.children
                .entry(v.parent)
                .or_default()
                .insert((v.meta.clone(), v.child));
            visited_parents.insert(v.parent);
        }

        // Now that every move has landed, look for name collisions under each touched parent and
        // rename every loser but the most-recently-written child.
        let mut follow_up_moves: Vec<(i64, String, i64)> = Vec::new();
        for parent in &visited_parents {
            if *parent == TRASH_ID {
                continue;
            }
            let mut by_name: HashMap<String, Vec<i64>> = HashMap::new();
            if let Some(set) = self.children.get(parent) {
                for (name, child) in set {
                    by_name.entry(name.clone()).or_default().push(*child);
                }
            }
            for (name, mut contenders) in by_name {
                if contenders.len() < 2 {
                    continue;
                }
                contenders.sort_by_key(|c| {
                    let idx = self.childlogs[c].last().copied().unwrap_or(0);
                    self.oplog[idx].time
                });
                for loser in &contenders[..contenders.len() - 1] {
                    let idx = self.childlogs[loser].last().copied().unwrap_or(0);
                    let last_op = &self.oplog[idx];
                    let mut suffix = 0u32;
                    let mut candidate = format!("{name}_{}_{suffix}", last_op.time.1);
                    while self.lookup(last_op.parent, &candidate).is_some() {
                        suffix += 1;
                        candidate = format!("{name}_{}_{suffix}", last_op.time.1);
                    }
                    follow_up_moves.push((last_op.parent, candidate, *loser));
                }
            }
        }

        follow_up_moves
            .into_iter()
            .map(|(parent, meta, child)| vec![parent.to_string(), meta, child.to_string()])
            .collect()
    }
}

pub type KTree = Crdt<KTreeState>;

impl KTree {
    pub fn new_tree(path: std::path::PathBuf, replica: i64) -> Self {
        let mut tree = Crdt::new(path, replica);
        tree.commit_move(vec!["0".to_string(), "root".to_string(), ROOT_ID.to_string()]);
        tree
    }

    /// Loads a tree snapshot from `path`, bootstrapping a fresh one (with `ROOT_ID` already
    /// created) if no snapshot exists yet.
    pub async fn open(path: std::path::PathBuf, replica: i64) -> Result<Self, crate::dag::DagError> {
        let mut tree: Crdt<KTreeState> = Crdt::new(path, replica);
        tree.fload().await?;
        if tree.state.parent_of(ROOT_ID).is_none() {
            tree.commit_move(vec!["0".to_string(), "root".to_string(), ROOT_ID.to_string()]);
        }
        Ok(tree)
    }

    fn do_move(&mut self, parent: i64, meta: String, child: i64) -> Result<(), KTreeError> {
        if !self.state.parent_exists(parent) {
            return Err(KTreeError::NoSuchParent(parent));
        }
        self.commit_move(vec![parent.to_string(), meta, child.to_string()]);
        Ok(())
    }

    pub fn mkdir(&mut self, parent: i64, name: String) -> Result<i64, KTreeError> {
        let id = fresh_id(false);
        self.do_move(parent, name, id)?;
        Ok(id)
    }

    pub fn mkf(&mut self, parent: i64, name: String) -> Result<i64, KTreeError> {
        let id = fresh_id(true);
        self.do_move(parent, name, id)?;
        Ok(id)
    }

    pub fn rename(&mut self, id: i64, new_parent: i64, new_name: String) -> Result<(), KTreeError> {
        self.do_move(new_parent, new_name, id)
    }

    pub fn remove(&mut self, id: i64) -> Result<(), KTreeError> {
        let marker = fresh_id(false).to_string();
        self.do_move(TRASH_ID, marker, id)
    }

    pub fn parent_of(&self, id: i64) -> Option<i64> {
        self.state.parent_of(id)
    }

    pub fn name_of(&self, id: i64) -> Option<&str> {
        self.state.name_of(id)
    }

    pub fn lookup(&self, parent: i64, name: &str) -> Option<i64> {
        self.state.lookup(parent, name)
    }

    pub fn list(&self, parent: i64) -> Vec<(String, i64)> {
        self.state.list(parent)
    }

    pub fn would_create_cycle(&self, child: i64, new_parent: i64) -> bool {
        self.state.would_create_cycle(child, new_parent)
    }
}

/// A file id has its top bit set, a directory id has it cleared — lets callers tell them apart
/// without a round trip through the tree.
fn fresh_id(is_file: bool) -> i64 {
    let mut bits: u64 = rand::random();
    bits &= !(1u64 << 63);
    if is_file {
        bits |= 1u64 << 63;
    }
    bits as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn new_tree(replica: i64) -> KTree {
        KTree::new_tree(PathBuf::from(format!("/tmp/ktree-test-{replica}.json")), replica)
    }

    #[test]
    fn mkdir_under_root_is_visible_by_name() {
        let mut t = new_tree(1);
        let id = t.mkdir(ROOT_ID, "docs".to_string()).unwrap();
        assert_eq!(t.lookup(ROOT_ID, "docs"), Some(id));
        assert_eq!(t.parent_of(id), Some(ROOT_ID));
    }

    #[test]
    fn mkdir_under_missing_parent_fails() {
        let mut t = new_tree(1);
        let err = t.mkdir(9999, "orphan".to_string()).unwrap_err();
        assert!(matches!(err, KTreeError::NoSuchParent(9999)));
    }

    #[test]
    fn rename_updates_lookup() {
        let mut t = new_tree(1);
        let id = t.mkf(ROOT_ID, "a.txt".to_string()).unwrap();
        t.rename(id, ROOT_ID, "b.txt".to_string()).unwrap();
        assert_eq!(t.lookup(ROOT_ID, "a.txt"), None);
        assert_eq!(t.lookup(ROOT_ID, "b.txt"), Some(id));
    }

    #[test]
    fn remove_moves_into_trash() {
        let mut t = new_tree(1);
        let id = t.mkf(ROOT_ID, "a.txt".to_string()).unwrap();
        t.remove(id).unwrap();
        assert_eq!(t.lookup(ROOT_ID, "a.txt"), None);
        assert_eq!(t.parent_of(id), Some(TRASH_ID));
    }

    #[test]
    fn moving_a_directory_under_its_own_descendant_is_ignored() {
        let mut t = new_tree(1);
        let a = t.mkdir(ROOT_ID, "a".to_string()).unwrap();
        let b = t.mkdir(a, "b".to_string()).unwrap();
        // Trying to move a under b (a's own child) would create a cycle.
        t.rename(a, b, "a".to_string()).unwrap();
        assert_eq!(t.parent_of(a), Some(ROOT_ID), "cycle-creating move must be dropped");
    }

    #[test]
    fn concurrent_same_name_create_is_resolved_by_renaming_the_loser() {
        let mut a = new_tree(1);
        let a_file = a.mkf(ROOT_ID, "note.txt".to_string()).unwrap();

        let mut b = new_tree(9);
        for node in a.nodes().values() {
            b.insert_node(node.clone());
        }
        b.add_root(a.root().clone());
        let b_file = b.mkf(ROOT_ID, "note.txt".to_string()).unwrap();

        for node in b.nodes().values() {
            a.insert_node(node.clone());
        }
        a.add_root(b.root().clone());

        // Both files must still exist, under distinct names, with the higher-replica write
        // keeping the contested name.
        assert_eq!(a.lookup(ROOT_ID, "note.txt"), Some(b_file));
        assert_ne!(a.parent_of(a_file), None);
        assert!(a
            .list(ROOT_ID)
            .iter()
            .any(|(name, child)| *child == a_file && name != "note.txt"));
    }

    /// For every parent in the tree (except TRASH), every child name under it is unique — the
    /// K-Tree's conflict-resolution rename pass must never leave a collision unresolved.
    fn assert_unique_names_everywhere(t: &KTree) {
        let mut by_parent: HashMap<i64, HashSet<String>> = HashMap::new();
        for (child, (parent, name)) in &t.state.tree {
            if *parent == TRASH_ID {
                continue;
            }
            assert!(
                by_parent.entry(*parent).or_default().insert(name.clone()),
                "duplicate name {name:?} under parent {parent} (child {child})"
            );
        }
    }

    proptest! {
        /// A sequence of concurrent same-named creates across two replicas, merged in both
        /// directions, must never leave a directory with two children sharing a name.
        #[test]
        fn concurrent_creates_never_leave_duplicate_names(
            names in prop::collection::vec("[a-z]{1,4}", 1..6),
            replica_a in 1i64..50,
            replica_b in 51i64..100,
        ) {
            let mut a = new_tree(replica_a);
            let mut b = new_tree(replica_b);
            for node in a.nodes().values() {
                b.insert_node(node.clone());
            }
            b.add_root(a.root().clone());

            for name in &names {
                a.mkf(ROOT_ID, name.clone()).unwrap();
                b.mkf(ROOT_ID, name.clone()).unwrap();
            }

            let a_nodes: Vec<_> = a.nodes().values().cloned().collect();
            let b_nodes: Vec<_> = b.nodes().values().cloned().collect();
            for node in &b_nodes {
                a.insert_node(node.clone());
            }
            for node in &a_nodes {
                b.insert_node(node.clone());
            }
            let b_root = b.root().clone();
            let a_root = a.root().clone();
            a.add_root(b_root);
            b.add_root(a_root);

            assert_unique_names_everywhere(&a);
            assert_unique_names_everywhere(&b);
        }
    }
}
