//! Last-Writer-Wins register: the CRDT backing a single file's content.
//!
//! Writes are deferred — [`LwwRegister::write`] only stages bytes locally; nothing is hashed into
//! the DAG until [`LwwRegister::cut_root`] runs, which lets a burst of writes to the same file
//! (an editor autosaving every keystroke, say) collapse into one DAG node instead of one per
//! write. Conflicting writes are resolved by comparing `(height, replica)` — the taller write
//! wins, replica id breaks ties between writes of equal height.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::crdt::{Crdt, CrdtState};

#[derive(Default)]
pub struct LwwState {
    value: Vec<u8>,
    won: (i64, i64),
    dirty: bool,
}

impl CrdtState for LwwState {
    fn apply_operation(&mut self, op: &[String]) -> Vec<Vec<String>> {
        if op.is_empty() {
            return Vec::new();
        }
        let Ok(height) = op[0].parse::<i64>() else {
            return Vec::new();
        };
        let Ok(replica) = op[1].parse::<i64>() else {
            return Vec::new();
        };
        if (height, replica) > self.won {
            if let Ok(decoded) = STANDARD.decode(&op[2]) {
                self.value = decoded;
                self.won = (height, replica);
            }
        }
        Vec::new()
    }
}

pub type LwwRegister = Crdt<LwwState>;

impl LwwRegister {
    /// Stages `val` as the register's new content without touching the DAG. Callers that want the
    /// write to become durable/replicable must follow up with [`LwwRegister::cut_root`].
    pub fn write(&mut self, val: Vec<u8>) {
        self.state.dirty = true;
        self.state.value = val;
    }

    pub fn read(&self) -> &[u8] {
        &self.state.value
    }

    pub fn is_dirty(&self) -> bool {
        self.state.dirty
    }

    /// Materializes any staged write into a new DAG node. A no-op if nothing has been written
    /// since the last cut. Bumps `won` to a height strictly greater than anything seen so far,
    /// ensuring this replica's own write always wins against its own prior writes.
    pub fn cut_root(&mut self) {
        if !self.state.dirty {
            return;
        }
        let replica = self.replica();
        self.state.won = (self.state.won.0 + 1, replica);
        self.state.dirty = false;
        let encoded = STANDARD.encode(&self.state.value);
        let op = vec![
            self.state.won.0.to_string(),
            self.state.won.1.to_string(),
            encoded,
        ];
        self.commit_local(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn new_register(replica: i64) -> LwwRegister {
        Crdt::new(PathBuf::from(format!("/tmp/lww-test-{replica}.json")), replica)
    }

    #[test]
    fn write_is_staged_until_cut_root() {
        let mut reg = new_register(1);
        reg.write(b"hello".to_vec());
        assert!(reg.is_dirty());
        assert_eq!(reg.read(), b"hello");
        reg.cut_root();
        assert!(!reg.is_dirty());
        assert_eq!(reg.read(), b"hello");
    }

    #[test]
    fn cut_root_without_a_write_is_a_no_op() {
        let mut reg = new_register(1);
        let root_before = reg.root().clone();
        reg.cut_root();
        assert_eq!(reg.root(), &root_before);
    }

    #[test]
    fn higher_replica_wins_at_equal_height() {
        let mut low = new_register(1);
        low.write(b"from-low".to_vec());
        low.cut_root();

        let mut high = new_register(9);
        high.write(b"from-high".to_vec());
        high.cut_root();

        for node in high.nodes().values() {
            low.insert_node(node.clone());
        }
        low.add_root(high.root().clone());
        assert_eq!(low.read(), b"from-high");
    }

    proptest! {
        /// Whichever replica writes converge to the larger `(height, replica)` tuple, both sides
        /// of a merge see the same final value regardless of merge direction.
        #[test]
        fn lww_converges_to_the_same_value_from_either_merge_direction(
            replica_a in 1i64..50,
            replica_b in 51i64..100,
            value_a in "[a-z]{1,8}",
            value_b in "[a-z]{1,8}",
        ) {
            let mut a = new_register(replica_a);
            a.write(value_a.clone().into_bytes());
            a.cut_root();

            let mut b = new_register(replica_b);
            b.write(value_b.clone().into_bytes());
            b.cut_root();

            let mut a_merged = a;
            let mut b_merged = b;
            let a_nodes: Vec<_> = a_merged.nodes().values().cloned().collect();
            let b_nodes: Vec<_> = b_merged.nodes().values().cloned().collect();
            for node in &b_nodes {
                a_merged.insert_node(node.clone());
            }
            for node in &a_nodes {
                b_merged.insert_node(node.clone());
            }
            let b_root = b_merged.root().clone();
            let a_root = a_merged.root().clone();
            a_merged.add_root(b_root);
            b_merged.add_root(a_root);

            // replica_b's write always has the higher replica id at equal height, so it wins.
            prop_assert_eq!(a_merged.read(), b_merged.read());
            prop_assert_eq!(a_merged.read(), value_b.as_bytes());
        }
    }
}
