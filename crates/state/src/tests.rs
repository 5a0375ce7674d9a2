//! Structural invariant checks that need access to tree internals. The
//! black-box scenario suites live in `tests/`.

use crate::node::Node;
use crate::node_db::NodeDb;
use crate::MutableTree;
use canopy_storage::MemDb;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;

fn new_tree() -> MutableTree {
    MutableTree::new(Arc::new(MemDb::new()), 100).expect("in-memory tree")
}

struct SubtreeStats {
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    height: i8,
    size: i64,
}

/// Walk the whole tree, checking the AVL balance, height/size bookkeeping,
/// key ordering and the pivot invariant at every inner node.
fn check_subtree(ndb: &NodeDb, node: &Arc<Node>) -> SubtreeStats {
    if node.is_leaf() {
        assert_eq!(node.height, 0, "leaf height");
        assert_eq!(node.size, 1, "leaf size");
        return SubtreeStats {
            min_key: node.key.clone(),
            max_key: node.key.clone(),
            height: 0,
            size: 1,
        };
    }

    let left = ndb.resolve(node.left_ref()).expect("resolve left child");
    let right = ndb.resolve(node.right_ref()).expect("resolve right child");
    let left_stats = check_subtree(ndb, &left);
    let right_stats = check_subtree(ndb, &right);

    let balance = left_stats.height as i32 - right_stats.height as i32;
    assert!(balance.abs() <= 1, "balance factor {balance} out of range");
    assert_eq!(
        node.height,
        1 + left_stats.height.max(right_stats.height),
        "stored height mismatch"
    );
    assert_eq!(
        node.size,
        left_stats.size + right_stats.size,
        "stored size mismatch"
    );
    assert!(
        left_stats.max_key < node.key,
        "left subtree keys must stay below the pivot"
    );
    assert_eq!(
        node.key, right_stats.min_key,
        "pivot must equal the minimum key of the right subtree"
    );

    SubtreeStats {
        min_key: left_stats.min_key,
        max_key: right_stats.max_key,
        height: node.height,
        size: node.size,
    }
}

fn check_invariants(tree: &MutableTree) {
    if let Some(root) = tree.working_root() {
        let stats = check_subtree(tree.node_db(), root);
        assert_eq!(stats.size, tree.size());
        assert_eq!(stats.height, tree.height());
    } else {
        assert_eq!(tree.size(), 0);
    }
}

#[test]
fn invariants_hold_during_random_edits() {
    let mut tree = new_tree();
    let mut oracle = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(42);

    for round in 0..6 {
        for _ in 0..200 {
            let key = format!("key-{:03}", rng.gen_range(0..250)).into_bytes();
            if rng.gen_bool(0.7) {
                let value = format!("value-{}", rng.gen::<u32>()).into_bytes();
                tree.set(&key, &value).expect("set");
                oracle.insert(key, value);
            } else {
                let removed = tree.remove(&key).expect("remove");
                assert_eq!(removed, oracle.remove(&key), "round {round}");
            }
        }
        check_invariants(&tree);

        for (key, value) in &oracle {
            assert_eq!(tree.get(key).expect("get").as_ref(), Some(value));
        }
        assert_eq!(tree.size(), oracle.len() as i64);

        tree.save_version().expect("save");
        check_invariants(&tree);
    }
}

#[test]
fn single_edit_orphans_stay_within_bound() {
    let mut tree = new_tree();
    for i in 0..200u32 {
        tree.set(format!("key-{i:03}").as_bytes(), b"value").expect("set");
    }
    tree.save_version().expect("save");

    // A fresh working version over fully persisted nodes: each edit may
    // orphan at most one node per level plus three from rebalancing.
    let bound = (tree.height() as usize) + 3;

    let before = tree.orphan_count();
    tree.set(b"key-100", b"updated").expect("set");
    assert!(tree.orphan_count() - before <= bound);

    tree.rollback();
    let before = tree.orphan_count();
    tree.remove(b"key-100").expect("remove");
    assert!(tree.orphan_count() - before <= bound);
}

#[test]
fn orphans_are_only_persisted_nodes() {
    let mut tree = new_tree();
    for i in 0..50u32 {
        tree.set(format!("key-{i:02}").as_bytes(), b"value").expect("set");
    }
    // Nothing was saved, so nothing can be orphaned.
    assert_eq!(tree.orphan_count(), 0);

    tree.save_version().expect("save");
    tree.set(b"key-25", b"other").expect("set");
    assert!(tree.orphan_count() > 0);
}

#[test]
fn working_hash_is_stable_across_recomputation() {
    let mut tree = new_tree();
    for i in 0..32u32 {
        tree.set(format!("key-{i:02}").as_bytes(), format!("value-{i}").as_bytes())
            .expect("set");
    }
    let first = tree.working_hash();
    let second = tree.working_hash();
    assert_eq!(first, second);

    // Saving persists the same nodes; the root hash must not move.
    let (saved, _) = tree.save_version().expect("save");
    assert_eq!(first, saved);
    assert_eq!(tree.working_hash(), saved);
}

#[test]
fn identical_histories_produce_identical_hashes() {
    let script: Vec<(Vec<u8>, Vec<u8>)> = (0..100u32)
        .map(|i| {
            (
                format!("key-{:03}", (i * 37) % 100).into_bytes(),
                format!("value-{i}").into_bytes(),
            )
        })
        .collect();

    let mut a = new_tree();
    let mut b = new_tree();
    for (key, value) in &script {
        a.set(key, value).expect("set");
        b.set(key, value).expect("set");
    }
    assert_eq!(a.working_hash(), b.working_hash());

    let (hash_a, v_a) = a.save_version().expect("save");
    let (hash_b, v_b) = b.save_version().expect("save");
    assert_eq!(hash_a, hash_b);
    assert_eq!(v_a, v_b);
}
