//! Black-box tests for the working-tree operations: point reads, writes,
//! removal, iteration and hashing.

use canopy_state::{MutableTree, TreeError};
use canopy_storage::MemDb;
use std::collections::BTreeMap;
use std::sync::Arc;

fn new_tree() -> MutableTree {
    MutableTree::new(Arc::new(MemDb::new()), 1000).expect("in-memory tree")
}

fn collect(tree: &MutableTree) -> Vec<(Vec<u8>, Vec<u8>)> {
    tree.iter()
        .expect("iterator")
        .collect::<Result<_, _>>()
        .expect("iteration")
}

#[test]
fn set_get_save_roundtrip() {
    // Empty tree, three keys, one save.
    let mut tree = new_tree();
    assert!(tree.is_empty());

    assert!(!tree.set(b"a", b"1").unwrap());
    assert!(!tree.set(b"b", b"2").unwrap());
    assert!(!tree.set(b"c", b"3").unwrap());

    let (_, version) = tree.save_version().unwrap();
    assert_eq!(version, 1);

    assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(tree.get(b"d").unwrap(), None);
    assert_eq!(tree.size(), 3);
    assert_eq!(tree.height(), 2);
}

#[test]
fn set_reports_updates() {
    let mut tree = new_tree();
    assert!(!tree.set(b"key", b"one").unwrap());
    assert!(tree.set(b"key", b"two").unwrap());
    assert_eq!(tree.get(b"key").unwrap(), Some(b"two".to_vec()));
    assert_eq!(tree.size(), 1);
}

#[test]
fn empty_keys_are_rejected() {
    let mut tree = new_tree();
    assert!(matches!(tree.set(b"", b"v"), Err(TreeError::EmptyKey)));
    assert!(matches!(tree.remove(b""), Err(TreeError::EmptyKey)));
}

#[test]
fn empty_values_are_distinct_from_absent() {
    let mut tree = new_tree();
    tree.set(b"key", b"").unwrap();
    assert_eq!(tree.get(b"key").unwrap(), Some(Vec::new()));
    assert_eq!(tree.get(b"other").unwrap(), None);

    tree.save_version().unwrap();
    assert_eq!(tree.get(b"key").unwrap(), Some(Vec::new()));
}

#[test]
fn remove_returns_the_value() {
    let mut tree = new_tree();
    tree.set(b"a", b"1").unwrap();
    tree.set(b"b", b"2").unwrap();

    assert_eq!(tree.remove(b"missing").unwrap(), None);
    assert_eq!(tree.remove(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.get(b"a").unwrap(), None);
    assert_eq!(tree.size(), 1);

    assert_eq!(tree.remove(b"b").unwrap(), Some(b"2".to_vec()));
    assert!(tree.is_empty());
}

#[test]
fn removing_every_key_and_saving_yields_the_empty_hash() {
    let mut tree = new_tree();
    tree.set(b"only", b"value").unwrap();
    tree.save_version().unwrap();

    tree.remove(b"only").unwrap();
    let (hash, version) = tree.save_version().unwrap();
    assert_eq!(version, 2);
    assert_eq!(hash, canopy_state::empty_root_hash());
}

#[test]
fn working_hash_tracks_unsaved_edits() {
    // An unsaved edit must change the working hash but not the saved hash;
    // rollback reunites them.
    let mut tree = new_tree();
    tree.set(b"a", b"1").unwrap();
    tree.set(b"b", b"2").unwrap();
    tree.set(b"c", b"3").unwrap();
    tree.save_version().unwrap();

    tree.set(b"b", b"20").unwrap();
    assert_ne!(tree.working_hash(), tree.hash());

    tree.rollback();
    assert_eq!(tree.working_hash(), tree.hash());
    assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn rollback_discards_removals_too() {
    let mut tree = new_tree();
    tree.set(b"a", b"1").unwrap();
    tree.save_version().unwrap();

    tree.remove(b"a").unwrap();
    assert_eq!(tree.get(b"a").unwrap(), None);

    tree.rollback();
    assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.working_hash(), tree.hash());
}

#[test]
fn iteration_is_ordered_and_merges_unsaved_edits() {
    let mut tree = new_tree();
    let mut oracle = BTreeMap::new();
    for i in [5u32, 1, 9, 3, 7, 2, 8] {
        let key = format!("key-{i}").into_bytes();
        let value = format!("value-{i}").into_bytes();
        tree.set(&key, &value).unwrap();
        oracle.insert(key, value);
    }
    tree.save_version().unwrap();

    // Unsaved overlay: one update, one addition, one removal.
    tree.set(b"key-3", b"updated").unwrap();
    oracle.insert(b"key-3".to_vec(), b"updated".to_vec());
    tree.set(b"key-4", b"new").unwrap();
    oracle.insert(b"key-4".to_vec(), b"new".to_vec());
    tree.remove(b"key-7").unwrap();
    oracle.remove(b"key-7".as_slice());

    let expected: Vec<(Vec<u8>, Vec<u8>)> = oracle.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(collect(&tree), expected);

    // Descending iteration is the exact reverse.
    let mut reversed = expected.clone();
    reversed.reverse();
    let descending: Vec<(Vec<u8>, Vec<u8>)> = tree
        .range(None, None, false)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(descending, reversed);
}

#[test]
fn range_bounds_are_half_open() {
    let mut tree = new_tree();
    for key in [b"a", b"b", b"c", b"d", b"e"] {
        tree.set(key, b"value").unwrap();
    }
    tree.save_version().unwrap();

    let keys: Vec<Vec<u8>> = tree
        .range(Some(b"b"), Some(b"d"), true)
        .unwrap()
        .map(|item| item.unwrap().0)
        .collect();
    assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn insertion_order_changes_the_shape_but_not_the_contents() {
    // Height-balanced trees are not canonical-form: inserting the same set
    // ascending and descending may produce different root hashes, but the
    // contents, size, height bounds and every structural invariant agree.
    let keys: Vec<Vec<u8>> = {
        let mut keys: Vec<Vec<u8>> = (1..=1000u32).map(|i| i.to_string().into_bytes()).collect();
        keys.sort();
        keys
    };

    let mut ascending = new_tree();
    for key in &keys {
        ascending.set(key, &[b"v".as_slice(), key.as_slice()].concat()).unwrap();
    }
    ascending.save_version().unwrap();

    let mut descending = new_tree();
    for key in keys.iter().rev() {
        descending.set(key, &[b"v".as_slice(), key.as_slice()].concat()).unwrap();
    }
    descending.save_version().unwrap();

    assert_eq!(ascending.size(), 1000);
    assert_eq!(descending.size(), 1000);
    assert_eq!(ascending.height(), descending.height());
    assert_eq!(collect(&ascending), collect(&descending));
}

#[test]
fn deletions_leave_only_the_survivors() {
    // Inserts plus deletes must land on exactly the surviving contents.
    let mut tree = new_tree();
    let mut oracle = BTreeMap::new();
    for i in 0..100u32 {
        let key = format!("key-{i:03}").into_bytes();
        let value = format!("value-{i}").into_bytes();
        tree.set(&key, &value).unwrap();
        oracle.insert(key, value);
    }
    for i in (0..100u32).step_by(3) {
        let key = format!("key-{i:03}").into_bytes();
        tree.remove(&key).unwrap();
        oracle.remove(&key);
    }
    tree.save_version().unwrap();

    let survivors: Vec<(Vec<u8>, Vec<u8>)> =
        oracle.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(collect(&tree), survivors);
    assert_eq!(tree.size(), survivors.len() as i64);

    // A fresh tree fed the same operation history lands on the same hash.
    let mut replay = new_tree();
    for i in 0..100u32 {
        replay
            .set(
                format!("key-{i:03}").as_bytes(),
                format!("value-{i}").as_bytes(),
            )
            .unwrap();
    }
    for i in (0..100u32).step_by(3) {
        replay.remove(format!("key-{i:03}").as_bytes()).unwrap();
    }
    replay.save_version().unwrap();
    assert_eq!(replay.hash(), tree.hash());
}
