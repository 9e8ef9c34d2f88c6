// Path: crates/state/src/tree/mutable/tests.rs

use super::*;
use crate::tree::EMPTY_ROOT_HASH;
use canopy_storage::{KvStore, MemoryStore, RedbStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap as Model;

fn new_tree() -> MutableTree {
    MutableTree::new(Arc::new(MemoryStore::new()), TreeOptions::default()).unwrap()
}

fn rand_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect()
}

/// Walks the working tree verifying every structural invariant: AVL balance,
/// height and size bookkeeping, ordering, and that each routing key equals
/// the smallest key of its right subtree. Returns (height, size, min, max).
fn check_node(
    tree: &MutableTree,
    node_ref: &NodeRef,
    min: Option<&[u8]>,
    max: Option<&[u8]>,
) -> (i32, u64, Vec<u8>, Vec<u8>) {
    let node = tree.ndb.resolve(node_ref).unwrap();
    if node.is_leaf() {
        if let Some(min) = min {
            assert!(node.key.as_slice() >= min);
        }
        if let Some(max) = max {
            assert!(node.key.as_slice() < max);
        }
        return (0, 1, node.key.clone(), node.key.clone());
    }
    let (left_height, left_size, left_min, left_max) =
        check_node(tree, node.left_ref().unwrap(), min, Some(&node.key));
    let (right_height, right_size, right_min, right_max) =
        check_node(tree, node.right_ref().unwrap(), Some(&node.key), max);

    assert!(
        (left_height - right_height).abs() <= 1,
        "unbalanced node at key {:?}",
        node.key
    );
    assert_eq!(node.height, 1 + left_height.max(right_height));
    assert_eq!(node.size, left_size + right_size);
    assert_eq!(
        node.key, right_min,
        "routing key must equal the right-subtree minimum"
    );
    assert!(left_max.as_slice() < node.key.as_slice());
    (node.height, node.size, left_min, right_max)
}

fn check_invariants(tree: &MutableTree) {
    if let Some(root) = &tree.root {
        check_node(tree, root, None, None);
    }
}

fn count_nodes(tree: &MutableTree, node_ref: &NodeRef) -> u64 {
    let node = tree.ndb.resolve(node_ref).unwrap();
    if node.is_leaf() {
        return 1;
    }
    1 + count_nodes(tree, node.left_ref().unwrap()) + count_nodes(tree, node.right_ref().unwrap())
}

#[test]
fn test_save_empty_tree() {
    let mut tree = new_tree();
    let (hash, version) = tree.save_version().unwrap();
    assert_eq!(version, 1);
    assert_eq!(hash, EMPTY_ROOT_HASH);
    assert_eq!(tree.get(b"x").unwrap(), None);
    assert_eq!(tree.get_fast(b"x").unwrap(), None);
    assert_eq!(tree.size().unwrap(), 0);
}

#[test]
fn test_single_key() {
    let mut tree = new_tree();
    assert!(!tree.set(b"a", b"1").unwrap());
    let (hash, version) = tree.save_version().unwrap();
    assert_eq!(version, 1);
    assert_ne!(hash, EMPTY_ROOT_HASH);
    assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.get_fast(b"a").unwrap(), Some(b"1".to_vec()));

    let view = tree.get_immutable(1).unwrap();
    assert_eq!(view.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(view.size().unwrap(), 1);
    assert_eq!(view.hash().unwrap(), hash);
}

#[test]
fn test_set_and_remove_report_prior_state() {
    let mut tree = new_tree();
    assert!(!tree.set(b"k", b"1").unwrap());
    assert!(tree.set(b"k", b"2").unwrap());
    assert_eq!(tree.remove(b"k").unwrap(), Some(b"2".to_vec()));
    assert_eq!(tree.remove(b"k").unwrap(), None);
    assert_eq!(tree.remove(b"absent").unwrap(), None);
}

#[test]
fn test_get_with_index() {
    let mut tree = new_tree();
    for key in [b"a", b"c", b"e"] {
        tree.set(key, key).unwrap();
    }
    tree.save_version().unwrap();
    let view = tree.get_immutable(1).unwrap();

    assert_eq!(view.get_with_index(b"a").unwrap(), (0, Some(b"a".to_vec())));
    assert_eq!(view.get_with_index(b"c").unwrap(), (1, Some(b"c".to_vec())));
    assert_eq!(view.get_with_index(b"e").unwrap(), (2, Some(b"e".to_vec())));
    // absent keys report their insertion position
    assert_eq!(view.get_with_index(b"b").unwrap(), (1, None));
    assert_eq!(view.get_with_index(b"z").unwrap(), (3, None));
}

#[test]
fn test_traverse_node_count() {
    let mut tree = new_tree();
    for i in 0..6u32 {
        tree.set(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
            .unwrap();
    }
    // 6 leaves and 5 branches
    assert_eq!(count_nodes(&tree, tree.root.as_ref().unwrap()), 11);
    check_invariants(&tree);
}

#[test]
fn test_delete() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let mut tree = MutableTree::new(store.clone(), TreeOptions::default()).unwrap();

    tree.set(b"k1", b"Fred").unwrap();
    let (hash, version) = tree.save_version().unwrap();
    tree.save_version().unwrap();

    tree.delete_version(version).unwrap();
    assert!(matches!(
        tree.get_immutable(version),
        Err(StateError::VersionNotFound(1))
    ));

    // Resurrect the root record by hand; the nodes are still live because
    // version 2 shares them.
    let mut root_key = b"r/".to_vec();
    root_key.extend_from_slice(&version.to_be_bytes());
    store.set(&root_key, &hash).unwrap();

    let view = tree.get_immutable(version).unwrap();
    assert_eq!(view.get(b"k1").unwrap(), Some(b"Fred".to_vec()));
}

#[test]
fn test_determinism() {
    let mut rng = StdRng::seed_from_u64(41);
    let mut ops: Vec<(bool, Vec<u8>, Vec<u8>)> = Vec::new();
    for _ in 0..300 {
        let key_len = rng.gen_range(1..8);
        let key = rand_bytes(&mut rng, key_len);
        if rng.gen_bool(0.25) {
            ops.push((false, key, Vec::new()));
        } else {
            let value = rand_bytes(&mut rng, 8);
            ops.push((true, key, value));
        }
    }

    let run = |ops: &[(bool, Vec<u8>, Vec<u8>)]| -> Vec<[u8; 32]> {
        let mut tree = new_tree();
        let mut hashes = Vec::new();
        for (i, (is_set, key, value)) in ops.iter().enumerate() {
            if *is_set {
                tree.set(key, value).unwrap();
            } else {
                tree.remove(key).unwrap();
            }
            if i % 50 == 49 {
                let expected = tree.working_hash().unwrap();
                let (hash, _) = tree.save_version().unwrap();
                assert_eq!(hash, expected);
                hashes.push(hash);
            }
        }
        hashes
    };

    assert_eq!(run(&ops), run(&ops));
}

#[test]
fn test_set_semantics_against_model() {
    let mut rng = StdRng::seed_from_u64(43);
    let mut tree = new_tree();
    let mut model: Model<Vec<u8>, Vec<u8>> = Model::new();

    for i in 0..500 {
        let key_len = rng.gen_range(1..5);
        let key = rand_bytes(&mut rng, key_len);
        if rng.gen_bool(0.3) {
            let expected = model.remove(&key);
            assert_eq!(tree.remove(&key).unwrap(), expected);
        } else {
            let value = rand_bytes(&mut rng, 6);
            let existed = model.insert(key.clone(), value.clone()).is_some();
            assert_eq!(tree.set(&key, &value).unwrap(), existed);
        }
        if i % 100 == 99 {
            check_invariants(&tree);
            tree.save_version().unwrap();
        }
    }

    assert_eq!(tree.size().unwrap(), model.len() as u64);
    for (key, value) in &model {
        assert_eq!(tree.get(key).unwrap().as_ref(), Some(value));
        assert_eq!(tree.get_fast(key).unwrap().as_ref(), Some(value));
    }
    for _ in 0..50 {
        let key = rand_bytes(&mut rng, 9);
        if !model.contains_key(&key) {
            assert_eq!(tree.get(&key).unwrap(), None);
        }
    }
}

#[test]
fn test_mutable_tree_delete_versions() {
    let mut tree = new_tree();
    let mut rng = StdRng::seed_from_u64(47);
    let mut version_entries: Model<u64, Vec<(Vec<u8>, Vec<u8>)>> = Model::new();

    for _ in 0..10 {
        let mut entries = Vec::with_capacity(100);
        for _ in 0..100 {
            let key = rand_bytes(&mut rng, 10);
            let value = rand_bytes(&mut rng, 10);
            tree.set(&key, &value).unwrap();
            entries.push((key, value));
        }
        let (_, version) = tree.save_version().unwrap();
        version_entries.insert(version, entries);
    }

    for version in [2, 4, 6, 8] {
        tree.delete_version(version).unwrap();
    }

    for version in [2u64, 4, 6, 8] {
        assert!(!tree.version_exists(version));
        assert!(tree.lazy_load_version(version).is_err());
    }

    for version in [1u64, 3, 5, 7, 9, 10] {
        assert!(tree.version_exists(version));
        assert_eq!(tree.lazy_load_version(version).unwrap(), version);
        for (key, value) in &version_entries[&version] {
            assert_eq!(tree.get_fast(key).unwrap().as_ref(), Some(value));
        }
    }
}

#[test]
fn test_mutable_tree_delete_versions_range() {
    const MAX_LENGTH: u64 = 40;
    const FROM: u64 = 10;
    const TO: u64 = 20;

    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let mut tree = MutableTree::new(store.clone(), TreeOptions::default()).unwrap();
    for count in 1..=MAX_LENGTH {
        tree.set(b"aaa", b"bbb").unwrap();
        tree.set(format!("key{count}").as_bytes(), format!("value{count}").as_bytes())
            .unwrap();
        tree.save_version().unwrap();
    }

    let mut tree = MutableTree::new(store, TreeOptions::default()).unwrap();
    assert_eq!(tree.load_version(MAX_LENGTH).unwrap(), MAX_LENGTH);

    tree.delete_versions_range(FROM, TO).unwrap();

    for version in 1..FROM {
        assert!(tree.version_exists(version));
        assert_eq!(tree.lazy_load_version(version).unwrap(), version);
        assert_eq!(tree.get_fast(b"aaa").unwrap(), Some(b"bbb".to_vec()));
        for count in 1..=version {
            assert_eq!(
                tree.get_fast(format!("key{count}").as_bytes()).unwrap(),
                Some(format!("value{count}").into_bytes())
            );
        }
    }

    for version in FROM..TO {
        assert!(!tree.version_exists(version));
        assert!(matches!(
            tree.lazy_load_version(version),
            Err(StateError::VersionNotFound(_))
        ));
    }

    for version in TO..=MAX_LENGTH {
        assert!(tree.version_exists(version));
        assert_eq!(tree.lazy_load_version(version).unwrap(), version);
        assert_eq!(tree.get_fast(b"aaa").unwrap(), Some(b"bbb".to_vec()));
    }
}

#[test]
fn test_load_version_empty() {
    let mut tree = new_tree();
    assert_eq!(tree.load_version(0).unwrap(), 0);
    assert!(matches!(
        tree.load_version(3),
        Err(StateError::VersionNotFound(3))
    ));
}

#[test]
fn test_lazy_load_version_empty() {
    let mut tree = new_tree();
    assert_eq!(tree.lazy_load_version(0).unwrap(), 0);
    assert!(matches!(
        tree.lazy_load_version(3),
        Err(StateError::VersionNotFound(3))
    ));
}

#[test]
fn test_cannot_delete_latest_version() {
    let mut tree = new_tree();
    tree.set(b"a", b"1").unwrap();
    tree.save_version().unwrap();
    tree.set(b"b", b"2").unwrap();
    let (_, latest) = tree.save_version().unwrap();

    assert!(matches!(
        tree.delete_version(latest),
        Err(StateError::CannotDeleteLatestVersion(2))
    ));
    // the failed delete is a no-op
    assert!(tree.version_exists(latest));
    let view = tree.get_immutable(latest).unwrap();
    assert_eq!(view.get(b"b").unwrap(), Some(b"2".to_vec()));

    tree.delete_version(1).unwrap();
    assert!(!tree.version_exists(1));
}

#[test]
fn test_version_already_exists() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let mut tree = MutableTree::new(store.clone(), TreeOptions::default()).unwrap();
    tree.set(b"a", b"1").unwrap();
    tree.save_version().unwrap();

    // a second tree over the same store that never loaded the latest version
    // tries to commit version 1 again
    let mut stale = MutableTree::new(store, TreeOptions::default()).unwrap();
    stale.set(b"b", b"2").unwrap();
    assert!(matches!(
        stale.save_version(),
        Err(StateError::VersionAlreadyExists(1))
    ));
}

#[test]
fn test_initial_version() {
    let opts = TreeOptions {
        initial_version: 10,
        ..TreeOptions::default()
    };
    let mut tree = MutableTree::new(Arc::new(MemoryStore::new()), opts.clone()).unwrap();
    tree.set(b"a", b"1").unwrap();
    let (_, version) = tree.save_version().unwrap();
    assert_eq!(version, 10);
    tree.set(b"b", b"2").unwrap();
    let (_, version) = tree.save_version().unwrap();
    assert_eq!(version, 11);

    // a store whose history starts below the configured initial version is
    // rejected at load
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let mut plain = MutableTree::new(store.clone(), TreeOptions::default()).unwrap();
    plain.set(b"a", b"1").unwrap();
    plain.save_version().unwrap();

    let mut reopened = MutableTree::new(store, opts).unwrap();
    assert!(matches!(
        reopened.load_version(0),
        Err(StateError::InitialVersionMismatch {
            initial: 10,
            found: 1
        })
    ));
}

#[test]
fn test_orphan_conservation_after_delete() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let mut tree = MutableTree::new(store.clone(), TreeOptions::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(53);
    let mut model: Model<Vec<u8>, Vec<u8>> = Model::new();

    for _ in 0..1000 {
        let key = rand_bytes(&mut rng, 10);
        let value = rand_bytes(&mut rng, 10);
        tree.set(&key, &value).unwrap();
        model.insert(key, value);
    }
    tree.save_version().unwrap();

    let keys: Vec<Vec<u8>> = model.keys().cloned().collect();
    for key in keys.iter().take(200) {
        let value = rand_bytes(&mut rng, 10);
        tree.set(key, &value).unwrap();
        model.insert(key.clone(), value);
    }
    for key in keys.iter().skip(200).take(100) {
        tree.remove(key).unwrap();
        model.remove(key);
    }
    for _ in 0..100 {
        let key = rand_bytes(&mut rng, 10);
        let value = rand_bytes(&mut rng, 10);
        tree.set(&key, &value).unwrap();
        model.insert(key, value);
    }
    tree.save_version().unwrap();

    tree.delete_version(1).unwrap();
    assert!(matches!(
        tree.get_immutable(1),
        Err(StateError::VersionNotFound(1))
    ));

    // iteration over version 2 returns exactly the model
    let view = tree.get_immutable(2).unwrap();
    let mut expected = model.iter();
    view.iterate(|key, value| {
        let (model_key, model_value) = expected.next().unwrap();
        assert_eq!(key, model_key.as_slice());
        assert_eq!(value, model_value.as_slice());
        false
    })
    .unwrap();
    assert!(expected.next().is_none());

    // every node record left in the store is reachable from version 2: the
    // nodes uniquely owned by version 1 were reclaimed
    let reachable = count_nodes(&tree, tree.root.as_ref().unwrap());
    let stored = store
        .iterate(Some(b"n/"), Some(b"n0"), true)
        .unwrap()
        .count() as u64;
    assert_eq!(stored, reachable);
    check_invariants(&tree);
}

#[test]
fn test_removed_before_save_leaves_no_fast_record() {
    let mut tree = new_tree();
    tree.set(b"ghost", b"1").unwrap();
    assert_eq!(tree.remove(b"ghost").unwrap(), Some(b"1".to_vec()));
    assert!(tree.unsaved_additions.is_empty());
    assert!(tree.unsaved_removals.is_empty());

    tree.save_version().unwrap();
    assert_eq!(tree.ndb.get_fast_node(b"ghost").unwrap(), None);
    assert_eq!(tree.get(b"ghost").unwrap(), None);
}

#[test]
fn test_overlay_empties_after_save() {
    let mut tree = new_tree();
    tree.set(b"a", b"1").unwrap();
    tree.set(b"b", b"2").unwrap();
    tree.save_version().unwrap();
    tree.remove(b"a").unwrap();
    assert_eq!(tree.unsaved_removals.len(), 1);
    tree.save_version().unwrap();
    assert!(tree.unsaved_additions.is_empty());
    assert!(tree.unsaved_removals.is_empty());
    assert_eq!(tree.ndb.get_fast_node(b"a").unwrap(), None);
    assert!(tree.ndb.get_fast_node(b"b").unwrap().is_some());
}

#[test]
fn test_fast_index_migration_on_load() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let slow_opts = TreeOptions {
        fast_index: false,
        ..TreeOptions::default()
    };
    let mut tree = MutableTree::new(store.clone(), slow_opts).unwrap();
    tree.set(b"a", b"1").unwrap();
    tree.set(b"b", b"2").unwrap();
    tree.save_version().unwrap();
    assert_eq!(tree.ndb.get_fast_node(b"a").unwrap(), None);
    drop(tree);

    let mut tree = MutableTree::new(store, TreeOptions::default()).unwrap();
    assert_eq!(tree.load_version(0).unwrap(), 1);
    let fast = tree.ndb.get_fast_node(b"a").unwrap().unwrap();
    assert_eq!(fast.value(), b"1");
    assert_eq!(fast.version_last_updated_at(), 1);
    assert_eq!(tree.get_fast(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_redb_backend_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");

    {
        let store: Arc<dyn KvStore> = Arc::new(RedbStore::open(&path).unwrap());
        let mut tree = MutableTree::new(store, TreeOptions::default()).unwrap();
        tree.set(b"alpha", b"1").unwrap();
        tree.set(b"beta", b"2").unwrap();
        tree.save_version().unwrap();
        tree.set(b"beta", b"20").unwrap();
        tree.set(b"gamma", b"3").unwrap();
        tree.save_version().unwrap();
    }

    let store: Arc<dyn KvStore> = Arc::new(RedbStore::open(&path).unwrap());
    let mut tree = MutableTree::new(store, TreeOptions::default()).unwrap();
    assert_eq!(tree.load_version(0).unwrap(), 2);
    assert_eq!(tree.get(b"alpha").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.get_fast(b"beta").unwrap(), Some(b"20".to_vec()));
    assert_eq!(tree.get(b"gamma").unwrap(), Some(b"3".to_vec()));

    let view = tree.get_immutable(1).unwrap();
    assert_eq!(view.get(b"beta").unwrap(), Some(b"2".to_vec()));
    assert_eq!(view.get(b"gamma").unwrap(), None);
}
