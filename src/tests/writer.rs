use insta::assert_snapshot;
use proptest::collection::vec;
use proptest::prelude::*;
use rand::Rng;

use super::{assert_tree_valid, create_database, rng};
use crate::{Reader, Writer};

#[test]
fn intern_is_idempotent() {
    let handle = create_database();
    let mut wtxn = handle.env.write_txn().unwrap();
    let writer = Writer::new(&handle.index);

    let first = writer.intern(&mut wtxn, 0xdead_beef).unwrap();
    let second = writer.intern(&mut wtxn, 0xdead_beef).unwrap();
    assert_eq!(first, second);

    let other = writer.intern(&mut wtxn, 0xcafe_babe).unwrap();
    assert_ne!(first, other);

    assert_eq!(handle.index.phash_id(&wtxn, 0xdead_beef).unwrap(), Some(first));
    assert_eq!(handle.index.phash_of(&wtxn, first).unwrap(), 0xdead_beef);
    wtxn.commit().unwrap();
}

#[test]
fn first_leaf_becomes_root() {
    let handle = create_database();
    let mut wtxn = handle.env.write_txn().unwrap();
    let writer = Writer::new(&handle.index);

    writer.associate(&mut wtxn, 1, &[0x00000000000000ff]).unwrap();
    wtxn.commit().unwrap();

    assert_snapshot!(handle, @r###"
    Root: 1, next id: 2
    Item 1: phash 00000000000000ff, parent none, radius none, inner none (0), outer none (0)
    "###);
}

#[test]
fn leaves_attach_inner_then_outer() {
    let handle = create_database();
    let mut wtxn = handle.env.write_txn().unwrap();
    let writer = Writer::new(&handle.index);

    // Distance 1 from the root sets its radius, distance 8 lands outside.
    writer.associate(&mut wtxn, 1, &[0x000000000000000f]).unwrap();
    writer.associate(&mut wtxn, 2, &[0x000000000000000e]).unwrap();
    writer.associate(&mut wtxn, 3, &[0x00000000000000f0]).unwrap();
    wtxn.commit().unwrap();

    assert_snapshot!(handle, @r###"
    Root: 1, next id: 4
    Item 1: phash 000000000000000f, parent none, radius 1, inner 2 (1), outer 3 (1)
    Item 2: phash 000000000000000e, parent 1, radius none, inner none (0), outer none (0)
    Item 3: phash 00000000000000f0, parent 1, radius none, inner none (0), outer none (0)
    "###);

    let rtxn = handle.env.read_txn().unwrap();
    assert_tree_valid(&rtxn, &handle.index);
}

#[test]
fn equidistant_leaves_go_inner() {
    let handle = create_database();
    let mut wtxn = handle.env.write_txn().unwrap();
    let writer = Writer::new(&handle.index);

    writer.associate(&mut wtxn, 1, &[0x0f]).unwrap();
    writer.associate(&mut wtxn, 2, &[0x0e]).unwrap();
    // Exactly on the root's radius of 1: must descend inner, towards item 2.
    writer.associate(&mut wtxn, 3, &[0x0d]).unwrap();
    wtxn.commit().unwrap();

    let rtxn = handle.env.read_txn().unwrap();
    let root = handle.index.node(&rtxn, 1).unwrap();
    assert_eq!(root.inner, Some(2));
    assert_eq!(root.inner_population, 2);
    assert_eq!(root.outer_population, 0);

    let third = handle.index.node(&rtxn, 3).unwrap();
    assert_eq!(third.parent, Some(2));

    assert_tree_valid(&rtxn, &handle.index);
}

#[test]
fn associate_marks_the_search_cache_dirty() {
    let handle = create_database();
    let mut wtxn = handle.env.write_txn().unwrap();
    let writer = Writer::new(&handle.index);
    let reader = Reader::new(&handle.index);

    writer.associate(&mut wtxn, 1, &[0xff]).unwrap();
    assert!(reader.is_in_system(&wtxn, 1).unwrap());
    assert_eq!(handle.index.search_cache.get(&wtxn, &1).unwrap(), Some(None));

    writer.set_searched_distance(&mut wtxn, &[1], 8).unwrap();
    assert_eq!(handle.index.search_cache.get(&wtxn, &1).unwrap(), Some(Some(8)));

    // Associating a phash the file already carries adds no row and must not
    // reset the watermark.
    writer.associate(&mut wtxn, 1, &[0xff]).unwrap();
    assert_eq!(handle.index.search_cache.get(&wtxn, &1).unwrap(), Some(Some(8)));

    // A genuinely new phash does.
    writer.associate(&mut wtxn, 1, &[0xf0]).unwrap();
    assert_eq!(handle.index.search_cache.get(&wtxn, &1).unwrap(), Some(None));

    wtxn.commit().unwrap();
}

#[test]
fn reset_search_ignores_unknown_files() {
    let handle = create_database();
    let mut wtxn = handle.env.write_txn().unwrap();
    let writer = Writer::new(&handle.index);

    writer.associate(&mut wtxn, 1, &[0xff]).unwrap();
    writer.set_searched_distance(&mut wtxn, &[1], 4).unwrap();
    writer.reset_search(&mut wtxn, &[1, 999]).unwrap();

    assert_eq!(handle.index.search_cache.get(&wtxn, &1).unwrap(), Some(None));
    assert_eq!(handle.index.search_cache.get(&wtxn, &999).unwrap(), None);
    wtxn.commit().unwrap();
}

#[test]
fn set_phashes_replaces_the_association_set() {
    let handle = create_database();
    let mut wtxn = handle.env.write_txn().unwrap();
    let writer = Writer::new(&handle.index);

    let old_ids = writer.associate(&mut wtxn, 1, &[0x0f, 0xf0]).unwrap();
    writer.set_phashes(&mut wtxn, 1, &[0xff]).unwrap();

    let phash_ids = handle.index.file_phash_ids(&wtxn, 1).unwrap();
    assert_eq!(phash_ids.len(), 1);
    assert_eq!(handle.index.phash_of(&wtxn, phash_ids[0]).unwrap(), 0xff);

    // The replaced phashes are orphaned and queued for eviction.
    for old_id in old_ids {
        assert_eq!(handle.index.rebalance.get(&wtxn, &old_id).unwrap(), Some(()));
    }

    wtxn.commit().unwrap();
    let rtxn = handle.env.read_txn().unwrap();
    assert_tree_valid(&rtxn, &handle.index);
}

#[test]
fn disassociate_queues_orphans_only() {
    let handle = create_database();
    let mut wtxn = handle.env.write_txn().unwrap();
    let writer = Writer::new(&handle.index);

    let shared = writer.associate(&mut wtxn, 1, &[0x0f]).unwrap()[0];
    writer.associate(&mut wtxn, 2, &[0x0f, 0xf0]).unwrap();
    let lonely = handle.index.phash_id(&wtxn, 0xf0).unwrap().unwrap();

    writer.disassociate(&mut wtxn, 2, &[shared, lonely]).unwrap();

    // Still referenced by file 1, so not an orphan.
    assert_eq!(handle.index.rebalance.get(&wtxn, &shared).unwrap(), None);
    assert_eq!(handle.index.rebalance.get(&wtxn, &lonely).unwrap(), Some(()));

    // The orphan's node stays in the tree until maintenance runs.
    assert!(handle.index.tree.get(&wtxn, &lonely).unwrap().is_some());
    wtxn.commit().unwrap();
}

#[test]
fn stop_searching_removes_the_file() {
    let handle = create_database();
    let mut wtxn = handle.env.write_txn().unwrap();
    let writer = Writer::new(&handle.index);
    let reader = Reader::new(&handle.index);

    writer.associate(&mut wtxn, 1, &[0x0f]).unwrap();
    writer.associate(&mut wtxn, 2, &[0x0f]).unwrap();
    writer.stop_searching(&mut wtxn, 1).unwrap();

    assert!(!reader.is_in_system(&wtxn, 1).unwrap());
    assert!(handle.index.file_phash_ids(&wtxn, 1).unwrap().is_empty());
    assert_eq!(reader.search(&wtxn, 2, 0).unwrap(), vec![]);
    wtxn.commit().unwrap();
}

#[test]
fn random_insertions_keep_the_tree_valid() {
    let handle = create_database();
    let mut wtxn = handle.env.write_txn().unwrap();
    let writer = Writer::new(&handle.index);
    let mut rng = rng();

    for file_id in 1..=10_000u32 {
        let phash: u64 = rng.gen();
        writer.associate(&mut wtxn, file_id, &[phash]).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = handle.env.read_txn().unwrap();
    assert_tree_valid(&rtxn, &handle.index);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn arbitrary_phash_sets_keep_the_tree_valid(phashes in vec(any::<u64>(), 1..128)) {
        let handle = create_database();
        let mut wtxn = handle.env.write_txn().unwrap();
        let writer = Writer::new(&handle.index);

        for (i, &phash) in phashes.iter().enumerate() {
            writer.associate(&mut wtxn, i as u32 + 1, &[phash]).unwrap();
        }
        wtxn.commit().unwrap();

        let rtxn = handle.env.read_txn().unwrap();
        assert_tree_valid(&rtxn, &handle.index);
    }
}
