use std::fmt;

use heed::{Env, EnvOpenOptions, RoTxn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

use crate::distance::hamming;
use crate::{FileId, FileStore, Index, IndexOptions, PHash, PhashId, ServiceId, Services};

mod writer;

pub struct DatabaseHandle {
    pub env: Env,
    pub index: Index,
    #[allow(unused)]
    pub tempdir: TempDir,
}

impl fmt::Display for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt(id: Option<u32>) -> String {
            id.map_or_else(|| "none".to_string(), |id| id.to_string())
        }

        let rtxn = self.env.read_txn().unwrap();
        let metadata = self.index.metadata(&rtxn).unwrap();
        writeln!(f, "Root: {}, next id: {}", opt(metadata.root), metadata.next_phash_id)?;

        for result in self.index.tree.iter(&rtxn).unwrap() {
            let (phash_id, node) = result.unwrap();
            let phash = self.index.phashes.get(&rtxn, &phash_id).unwrap().unwrap();
            writeln!(
                f,
                "Item {phash_id}: phash {phash:016x}, parent {}, radius {}, inner {} ({}), outer {} ({})",
                opt(node.parent),
                opt(node.radius),
                opt(node.inner),
                node.inner_population,
                opt(node.outer),
                node.outer_population,
            )?;
        }

        Ok(())
    }
}

pub fn create_database() -> DatabaseHandle {
    let dir = tempfile::tempdir().unwrap();
    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(200 * 1024 * 1024)
            .max_dbs(Index::NB_DBS + FileStore::NB_DBS + 2)
            .open(dir.path())
    }
    .unwrap();
    let mut wtxn = env.write_txn().unwrap();
    let index = Index::create(&env, &mut wtxn, IndexOptions::default()).unwrap();
    wtxn.commit().unwrap();

    DatabaseHandle { env, index, tempdir: dir }
}

pub const COMBINED_FILES: ServiceId = 1;
pub const COMBINED_LOCAL_FILES: ServiceId = 2;
pub const TRASH: ServiceId = 3;
pub const LOCAL_DOMAIN: ServiceId = 4;
pub const REMOTE: ServiceId = 5;

pub struct FileStoreHandle {
    pub env: Env,
    pub store: FileStore,
    #[allow(unused)]
    pub tempdir: TempDir,
}

pub fn create_file_store() -> FileStoreHandle {
    let dir = tempfile::tempdir().unwrap();
    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(200 * 1024 * 1024)
            .max_dbs(Index::NB_DBS + FileStore::NB_DBS + 2)
            .open(dir.path())
    }
    .unwrap();
    let services = Services::new(COMBINED_FILES, COMBINED_LOCAL_FILES, TRASH)
        .with_local_domains(vec![LOCAL_DOMAIN])
        .with_remotes(vec![REMOTE]);
    let mut wtxn = env.write_txn().unwrap();
    let store = FileStore::create(&env, &mut wtxn, services).unwrap();
    wtxn.commit().unwrap();

    FileStoreHandle { env, store, tempdir: dir }
}

pub fn rng() -> StdRng {
    StdRng::from_seed(std::array::from_fn(|_| 42))
}

/// The exhaustive answer a search must reproduce: minimum pairwise distance
/// between any phash of the query and any phash of each other file, kept when
/// within `max_distance`.
pub fn brute_force(
    files: &[(FileId, Vec<PHash>)],
    query: FileId,
    max_distance: u32,
) -> Vec<(FileId, u32)> {
    let query_phashes = &files.iter().find(|(file_id, _)| *file_id == query).unwrap().1;

    let mut expected = Vec::new();
    for (other_id, other_phashes) in files {
        if *other_id == query {
            continue;
        }
        let distance = query_phashes
            .iter()
            .flat_map(|&q| other_phashes.iter().map(move |&o| hamming(q, o)))
            .min()
            .unwrap();
        if distance <= max_distance {
            expected.push((*other_id, distance));
        }
    }

    expected.sort_unstable();
    expected
}

pub fn sorted(mut results: Vec<(FileId, u32)>) -> Vec<(FileId, u32)> {
    results.sort_unstable();
    results
}

/// Checks every structural invariant of the tree: one root, parent back
/// pointers, the radius partition rule, exact populations, no unreachable
/// node, and interning-store consistency.
pub fn assert_tree_valid(rtxn: &RoTxn, index: &Index) {
    // Walks the subtree and returns every phash in it, self included.
    fn walk(
        rtxn: &RoTxn,
        index: &Index,
        phash_id: PhashId,
        parent: Option<PhashId>,
    ) -> Vec<PHash> {
        let node = index.tree.get(rtxn, &phash_id).unwrap().unwrap();
        assert_eq!(node.parent, parent, "node {phash_id} points at the wrong parent");
        assert!(
            (node.inner.is_none() && node.outer.is_none()) || node.radius.is_some(),
            "node {phash_id} has children but no radius",
        );

        let phash = index
            .phashes
            .get(rtxn, &phash_id)
            .unwrap()
            .unwrap_or_else(|| panic!("node {phash_id} is not interned"));
        assert_eq!(index.phash_ids.get(rtxn, &phash).unwrap(), Some(phash_id));

        let mut subtree = vec![phash];

        match node.inner {
            Some(inner) => {
                let inner_subtree = walk(rtxn, index, inner, Some(phash_id));
                assert_eq!(
                    inner_subtree.len() as u32,
                    node.inner_population,
                    "node {phash_id} has a wrong inner population",
                );
                let radius = node.radius.unwrap();
                for &descendant in &inner_subtree {
                    assert!(
                        hamming(phash, descendant) <= radius,
                        "an inner descendant of node {phash_id} escapes its radius",
                    );
                }
                subtree.extend(inner_subtree);
            }
            None => assert_eq!(node.inner_population, 0),
        }

        match node.outer {
            Some(outer) => {
                let outer_subtree = walk(rtxn, index, outer, Some(phash_id));
                assert_eq!(
                    outer_subtree.len() as u32,
                    node.outer_population,
                    "node {phash_id} has a wrong outer population",
                );
                let radius = node.radius.unwrap();
                for &descendant in &outer_subtree {
                    assert!(
                        hamming(phash, descendant) > radius,
                        "an outer descendant of node {phash_id} is within its radius",
                    );
                }
                subtree.extend(outer_subtree);
            }
            None => assert_eq!(node.outer_population, 0),
        }

        subtree
    }

    let metadata = index.metadata(rtxn).unwrap();
    let total_nodes = index.tree.len(rtxn).unwrap();

    match metadata.root {
        Some(root) => {
            let reachable = walk(rtxn, index, root, None);
            assert_eq!(
                reachable.len() as u64, total_nodes,
                "every node must be reachable from the root",
            );
        }
        None => assert_eq!(total_nodes, 0, "a rootless tree must be empty"),
    }

    // The association relation and its reverse index mirror each other.
    for result in index.associations.iter(rtxn).unwrap() {
        let (key, ()) = result.unwrap();
        let mirror = crate::key::PairKey::new(key.item, key.group);
        assert_eq!(index.file_phashes.get(rtxn, &mirror).unwrap(), Some(()));
        assert!(
            index.phashes.get(rtxn, &key.group).unwrap().is_some(),
            "association references a phash id that is not interned",
        );
    }
    for result in index.file_phashes.iter(rtxn).unwrap() {
        let (key, ()) = result.unwrap();
        let mirror = crate::key::PairKey::new(key.item, key.group);
        assert_eq!(index.associations.get(rtxn, &mirror).unwrap(), Some(()));
    }
}
