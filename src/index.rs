use heed::types::{DecodeIgnore, Str, Unit};
use heed::{Env, RoTxn, RwTxn};

use crate::key::{PairKey, PairKeyCodec, PairPrefixCodec};
use crate::metadata::{Metadata, MetadataCodec, SearchedDistanceCodec, METADATA_KEY};
use crate::node::{Node, NodeCodec};
use crate::{BEU32, BEU64, Error, FileId, PHash, PhashId, Result};

/// The tunables of the similarity index. The defaults are the contract
/// defaults; changing them only affects future insertions and rebuilds.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// A subtree bigger than this is checked for imbalance on insertion.
    pub imbalance_population_threshold: u64,
    /// A checked subtree whose `min/max` child-population ratio falls below
    /// this is queued for regeneration.
    pub imbalance_ratio_threshold: f64,
    /// How many candidate vantage points are scored when picking a sub-root.
    pub best_root_max_viewpoints: usize,
    /// How many nodes each candidate is scored against.
    pub best_root_max_sample: usize,
    /// Nodes fetched per chunk while expanding a search frontier level.
    pub search_fetch_chunk: usize,
    /// How many dirty search-cache rows make maintenance due.
    pub maintenance_due_cache_hits: usize,
    /// The Hamming radius used when no explicit distance is configured.
    pub default_search_distance: u32,
}

impl Default for IndexOptions {
    fn default() -> IndexOptions {
        IndexOptions {
            imbalance_population_threshold: 16,
            imbalance_ratio_threshold: 0.5,
            best_root_max_viewpoints: 256,
            best_root_max_sample: 64,
            search_fetch_chunk: 10_000,
            maintenance_due_cache_hits: 100,
            default_search_distance: 8,
        }
    }
}

/// Handles to every database of the similarity index.
///
/// This is the row-level layer: it moves records around and keeps the
/// interning store bijective, but the tree invariants are upheld by the
/// [`Writer`](crate::Writer) and the maintenance loop on top of it.
#[derive(Debug, Clone)]
pub struct Index {
    /// Fixed-key bookkeeping: the id allocator and the tree root pointer.
    pub(crate) main: heed::Database<Str, MetadataCodec>,
    /// phash_id to the interned 64-bit perceptual hash.
    pub(crate) phashes: heed::Database<BEU32, BEU64>,
    /// Reverse unique index, phash to phash_id.
    pub(crate) phash_ids: heed::Database<BEU64, BEU32>,
    /// The (phash_id, file_id) association relation.
    pub(crate) associations: heed::Database<PairKeyCodec, Unit>,
    /// The same relation keyed (file_id, phash_id) for reverse lookups.
    pub(crate) file_phashes: heed::Database<PairKeyCodec, Unit>,
    /// The vantage-point tree nodes, keyed by phash_id.
    pub(crate) tree: heed::Database<BEU32, NodeCodec>,
    /// The set of subtree roots waiting for regeneration.
    pub(crate) rebalance: heed::Database<BEU32, Unit>,
    /// file_id to the searched-distance watermark.
    pub(crate) search_cache: heed::Database<BEU32, SearchedDistanceCodec>,
    pub(crate) options: IndexOptions,
}

impl Index {
    const MAIN: &'static str = "main";
    const PHASHES: &'static str = "phashes";
    const PHASH_IDS: &'static str = "phash-ids";
    const ASSOCIATIONS: &'static str = "associations";
    const FILE_PHASHES: &'static str = "file-phashes";
    const TREE: &'static str = "tree";
    const REBALANCE: &'static str = "rebalance";
    const SEARCH_CACHE: &'static str = "search-cache";

    /// The number of named databases the index needs; pass at least this to
    /// `EnvOpenOptions::max_dbs` (plus whatever the [`crate::FileStore`] and
    /// the rest of the application need).
    pub const NB_DBS: u32 = 8;

    /// Creates (or opens, when they already exist) the index databases.
    pub fn create(env: &Env, wtxn: &mut RwTxn, options: IndexOptions) -> Result<Index> {
        Ok(Index {
            main: env.create_database(wtxn, Some(Self::MAIN))?,
            phashes: env.create_database(wtxn, Some(Self::PHASHES))?,
            phash_ids: env.create_database(wtxn, Some(Self::PHASH_IDS))?,
            associations: env.create_database(wtxn, Some(Self::ASSOCIATIONS))?,
            file_phashes: env.create_database(wtxn, Some(Self::FILE_PHASHES))?,
            tree: env.create_database(wtxn, Some(Self::TREE))?,
            rebalance: env.create_database(wtxn, Some(Self::REBALANCE))?,
            search_cache: env.create_database(wtxn, Some(Self::SEARCH_CACHE))?,
            options,
        })
    }

    /// Opens the index databases, failing if any of them is missing.
    pub fn open(env: &Env, rtxn: &RoTxn, options: IndexOptions) -> Result<Index> {
        fn open_db<KC: 'static, DC: 'static>(
            env: &Env,
            rtxn: &RoTxn,
            name: &'static str,
        ) -> Result<heed::Database<KC, DC>> {
            env.open_database(rtxn, Some(name))?.ok_or(Error::MissingDatabase(name))
        }

        Ok(Index {
            main: open_db(env, rtxn, Self::MAIN)?,
            phashes: open_db(env, rtxn, Self::PHASHES)?,
            phash_ids: open_db(env, rtxn, Self::PHASH_IDS)?,
            associations: open_db(env, rtxn, Self::ASSOCIATIONS)?,
            file_phashes: open_db(env, rtxn, Self::FILE_PHASHES)?,
            tree: open_db(env, rtxn, Self::TREE)?,
            rebalance: open_db(env, rtxn, Self::REBALANCE)?,
            search_cache: open_db(env, rtxn, Self::SEARCH_CACHE)?,
            options,
        })
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    pub fn metadata(&self, rtxn: &RoTxn) -> Result<Metadata> {
        Ok(self.main.get(rtxn, METADATA_KEY)?.unwrap_or_default())
    }

    pub(crate) fn put_metadata(&self, wtxn: &mut RwTxn, metadata: &Metadata) -> Result<()> {
        Ok(self.main.put(wtxn, METADATA_KEY, metadata)?)
    }

    /// The id of an already interned phash, if any.
    pub fn phash_id(&self, rtxn: &RoTxn, phash: PHash) -> Result<Option<PhashId>> {
        Ok(self.phash_ids.get(rtxn, &phash)?)
    }

    /// The interned phash behind an id.
    pub fn phash_of(&self, rtxn: &RoTxn, phash_id: PhashId) -> Result<PHash> {
        self.phashes.get(rtxn, &phash_id)?.ok_or(Error::PhashNotFound { phash_id })
    }

    /// The phash of a node. The ids handed to this function come from tree
    /// records, so a missing row is a corruption, not a lookup miss.
    pub(crate) fn tree_phash(&self, rtxn: &RoTxn, phash_id: PhashId) -> Result<PHash> {
        self.phashes.get(rtxn, &phash_id)?.ok_or(Error::CorruptedTree { phash_id })
    }

    /// A node the tree structure references; missing means corruption.
    pub(crate) fn node(&self, rtxn: &RoTxn, phash_id: PhashId) -> Result<Node> {
        self.tree.get(rtxn, &phash_id)?.ok_or(Error::CorruptedTree { phash_id })
    }

    /// Unconditionally removes an interning record. The caller must make sure
    /// no association references it anymore.
    pub(crate) fn forget(&self, wtxn: &mut RwTxn, phash_id: PhashId) -> Result<()> {
        if let Some(phash) = self.phashes.get(wtxn, &phash_id)? {
            self.phash_ids.delete(wtxn, &phash)?;
            self.phashes.delete(wtxn, &phash_id)?;
        }
        Ok(())
    }

    /// True iff the phash id still has at least one file association.
    pub(crate) fn is_useful(&self, rtxn: &RoTxn, phash_id: PhashId) -> Result<bool> {
        let mut iter = self
            .associations
            .remap_types::<PairPrefixCodec, DecodeIgnore>()
            .prefix_iter(rtxn, &phash_id)?
            .remap_key_type::<DecodeIgnore>();

        Ok(iter.next().transpose()?.is_some())
    }

    /// The phash ids currently associated to a file.
    pub(crate) fn file_phash_ids(&self, rtxn: &RoTxn, file_id: FileId) -> Result<Vec<PhashId>> {
        let mut phash_ids = Vec::new();
        let iter = self
            .file_phashes
            .remap_types::<PairPrefixCodec, DecodeIgnore>()
            .prefix_iter(rtxn, &file_id)?
            .remap_key_type::<PairKeyCodec>();

        for result in iter {
            let (PairKey { item, .. }, ()) = result?;
            phash_ids.push(item);
        }

        Ok(phash_ids)
    }

    /// The files associated to a phash id.
    pub(crate) fn association_file_ids(
        &self,
        rtxn: &RoTxn,
        phash_id: PhashId,
    ) -> Result<Vec<FileId>> {
        let mut file_ids = Vec::new();
        let iter = self
            .associations
            .remap_types::<PairPrefixCodec, DecodeIgnore>()
            .prefix_iter(rtxn, &phash_id)?
            .remap_key_type::<PairKeyCodec>();

        for result in iter {
            let (PairKey { item, .. }, ()) = result?;
            file_ids.push(item);
        }

        Ok(file_ids)
    }
}
