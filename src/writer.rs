use heed::RwTxn;

use crate::distance::hamming;
use crate::key::PairKey;
use crate::metadata::Metadata;
use crate::node::Node;
use crate::{Error, FileId, Index, PHash, PhashId, Result};

/// Mutates the similarity index: interns perceptual hashes, maintains the
/// phash/file association and grows the live tree one leaf at a time.
///
/// Every method works inside the caller's write transaction, so a crashed or
/// aborted operation publishes nothing.
#[derive(Debug)]
pub struct Writer<'i> {
    pub(crate) index: &'i Index,
}

impl<'i> Writer<'i> {
    pub fn new(index: &'i Index) -> Writer<'i> {
        Writer { index }
    }

    /// Interns every phash, associates them all to `file_id` and returns
    /// their ids. A phash seen for the first time is inserted into the tree
    /// before this returns, so a committed associate is search-visible. If at
    /// least one association row is new, the file's search-cache entry is
    /// reset to dirty.
    pub fn associate(
        &self,
        wtxn: &mut RwTxn,
        file_id: FileId,
        phashes: &[PHash],
    ) -> Result<Vec<PhashId>> {
        let mut phash_ids = Vec::with_capacity(phashes.len());
        for &phash in phashes {
            phash_ids.push(self.intern(wtxn, phash)?);
        }
        phash_ids.sort_unstable();
        phash_ids.dedup();

        let mut new_rows = 0;
        for &phash_id in &phash_ids {
            let key = PairKey::new(phash_id, file_id);
            if self.index.associations.get(wtxn, &key)?.is_none() {
                self.index.associations.put(wtxn, &key, &())?;
                self.index.file_phashes.put(wtxn, &PairKey::new(file_id, phash_id), &())?;
                new_rows += 1;
            }
        }

        if new_rows > 0 {
            self.index.search_cache.put(wtxn, &file_id, &None)?;
        }

        Ok(phash_ids)
    }

    /// Deletes the listed associations. A phash id left referencing no file
    /// is queued for eviction at the next regeneration of its branch; its
    /// node stays in the tree until then.
    pub fn disassociate(
        &self,
        wtxn: &mut RwTxn,
        file_id: FileId,
        phash_ids: &[PhashId],
    ) -> Result<()> {
        for &phash_id in phash_ids {
            self.index.associations.delete(wtxn, &PairKey::new(phash_id, file_id))?;
            self.index.file_phashes.delete(wtxn, &PairKey::new(file_id, phash_id))?;
        }

        for &phash_id in phash_ids {
            if !self.index.is_useful(wtxn, phash_id)? {
                self.index.rebalance.put(wtxn, &phash_id, &())?;
            }
        }

        Ok(())
    }

    /// Replaces the file's phash set: everything currently associated is
    /// disassociated, then the new set is associated.
    pub fn set_phashes(&self, wtxn: &mut RwTxn, file_id: FileId, phashes: &[PHash]) -> Result<()> {
        let current = self.index.file_phash_ids(wtxn, file_id)?;
        if !current.is_empty() {
            self.disassociate(wtxn, file_id, &current)?;
        }

        if !phashes.is_empty() {
            self.associate(wtxn, file_id, phashes)?;
        }

        Ok(())
    }

    /// Takes the file out of the similarity system: drops all of its
    /// associations and its search-cache row. A search already in flight may
    /// still return it once.
    pub fn stop_searching(&self, wtxn: &mut RwTxn, file_id: FileId) -> Result<()> {
        let phash_ids = self.index.file_phash_ids(wtxn, file_id)?;
        self.disassociate(wtxn, file_id, &phash_ids)?;
        self.index.search_cache.delete(wtxn, &file_id)?;

        Ok(())
    }

    /// Marks the listed files as never searched. Rows that do not exist are
    /// left alone.
    pub fn reset_search(&self, wtxn: &mut RwTxn, file_ids: &[FileId]) -> Result<()> {
        for &file_id in file_ids {
            if self.index.search_cache.get(wtxn, &file_id)?.is_some() {
                self.index.search_cache.put(wtxn, &file_id, &None)?;
            }
        }

        Ok(())
    }

    /// Records that the listed files have been compared against everything up
    /// to `distance`. Rows that do not exist are left alone.
    pub fn set_searched_distance(
        &self,
        wtxn: &mut RwTxn,
        file_ids: &[FileId],
        distance: u32,
    ) -> Result<()> {
        for &file_id in file_ids {
            if self.index.search_cache.get(wtxn, &file_id)?.is_some() {
                self.index.search_cache.put(wtxn, &file_id, &Some(distance))?;
            }
        }

        Ok(())
    }

    /// Returns the stable id of `phash`, interning it and inserting its leaf
    /// into the tree on first sight. Idempotent, and stable across restarts.
    pub fn intern(&self, wtxn: &mut RwTxn, phash: PHash) -> Result<PhashId> {
        if let Some(phash_id) = self.index.phash_ids.get(wtxn, &phash)? {
            return Ok(phash_id);
        }

        let mut metadata = self.index.metadata(wtxn)?;
        let phash_id = metadata.next_phash_id;
        metadata.next_phash_id = phash_id.checked_add(1).ok_or(Error::DatabaseFull)?;

        self.index.phashes.put(wtxn, &phash_id, &phash)?;
        self.index.phash_ids.put(wtxn, &phash, &phash_id)?;

        self.add_leaf(wtxn, &mut metadata, phash_id, phash)?;
        self.index.put_metadata(wtxn, &metadata)?;

        Ok(phash_id)
    }

    /// Inserts a freshly interned phash as a leaf: descends from the root,
    /// attaches where a child pointer is free, then applies the population
    /// increments to every ancestor on the descended path.
    ///
    /// The eldest ancestor that ends up both big and lopsided is queued for
    /// regeneration; deeper ones are skipped since rebuilding the elder
    /// rebuilds them too.
    fn add_leaf(
        &self,
        wtxn: &mut RwTxn,
        metadata: &mut Metadata,
        phash_id: PhashId,
        phash: PHash,
    ) -> Result<()> {
        let root = match metadata.root {
            Some(root) => root,
            None => {
                metadata.root = Some(phash_id);
                self.index.tree.put(wtxn, &phash_id, &Node::leaf(None))?;
                return Ok(());
            }
        };

        let options = &self.index.options;

        let mut ancestors_we_are_inside = Vec::new();
        let mut ancestors_we_are_outside = Vec::new();
        let mut an_ancestor_is_unbalanced = false;
        let mut parent_id = None;
        let mut next_ancestor = Some(root);

        while let Some(ancestor_id) = next_ancestor {
            let node = self.index.node(wtxn, ancestor_id)?;
            let ancestor_phash = self.index.tree_phash(wtxn, ancestor_id)?;
            let distance = hamming(phash, ancestor_phash);

            // The populations as they will stand once the deferred increments
            // below have landed, for the balance check.
            let mut inner_population = node.inner_population;
            let mut outer_population = node.outer_population;

            // A missing radius means a childless node; ties go inner.
            if node.radius.map_or(true, |radius| distance <= radius) {
                ancestors_we_are_inside.push(ancestor_id);
                inner_population += 1;
                next_ancestor = node.inner;

                if node.inner.is_none() {
                    let attached =
                        Node { inner: Some(phash_id), radius: Some(distance), ..node };
                    self.index.tree.put(wtxn, &ancestor_id, &attached)?;
                    parent_id = Some(ancestor_id);
                }
            } else {
                ancestors_we_are_outside.push(ancestor_id);
                outer_population += 1;
                next_ancestor = node.outer;

                if node.outer.is_none() {
                    let attached = Node { outer: Some(phash_id), ..node };
                    self.index.tree.put(wtxn, &ancestor_id, &attached)?;
                    parent_id = Some(ancestor_id);
                }
            }

            if !an_ancestor_is_unbalanced
                && inner_population as u64 + outer_population as u64
                    > options.imbalance_population_threshold
            {
                let larger = inner_population.max(outer_population) as f64;
                let smaller = inner_population.min(outer_population) as f64;

                if smaller / larger < options.imbalance_ratio_threshold {
                    // Only the eldest unbalanced ancestor: its regeneration
                    // will rebuild every descendant anyway.
                    self.index.rebalance.put(wtxn, &ancestor_id, &())?;
                    an_ancestor_is_unbalanced = true;
                }
            }
        }

        for ancestor_id in ancestors_we_are_inside {
            let node = self.index.node(wtxn, ancestor_id)?;
            let node = Node { inner_population: node.inner_population + 1, ..node };
            self.index.tree.put(wtxn, &ancestor_id, &node)?;
        }
        for ancestor_id in ancestors_we_are_outside {
            let node = self.index.node(wtxn, ancestor_id)?;
            let node = Node { outer_population: node.outer_population + 1, ..node };
            self.index.tree.put(wtxn, &ancestor_id, &node)?;
        }

        let parent_id = parent_id.ok_or(Error::CorruptedTree { phash_id })?;
        self.index.tree.put(wtxn, &phash_id, &Node::leaf(Some(parent_id)))?;

        Ok(())
    }
}
