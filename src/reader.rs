use std::collections::BTreeMap;

use heed::RoTxn;
use nohash::{IntMap, IntSet};
use tracing::warn;

use crate::distance::hamming;
use crate::{FileId, Index, PHash, PhashId, Result};

/// Read-only access to the similarity index: similarity search and the
/// search-cache bookkeeping queries the maintenance scheduler consults.
#[derive(Debug)]
pub struct Reader<'i> {
    index: &'i Index,
}

impl<'i> Reader<'i> {
    pub fn new(index: &'i Index) -> Reader<'i> {
        Reader { index }
    }

    /// The perceptual hashes currently associated to a file.
    pub fn phashes(&self, rtxn: &RoTxn, file_id: FileId) -> Result<Vec<PHash>> {
        let mut phashes = Vec::new();
        for phash_id in self.index.file_phash_ids(rtxn, file_id)? {
            phashes.push(self.index.phash_of(rtxn, phash_id)?);
        }

        Ok(phashes)
    }

    /// True iff the file has a search-cache entry, i.e. it is associated to
    /// at least one phash and has not been stopped.
    pub fn is_in_system(&self, rtxn: &RoTxn, file_id: FileId) -> Result<bool> {
        Ok(self.index.search_cache.get(rtxn, &file_id)?.is_some())
    }

    /// The searched-distance histogram of the search cache, `None` counting
    /// the files never searched since their phashes last changed.
    pub fn maintenance_status(&self, rtxn: &RoTxn) -> Result<BTreeMap<Option<u32>, u64>> {
        let mut counts = BTreeMap::new();
        for result in self.index.search_cache.iter(rtxn)? {
            let (_, searched_distance) = result?;
            *counts.entry(searched_distance).or_insert(0) += 1;
        }

        Ok(counts)
    }

    /// True iff enough files are still dirty below the configured default
    /// search distance to make a maintenance pass worth scheduling.
    pub fn maintenance_due(&self, rtxn: &RoTxn) -> Result<bool> {
        self.maintenance_due_at(rtxn, self.index.options.default_search_distance)
    }

    /// Same as [`Reader::maintenance_due`] for an explicit search distance.
    pub fn maintenance_due_at(&self, rtxn: &RoTxn, search_distance: u32) -> Result<bool> {
        let threshold = self.index.options.maintenance_due_cache_hits;

        let mut count = 0;
        for result in self.index.search_cache.iter(rtxn)? {
            let (_, searched_distance) = result?;
            if searched_distance.map_or(true, |distance| distance < search_distance) {
                count += 1;
                if count >= threshold {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Returns every file owning a phash within `max_distance` of one of
    /// `file_id`'s phashes, with the smallest distance found per file. The
    /// queried file itself is never reported. A file unknown to the index
    /// simply returns no results.
    pub fn search(
        &self,
        rtxn: &RoTxn,
        file_id: FileId,
        max_distance: u32,
    ) -> Result<Vec<(FileId, u32)>> {
        self.search_cancellable(rtxn, file_id, max_distance, &|| false)
    }

    /// Same as [`Reader::search`], consulting `cancel` between level
    /// expansions of the traversal: a cancelled search aborts and comes back
    /// empty.
    pub fn search_cancellable(
        &self,
        rtxn: &RoTxn,
        file_id: FileId,
        max_distance: u32,
        cancel: &dyn Fn() -> bool,
    ) -> Result<Vec<(FileId, u32)>> {
        if max_distance == 0 {
            return self.search_exact(rtxn, file_id);
        }

        let search_phashes = self.phashes(rtxn, file_id)?;
        if search_phashes.is_empty() {
            return Ok(Vec::new());
        }

        let root = match self.index.metadata(rtxn)?.root {
            Some(root) => root,
            None => return Ok(Vec::new()),
        };

        let chunk_size = self.index.options.search_fetch_chunk;
        let mut matches: IntMap<PhashId, u32> = IntMap::default();

        for search_phash in search_phashes {
            let mut frontier = vec![root];

            while !frontier.is_empty() {
                if cancel() {
                    return Ok(Vec::new());
                }

                let mut next_frontier = Vec::new();

                // Nodes are fetched level by level in bounded chunks to keep
                // the cursor round-trips amortized; order within a level does
                // not matter.
                for frontier_chunk in frontier.chunks(chunk_size) {
                    for &phash_id in frontier_chunk {
                        let node = self.index.tree.get(rtxn, &phash_id)?;
                        let node_phash = self.index.phashes.get(rtxn, &phash_id)?;
                        let (node, node_phash) = match node.zip(node_phash) {
                            Some(found) => found,
                            None => {
                                // Degrade to a best-effort search around the
                                // hole; regenerating the tree repairs it.
                                warn!(phash_id, "node missing from the tree, skipping it");
                                continue;
                            }
                        };

                        let distance = hamming(search_phash, node_phash);

                        if distance <= max_distance {
                            let entry = matches.entry(phash_id).or_insert(distance);
                            if distance < *entry {
                                *entry = distance;
                            }
                        }

                        // Two spheres, the node's and the search ball: a side
                        // is only worth visiting if the search ball pokes
                        // into its space.
                        if let Some(radius) = node.radius {
                            let spheres_disjoint = distance > radius + max_distance;
                            let search_inside_node_sphere = distance + max_distance <= radius;

                            if let Some(inner) = node.inner {
                                if !spheres_disjoint {
                                    next_frontier.push(inner);
                                }
                            }
                            if let Some(outer) = node.outer {
                                if !search_inside_node_sphere {
                                    next_frontier.push(outer);
                                }
                            }
                        }
                    }
                }

                frontier = next_frontier;
            }
        }

        // Files can carry several phashes and phashes can refer to several
        // files: keep the smallest distance seen per file.
        let mut results: IntMap<FileId, u32> = IntMap::default();
        for (phash_id, distance) in matches {
            for other_file_id in self.index.association_file_ids(rtxn, phash_id)? {
                if other_file_id == file_id {
                    continue;
                }
                let entry = results.entry(other_file_id).or_insert(distance);
                if distance < *entry {
                    *entry = distance;
                }
            }
        }

        Ok(results.into_iter().collect())
    }

    /// The distance-0 fast path: files sharing a phash id, no tree involved.
    fn search_exact(&self, rtxn: &RoTxn, file_id: FileId) -> Result<Vec<(FileId, u32)>> {
        let mut similar: IntSet<FileId> = IntSet::default();
        for phash_id in self.index.file_phash_ids(rtxn, file_id)? {
            for other_file_id in self.index.association_file_ids(rtxn, phash_id)? {
                if other_file_id != file_id {
                    similar.insert(other_file_id);
                }
            }
        }

        Ok(similar.into_iter().map(|file_id| (file_id, 0)).collect())
    }
}
