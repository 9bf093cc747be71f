use std::collections::VecDeque;
use std::time::Instant;

use heed::RwTxn;
use ordered_float::OrderedFloat;
use rand::seq::SliceRandom;
use rand::Rng;
use roaring::RoaringBitmap;
use tracing::debug;

use crate::distance::hamming;
use crate::index::IndexOptions;
use crate::key::PairKey;
use crate::node::Node;
use crate::writer::Writer;
use crate::{Error, PHash, PhashId, Result};

/// Controls one maintenance slice. By default the loop runs to completion.
///
/// Cancellation is cooperative: it is checked between branch regenerations
/// and between fetch chunks, always before the next unit of work mutates
/// anything, so the transaction stays consistent and committable whenever
/// [`Error::MaintenanceCancelled`] comes back.
pub struct MaintainOptions<'a> {
    cancel: Option<&'a dyn Fn() -> bool>,
    deadline: Option<Instant>,
}

impl Default for MaintainOptions<'_> {
    fn default() -> Self {
        MaintainOptions { cancel: None, deadline: None }
    }
}

impl<'a> MaintainOptions<'a> {
    pub fn new() -> MaintainOptions<'static> {
        MaintainOptions { cancel: None, deadline: None }
    }

    /// The loop stops at the first check where this returns true.
    pub fn cancel<'b>(self, cancel: &'b dyn Fn() -> bool) -> MaintainOptions<'b> {
        MaintainOptions { cancel: Some(cancel), deadline: self.deadline }
    }

    /// Wall-clock bound: the loop stops at the first check past this instant.
    pub fn deadline(mut self, deadline: Instant) -> MaintainOptions<'a> {
        self.deadline = Some(deadline);
        self
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_some_and(|cancel| cancel())
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl Writer<'_> {
    /// Consumes the rebalance queue, biggest subtree first, until it is empty
    /// or the slice is cancelled. Regenerating a big branch usually clears
    /// smaller queued ones transitively, so the queue is re-read after every
    /// unit of work.
    ///
    /// On cancellation the branches already rebuilt stay rebuilt and the
    /// queue keeps the remainder.
    pub fn maintain_tree<R: Rng>(
        &self,
        wtxn: &mut RwTxn,
        rng: &mut R,
        options: &MaintainOptions,
    ) -> Result<()> {
        let num_to_do = self.index.rebalance.len(wtxn)?;
        if num_to_do == 0 {
            return Ok(());
        }

        debug!("rebalancing similar file metadata, {num_to_do} branches queued");

        loop {
            if options.should_stop() {
                return Err(Error::MaintenanceCancelled);
            }

            let mut queued = Vec::new();
            for result in self.index.rebalance.iter(wtxn)? {
                let (phash_id, ()) = result?;
                queued.push(phash_id);
            }

            let mut biggest: Option<(u64, PhashId)> = None;
            for phash_id in queued {
                match self.index.tree.get(wtxn, &phash_id)? {
                    Some(node) => {
                        let population = node.population();
                        if biggest.map_or(true, |(best, _)| population > best) {
                            biggest = Some((population, phash_id));
                        }
                    }
                    // A queued id can lose its node to an enclosing rebuild
                    // committed in an earlier slice.
                    None => {
                        self.index.rebalance.delete(wtxn, &phash_id)?;
                    }
                }
            }

            let Some((population, phash_id)) = biggest else { break };

            debug!(phash_id, population, "regenerating branch");
            self.regenerate_branch(wtxn, rng, phash_id, options)?;
        }

        Ok(())
    }

    /// Tears down the subtree rooted at `phash_id` and rebuilds it balanced,
    /// evicting the phashes that no longer reference any file.
    fn regenerate_branch<R: Rng>(
        &self,
        wtxn: &mut RwTxn,
        rng: &mut R,
        phash_id: PhashId,
        options: &MaintainOptions,
    ) -> Result<()> {
        let parent_id = self.index.node(wtxn, phash_id)?.parent;

        // Collect the whole branch before touching anything: cancelling here
        // abandons the work with the tree untouched.
        let mut branch = Vec::new();
        let mut stack = vec![phash_id];
        while let Some(id) = stack.pop() {
            if branch.len() % self.index.options.search_fetch_chunk == 0 && options.should_stop() {
                return Err(Error::MaintenanceCancelled);
            }

            let node = self.index.node(wtxn, id)?;
            branch.push((id, self.index.tree_phash(wtxn, id)?));

            if let Some(inner) = node.inner {
                stack.push(inner);
            }
            if let Some(outer) = node.outer {
                stack.push(outer);
            }
        }

        debug!("{} leaves found, clearing out the old branch", branch.len());

        for &(id, _) in &branch {
            self.index.tree.delete(wtxn, &id)?;
            self.index.rebalance.delete(wtxn, &id)?;
        }

        let mut useful_nodes = Vec::with_capacity(branch.len());
        let mut orphans = Vec::new();
        for (id, phash) in branch {
            if self.index.is_useful(wtxn, id)? {
                useful_nodes.push((id, phash));
            } else {
                orphans.push(id);
            }
        }
        for id in orphans {
            self.index.forget(wtxn, id)?;
        }

        // The parent's child population counts the branch root too, and is
        // computed before the root is popped out of the list.
        let useful_population = useful_nodes.len() as u32;
        let new_root = if useful_nodes.is_empty() {
            None
        } else {
            Some(pop_best_root(rng, &self.index.options, &mut useful_nodes))
        };
        let new_root_id = new_root.map(|(id, _)| id);

        match parent_id {
            Some(parent_id) => {
                let parent = self.index.node(wtxn, parent_id)?;
                // The radius stays untouched even when the inner slot empties
                // out: the outer subtree is still partitioned by it, and the
                // next inner attachment overwrites it with a smaller one.
                let parent = if parent.inner == Some(phash_id) {
                    Node { inner: new_root_id, inner_population: useful_population, ..parent }
                } else {
                    Node { outer: new_root_id, outer_population: useful_population, ..parent }
                };
                self.index.tree.put(wtxn, &parent_id, &parent)?;
            }
            None => {
                let mut metadata = self.index.metadata(wtxn)?;
                metadata.root = new_root_id;
                self.index.put_metadata(wtxn, &metadata)?;
            }
        }

        if let Some((root_id, root_phash)) = new_root {
            self.generate_branch(wtxn, rng, parent_id, root_id, root_phash, useful_nodes)?;
        }

        Ok(())
    }

    /// Builds a balanced subtree rooted at `root_id` over `children`, writing
    /// every resulting node record in one pass at the end.
    ///
    /// Per node: children are sorted by distance to the vantage point and
    /// split at the median. The group sitting exactly on the median goes to
    /// whichever side would otherwise be smaller, with the radius adjusted so
    /// the inner rule stays "within the radius".
    fn generate_branch<R: Rng>(
        &self,
        wtxn: &mut RwTxn,
        rng: &mut R,
        parent_id: Option<PhashId>,
        root_id: PhashId,
        root_phash: PHash,
        children: Vec<(PhashId, PHash)>,
    ) -> Result<()> {
        let options = &self.index.options;
        let num_to_do = children.len() + 1;

        let mut process_queue = VecDeque::new();
        process_queue.push_back((parent_id, root_id, root_phash, children));

        let mut insert_rows = Vec::with_capacity(num_to_do);

        while let Some((parent_id, phash_id, phash, children)) = process_queue.pop_front() {
            if children.is_empty() {
                insert_rows.push((phash_id, Node::leaf(parent_id)));
                continue;
            }

            let mut children: Vec<(u32, PhashId, PHash)> = children
                .into_iter()
                .map(|(child_id, child_phash)| {
                    (hamming(phash, child_phash), child_id, child_phash)
                })
                .collect();
            children.sort_unstable();

            let median_radius = children[children.len() / 2].0;

            let mut inner_children: Vec<(PhashId, PHash)> = Vec::new();
            let mut radius_children: Vec<(PhashId, PHash)> = Vec::new();
            let mut outer_children: Vec<(PhashId, PHash)> = Vec::new();
            for (distance, child_id, child_phash) in children {
                let side = match distance.cmp(&median_radius) {
                    std::cmp::Ordering::Less => &mut inner_children,
                    std::cmp::Ordering::Equal => &mut radius_children,
                    std::cmp::Ordering::Greater => &mut outer_children,
                };
                side.push((child_id, child_phash));
            }

            let radius = if inner_children.len() <= outer_children.len() {
                inner_children.append(&mut radius_children);
                median_radius
            } else {
                // The median group moves outside, so "further than the
                // radius" must start at the median itself.
                outer_children.append(&mut radius_children);
                median_radius - 1
            };

            let inner_population = inner_children.len() as u32;
            let outer_population = outer_children.len() as u32;

            let (inner_id, inner_phash) = pop_best_root(rng, options, &mut inner_children);
            let outer = if outer_children.is_empty() {
                None
            } else {
                Some(pop_best_root(rng, options, &mut outer_children))
            };

            insert_rows.push((
                phash_id,
                Node {
                    parent: parent_id,
                    radius: Some(radius),
                    inner: Some(inner_id),
                    inner_population,
                    outer: outer.map(|(id, _)| id),
                    outer_population,
                },
            ));

            process_queue.push_back((Some(phash_id), inner_id, inner_phash, inner_children));
            if let Some((outer_id, outer_phash)) = outer {
                process_queue.push_back((Some(phash_id), outer_id, outer_phash, outer_children));
            }
        }

        debug!("branch of {num_to_do} nodes constructed, now committing");

        for (phash_id, node) in insert_rows {
            self.index.tree.put(wtxn, &phash_id, &node)?;
        }

        Ok(())
    }

    /// Rebuilds the whole tree from scratch, the recovery path for a
    /// corrupted index. Associations whose file is not in `local_file_ids`
    /// are purged first; every phash still interned afterwards becomes a node
    /// of the new tree, orphaned or not, exactly as branch regeneration will
    /// later find them.
    pub fn regenerate_tree<R: Rng>(
        &self,
        wtxn: &mut RwTxn,
        rng: &mut R,
        local_file_ids: &RoaringBitmap,
    ) -> Result<()> {
        debug!("purging search info of non-local files");

        let mut purge = Vec::new();
        for result in self.index.associations.iter(wtxn)? {
            let (key, ()) = result?;
            if !local_file_ids.contains(key.item) {
                purge.push(key);
            }
        }
        for key in purge {
            self.index.associations.delete(wtxn, &key)?;
            self.index.file_phashes.delete(wtxn, &PairKey::new(key.item, key.group))?;
        }

        debug!("gathering all leaves");

        self.index.tree.clear(wtxn)?;

        let mut all_nodes = Vec::new();
        for result in self.index.phashes.iter(wtxn)? {
            let (phash_id, phash) = result?;
            all_nodes.push((phash_id, phash));
        }

        debug!("{} leaves found, now regenerating", all_nodes.len());

        let mut metadata = self.index.metadata(wtxn)?;
        if all_nodes.is_empty() {
            metadata.root = None;
            return self.index.put_metadata(wtxn, &metadata);
        }

        let (root_id, root_phash) = pop_best_root(rng, &self.index.options, &mut all_nodes);
        metadata.root = Some(root_id);
        self.index.put_metadata(wtxn, &metadata)?;

        self.generate_branch(wtxn, rng, None, root_id, root_phash, all_nodes)
    }
}

/// Picks the node best suited to be the vantage point over `nodes`, removes
/// it from the list and returns it.
///
/// Candidates are scored on how evenly their median radius would split a
/// sample of the population, the ratio discretized so that ties fall through
/// to the standard deviation of the observed distances: a larger spread means
/// less sphere overlap during search.
fn pop_best_root<R: Rng>(
    rng: &mut R,
    options: &IndexOptions,
    nodes: &mut Vec<(PhashId, PHash)>,
) -> (PhashId, PHash) {
    if nodes.len() == 1 {
        return nodes.pop().unwrap();
    }

    let viewpoints: Vec<(PhashId, PHash)> = if nodes.len() > options.best_root_max_viewpoints {
        nodes.choose_multiple(rng, options.best_root_max_viewpoints).copied().collect()
    } else {
        nodes.clone()
    };
    let sample: Vec<(PhashId, PHash)> = if nodes.len() > options.best_root_max_sample {
        nodes.choose_multiple(rng, options.best_root_max_sample).copied().collect()
    } else {
        nodes.clone()
    };

    let mut best: Option<(u64, OrderedFloat<f64>, PhashId)> = None;
    for &(viewpoint_id, viewpoint_phash) in &viewpoints {
        let mut views: Vec<u32> = sample
            .iter()
            .filter(|&&(sample_id, _)| sample_id != viewpoint_id)
            .map(|&(_, sample_phash)| hamming(viewpoint_phash, sample_phash))
            .collect();
        views.sort_unstable();

        let radius = views[views.len() / 2];

        let mut num_left = views.iter().filter(|&&view| view < radius).count();
        let num_radius = views.iter().filter(|&&view| view == radius).count();
        let mut num_right = views.iter().filter(|&&view| view > radius).count();

        if num_left <= num_right {
            num_left += num_radius;
        } else {
            num_right += num_radius;
        }

        let smaller = num_left.min(num_right) as f64;
        let larger = num_left.max(num_right) as f64;
        let ratio_score = (smaller / larger * options.best_root_max_sample as f64 / 2.0) as u64;

        let mean_view = views.iter().map(|&view| view as f64).sum::<f64>() / views.len() as f64;
        let variance = views
            .iter()
            .map(|&view| (view as f64 - mean_view).powi(2))
            .sum::<f64>()
            / views.len() as f64;

        let score = (ratio_score, OrderedFloat(variance.sqrt()), viewpoint_id);
        if best.map_or(true, |best| score > best) {
            best = Some(score);
        }
    }

    let (_, _, root_id) = best.unwrap();
    let position = nodes.iter().position(|&(id, _)| id == root_id).unwrap();
    nodes.remove(position)
}
