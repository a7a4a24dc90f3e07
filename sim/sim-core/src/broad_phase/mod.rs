//! Broad phase: one quad tree per broad-phase layer.
//!
//! The broad phase finds body pairs whose world bounds overlap. Bodies are
//! stored in the tree of their [`BroadPhaseLayer`]; a [`BodyTracker`] per body
//! slot remembers the layers and the leaf slot of the body.
//!
//! # Locking
//!
//! Structural changes take `&mut self`, queries take `&self`. The ranked locks
//! of [`PhysicsLockContext`] are still taken so the broad phase participates in
//! the global lock order:
//!
//! | Operation                       | Lock                                |
//! |---------------------------------|-------------------------------------|
//! | queries                         | shared, current query lock          |
//! | add, remove, notify             | shared, update lock                 |
//! | [`BroadPhase::update`]          | exclusive, update lock              |
//! | [`BroadPhase::frame_sync`]      | exclusive, previous query lock      |
//!
//! [`BroadPhase::update`] rebuilds every dirty tree and flips the query lock;
//! the replaced trees stay allocated until [`BroadPhase::frame_sync`].

mod quad_tree;
mod query;

use parking_lot::RwLock;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSlice;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use sim_types::{
    Aabb, BodyId, BodyManager, BroadPhaseLayer, CollisionLayer, CollisionLayerPairFilter,
    CollisionVsBroadPhaseLayerFilter, LockType, PhysicsLockContext, Result, SharedLock, SimError,
    UniqueLock,
};
use tracing::{debug, trace};

use quad_tree::{PreparedLeaf, QuadTree, TreeVisitor};

pub use query::{
    AaBoxCast, AllHitCollector, AnyHitCollector, CastResult, ClosestHitCollector,
    CollectorHit, CollisionCollector, CollisionLayerFilter, PairCollisionLayerFilter,
    QueryFilter, RayCast,
};

/// Active bodies handed to one pair-finding job.
const PAIR_BATCH_SIZE: usize = 64;

/// Broad-phase bookkeeping for one body slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyTracker {
    /// Tree the body is stored in.
    pub broad_phase_layer: BroadPhaseLayer,
    /// Collision layer used for filtering.
    pub collision_layer: CollisionLayer,
    /// `node << 2 | child` of the leaf slot.
    location: u32,
}

impl BodyTracker {
    /// Tracker of a body that is not in the broad phase.
    pub const INVALID: Self = Self {
        broad_phase_layer: BroadPhaseLayer(u8::MAX),
        collision_layer: CollisionLayer(u16::MAX),
        location: u32::MAX,
    };

    /// True if the body was added to the broad phase.
    #[must_use]
    pub fn is_in_broad_phase(&self) -> bool {
        self.broad_phase_layer != Self::INVALID.broad_phase_layer
    }

    pub(crate) fn set_location(&mut self, node: u32, child: usize) {
        debug_assert!(node < (1 << 30) && child < 4);
        self.location = (node << 2) | child as u32;
    }

    pub(crate) fn location(&self) -> Option<(u32, usize)> {
        (self.location != u32::MAX).then_some((self.location >> 2, (self.location & 3) as usize))
    }

    pub(crate) fn invalidate_location(&mut self) {
        self.location = u32::MAX;
    }
}

/// Statistics of one broad-phase tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerStats {
    /// Bodies stored in the tree.
    pub num_bodies: u32,
    /// Nodes allocated, including a replaced tree not yet freed.
    pub num_nodes: usize,
    /// Depth of the current tree.
    pub max_depth: u32,
    /// Whether the tree changed since the last rebuild.
    pub dirty: bool,
}

/// Subtrees built by [`BroadPhase::add_bodies_prepare`], one per layer.
#[derive(Debug)]
#[must_use = "prepared bodies must be finalized or aborted"]
pub struct AddState {
    layers: Vec<PreparedLayer>,
}

#[derive(Debug)]
struct PreparedLayer {
    layer: usize,
    bodies: Vec<BodyId>,
    leaf: PreparedLeaf,
}

impl AddState {
    /// Number of bodies in the batch.
    #[must_use]
    pub fn num_bodies(&self) -> usize {
        self.layers.iter().map(|l| l.bodies.len()).sum()
    }
}

/// Quad-tree broad phase over all broad-phase layers.
#[derive(Debug)]
pub struct BroadPhase {
    trees: Vec<QuadTree>,
    trackers: Vec<BodyTracker>,
    query_locks: [RwLock<()>; 2],
    query_lock_index: usize,
    update_lock: RwLock<()>,
}

impl BroadPhase {
    /// A broad phase for up to `max_bodies` body slots spread over
    /// `num_layers` trees.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] if `num_layers` is zero or does not
    /// fit a [`BroadPhaseLayer`].
    pub fn new(max_bodies: usize, num_layers: usize) -> Result<Self> {
        if num_layers == 0 || num_layers > usize::from(u8::MAX) {
            return Err(SimError::invalid_config(format!(
                "broad phase needs 1..={} layers, got {num_layers}",
                u8::MAX
            )));
        }
        Ok(Self {
            trees: (0..num_layers).map(|_| QuadTree::new(max_bodies)).collect(),
            trackers: vec![BodyTracker::INVALID; max_bodies],
            query_locks: [RwLock::new(()), RwLock::new(())],
            query_lock_index: 0,
            update_lock: RwLock::new(()),
        })
    }

    /// Number of broad-phase layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.trees.len()
    }

    /// Bodies stored over all layers.
    #[must_use]
    pub fn num_bodies(&self) -> u32 {
        self.trees.iter().map(QuadTree::num_bodies).sum()
    }

    /// Tracker of a body, `None` if the id is out of range.
    #[must_use]
    pub fn tracker(&self, id: BodyId) -> Option<&BodyTracker> {
        self.trackers.get(id.index() as usize)
    }

    /// Statistics for one layer.
    #[must_use]
    pub fn layer_stats(&self, layer: BroadPhaseLayer) -> Option<LayerStats> {
        self.trees.get(layer.index()).map(|tree| LayerStats {
            num_bodies: tree.num_bodies(),
            num_nodes: tree.num_nodes(),
            max_depth: tree.max_depth(),
            dirty: tree.is_dirty(),
        })
    }

    /// Bounds of everything in the broad phase.
    #[must_use]
    pub fn bounds(&self) -> Aabb {
        let mut bounds = Aabb::invalid();
        for tree in self.trees.iter().filter(|t| t.has_bodies()) {
            bounds.encapsulate(&tree.bounds());
        }
        bounds
    }

    fn tracker_mut(&mut self, id: BodyId) -> Result<&mut BodyTracker> {
        self.trackers
            .get_mut(id.index() as usize)
            .ok_or(SimError::InvalidBodyId(id))
    }

    fn reset_trackers(&mut self, ids: &[BodyId]) {
        for id in ids {
            if let Some(tracker) = self.trackers.get_mut(id.index() as usize) {
                *tracker = BodyTracker::INVALID;
            }
        }
    }

    /// Build the subtrees for a batch of bodies without making them visible.
    ///
    /// `ids` is sorted by broad-phase layer. The trackers are claimed, so the
    /// same body cannot be prepared twice.
    ///
    /// # Errors
    ///
    /// Fails if a body does not exist, is already in the broad phase, names a
    /// layer that does not exist or a tree runs out of nodes. Nothing is
    /// changed on failure.
    pub fn add_bodies_prepare(
        &mut self,
        bodies: &BodyManager,
        ids: &mut [BodyId],
    ) -> Result<AddState> {
        let mut leaves = Vec::with_capacity(ids.len());
        for (claimed, &id) in ids.iter().enumerate() {
            let checked = self.claim_tracker(bodies, id);
            match checked {
                Ok(leaf) => leaves.push(leaf),
                Err(e) => {
                    self.reset_trackers(&ids[..claimed]);
                    return Err(e);
                }
            }
        }
        leaves.sort_unstable_by_key(|(layer, id, _)| (*layer, *id));
        for (slot, (_, id, _)) in ids.iter_mut().zip(&leaves) {
            *slot = *id;
        }

        let mut state = AddState { layers: Vec::new() };
        for group in leaves.chunk_by(|a, b| a.0 == b.0) {
            let layer = group[0].0;
            let mut tree_leaves: Vec<(BodyId, Aabb)> =
                group.iter().map(|(_, id, b)| (*id, *b)).collect();
            match self.trees[layer].add_bodies_prepare(&mut tree_leaves, &mut self.trackers) {
                Ok(leaf) => state.layers.push(PreparedLayer {
                    layer,
                    bodies: group.iter().map(|(_, id, _)| *id).collect(),
                    leaf,
                }),
                Err(e) => {
                    self.add_bodies_abort(state);
                    self.reset_trackers(ids);
                    return Err(e);
                }
            }
        }
        Ok(state)
    }

    fn claim_tracker(&mut self, bodies: &BodyManager, id: BodyId) -> Result<(usize, BodyId, Aabb)> {
        let num_layers = self.trees.len();
        let body = bodies.lock(id).ok_or(SimError::InvalidBodyId(id))?;
        let (broad_phase_layer, collision_layer, bounds) =
            (body.broad_phase_layer(), body.collision_layer(), body.world_bounds());
        drop(body);

        if broad_phase_layer.index() >= num_layers {
            return Err(SimError::invalid_config(format!(
                "body {id} uses broad-phase layer {} of {num_layers}",
                broad_phase_layer.0
            )));
        }
        let tracker = self.tracker_mut(id)?;
        if tracker.is_in_broad_phase() {
            return Err(SimError::AlreadyInBroadPhase(id));
        }
        *tracker = BodyTracker {
            broad_phase_layer,
            collision_layer,
            location: u32::MAX,
        };
        Ok((broad_phase_layer.index(), id, bounds))
    }

    /// Link prepared subtrees into their trees, making the bodies visible to
    /// queries.
    pub fn add_bodies_finalize(&mut self, ctx: &PhysicsLockContext, state: AddState) {
        let _lock = SharedLock::new(ctx, &self.update_lock, LockType::BroadPhaseUpdate);
        for prepared in state.layers {
            trace!(layer = prepared.layer, bodies = prepared.bodies.len(), "adding bodies");
            self.trees[prepared.layer].add_bodies_finalize(prepared.leaf, &mut self.trackers);
        }
    }

    /// Drop prepared subtrees and release the trackers.
    pub fn add_bodies_abort(&mut self, state: AddState) {
        for prepared in state.layers {
            self.trees[prepared.layer].add_bodies_abort(prepared.leaf);
            self.reset_trackers(&prepared.bodies);
        }
    }

    /// Prepare and finalize in one call.
    ///
    /// # Errors
    ///
    /// See [`BroadPhase::add_bodies_prepare`].
    pub fn add_bodies(
        &mut self,
        ctx: &PhysicsLockContext,
        bodies: &BodyManager,
        ids: &mut [BodyId],
    ) -> Result<()> {
        let state = self.add_bodies_prepare(bodies, ids)?;
        self.add_bodies_finalize(ctx, state);
        Ok(())
    }

    fn check_in_broad_phase(&self, ids: &[BodyId]) -> Result<()> {
        for &id in ids {
            let tracker = self.tracker(id).ok_or(SimError::InvalidBodyId(id))?;
            if !tracker.is_in_broad_phase() {
                return Err(SimError::NotInBroadPhase(id));
            }
        }
        Ok(())
    }

    /// Remove bodies from their trees.
    ///
    /// `ids` is sorted by broad-phase layer.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NotInBroadPhase`] and removes nothing if any body
    /// is not in the broad phase.
    pub fn remove_bodies(&mut self, ctx: &PhysicsLockContext, ids: &mut [BodyId]) -> Result<()> {
        self.check_in_broad_phase(ids)?;
        let _lock = SharedLock::new(ctx, &self.update_lock, LockType::BroadPhaseUpdate);
        let trackers = &self.trackers;
        ids.sort_unstable_by_key(|id| (trackers[id.index() as usize].broad_phase_layer, *id));
        for &id in ids.iter() {
            let slot = id.index() as usize;
            let layer = self.trackers[slot].broad_phase_layer.index();
            self.trees[layer].remove_body(id, &mut self.trackers);
            self.trackers[slot] = BodyTracker::INVALID;
        }
        Ok(())
    }

    /// Copy the current world bounds of bodies into their leaves.
    ///
    /// # Errors
    ///
    /// Fails without changes if a body does not exist or is not in the broad
    /// phase.
    pub fn notify_bodies_aabb_changed(
        &mut self,
        ctx: &PhysicsLockContext,
        bodies: &BodyManager,
        ids: &[BodyId],
    ) -> Result<()> {
        self.check_in_broad_phase(ids)?;
        let mut updates = Vec::with_capacity(ids.len());
        for &id in ids {
            let body = bodies.lock(id).ok_or(SimError::InvalidBodyId(id))?;
            updates.push((id, body.world_bounds()));
        }

        let _lock = SharedLock::new(ctx, &self.update_lock, LockType::BroadPhaseUpdate);
        for (id, bounds) in updates {
            let layer = self.trackers[id.index() as usize].broad_phase_layer.index();
            self.trees[layer].update_body_bounds(id, &bounds, &self.trackers);
        }
        Ok(())
    }

    /// Pick up layer changes of bodies. A body whose broad-phase layer
    /// changed moves to the other tree; a collision-layer change only updates
    /// the tracker.
    ///
    /// # Errors
    ///
    /// Fails if a body does not exist, is not in the broad phase, or the new
    /// tree is out of nodes. Bodies handled before the failure keep their new
    /// layer.
    pub fn notify_bodies_layer_changed(
        &mut self,
        ctx: &PhysicsLockContext,
        bodies: &BodyManager,
        ids: &[BodyId],
    ) -> Result<()> {
        self.check_in_broad_phase(ids)?;
        let _lock = SharedLock::new(ctx, &self.update_lock, LockType::BroadPhaseUpdate);
        for &id in ids {
            let body = bodies.lock(id).ok_or(SimError::InvalidBodyId(id))?;
            let (broad_phase_layer, collision_layer, bounds) =
                (body.broad_phase_layer(), body.collision_layer(), body.world_bounds());
            drop(body);

            let tracker = self.trackers[id.index() as usize];
            if tracker.broad_phase_layer == broad_phase_layer {
                self.trackers[id.index() as usize].collision_layer = collision_layer;
                continue;
            }
            if broad_phase_layer.index() >= self.trees.len() {
                return Err(SimError::invalid_config(format!(
                    "body {id} uses broad-phase layer {} of {}",
                    broad_phase_layer.0,
                    self.trees.len()
                )));
            }

            let tree = &mut self.trees[broad_phase_layer.index()];
            let leaf = tree.add_bodies_prepare(&mut [(id, bounds)], &mut self.trackers)?;
            self.trees[tracker.broad_phase_layer.index()].remove_body(id, &mut self.trackers);
            self.trackers[id.index() as usize] = BodyTracker {
                broad_phase_layer,
                collision_layer,
                location: u32::MAX,
            };
            self.trees[broad_phase_layer.index()].add_bodies_finalize(leaf, &mut self.trackers);
            trace!(
                %id,
                from = tracker.broad_phase_layer.0,
                to = broad_phase_layer.0,
                "body changed layer"
            );
        }
        Ok(())
    }

    /// Rebuild every dirty tree and publish the new trees to queries.
    ///
    /// A tree whose previous generation was not released by
    /// [`BroadPhase::frame_sync`] is skipped.
    ///
    /// # Errors
    ///
    /// Fails if a tree runs out of nodes; that tree keeps its current shape.
    pub fn update(&mut self, ctx: &PhysicsLockContext) -> Result<()> {
        let _lock = UniqueLock::new(ctx, &self.update_lock, LockType::BroadPhaseUpdate);
        let mut rebuilt_any = false;
        let mut result = Ok(());
        for (layer, tree) in self.trees.iter_mut().enumerate() {
            match tree.update_prepare(&mut self.trackers) {
                Ok(Some(rebuilt)) => {
                    tree.update_finalize(rebuilt);
                    rebuilt_any = true;
                    debug!(
                        layer,
                        bodies = tree.num_bodies(),
                        depth = tree.max_depth(),
                        "rebuilt broad phase tree"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if rebuilt_any {
            self.query_lock_index ^= 1;
        }
        result
    }

    /// Wait for queries on the previous tree generation and free it.
    pub fn frame_sync(&mut self, ctx: &PhysicsLockContext) {
        let _lock = UniqueLock::new(
            ctx,
            &self.query_locks[self.query_lock_index ^ 1],
            LockType::BroadPhaseQuery,
        );
        for tree in &mut self.trees {
            tree.discard_old_tree();
        }
    }

    fn query_lock<'a>(&'a self, ctx: &'a PhysicsLockContext) -> SharedLock<'a, ()> {
        SharedLock::new(ctx, &self.query_locks[self.query_lock_index], LockType::BroadPhaseQuery)
    }

    /// Find all pairs of bodies whose bounds overlap where at least one is
    /// active.
    ///
    /// Bounds of the active bodies are grown by `speculative_distance`. A pair
    /// needs at least one dynamic body and must pass both filters. Each pair
    /// is reported once with the active body first; two active bodies are
    /// reported in id order.
    #[must_use]
    pub fn find_colliding_pairs(
        &self,
        bodies: &BodyManager,
        active: &[BodyId],
        speculative_distance: f64,
        layer_filter: &dyn CollisionVsBroadPhaseLayerFilter,
        pair_filter: &dyn CollisionLayerPairFilter,
    ) -> Vec<(BodyId, BodyId)> {
        let mut by_layer: Vec<(CollisionLayer, BodyId)> = active
            .iter()
            .filter_map(|&id| {
                let tracker = self.tracker(id)?;
                tracker.is_in_broad_phase().then_some((tracker.collision_layer, id))
            })
            .collect();
        by_layer.sort_by_key(|(layer, _)| *layer);

        let mut pairs = Vec::new();
        for group in by_layer.chunk_by(|a, b| a.0 == b.0) {
            let collision_layer = group[0].0;
            let ids: Vec<BodyId> = group.iter().map(|(_, id)| *id).collect();
            for (index, tree) in self.trees.iter().enumerate() {
                let broad_phase_layer = BroadPhaseLayer(index as u8);
                if !tree.has_bodies()
                    || !layer_filter.should_collide(collision_layer, broad_phase_layer)
                {
                    continue;
                }
                let found: Vec<Vec<(BodyId, BodyId)>> = ids
                    .par_chunks(PAIR_BATCH_SIZE)
                    .map(|chunk| {
                        self.pairs_for_chunk(tree, bodies, chunk, speculative_distance, pair_filter)
                    })
                    .collect();
                pairs.extend(found.into_iter().flatten());
            }
        }
        trace!(active = active.len(), pairs = pairs.len(), "found colliding pairs");
        pairs
    }

    fn pairs_for_chunk(
        &self,
        tree: &QuadTree,
        bodies: &BodyManager,
        chunk: &[BodyId],
        speculative_distance: f64,
        pair_filter: &dyn CollisionLayerPairFilter,
    ) -> Vec<(BodyId, BodyId)> {
        let mut pairs = Vec::new();
        let mut visitor = OverlapVisitor {
            query: Aabb::invalid(),
            hits: Vec::new(),
        };
        for &id1 in chunk {
            let Some(body1) = bodies.lock(id1) else {
                continue;
            };
            visitor.query = body1.world_bounds().expanded(speculative_distance);
            let dynamic1 = body1.is_dynamic();
            drop(body1);
            let layer1 = self.trackers[id1.index() as usize].collision_layer;

            visitor.hits.clear();
            tree.walk(&mut visitor);
            for &id2 in &visitor.hits {
                if id2 == id1 {
                    continue;
                }
                let Some(body2) = bodies.lock(id2) else {
                    continue;
                };
                let (active2, dynamic2) = (body2.is_active(), body2.is_dynamic());
                drop(body2);
                if active2 && id2 < id1 {
                    continue;
                }
                if !dynamic1 && !dynamic2 {
                    continue;
                }
                let layer2 = self.trackers[id2.index() as usize].collision_layer;
                if pair_filter.should_collide(layer1, layer2) {
                    pairs.push((id1, id2));
                }
            }
        }
        pairs
    }
}

/// Collects every body whose bounds overlap a box.
struct OverlapVisitor {
    query: Aabb,
    hits: Vec<BodyId>,
}

impl TreeVisitor for OverlapVisitor {
    fn should_visit(&mut self, bounds: &Aabb) -> bool {
        bounds.overlaps(&self.query)
    }

    fn visit_body(&mut self, body: BodyId, _: &Aabb) {
        self.hits.push(body);
    }
}
