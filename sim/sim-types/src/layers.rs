//! Broad-phase layers, collision layers and the filters between them.
//!
//! A body has a [`CollisionLayer`] (what it is) and lives in one
//! [`BroadPhaseLayer`] (which spatial tree it is stored in). Several collision
//! layers usually share one broad-phase layer.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Index of a broad-phase tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BroadPhaseLayer(pub u8);

impl BroadPhaseLayer {
    /// Layer index as `usize`.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Collision layer of a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CollisionLayer(pub u16);

impl CollisionLayer {
    /// Layer index as `usize`.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Decides which broad-phase layers a query visits.
pub trait BroadPhaseLayerFilter {
    /// Return true to search the tree of `layer`.
    fn should_collide(&self, layer: BroadPhaseLayer) -> bool {
        let _ = layer;
        true
    }
}

/// Decides whether a collision layer can touch anything in a broad-phase layer.
pub trait CollisionVsBroadPhaseLayerFilter: Sync {
    /// Return true if bodies of `collision_layer` can collide with bodies in
    /// `broad_phase_layer`.
    fn should_collide(&self, collision_layer: CollisionLayer, broad_phase_layer: BroadPhaseLayer)
    -> bool;
}

/// Decides whether two collision layers can touch.
pub trait CollisionLayerPairFilter: Sync {
    /// Return true if bodies of `a` and `b` can collide.
    fn should_collide(&self, a: CollisionLayer, b: CollisionLayer) -> bool;
}

/// Accept-all filter, usable for every filter trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllLayers;

impl BroadPhaseLayerFilter for AllLayers {}

impl CollisionVsBroadPhaseLayerFilter for AllLayers {
    fn should_collide(&self, _: CollisionLayer, _: BroadPhaseLayer) -> bool {
        true
    }
}

impl CollisionLayerPairFilter for AllLayers {
    fn should_collide(&self, _: CollisionLayer, _: CollisionLayer) -> bool {
        true
    }
}

/// Table-driven layer setup: a symmetric collision matrix plus a mapping from
/// collision layer to broad-phase layer.
///
/// # Example
///
/// ```
/// use sim_types::{BroadPhaseLayer, CollisionLayer, CollisionLayerPairFilter, LayerTable};
///
/// const NON_MOVING: CollisionLayer = CollisionLayer(0);
/// const MOVING: CollisionLayer = CollisionLayer(1);
///
/// let mut table = LayerTable::new(2);
/// table.map_to_broad_phase(NON_MOVING, BroadPhaseLayer(0));
/// table.map_to_broad_phase(MOVING, BroadPhaseLayer(1));
/// table.enable_collision(MOVING, MOVING);
/// table.enable_collision(MOVING, NON_MOVING);
///
/// assert!(table.should_collide(NON_MOVING, MOVING));
/// assert!(!table.should_collide(NON_MOVING, NON_MOVING));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerTable {
    num_layers: usize,
    collides: Vec<bool>,
    broad_phase_of: Vec<BroadPhaseLayer>,
}

impl LayerTable {
    /// Table for `num_layers` collision layers, nothing colliding, all in
    /// broad-phase layer 0.
    #[must_use]
    pub fn new(num_layers: usize) -> Self {
        Self {
            num_layers,
            collides: vec![false; num_layers * num_layers],
            broad_phase_of: vec![BroadPhaseLayer(0); num_layers],
        }
    }

    /// Number of collision layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Number of distinct broad-phase layers referenced.
    #[must_use]
    pub fn num_broad_phase_layers(&self) -> usize {
        self.broad_phase_of
            .iter()
            .map(|l| l.index() + 1)
            .max()
            .unwrap_or(1)
    }

    /// Let `a` and `b` collide (symmetric).
    pub fn enable_collision(&mut self, a: CollisionLayer, b: CollisionLayer) {
        let n = self.num_layers;
        if a.index() < n && b.index() < n {
            self.collides[a.index() * n + b.index()] = true;
            self.collides[b.index() * n + a.index()] = true;
        }
    }

    /// Put a collision layer in a broad-phase layer.
    pub fn map_to_broad_phase(&mut self, layer: CollisionLayer, broad_phase: BroadPhaseLayer) {
        if let Some(slot) = self.broad_phase_of.get_mut(layer.index()) {
            *slot = broad_phase;
        }
    }

    /// Broad-phase layer of a collision layer.
    #[must_use]
    pub fn broad_phase_layer(&self, layer: CollisionLayer) -> BroadPhaseLayer {
        self.broad_phase_of
            .get(layer.index())
            .copied()
            .unwrap_or_default()
    }
}

impl CollisionLayerPairFilter for LayerTable {
    fn should_collide(&self, a: CollisionLayer, b: CollisionLayer) -> bool {
        let n = self.num_layers;
        a.index() < n && b.index() < n && self.collides[a.index() * n + b.index()]
    }
}

impl CollisionVsBroadPhaseLayerFilter for LayerTable {
    fn should_collide(
        &self,
        collision_layer: CollisionLayer,
        broad_phase_layer: BroadPhaseLayer,
    ) -> bool {
        (0..self.num_layers).any(|other| {
            self.broad_phase_of[other] == broad_phase_layer
                && CollisionLayerPairFilter::should_collide(
                    self,
                    collision_layer,
                    CollisionLayer(other as u16),
                )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_table_is_symmetric() {
        let mut table = LayerTable::new(3);
        table.enable_collision(CollisionLayer(0), CollisionLayer(2));

        assert!(CollisionLayerPairFilter::should_collide(
            &table,
            CollisionLayer(2),
            CollisionLayer(0)
        ));
        assert!(!CollisionLayerPairFilter::should_collide(
            &table,
            CollisionLayer(1),
            CollisionLayer(0)
        ));
    }

    #[test]
    fn test_collision_vs_broad_phase() {
        let mut table = LayerTable::new(2);
        table.map_to_broad_phase(CollisionLayer(1), BroadPhaseLayer(1));
        table.enable_collision(CollisionLayer(1), CollisionLayer(1));

        assert_eq!(table.num_broad_phase_layers(), 2);
        assert!(CollisionVsBroadPhaseLayerFilter::should_collide(
            &table,
            CollisionLayer(1),
            BroadPhaseLayer(1)
        ));
        assert!(!CollisionVsBroadPhaseLayerFilter::should_collide(
            &table,
            CollisionLayer(1),
            BroadPhaseLayer(0)
        ));
    }

    #[test]
    fn test_out_of_range_layers_never_collide() {
        let table = LayerTable::new(1);
        assert!(!CollisionLayerPairFilter::should_collide(
            &table,
            CollisionLayer(0),
            CollisionLayer(7)
        ));
    }
}
