//! Double-buffered contact cache.
//!
//! Every step reads the cache written by the previous step and writes a fresh
//! one. A body pair whose relative transform barely changed is reused from the
//! read side without running the narrow phase again; contact points that
//! survive carry their accumulated impulses forward for warm starting.
//!
//! Manifolds of one body pair form a singly linked list through
//! [`CachedManifold::next`], with the head stored in [`CachedBodyPair`].

use hashbrown::HashMap;
use nalgebra::{Point3, UnitQuaternion, Vector3};
use smallvec::SmallVec;

use sim_types::StepErrors;

use crate::{BodyPairKey, MAX_CONTACT_POINTS, SubShapeIdPair};

/// End of a manifold list.
pub const NO_MANIFOLD: u32 = u32::MAX;

/// Relative transform of a body pair at the time its contacts were computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedBodyPair {
    /// Position of body 2 relative to body 1, in body 1's space.
    pub delta_position: Vector3<f64>,
    /// Rotation of body 2 relative to body 1.
    pub delta_rotation: UnitQuaternion<f64>,
    /// First manifold of the pair, or [`NO_MANIFOLD`].
    pub first_manifold: u32,
}

/// A contact point in body-local space plus its accumulated impulses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedContactPoint {
    /// Point on body 1 relative to its center of mass, body space.
    pub position1: Vector3<f64>,
    /// Point on body 2 relative to its center of mass, body space.
    pub position2: Vector3<f64>,
    /// Accumulated non-penetration impulse.
    pub non_penetration_lambda: f64,
    /// Accumulated friction impulses along the two tangents.
    pub friction_lambda: [f64; 2],
}

impl CachedContactPoint {
    /// A point without impulses from two world-space points.
    #[must_use]
    pub fn from_world(
        point1: &Point3<f64>,
        com1: &Point3<f64>,
        inv_rotation1: &UnitQuaternion<f64>,
        point2: &Point3<f64>,
        com2: &Point3<f64>,
        inv_rotation2: &UnitQuaternion<f64>,
    ) -> Self {
        Self {
            position1: inv_rotation1 * (point1 - com1),
            position2: inv_rotation2 * (point2 - com2),
            non_penetration_lambda: 0.0,
            friction_lambda: [0.0; 2],
        }
    }
}

/// Contact points of one sub shape pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedManifold {
    /// Which sub shapes touch.
    pub key: SubShapeIdPair,
    /// Contact normal in body 2's space.
    pub contact_normal: Vector3<f64>,
    /// Contact points.
    pub points: SmallVec<[CachedContactPoint; MAX_CONTACT_POINTS]>,
    /// Next manifold of the same body pair, or [`NO_MANIFOLD`].
    pub next: u32,
    /// Set on a read-side manifold when the current step found it again.
    pub persisted: bool,
}

/// One side of the double buffer.
#[derive(Debug)]
pub struct ManifoldCache {
    body_pairs: HashMap<BodyPairKey, CachedBodyPair>,
    manifolds: Vec<CachedManifold>,
    manifold_index: HashMap<SubShapeIdPair, u32>,
    max_body_pairs: usize,
    max_manifolds: usize,
}

impl ManifoldCache {
    /// Empty cache with fixed capacities.
    #[must_use]
    pub fn new(max_body_pairs: usize, max_manifolds: usize) -> Self {
        Self {
            body_pairs: HashMap::new(),
            manifolds: Vec::new(),
            manifold_index: HashMap::new(),
            max_body_pairs,
            max_manifolds,
        }
    }

    /// Empty the cache and size it for roughly the given occupancy.
    pub fn prepare(&mut self, expected_body_pairs: usize, expected_manifolds: usize) {
        let body_pairs = expected_body_pairs.min(self.max_body_pairs);
        let manifolds = expected_manifolds.min(self.max_manifolds);

        self.body_pairs.clear();
        self.body_pairs.shrink_to(body_pairs);
        self.body_pairs.reserve(body_pairs);

        self.manifolds.clear();
        self.manifolds.shrink_to(manifolds);
        self.manifolds.reserve(manifolds);

        self.manifold_index.clear();
        self.manifold_index.shrink_to(manifolds);
        self.manifold_index.reserve(manifolds);
    }

    /// Number of cached body pairs.
    #[must_use]
    pub fn num_body_pairs(&self) -> usize {
        self.body_pairs.len()
    }

    /// Number of cached manifolds.
    #[must_use]
    pub fn num_manifolds(&self) -> usize {
        self.manifolds.len()
    }

    /// Clear the `persisted` mark of every manifold.
    pub fn clear_persisted(&mut self) {
        for manifold in &mut self.manifolds {
            manifold.persisted = false;
        }
    }

    /// Look up a body pair.
    #[must_use]
    pub fn find_body_pair(&self, key: &BodyPairKey) -> Option<&CachedBodyPair> {
        self.body_pairs.get(key)
    }

    /// Insert a body pair without manifolds.
    pub fn create_body_pair(
        &mut self,
        key: BodyPairKey,
        delta_position: Vector3<f64>,
        delta_rotation: UnitQuaternion<f64>,
    ) -> Result<(), StepErrors> {
        debug_assert!(!self.body_pairs.contains_key(&key), "body pair cached twice");
        if self.body_pairs.len() >= self.max_body_pairs {
            return Err(StepErrors::BODY_PAIR_CACHE_FULL);
        }
        self.body_pairs.insert(
            key,
            CachedBodyPair {
                delta_position,
                delta_rotation,
                first_manifold: NO_MANIFOLD,
            },
        );
        Ok(())
    }

    /// Look up a manifold.
    #[must_use]
    pub fn find_manifold(&self, key: &SubShapeIdPair) -> Option<u32> {
        self.manifold_index.get(key).copied()
    }

    /// Manifold by index.
    #[must_use]
    pub fn manifold(&self, index: u32) -> &CachedManifold {
        &self.manifolds[index as usize]
    }

    /// Mutable manifold by index.
    pub fn manifold_mut(&mut self, index: u32) -> &mut CachedManifold {
        &mut self.manifolds[index as usize]
    }

    /// All manifolds in insertion order.
    pub fn manifolds(&self) -> impl Iterator<Item = &CachedManifold> {
        self.manifolds.iter()
    }

    /// Add a manifold to the list of an existing body pair.
    pub fn add_manifold(
        &mut self,
        pair: &BodyPairKey,
        mut manifold: CachedManifold,
    ) -> Result<u32, StepErrors> {
        debug_assert!(
            !self.manifold_index.contains_key(&manifold.key),
            "manifold cached twice"
        );
        let Some(body_pair) = self.body_pairs.get_mut(pair) else {
            return Err(StepErrors::BODY_PAIR_CACHE_FULL);
        };
        if self.manifolds.len() >= self.max_manifolds {
            return Err(StepErrors::MANIFOLD_CACHE_FULL);
        }
        let index = self.manifolds.len() as u32;
        manifold.next = body_pair.first_manifold;
        manifold.persisted = false;
        body_pair.first_manifold = index;
        self.manifold_index.insert(manifold.key, index);
        self.manifolds.push(manifold);
        Ok(index)
    }

    /// Indices of the manifolds of a body pair, most recently added first.
    #[must_use]
    pub fn body_pair_manifolds(&self, pair: &CachedBodyPair) -> ManifoldIter<'_> {
        ManifoldIter {
            cache: self,
            next: pair.first_manifold,
        }
    }
}

/// Walks the manifold list of one body pair.
#[derive(Debug)]
pub struct ManifoldIter<'a> {
    cache: &'a ManifoldCache,
    next: u32,
}

impl Iterator for ManifoldIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next == NO_MANIFOLD {
            return None;
        }
        let index = self.next;
        self.next = self.cache.manifold(index).next;
        Some(index)
    }
}

/// The two sides of the contact cache.
#[derive(Debug)]
pub struct ContactCache {
    caches: [ManifoldCache; 2],
    write_index: usize,
}

impl ContactCache {
    /// Two empty caches with the same capacities.
    #[must_use]
    pub fn new(max_body_pairs: usize, max_manifolds: usize) -> Self {
        Self {
            caches: [
                ManifoldCache::new(max_body_pairs, max_manifolds),
                ManifoldCache::new(max_body_pairs, max_manifolds),
            ],
            write_index: 0,
        }
    }

    /// Cache written by the previous step.
    #[must_use]
    pub fn read(&self) -> &ManifoldCache {
        &self.caches[self.write_index ^ 1]
    }

    /// Cache written by this step.
    #[must_use]
    pub fn write(&self) -> &ManifoldCache {
        &self.caches[self.write_index]
    }

    /// Mutable access to the write side.
    pub fn write_mut(&mut self) -> &mut ManifoldCache {
        &mut self.caches[self.write_index]
    }

    /// Read side and write side at once.
    pub fn split_mut(&mut self) -> (&mut ManifoldCache, &mut ManifoldCache) {
        let [first, second] = &mut self.caches;
        if self.write_index == 0 {
            (second, first)
        } else {
            (first, second)
        }
    }

    /// Make the write side the read side of the next step and clear the
    /// new write side, sized after the cache that was just written.
    pub fn swap(&mut self) {
        self.write_index ^= 1;
        let (body_pairs, manifolds) = {
            let read = self.read();
            (read.num_body_pairs(), read.num_manifolds())
        };
        self.write_mut().prepare(body_pairs, manifolds);
    }

    /// Drop whatever an unfinished step wrote and forget which read-side
    /// manifolds it found again. A no-op after [`ContactCache::swap`].
    pub fn discard_write(&mut self) {
        let (read, write) = self.split_mut();
        read.clear_persisted();
        if write.num_body_pairs() > 0 || write.num_manifolds() > 0 {
            write.prepare(read.num_body_pairs(), read.num_manifolds());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::SubShapeId;
    use sim_types::BodyId;

    fn manifold(a: u32, b: u32, sub: u32) -> CachedManifold {
        CachedManifold {
            key: SubShapeIdPair::new(
                BodyId::new(a, 0),
                SubShapeId(sub),
                BodyId::new(b, 0),
                SubShapeId::EMPTY,
            ),
            contact_normal: Vector3::z(),
            points: SmallVec::new(),
            next: NO_MANIFOLD,
            persisted: false,
        }
    }

    fn pair(a: u32, b: u32) -> BodyPairKey {
        BodyPairKey::new(BodyId::new(a, 0), BodyId::new(b, 0))
    }

    #[test]
    fn test_manifold_list_per_body_pair() {
        let mut cache = ManifoldCache::new(4, 4);
        cache
            .create_body_pair(pair(0, 1), Vector3::zeros(), UnitQuaternion::identity())
            .unwrap();
        cache
            .create_body_pair(pair(1, 2), Vector3::zeros(), UnitQuaternion::identity())
            .unwrap();
        let m0 = cache.add_manifold(&pair(0, 1), manifold(0, 1, 0)).unwrap();
        let m1 = cache.add_manifold(&pair(1, 2), manifold(1, 2, 0)).unwrap();
        let m2 = cache.add_manifold(&pair(0, 1), manifold(0, 1, 1)).unwrap();

        let list: Vec<u32> = cache
            .body_pair_manifolds(cache.find_body_pair(&pair(0, 1)).unwrap())
            .collect();
        assert_eq!(list, vec![m2, m0]);
        assert_eq!(cache.find_manifold(&manifold(1, 2, 0).key), Some(m1));
    }

    #[test]
    fn test_capacity_errors() {
        let mut cache = ManifoldCache::new(1, 1);
        cache
            .create_body_pair(pair(0, 1), Vector3::zeros(), UnitQuaternion::identity())
            .unwrap();
        assert_eq!(
            cache.create_body_pair(pair(1, 2), Vector3::zeros(), UnitQuaternion::identity()),
            Err(StepErrors::BODY_PAIR_CACHE_FULL)
        );
        cache.add_manifold(&pair(0, 1), manifold(0, 1, 0)).unwrap();
        assert_eq!(
            cache.add_manifold(&pair(0, 1), manifold(0, 1, 1)),
            Err(StepErrors::MANIFOLD_CACHE_FULL)
        );
    }

    #[test]
    fn test_swap_clears_new_write_side() {
        let mut cache = ContactCache::new(8, 8);
        cache
            .write_mut()
            .create_body_pair(pair(0, 1), Vector3::zeros(), UnitQuaternion::identity())
            .unwrap();
        cache.swap();
        assert_eq!(cache.read().num_body_pairs(), 1);
        assert_eq!(cache.write().num_body_pairs(), 0);

        cache.swap();
        assert_eq!(cache.read().num_body_pairs(), 0);

        let (read, write) = cache.split_mut();
        assert_eq!(read.num_body_pairs(), 0);
        assert_eq!(write.num_body_pairs(), 0);
    }

    #[test]
    fn test_discard_write_forgets_unfinished_step() {
        let mut cache = ContactCache::new(8, 8);
        cache
            .write_mut()
            .create_body_pair(pair(0, 1), Vector3::zeros(), UnitQuaternion::identity())
            .unwrap();
        cache.write_mut().add_manifold(&pair(0, 1), manifold(0, 1, 0)).unwrap();
        cache.swap();

        // A step that marks the old manifold and writes the pair again, then
        // never finishes.
        cache.split_mut().0.manifold_mut(0).persisted = true;
        cache
            .write_mut()
            .create_body_pair(pair(0, 1), Vector3::zeros(), UnitQuaternion::identity())
            .unwrap();

        cache.discard_write();
        assert_eq!(cache.write().num_body_pairs(), 0);
        assert!(!cache.read().manifold(0).persisted);
        assert_eq!(cache.read().num_body_pairs(), 1);

        // The retried step can write the pair again.
        cache
            .write_mut()
            .create_body_pair(pair(0, 1), Vector3::zeros(), UnitQuaternion::identity())
            .unwrap();
    }
}
