//! Narrow-phase results and the per-pair settings handed to contact listeners.

use nalgebra::{Point3, Vector3};
use sim_types::{Body, BodyId};
use smallvec::SmallVec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Maximum number of contact points per manifold. Four points are enough for
/// a stable resting contact.
pub const MAX_CONTACT_POINTS: usize = 4;

/// Contact point offsets of one manifold side.
pub type ContactPoints = SmallVec<[Vector3<f64>; MAX_CONTACT_POINTS]>;

/// Identifies a part of a compound shape. Shapes without parts use
/// [`SubShapeId::EMPTY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubShapeId(pub u32);

impl SubShapeId {
    /// The whole shape.
    pub const EMPTY: Self = Self(u32::MAX);
}

impl Default for SubShapeId {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Canonical identity of a body pair: the lower [`BodyId`] comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BodyPairKey {
    /// Lower body id.
    pub body1: BodyId,
    /// Higher body id.
    pub body2: BodyId,
}

impl BodyPairKey {
    /// Build the key for two bodies in any order.
    #[must_use]
    pub fn new(a: BodyId, b: BodyId) -> Self {
        if a <= b {
            Self { body1: a, body2: b }
        } else {
            Self { body1: b, body2: a }
        }
    }
}

/// Identity of one manifold: a body pair plus the touching sub shapes.
///
/// The derived ordering (bodies first, then sub shapes) is the contact sort
/// key used for deterministic simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubShapeIdPair {
    /// First body.
    pub body1: BodyId,
    /// Second body.
    pub body2: BodyId,
    /// Sub shape on the first body.
    pub sub_shape1: SubShapeId,
    /// Sub shape on the second body.
    pub sub_shape2: SubShapeId,
}

impl SubShapeIdPair {
    /// Pair of two sub shapes.
    #[must_use]
    pub const fn new(
        body1: BodyId,
        sub_shape1: SubShapeId,
        body2: BodyId,
        sub_shape2: SubShapeId,
    ) -> Self {
        Self {
            body1,
            body2,
            sub_shape1,
            sub_shape2,
        }
    }

    /// The body pair this manifold belongs to.
    #[must_use]
    pub fn body_pair(&self) -> BodyPairKey {
        BodyPairKey::new(self.body1, self.body2)
    }
}

/// Contact surface between two bodies as reported by the narrow phase.
///
/// The normal points from body 1 towards body 2: moving body 2 along it by
/// `penetration_depth` separates the shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactManifold {
    /// Offset that all contact points are relative to.
    pub base_offset: Point3<f64>,
    /// World-space contact normal, unit length.
    pub world_space_normal: Vector3<f64>,
    /// Penetration depth; negative when the shapes are apart (speculative
    /// contact).
    pub penetration_depth: f64,
    /// Sub shape of body 1.
    pub sub_shape1: SubShapeId,
    /// Sub shape of body 2.
    pub sub_shape2: SubShapeId,
    /// Contact points on body 1, relative to `base_offset`.
    pub relative_points_on1: ContactPoints,
    /// Contact points on body 2, relative to `base_offset`. Same length as
    /// `relative_points_on1`.
    pub relative_points_on2: ContactPoints,
}

impl ContactManifold {
    /// Single-point manifold between whole shapes.
    #[must_use]
    pub fn single_point(
        point_on1: Point3<f64>,
        point_on2: Point3<f64>,
        world_space_normal: Vector3<f64>,
    ) -> Self {
        let mut on1 = ContactPoints::new();
        on1.push(Vector3::zeros());
        let mut on2 = ContactPoints::new();
        on2.push(point_on2 - point_on1);
        Self {
            base_offset: point_on1,
            world_space_normal,
            penetration_depth: (point_on1 - point_on2).dot(&world_space_normal),
            sub_shape1: SubShapeId::EMPTY,
            sub_shape2: SubShapeId::EMPTY,
            relative_points_on1: on1,
            relative_points_on2: on2,
        }
    }

    /// Number of contact points.
    #[must_use]
    pub fn num_points(&self) -> usize {
        self.relative_points_on1.len().min(self.relative_points_on2.len())
    }

    /// World-space contact point `index` on body 1.
    #[must_use]
    pub fn world_point_on1(&self, index: usize) -> Point3<f64> {
        self.base_offset + self.relative_points_on1[index]
    }

    /// World-space contact point `index` on body 2.
    #[must_use]
    pub fn world_point_on2(&self, index: usize) -> Point3<f64> {
        self.base_offset + self.relative_points_on2[index]
    }

    /// The same contact seen from body 2.
    #[must_use]
    pub fn swap_shapes(&self) -> Self {
        Self {
            base_offset: self.base_offset,
            world_space_normal: -self.world_space_normal,
            penetration_depth: self.penetration_depth,
            sub_shape1: self.sub_shape2,
            sub_shape2: self.sub_shape1,
            relative_points_on1: self.relative_points_on2.clone(),
            relative_points_on2: self.relative_points_on1.clone(),
        }
    }
}

/// Contact constraint settings. Filled with defaults before
/// `on_contact_added` / `on_contact_persisted`, which may change them.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ContactSettings {
    /// Friction coefficient of the pair.
    pub combined_friction: f64,
    /// Restitution of the pair.
    pub combined_restitution: f64,
    /// Scale for body 1's inverse mass (0 = infinite mass).
    pub inverse_mass_scale1: f64,
    /// Scale for body 1's inverse inertia.
    pub inverse_inertia_scale1: f64,
    /// Scale for body 2's inverse mass (0 = infinite mass).
    pub inverse_mass_scale2: f64,
    /// Scale for body 2's inverse inertia.
    pub inverse_inertia_scale2: f64,
    /// Report contacts but apply no impulses.
    pub is_sensor: bool,
    /// World-space linear velocity of body 2's surface relative to body 1's
    /// (conveyor belts).
    pub relative_linear_surface_velocity: Vector3<f64>,
    /// World-space angular velocity of body 2's surface relative to body 1's.
    pub relative_angular_surface_velocity: Vector3<f64>,
}

impl ContactSettings {
    /// Settings with the given combined material values and unit mass scales.
    #[must_use]
    pub fn new(combined_friction: f64, combined_restitution: f64, is_sensor: bool) -> Self {
        Self {
            combined_friction,
            combined_restitution,
            inverse_mass_scale1: 1.0,
            inverse_inertia_scale1: 1.0,
            inverse_mass_scale2: 1.0,
            inverse_inertia_scale2: 1.0,
            is_sensor,
            relative_linear_surface_velocity: Vector3::zeros(),
            relative_angular_surface_velocity: Vector3::zeros(),
        }
    }

    /// True when the scaled inverse masses of both sides are zero, so no
    /// impulse can ever be applied.
    #[must_use]
    pub fn is_immovable_pair(&self, body1: &Body, body2: &Body) -> bool {
        body1.inverse_mass() * self.inverse_mass_scale1 == 0.0
            && body2.inverse_mass() * self.inverse_mass_scale2 == 0.0
    }
}

impl Default for ContactSettings {
    fn default() -> Self {
        Self::new(0.0, 0.0, false)
    }
}

/// Combines a material value of two bodies.
pub type CombineFunction = fn(&Body, SubShapeId, &Body, SubShapeId) -> f64;

/// Geometric mean of the friction values.
#[must_use]
pub fn combine_friction(body1: &Body, _: SubShapeId, body2: &Body, _: SubShapeId) -> f64 {
    (body1.friction() * body2.friction()).sqrt()
}

/// The larger of the restitution values.
#[must_use]
pub fn combine_restitution(body1: &Body, _: SubShapeId, body2: &Body, _: SubShapeId) -> f64 {
    body1.restitution().max(body2.restitution())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use sim_types::{BodyCreationSettings, BodyManager, MotionType};

    #[test]
    fn test_body_pair_key_is_canonical() {
        let a = BodyId::new(3, 0);
        let b = BodyId::new(7, 1);
        assert_eq!(BodyPairKey::new(a, b), BodyPairKey::new(b, a));
        assert_eq!(BodyPairKey::new(b, a).body1, a);
    }

    #[test]
    fn test_single_point_penetration() {
        let m = ContactManifold::single_point(
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(0.0, 0.0, 0.8),
            Vector3::z(),
        );
        assert_eq!(m.num_points(), 1);
        assert_relative_eq!(m.penetration_depth, 0.2, epsilon = 1e-12);
        assert_relative_eq!(m.world_point_on2(0).z, 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_swap_shapes() {
        let point = Point3::new(1.0, 0.0, 0.0);
        let mut m = ContactManifold::single_point(Point3::origin(), point, Vector3::x());
        m.sub_shape1 = SubShapeId(4);
        let swapped = m.swap_shapes();
        assert_eq!(swapped.world_space_normal, -Vector3::x());
        assert_eq!(swapped.sub_shape2, SubShapeId(4));
        assert_eq!(swapped.world_point_on1(0), m.world_point_on2(0));
        assert_eq!(swapped.penetration_depth, m.penetration_depth);
    }

    #[test]
    fn test_combine_functions() {
        let mut bodies = BodyManager::new(2);
        let a = bodies
            .create_body(
                &BodyCreationSettings::sphere(Point3::origin(), 0.5, MotionType::Dynamic)
                    .with_friction(0.25)
                    .with_restitution(0.1),
            )
            .unwrap();
        let b = bodies
            .create_body(
                &BodyCreationSettings::sphere(Point3::origin(), 0.5, MotionType::Static)
                    .with_friction(1.0)
                    .with_restitution(0.6),
            )
            .unwrap();
        let (a, b) = bodies.lock_pair(a, b).unwrap();
        assert_relative_eq!(combine_friction(&a, SubShapeId::EMPTY, &b, SubShapeId::EMPTY), 0.5);
        assert_eq!(combine_restitution(&a, SubShapeId::EMPTY, &b, SubShapeId::EMPTY), 0.6);

        let settings = ContactSettings::default();
        assert!(!settings.is_immovable_pair(&a, &b));
        assert!(settings.is_immovable_pair(&b, &b));
    }

    proptest! {
        /// Manifolds of the same body pair sort next to each other, in body
        /// pair order.
        #[test]
        fn sort_key_groups_body_pairs(
            a in (0_u32..64, 0_u32..64, 0_u32..4, 0_u32..4),
            b in (0_u32..64, 0_u32..64, 0_u32..4, 0_u32..4),
        ) {
            let key = |(i, j, s1, s2): (u32, u32, u32, u32)| {
                let pair = BodyPairKey::new(BodyId::new(i, 0), BodyId::new(j, 0));
                SubShapeIdPair::new(pair.body1, SubShapeId(s1), pair.body2, SubShapeId(s2))
            };
            let (ka, kb) = (key(a), key(b));
            if ka.body_pair() < kb.body_pair() {
                prop_assert!(ka < kb);
            } else if ka.body_pair() == kb.body_pair() {
                let shapes = (ka.sub_shape1, ka.sub_shape2).cmp(&(kb.sub_shape1, kb.sub_shape2));
                prop_assert_eq!(ka.cmp(&kb), shapes);
            }
        }
    }
}
