//! Narrow-phase seam.
//!
//! The step pipeline does not know about shapes. Everything shape specific
//! happens behind [`NarrowPhase`], which turns a body pair found by the broad
//! phase into contact manifolds.

use nalgebra::Vector3;
use sim_contact::ContactManifold;
use sim_types::Body;

/// Generates contact manifolds for a body pair.
///
/// Called from worker threads with both bodies locked. Manifold normals point
/// from `body1` to `body2`.
pub trait NarrowPhase: Sync {
    /// Contacts between `body1` and `body2`, including speculative contacts
    /// for shapes less than `max_separation` apart.
    fn collide(&self, body1: &Body, body2: &Body, max_separation: f64) -> Vec<ContactManifold>;
}

/// Treats every body as a sphere whose radius is the largest half extent of
/// its local bounds. Exact for bodies created with
/// [`sim_types::BodyCreationSettings::sphere`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundingSphereNarrowPhase;

impl BoundingSphereNarrowPhase {
    fn radius(body: &Body) -> f64 {
        body.local_bounds().half_extents().max()
    }
}

impl NarrowPhase for BoundingSphereNarrowPhase {
    fn collide(&self, body1: &Body, body2: &Body, max_separation: f64) -> Vec<ContactManifold> {
        let (r1, r2) = (Self::radius(body1), Self::radius(body2));
        let delta = body2.position() - body1.position();
        let distance = delta.norm();
        if distance > r1 + r2 + max_separation {
            return Vec::new();
        }

        // Concentric spheres have no preferred direction.
        let normal = if distance > 1.0e-12 {
            delta / distance
        } else {
            Vector3::z()
        };
        let point_on1 = body1.position() + normal * r1;
        let point_on2 = body2.position() - normal * r2;
        vec![ContactManifold::single_point(point_on1, point_on2, normal)]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;
    use sim_types::{BodyCreationSettings, BodyManager, MotionType};

    fn collide(x2: f64, max_separation: f64) -> Vec<ContactManifold> {
        let mut bodies = BodyManager::new(2);
        let a = bodies
            .create_body(&BodyCreationSettings::sphere(Point3::origin(), 1.0, MotionType::Dynamic))
            .unwrap();
        let b = bodies
            .create_body(&BodyCreationSettings::sphere(
                Point3::new(x2, 0.0, 0.0),
                0.5,
                MotionType::Static,
            ))
            .unwrap();
        let (body1, body2) = bodies.lock_pair(a, b).unwrap();
        BoundingSphereNarrowPhase.collide(&body1, &body2, max_separation)
    }

    #[test]
    fn test_penetrating_spheres() {
        let manifolds = collide(1.3, 0.0);
        assert_eq!(manifolds.len(), 1);
        let manifold = &manifolds[0];
        assert_relative_eq!(manifold.penetration_depth, 0.2, epsilon = 1e-12);
        assert_relative_eq!(manifold.world_space_normal, Vector3::x());
        assert_relative_eq!(manifold.world_point_on1(0), Point3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(
            manifold.world_point_on2(0),
            Point3::new(0.8, 0.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_speculative_contact_within_distance() {
        assert!(collide(1.6, 0.05).is_empty());
        let manifolds = collide(1.6, 0.2);
        assert_eq!(manifolds.len(), 1);
        assert_relative_eq!(manifolds[0].penetration_depth, -0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_concentric_spheres_use_up_axis() {
        let manifolds = collide(0.0, 0.0);
        assert_eq!(manifolds[0].world_space_normal, Vector3::z());
        assert_relative_eq!(manifolds[0].penetration_depth, 1.5);
    }
}
