//! Per-step contact constraints.
//!
//! Each contact point carries three [`AxisConstraintPart`]s: one along the
//! contact normal that prevents penetration and two along the tangents for
//! friction. Friction is solved first each iteration, bounded by the normal
//! impulse of the previous iteration:
//!
//! ```text
//! |λ_t| ≤ μ λ_n
//! ```

use nalgebra::{Point3, Vector3};
use sim_constraint::{AxisConstraintPart, SolverMass};
use sim_types::{Body, BodyId, PhysicsSettings};
use smallvec::SmallVec;

use crate::{CachedContactPoint, ContactSettings, MAX_CONTACT_POINTS, SubShapeIdPair};

/// A unit vector perpendicular to `normal`.
#[must_use]
pub fn normalized_perpendicular(normal: &Vector3<f64>) -> Vector3<f64> {
    if normal.x.abs() > normal.y.abs() {
        let len = (normal.x * normal.x + normal.z * normal.z).sqrt();
        Vector3::new(normal.z, 0.0, -normal.x) / len
    } else {
        let len = (normal.y * normal.y + normal.z * normal.z).sqrt();
        Vector3::new(0.0, normal.z, -normal.y) / len
    }
}

/// One contact point of a [`ContactConstraint`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldContactPoint {
    /// Keeps the bodies from moving into each other.
    pub non_penetration: AxisConstraintPart,
    /// Friction along the first tangent.
    pub friction1: AxisConstraintPart,
    /// Friction along the second tangent.
    pub friction2: AxisConstraintPart,
    position1: Vector3<f64>,
    position2: Vector3<f64>,
}

impl WorldContactPoint {
    fn new(cached: &CachedContactPoint) -> Self {
        Self {
            non_penetration: AxisConstraintPart::default(),
            friction1: AxisConstraintPart::default(),
            friction2: AxisConstraintPart::default(),
            position1: cached.position1,
            position2: cached.position2,
        }
    }

    /// Current world-space positions of the point on both bodies.
    #[must_use]
    pub fn world_positions(&self, body1: &Body, body2: &Body) -> (Point3<f64>, Point3<f64>) {
        (
            body1.position() + body1.rotation() * self.position1,
            body2.position() + body2.rotation() * self.position2,
        )
    }

    /// Lever arms from both centers of mass to the midpoint of the contact.
    fn lever_arms(
        body1: &Body,
        p1: &Point3<f64>,
        body2: &Body,
        p2: &Point3<f64>,
    ) -> (Vector3<f64>, Vector3<f64>) {
        let p = Point3::from((p1.coords + p2.coords) * 0.5);
        (p - body1.position(), p - body2.position())
    }

    fn calculate_non_penetration_properties(
        &mut self,
        body1: &Body,
        mass1: &SolverMass,
        body2: &Body,
        mass2: &SolverMass,
        normal: &Vector3<f64>,
    ) {
        let (p1, p2) = self.world_positions(body1, body2);
        let (r1, r2) = Self::lever_arms(body1, &p1, body2, &p2);
        self.non_penetration
            .calculate_constraint_properties(mass1, &r1, mass2, &r2, normal, 0.0);
    }

    #[allow(clippy::too_many_arguments)]
    fn calculate_properties(
        &mut self,
        dt: f64,
        body1: &Body,
        mass1: &SolverMass,
        body2: &Body,
        mass2: &SolverMass,
        axes: &[Vector3<f64>; 3],
        settings: &ContactSettings,
        min_velocity_for_restitution: f64,
    ) {
        let [normal, tangent1, tangent2] = axes;
        let (p1, p2) = self.world_positions(body1, body2);
        let (r1, r2) = Self::lever_arms(body1, &p1, body2, &p2);

        let relative_velocity = body2.point_velocity(&p2) - body1.point_velocity(&p1);
        let normal_velocity = relative_velocity.dot(normal);

        // > 0 when penetrating. Apart bodies may approach by the gap this step.
        let penetration = (p1 - p2).dot(normal);
        let speculative_bias = (-penetration / dt).max(0.0);

        let normal_bias = if settings.combined_restitution > 0.0
            && normal_velocity < -min_velocity_for_restitution
            && normal_velocity < -speculative_bias
        {
            settings.combined_restitution * normal_velocity
        } else {
            speculative_bias
        };
        self.non_penetration
            .calculate_constraint_properties(mass1, &r1, mass2, &r2, normal, normal_bias);

        if settings.combined_friction > 0.0 {
            let surface_velocity = settings.relative_linear_surface_velocity
                + settings.relative_angular_surface_velocity.cross(&r1);
            self.friction1.calculate_constraint_properties(
                mass1,
                &r1,
                mass2,
                &r2,
                tangent1,
                tangent1.dot(&surface_velocity),
            );
            self.friction2.calculate_constraint_properties(
                mass1,
                &r1,
                mass2,
                &r2,
                tangent2,
                tangent2.dot(&surface_velocity),
            );
        } else {
            self.friction1.deactivate();
            self.friction2.deactivate();
        }
    }
}

/// Contact constraint of one manifold, rebuilt every step.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactConstraint {
    body1: BodyId,
    body2: BodyId,
    sort_key: SubShapeIdPair,
    manifold: u32,
    normal: Vector3<f64>,
    tangent1: Vector3<f64>,
    tangent2: Vector3<f64>,
    combined_friction: f64,
    mass1: SolverMass,
    mass2: SolverMass,
    inverse_mass_scale1: f64,
    inverse_inertia_scale1: f64,
    inverse_mass_scale2: f64,
    inverse_inertia_scale2: f64,
    points: SmallVec<[WorldContactPoint; MAX_CONTACT_POINTS]>,
}

impl ContactConstraint {
    /// Constraint without points for the manifold `manifold` (index into the
    /// write-side cache) of `sort_key`.
    pub(crate) fn new(
        body1: &Body,
        body2: &Body,
        sort_key: SubShapeIdPair,
        manifold: u32,
        normal: Vector3<f64>,
        settings: &ContactSettings,
    ) -> Self {
        let tangent1 = normalized_perpendicular(&normal);
        let tangent2 = normal.cross(&tangent1);
        Self {
            body1: body1.id(),
            body2: body2.id(),
            sort_key,
            manifold,
            normal,
            tangent1,
            tangent2,
            combined_friction: settings.combined_friction,
            mass1: SolverMass::scaled(
                body1,
                settings.inverse_mass_scale1,
                settings.inverse_inertia_scale1,
            ),
            mass2: SolverMass::scaled(
                body2,
                settings.inverse_mass_scale2,
                settings.inverse_inertia_scale2,
            ),
            inverse_mass_scale1: settings.inverse_mass_scale1,
            inverse_inertia_scale1: settings.inverse_inertia_scale1,
            inverse_mass_scale2: settings.inverse_mass_scale2,
            inverse_inertia_scale2: settings.inverse_inertia_scale2,
            points: SmallVec::new(),
        }
    }

    /// Add a point, seeding its impulses from `cached` when warm starting.
    pub(crate) fn add_point(
        &mut self,
        dt: f64,
        body1: &Body,
        body2: &Body,
        cached: &CachedContactPoint,
        settings: &ContactSettings,
        physics: &PhysicsSettings,
    ) {
        let mut point = WorldContactPoint::new(cached);
        let axes = [self.normal, self.tangent1, self.tangent2];
        point.calculate_properties(
            dt,
            body1,
            &self.mass1,
            body2,
            &self.mass2,
            &axes,
            settings,
            physics.min_velocity_for_restitution,
        );
        if physics.use_constraint_warm_start {
            if point.non_penetration.is_active() {
                point
                    .non_penetration
                    .set_total_lambda(cached.non_penetration_lambda);
            }
            if point.friction1.is_active() {
                point.friction1.set_total_lambda(cached.friction_lambda[0]);
                point.friction2.set_total_lambda(cached.friction_lambda[1]);
            }
        }
        self.points.push(point);
    }

    /// The two bodies, lower id first.
    #[must_use]
    pub fn body_ids(&self) -> (BodyId, BodyId) {
        (self.body1, self.body2)
    }

    /// Deterministic ordering key.
    #[must_use]
    pub fn sort_key(&self) -> &SubShapeIdPair {
        &self.sort_key
    }

    /// Index of the manifold in the write-side cache.
    #[must_use]
    pub fn manifold_index(&self) -> u32 {
        self.manifold
    }

    /// World-space normal from body 1 to body 2.
    #[must_use]
    pub fn normal(&self) -> &Vector3<f64> {
        &self.normal
    }

    /// Friction coefficient.
    #[must_use]
    pub fn combined_friction(&self) -> f64 {
        self.combined_friction
    }

    /// Contact points.
    #[must_use]
    pub fn points(&self) -> &[WorldContactPoint] {
        &self.points
    }

    /// Apply the scaled impulses of the previous step.
    pub fn warm_start(&mut self, body1: &mut Body, body2: &mut Body, ratio: f64) {
        for point in &mut self.points {
            // Friction first, matching the velocity iterations.
            if point.friction1.is_active() {
                point.friction1.warm_start(
                    body1,
                    &self.mass1,
                    body2,
                    &self.mass2,
                    &self.tangent1,
                    ratio,
                );
                point.friction2.warm_start(
                    body1,
                    &self.mass1,
                    body2,
                    &self.mass2,
                    &self.tangent2,
                    ratio,
                );
            }
            point.non_penetration.warm_start(
                body1,
                &self.mass1,
                body2,
                &self.mass2,
                &self.normal,
                ratio,
            );
        }
    }

    /// One velocity iteration. Returns true if any impulse was applied.
    pub fn solve_velocity(&mut self, body1: &mut Body, body2: &mut Body) -> bool {
        let mut any_impulse = false;

        for point in &mut self.points {
            if point.friction1.is_active() {
                // Bounded by last iteration's normal impulse.
                let max_lambda = self.combined_friction * point.non_penetration.total_lambda();

                let mut lambda1 = point
                    .friction1
                    .total_lambda_candidate(body1, body2, &self.tangent1);
                let mut lambda2 = point
                    .friction2
                    .total_lambda_candidate(body1, body2, &self.tangent2);

                // Project onto the friction circle.
                let length_sq = lambda1 * lambda1 + lambda2 * lambda2;
                if length_sq > max_lambda * max_lambda {
                    let scale = max_lambda / length_sq.sqrt();
                    lambda1 *= scale;
                    lambda2 *= scale;
                }

                any_impulse |= point.friction1.apply_total_lambda(
                    body1,
                    &self.mass1,
                    body2,
                    &self.mass2,
                    &self.tangent1,
                    lambda1,
                );
                any_impulse |= point.friction2.apply_total_lambda(
                    body1,
                    &self.mass1,
                    body2,
                    &self.mass2,
                    &self.tangent2,
                    lambda2,
                );
            }

            if point.non_penetration.is_active() {
                any_impulse |= point.non_penetration.solve_velocity_constraint(
                    body1,
                    &self.mass1,
                    body2,
                    &self.mass2,
                    &self.normal,
                    0.0,
                    f64::INFINITY,
                );
            }
        }

        any_impulse
    }

    /// One position iteration using the bodies' current transforms. Returns
    /// true if a body was moved.
    pub fn solve_position(
        &mut self,
        body1: &mut Body,
        body2: &mut Body,
        physics: &PhysicsSettings,
    ) -> bool {
        let mut any_impulse = false;

        for point in &mut self.points {
            let (p1, p2) = point.world_positions(body1, body2);
            let separation = (p2 - p1).dot(&self.normal) + physics.penetration_slop;
            if separation >= 0.0 {
                continue;
            }
            let separation = separation.max(-physics.max_penetration_distance);

            // Bodies moved since setup, so the inertia is recomputed.
            let mass1 = SolverMass::scaled(
                body1,
                self.inverse_mass_scale1,
                self.inverse_inertia_scale1,
            );
            let mass2 = SolverMass::scaled(
                body2,
                self.inverse_mass_scale2,
                self.inverse_inertia_scale2,
            );
            point.calculate_non_penetration_properties(body1, &mass1, body2, &mass2, &self.normal);
            any_impulse |= point.non_penetration.solve_position_constraint(
                body1,
                &mass1,
                body2,
                &mass2,
                &self.normal,
                separation,
                physics.baumgarte,
            );
        }

        any_impulse
    }

    /// Copy the accumulated impulses into cached points (same order as
    /// [`ContactConstraint::points`]).
    pub fn store_applied_impulses(&self, cached: &mut [CachedContactPoint]) {
        for (point, cached) in self.points.iter().zip(cached) {
            cached.non_penetration_lambda = point.non_penetration.total_lambda();
            cached.friction_lambda = [
                point.friction1.total_lambda(),
                point.friction2.total_lambda(),
            ];
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::SubShapeId;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use sim_types::{BodyCreationSettings, BodyManager, MotionType};

    const DT: f64 = 1.0 / 60.0;

    /// Spheres at x = 0 and x = 2 touching at `contact_x1` / `contact_x2`.
    fn setup(
        v1: f64,
        second: MotionType,
        friction: f64,
        restitution: f64,
        contact_x1: f64,
        contact_x2: f64,
    ) -> (BodyManager, BodyId, BodyId, ContactConstraint) {
        let mut bodies = BodyManager::new(2);
        let a = bodies
            .create_body(
                &BodyCreationSettings::sphere(Point3::origin(), 1.1, MotionType::Dynamic)
                    .with_linear_velocity(Vector3::new(v1, 0.0, 0.0))
                    .with_friction(friction)
                    .with_restitution(restitution),
            )
            .unwrap();
        let b = bodies
            .create_body(
                &BodyCreationSettings::sphere(Point3::new(2.0, 0.0, 0.0), 1.1, second)
                    .with_friction(friction)
                    .with_restitution(restitution),
            )
            .unwrap();

        let constraint = {
            let (body1, body2) = bodies.lock_pair(a, b).unwrap();
            let settings = ContactSettings::new(friction, restitution, false);
            let key = SubShapeIdPair::new(a, SubShapeId::EMPTY, b, SubShapeId::EMPTY);
            let mut constraint =
                ContactConstraint::new(&body1, &body2, key, 0, Vector3::x(), &settings);
            let identity = UnitQuaternion::identity();
            let cached = CachedContactPoint::from_world(
                &Point3::new(contact_x1, 0.0, 0.0),
                &body1.position(),
                &identity,
                &Point3::new(contact_x2, 0.0, 0.0),
                &body2.position(),
                &identity,
            );
            let physics = PhysicsSettings::default();
            constraint.add_point(DT, &body1, &body2, &cached, &settings, &physics);
            constraint
        };
        (bodies, a, b, constraint)
    }

    #[test]
    fn test_perpendicular_is_orthonormal() {
        for n in [Vector3::x(), Vector3::y(), Vector3::new(1.0, 2.0, 3.0).normalize()] {
            let t = normalized_perpendicular(&n);
            assert_relative_eq!(t.norm(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(t.dot(&n), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_resting_penetration_needs_no_velocity_impulse() {
        // Radius 1.1 at distance 2: 0.2 penetration, no relative velocity.
        let (bodies, a, b, mut constraint) = setup(0.0, MotionType::Dynamic, 0.0, 0.0, 1.1, 0.9);
        let (mut body1, mut body2) = bodies.lock_pair(a, b).unwrap();

        assert!(!constraint.solve_velocity(&mut body1, &mut body2));
        let point = &constraint.points()[0];
        assert_eq!(point.non_penetration.total_lambda(), 0.0);
        assert_eq!(point.friction1.total_lambda(), 0.0);
        assert!(!point.friction1.is_active());
        let closing = (body1.linear_velocity() - body2.linear_velocity()).dot(&Vector3::x());
        assert!(closing <= point.non_penetration.bias() + 1e-12);
    }

    #[test]
    fn test_resting_penetration_is_pushed_apart() {
        let (bodies, a, b, mut constraint) = setup(0.0, MotionType::Dynamic, 0.0, 0.0, 1.1, 0.9);
        let (mut body1, mut body2) = bodies.lock_pair(a, b).unwrap();
        let physics = PhysicsSettings::default();

        assert!(constraint.solve_position(&mut body1, &mut body2, &physics));
        // separation = -0.2 + slop 0.02; λ = -0.5 * 0.2 * -0.18
        assert_relative_eq!(body1.position().x, -0.018, epsilon = 1e-12);
        assert_relative_eq!(body2.position().x, 2.018, epsilon = 1e-12);
    }

    #[test]
    fn test_approaching_bodies_share_momentum() {
        let (bodies, a, b, mut constraint) = setup(1.0, MotionType::Dynamic, 0.0, 0.0, 1.0, 1.0);
        let (mut body1, mut body2) = bodies.lock_pair(a, b).unwrap();

        assert!(constraint.solve_velocity(&mut body1, &mut body2));
        assert_relative_eq!(body1.linear_velocity().x, 0.5, epsilon = 1e-12);
        assert_relative_eq!(body2.linear_velocity().x, 0.5, epsilon = 1e-12);
        let lambda = constraint.points()[0].non_penetration.total_lambda();
        assert_relative_eq!(lambda, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_restitution_above_threshold_bounces() {
        let (bodies, a, b, mut constraint) = setup(2.0, MotionType::Dynamic, 0.0, 1.0, 1.0, 1.0);
        let (mut body1, mut body2) = bodies.lock_pair(a, b).unwrap();

        constraint.solve_velocity(&mut body1, &mut body2);
        assert_relative_eq!(body1.linear_velocity().x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(body2.linear_velocity().x, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_restitution_below_threshold_is_ignored() {
        let (bodies, a, b, mut constraint) = setup(0.5, MotionType::Dynamic, 0.0, 1.0, 1.0, 1.0);
        let (mut body1, mut body2) = bodies.lock_pair(a, b).unwrap();

        constraint.solve_velocity(&mut body1, &mut body2);
        assert_relative_eq!(body1.linear_velocity().x, 0.25, epsilon = 1e-12);
        assert_relative_eq!(body2.linear_velocity().x, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_speculative_contact_allows_closing_the_gap() {
        // 0.01 gap: the bodies may approach at 0.6 / s this step.
        let (bodies, a, b, mut constraint) =
            setup(1.0, MotionType::Static, 0.0, 0.0, 0.995, 1.005);
        let (mut body1, mut body2) = bodies.lock_pair(a, b).unwrap();

        constraint.solve_velocity(&mut body1, &mut body2);
        assert_relative_eq!(body1.linear_velocity().x, 0.01 / DT, epsilon = 1e-9);
        assert_eq!(body2.linear_velocity(), Vector3::zeros());
    }

    #[test]
    fn test_friction_is_bounded_by_normal_impulse() {
        let (bodies, a, b, mut constraint) = setup(1.0, MotionType::Static, 0.5, 0.0, 1.0, 1.0);
        let (mut body1, mut body2) = bodies.lock_pair(a, b).unwrap();
        body1.set_linear_velocity(Vector3::new(1.0, 0.0, 3.0));

        // First iteration: no normal impulse yet, so no friction.
        constraint.solve_velocity(&mut body1, &mut body2);
        assert_relative_eq!(body1.linear_velocity().z, 3.0, epsilon = 1e-12);
        assert_relative_eq!(body1.linear_velocity().x, 0.0, epsilon = 1e-12);

        // Second iteration: friction limited to 0.5 * 1.0.
        constraint.solve_velocity(&mut body1, &mut body2);
        let point = &constraint.points()[0];
        let friction = point.friction1.total_lambda().hypot(point.friction2.total_lambda());
        assert_relative_eq!(friction, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_warm_start_ratio() {
        let (bodies, a, b, mut constraint) = setup(0.0, MotionType::Dynamic, 0.0, 0.0, 1.0, 1.0);
        constraint.points[0].non_penetration.set_total_lambda(0.4);
        let (mut body1, mut body2) = bodies.lock_pair(a, b).unwrap();

        constraint.warm_start(&mut body1, &mut body2, 0.0);
        assert_eq!(constraint.points()[0].non_penetration.total_lambda(), 0.0);
        assert_eq!(body1.linear_velocity(), Vector3::zeros());

        constraint.points[0].non_penetration.set_total_lambda(0.4);
        constraint.warm_start(&mut body1, &mut body2, 1.0);
        assert_relative_eq!(body1.linear_velocity().x, -0.4, epsilon = 1e-12);
        assert_relative_eq!(body2.linear_velocity().x, 0.4, epsilon = 1e-12);
    }
}
