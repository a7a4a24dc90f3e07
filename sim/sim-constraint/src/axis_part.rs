//! Single-axis velocity constraint between two bodies.
//!
//! The building block for contact normals, friction directions and distance
//! constraints. The constraint removes relative velocity along a world-space
//! axis:
//!
//! ```text
//! J = [-axis, -(r1 + u) × axis, axis, r2 × axis]
//! λ = K⁻¹ (-J v - b),   K = J M⁻¹ Jᵀ
//! ```
//!
//! Work is dispatched on the [`MotionType`] of each body: static bodies
//! contribute nothing, kinematic bodies contribute velocity but no mass, and
//! only dynamic bodies receive impulses.

use nalgebra::{Matrix3, Vector3};
use sim_types::{Body, MotionType};

/// Inverse mass data of one side of a constraint, possibly scaled by a
/// contact listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverMass {
    /// Motion type of the body.
    pub motion_type: MotionType,
    /// Inverse mass (zero unless dynamic).
    pub inverse_mass: f64,
    /// World-space inverse inertia (zero unless dynamic).
    pub inverse_inertia: Matrix3<f64>,
}

impl SolverMass {
    /// Unscaled inverse mass of `body`.
    #[must_use]
    pub fn of(body: &Body) -> Self {
        Self::scaled(body, 1.0, 1.0)
    }

    /// Inverse mass of `body` multiplied by the given scales.
    #[must_use]
    pub fn scaled(body: &Body, inverse_mass_scale: f64, inverse_inertia_scale: f64) -> Self {
        if body.is_dynamic() {
            Self {
                motion_type: MotionType::Dynamic,
                inverse_mass: body.inverse_mass() * inverse_mass_scale,
                inverse_inertia: body.inverse_inertia() * inverse_inertia_scale,
            }
        } else {
            Self {
                motion_type: body.motion_type(),
                inverse_mass: 0.0,
                inverse_inertia: Matrix3::zeros(),
            }
        }
    }
}

/// Accumulated-impulse constraint along one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisConstraintPart {
    r1_plus_u_x_axis: Vector3<f64>,
    r2_x_axis: Vector3<f64>,
    inv_i1_r1_plus_u_x_axis: Vector3<f64>,
    inv_i2_r2_x_axis: Vector3<f64>,
    effective_mass: f64,
    bias: f64,
    total_lambda: f64,
}

impl Default for AxisConstraintPart {
    fn default() -> Self {
        Self {
            r1_plus_u_x_axis: Vector3::zeros(),
            r2_x_axis: Vector3::zeros(),
            inv_i1_r1_plus_u_x_axis: Vector3::zeros(),
            inv_i2_r2_x_axis: Vector3::zeros(),
            effective_mass: 0.0,
            bias: 0.0,
            total_lambda: 0.0,
        }
    }
}

impl AxisConstraintPart {
    /// Compute the effective mass for `axis` with lever arms `r1_plus_u`
    /// (from body 1's center of mass) and `r2` (from body 2's).
    ///
    /// `bias` is the target relative velocity along the axis, see the module
    /// docs. Deactivates the part when neither body can receive an impulse.
    pub fn calculate_constraint_properties(
        &mut self,
        mass1: &SolverMass,
        r1_plus_u: &Vector3<f64>,
        mass2: &SolverMass,
        r2: &Vector3<f64>,
        axis: &Vector3<f64>,
        bias: f64,
    ) {
        debug_assert!((axis.norm_squared() - 1.0).abs() < 1.0e-5, "axis must be normalized");

        let mut inv_effective_mass = 0.0;

        match mass1.motion_type {
            MotionType::Static => {
                self.r1_plus_u_x_axis = Vector3::zeros();
                self.inv_i1_r1_plus_u_x_axis = Vector3::zeros();
            }
            MotionType::Kinematic => {
                self.r1_plus_u_x_axis = r1_plus_u.cross(axis);
                self.inv_i1_r1_plus_u_x_axis = Vector3::zeros();
            }
            MotionType::Dynamic => {
                self.r1_plus_u_x_axis = r1_plus_u.cross(axis);
                self.inv_i1_r1_plus_u_x_axis = mass1.inverse_inertia * self.r1_plus_u_x_axis;
                inv_effective_mass += mass1.inverse_mass
                    + self.inv_i1_r1_plus_u_x_axis.dot(&self.r1_plus_u_x_axis);
            }
        }

        match mass2.motion_type {
            MotionType::Static => {
                self.r2_x_axis = Vector3::zeros();
                self.inv_i2_r2_x_axis = Vector3::zeros();
            }
            MotionType::Kinematic => {
                self.r2_x_axis = r2.cross(axis);
                self.inv_i2_r2_x_axis = Vector3::zeros();
            }
            MotionType::Dynamic => {
                self.r2_x_axis = r2.cross(axis);
                self.inv_i2_r2_x_axis = mass2.inverse_inertia * self.r2_x_axis;
                inv_effective_mass +=
                    mass2.inverse_mass + self.inv_i2_r2_x_axis.dot(&self.r2_x_axis);
            }
        }

        if inv_effective_mass == 0.0 {
            self.deactivate();
        } else {
            self.effective_mass = 1.0 / inv_effective_mass;
            self.bias = bias;
        }
    }

    /// Disable the part and clear its impulse.
    pub fn deactivate(&mut self) {
        self.effective_mass = 0.0;
        self.total_lambda = 0.0;
    }

    /// True when the part can apply impulses.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.effective_mass != 0.0
    }

    /// Accumulated impulse.
    #[must_use]
    pub fn total_lambda(&self) -> f64 {
        self.total_lambda
    }

    /// Seed the accumulated impulse (from a cache).
    pub fn set_total_lambda(&mut self, lambda: f64) {
        self.total_lambda = lambda;
    }

    /// Effective mass `K⁻¹`.
    #[must_use]
    pub fn effective_mass(&self) -> f64 {
        self.effective_mass
    }

    /// Velocity bias.
    #[must_use]
    pub fn bias(&self) -> f64 {
        self.bias
    }

    /// Scale last frame's impulse by `ratio` and apply it.
    pub fn warm_start(
        &mut self,
        body1: &mut Body,
        mass1: &SolverMass,
        body2: &mut Body,
        mass2: &SolverMass,
        axis: &Vector3<f64>,
        ratio: f64,
    ) {
        self.total_lambda *= ratio;
        self.apply_velocity_step(body1, mass1, body2, mass2, axis, self.total_lambda);
    }

    /// Unclamped total impulse this iteration would reach.
    #[must_use]
    pub fn total_lambda_candidate(&self, body1: &Body, body2: &Body, axis: &Vector3<f64>) -> f64 {
        let m1 = body1.motion_type();
        let m2 = body2.motion_type();
        debug_assert!(
            m1 == MotionType::Dynamic || m2 == MotionType::Dynamic,
            "constraint needs at least one dynamic body"
        );

        let mut jv = match (m1, m2) {
            (MotionType::Static, MotionType::Static) => 0.0,
            (MotionType::Static, _) => axis.dot(&-body2.linear_velocity()),
            (_, MotionType::Static) => axis.dot(&body1.linear_velocity()),
            _ => axis.dot(&(body1.linear_velocity() - body2.linear_velocity())),
        };
        if m1 != MotionType::Static {
            jv += self.r1_plus_u_x_axis.dot(&body1.angular_velocity());
        }
        if m2 != MotionType::Static {
            jv -= self.r2_x_axis.dot(&body2.angular_velocity());
        }

        self.total_lambda + self.effective_mass * (jv - self.bias)
    }

    /// Replace the accumulated impulse by `total_lambda` and apply the change.
    pub fn apply_total_lambda(
        &mut self,
        body1: &mut Body,
        mass1: &SolverMass,
        body2: &mut Body,
        mass2: &SolverMass,
        axis: &Vector3<f64>,
        total_lambda: f64,
    ) -> bool {
        let delta_lambda = total_lambda - self.total_lambda;
        self.total_lambda = total_lambda;
        self.apply_velocity_step(body1, mass1, body2, mass2, axis, delta_lambda)
    }

    /// One Gauss-Seidel iteration with the accumulated impulse clamped to
    /// `[min_lambda, max_lambda]`. Returns true if an impulse was applied.
    #[allow(clippy::too_many_arguments)]
    pub fn solve_velocity_constraint(
        &mut self,
        body1: &mut Body,
        mass1: &SolverMass,
        body2: &mut Body,
        mass2: &SolverMass,
        axis: &Vector3<f64>,
        min_lambda: f64,
        max_lambda: f64,
    ) -> bool {
        let total_lambda = self
            .total_lambda_candidate(body1, body2, axis)
            .clamp(min_lambda, max_lambda);
        self.apply_total_lambda(body1, mass1, body2, mass2, axis, total_lambda)
    }

    /// Baumgarte position correction for a hard constraint with error `c`.
    ///
    /// Moves the bodies directly instead of adding momentum.
    #[allow(clippy::too_many_arguments)]
    pub fn solve_position_constraint(
        &self,
        body1: &mut Body,
        mass1: &SolverMass,
        body2: &mut Body,
        mass2: &SolverMass,
        axis: &Vector3<f64>,
        c: f64,
        baumgarte: f64,
    ) -> bool {
        if c == 0.0 || !self.is_active() {
            return false;
        }

        // λ = -K⁻¹ β C; the 1/dt of the bias cancels the dt of the Euler step.
        let lambda = -self.effective_mass * baumgarte * c;

        if mass1.motion_type == MotionType::Dynamic {
            body1.sub_position_step(&(axis * (lambda * mass1.inverse_mass)));
            body1.sub_rotation_step(&(self.inv_i1_r1_plus_u_x_axis * lambda));
        }
        if mass2.motion_type == MotionType::Dynamic {
            body2.add_position_step(&(axis * (lambda * mass2.inverse_mass)));
            body2.add_rotation_step(&(self.inv_i2_r2_x_axis * lambda));
        }
        true
    }

    fn apply_velocity_step(
        &self,
        body1: &mut Body,
        mass1: &SolverMass,
        body2: &mut Body,
        mass2: &SolverMass,
        axis: &Vector3<f64>,
        lambda: f64,
    ) -> bool {
        if lambda == 0.0 {
            return false;
        }

        if mass1.motion_type == MotionType::Dynamic {
            let motion = body1.motion_mut();
            motion.linear_velocity -= axis * (lambda * mass1.inverse_mass);
            motion.angular_velocity -= self.inv_i1_r1_plus_u_x_axis * lambda;
        }
        if mass2.motion_type == MotionType::Dynamic {
            let motion = body2.motion_mut();
            motion.linear_velocity += axis * (lambda * mass2.inverse_mass);
            motion.angular_velocity += self.inv_i2_r2_x_axis * lambda;
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;
    use sim_types::{BodyCreationSettings, BodyManager};

    fn two_bodies(
        v1: Vector3<f64>,
        second: MotionType,
    ) -> (BodyManager, sim_types::BodyId, sim_types::BodyId) {
        let mut bodies = BodyManager::new(2);
        let a = bodies
            .create_body(
                &BodyCreationSettings::sphere(Point3::origin(), 0.5, MotionType::Dynamic)
                    .with_linear_velocity(v1),
            )
            .unwrap();
        let b = bodies
            .create_body(&BodyCreationSettings::sphere(
                Point3::new(1.0, 0.0, 0.0),
                0.5,
                second,
            ))
            .unwrap();
        (bodies, a, b)
    }

    #[test]
    fn test_equal_masses_stop_closing_velocity() {
        let (bodies, a, b) = two_bodies(Vector3::new(2.0, 0.0, 0.0), MotionType::Dynamic);
        let (mut b1, mut b2) = bodies.lock_pair(a, b).unwrap();
        let (m1, m2) = (SolverMass::of(&b1), SolverMass::of(&b2));
        let axis = Vector3::x();

        let mut part = AxisConstraintPart::default();
        let r = Vector3::zeros();
        part.calculate_constraint_properties(&m1, &r, &m2, &r, &axis, 0.0);
        assert_relative_eq!(part.effective_mass(), 0.5, epsilon = 1e-12);

        assert!(part.solve_velocity_constraint(&mut b1, &m1, &mut b2, &m2, &axis, 0.0, f64::MAX));
        assert_relative_eq!(b1.linear_velocity().x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(b2.linear_velocity().x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(part.total_lambda(), 1.0, epsilon = 1e-12);

        // Converged: a second iteration applies nothing.
        assert!(!part.solve_velocity_constraint(&mut b1, &m1, &mut b2, &m2, &axis, 0.0, f64::MAX));
    }

    #[test]
    fn test_static_second_body_only_moves_first() {
        let (bodies, a, b) = two_bodies(Vector3::new(2.0, 0.0, 0.0), MotionType::Static);
        let (mut b1, mut b2) = bodies.lock_pair(a, b).unwrap();
        let (m1, m2) = (SolverMass::of(&b1), SolverMass::of(&b2));
        let axis = Vector3::x();

        let mut part = AxisConstraintPart::default();
        let r = Vector3::zeros();
        part.calculate_constraint_properties(&m1, &r, &m2, &r, &axis, 0.0);
        assert_relative_eq!(part.effective_mass(), 1.0, epsilon = 1e-12);

        part.solve_velocity_constraint(&mut b1, &m1, &mut b2, &m2, &axis, 0.0, f64::MAX);
        assert_relative_eq!(b1.linear_velocity().x, 0.0, epsilon = 1e-12);
        assert_eq!(b2.linear_velocity(), Vector3::zeros());
    }

    #[test]
    fn test_clamp_rejects_pulling_impulse() {
        // Separating bodies: the unilateral constraint must not pull them back.
        let (bodies, a, b) = two_bodies(Vector3::new(-2.0, 0.0, 0.0), MotionType::Dynamic);
        let (mut b1, mut b2) = bodies.lock_pair(a, b).unwrap();
        let (m1, m2) = (SolverMass::of(&b1), SolverMass::of(&b2));
        let axis = Vector3::x();

        let mut part = AxisConstraintPart::default();
        let r = Vector3::zeros();
        part.calculate_constraint_properties(&m1, &r, &m2, &r, &axis, 0.0);
        assert!(!part.solve_velocity_constraint(&mut b1, &m1, &mut b2, &m2, &axis, 0.0, f64::MAX));
        assert_relative_eq!(b1.linear_velocity().x, -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_warm_start_ratio() {
        let (bodies, a, b) = two_bodies(Vector3::zeros(), MotionType::Dynamic);
        let (mut b1, mut b2) = bodies.lock_pair(a, b).unwrap();
        let (m1, m2) = (SolverMass::of(&b1), SolverMass::of(&b2));
        let axis = Vector3::x();

        let mut part = AxisConstraintPart::default();
        let r = Vector3::zeros();
        part.calculate_constraint_properties(&m1, &r, &m2, &r, &axis, 0.0);
        part.set_total_lambda(2.0);

        part.warm_start(&mut b1, &m1, &mut b2, &m2, &axis, 0.0);
        assert_eq!(part.total_lambda(), 0.0);
        assert_eq!(b1.linear_velocity(), Vector3::zeros());

        part.set_total_lambda(2.0);
        part.warm_start(&mut b1, &m1, &mut b2, &m2, &axis, 1.0);
        assert_relative_eq!(b1.linear_velocity().x, -2.0, epsilon = 1e-12);
        assert_relative_eq!(b2.linear_velocity().x, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_position_correction_separates() {
        let (bodies, a, b) = two_bodies(Vector3::zeros(), MotionType::Dynamic);
        let (mut b1, mut b2) = bodies.lock_pair(a, b).unwrap();
        let (m1, m2) = (SolverMass::of(&b1), SolverMass::of(&b2));
        let axis = Vector3::x();

        let mut part = AxisConstraintPart::default();
        let r = Vector3::zeros();
        part.calculate_constraint_properties(&m1, &r, &m2, &r, &axis, 0.0);
        assert!(part.solve_position_constraint(&mut b1, &m1, &mut b2, &m2, &axis, -0.1, 0.2));

        // λ = 0.5 * 0.2 * 0.1 = 0.01, each body moves by 0.01.
        assert_relative_eq!(b1.position().x, -0.01, epsilon = 1e-12);
        assert_relative_eq!(b2.position().x, 1.01, epsilon = 1e-12);
    }
}
