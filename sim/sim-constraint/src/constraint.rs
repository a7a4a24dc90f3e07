//! The `Constraint` trait and the built-in distance constraint.
//!
//! Constraints are shared as [`ConstraintRef`]: an `Arc` around a
//! `parking_lot::Mutex`, so that the registry, the active list of a step and
//! the solver workers can all hold the same constraint. During solving a
//! worker locks the constraint first and its bodies second.

use std::fmt;
use std::sync::Arc;

use nalgebra::{Point3, Vector3};
use parking_lot::Mutex;
use sim_types::{Body, BodyId, BodyManager, MotionProperties};

use crate::{AxisConstraintPart, IslandBuilder, SolverMass, SplitMasks};

/// Shared handle to a constraint.
pub type ConstraintRef = Arc<Mutex<dyn Constraint>>;

/// Wrap a constraint in a [`ConstraintRef`].
pub fn constraint_ref<C: Constraint + 'static>(constraint: C) -> ConstraintRef {
    Arc::new(Mutex::new(constraint))
}

/// Active-list index used for island linking: only dynamic, active bodies
/// link islands.
#[must_use]
pub fn island_link_index(body: &Body) -> u32 {
    if body.is_dynamic() {
        body.motion().active_index()
    } else {
        MotionProperties::INACTIVE_INDEX
    }
}

/// A non-contact constraint between two bodies.
///
/// Implementors provide the velocity and position solve; island building,
/// split assignment and activity have default implementations based on
/// [`Constraint::body_ids`].
pub trait Constraint: Send + fmt::Debug {
    /// The two constrained bodies.
    fn body_ids(&self) -> (BodyId, BodyId);

    /// Disabled constraints are never solved.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Constraints with a higher priority are solved later within an
    /// iteration, so their error ends up smallest.
    fn priority(&self) -> u32 {
        0
    }

    /// Velocity steps requested by this constraint, 0 for the default.
    fn num_velocity_steps_override(&self) -> u32 {
        0
    }

    /// Position steps requested by this constraint, 0 for the default.
    fn num_position_steps_override(&self) -> u32 {
        0
    }

    /// Index of this constraint in the [`crate::ConstraintManager`].
    fn constraint_index(&self) -> u32;

    /// Set by the [`crate::ConstraintManager`] on add/remove.
    fn set_constraint_index(&mut self, index: u32);

    /// True when the constraint must be solved this step.
    fn is_active(&self, bodies: &BodyManager) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let (a, b) = self.body_ids();
        let state = |id| bodies.lock(id).map(|body| (body.is_active(), body.is_dynamic()));
        let (Some((active1, dynamic1)), Some((active2, dynamic2))) = (state(a), state(b)) else {
            return false;
        };
        (active1 || active2) && (dynamic1 || dynamic2)
    }

    /// Link the constraint's bodies into the same island.
    fn build_islands(&self, constraint_index: u32, builder: &IslandBuilder, bodies: &BodyManager) {
        let (a, b) = self.body_ids();
        let link = |id| {
            bodies
                .lock(id)
                .map_or(MotionProperties::INACTIVE_INDEX, |body| island_link_index(&body))
        };
        let (first, second) = (link(a), link(b));
        builder.link_constraint(constraint_index, first, second);
    }

    /// Choose the split this constraint is solved in.
    fn build_island_splits(&self, masks: &mut SplitMasks<'_>, bodies: &BodyManager) -> u32 {
        let (a, b) = self.body_ids();
        masks.assign_split_bodies(bodies, a, b)
    }

    /// Compute effective masses for this step.
    fn setup_velocity_constraint(&mut self, bodies: &BodyManager, dt: f64);

    /// Apply last step's impulses scaled by `ratio`.
    fn warm_start_velocity_constraint(&mut self, bodies: &BodyManager, ratio: f64);

    /// One velocity iteration. Returns true if an impulse was applied.
    fn solve_velocity_constraint(&mut self, bodies: &BodyManager, dt: f64) -> bool;

    /// One position iteration. Returns true if bodies were moved.
    fn solve_position_constraint(&mut self, bodies: &BodyManager, dt: f64, baumgarte: f64) -> bool;
}

/// Keeps two anchor points between a minimum and maximum distance.
///
/// With `min_distance == max_distance` it behaves as a rigid rod; with
/// `min_distance == 0` it behaves as a rope.
#[derive(Debug, Clone)]
pub struct DistanceConstraint {
    body1: BodyId,
    body2: BodyId,
    local_anchor1: Point3<f64>,
    local_anchor2: Point3<f64>,
    min_distance: f64,
    max_distance: f64,
    enabled: bool,
    priority: u32,
    num_velocity_steps_override: u32,
    num_position_steps_override: u32,
    index: u32,
    world_axis: Vector3<f64>,
    min_lambda: f64,
    max_lambda: f64,
    part: AxisConstraintPart,
}

impl DistanceConstraint {
    /// Create a rod between two anchors given in each body's center-of-mass
    /// space. The length is the current distance between the anchors.
    #[must_use]
    pub fn new(
        body1: BodyId,
        local_anchor1: Point3<f64>,
        body2: BodyId,
        local_anchor2: Point3<f64>,
        length: f64,
    ) -> Self {
        Self {
            body1,
            body2,
            local_anchor1,
            local_anchor2,
            min_distance: length,
            max_distance: length,
            enabled: true,
            priority: 0,
            num_velocity_steps_override: 0,
            num_position_steps_override: 0,
            index: u32::MAX,
            world_axis: Vector3::x(),
            min_lambda: f64::MIN,
            max_lambda: f64::MAX,
            part: AxisConstraintPart::default(),
        }
    }

    /// Allow the distance to vary in `[min, max]`.
    #[must_use]
    pub fn with_range(mut self, min_distance: f64, max_distance: f64) -> Self {
        self.min_distance = min_distance.min(max_distance);
        self.max_distance = max_distance.max(min_distance);
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Override solver step counts.
    #[must_use]
    pub fn with_step_overrides(mut self, velocity: u32, position: u32) -> Self {
        self.num_velocity_steps_override = velocity;
        self.num_position_steps_override = position;
        self
    }

    /// Enable or disable the constraint.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Accumulated impulse along the axis.
    #[must_use]
    pub fn total_lambda(&self) -> f64 {
        self.part.total_lambda()
    }

    fn world_points(&self, body1: &Body, body2: &Body) -> (Point3<f64>, Point3<f64>) {
        (
            body1.position() + body1.rotation() * self.local_anchor1.coords,
            body2.position() + body2.rotation() * self.local_anchor2.coords,
        )
    }

    /// Recompute axis and effective mass from the current body transforms.
    /// Returns the signed position error.
    fn calculate_properties(&mut self, body1: &Body, body2: &Body) -> f64 {
        let (p1, p2) = self.world_points(body1, body2);
        let delta = p2 - p1;
        let length = delta.norm();
        if length > 1.0e-9 {
            self.world_axis = delta / length;
        }

        let error = if length < self.min_distance {
            length - self.min_distance
        } else if length > self.max_distance {
            length - self.max_distance
        } else {
            0.0
        };

        if self.min_distance == self.max_distance {
            self.min_lambda = f64::MIN;
            self.max_lambda = f64::MAX;
        } else if error < 0.0 {
            self.min_lambda = 0.0;
            self.max_lambda = f64::MAX;
        } else if error > 0.0 {
            self.min_lambda = f64::MIN;
            self.max_lambda = 0.0;
        } else {
            self.part.deactivate();
            return 0.0;
        }

        let r1_plus_u = p2 - body1.position();
        let r2 = p2 - body2.position();
        self.part.calculate_constraint_properties(
            &SolverMass::of(body1),
            &r1_plus_u,
            &SolverMass::of(body2),
            &r2,
            &self.world_axis,
            0.0,
        );
        error
    }
}

impl Constraint for DistanceConstraint {
    fn body_ids(&self) -> (BodyId, BodyId) {
        (self.body1, self.body2)
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn num_velocity_steps_override(&self) -> u32 {
        self.num_velocity_steps_override
    }

    fn num_position_steps_override(&self) -> u32 {
        self.num_position_steps_override
    }

    fn constraint_index(&self) -> u32 {
        self.index
    }

    fn set_constraint_index(&mut self, index: u32) {
        self.index = index;
    }

    fn setup_velocity_constraint(&mut self, bodies: &BodyManager, _dt: f64) {
        if let Some((body1, body2)) = bodies.lock_pair(self.body1, self.body2) {
            self.calculate_properties(&body1, &body2);
        }
    }

    fn warm_start_velocity_constraint(&mut self, bodies: &BodyManager, ratio: f64) {
        if !self.part.is_active() {
            return;
        }
        if let Some((mut body1, mut body2)) = bodies.lock_pair(self.body1, self.body2) {
            let (m1, m2) = (SolverMass::of(&body1), SolverMass::of(&body2));
            let axis = self.world_axis;
            self.part.warm_start(&mut body1, &m1, &mut body2, &m2, &axis, ratio);
        }
    }

    fn solve_velocity_constraint(&mut self, bodies: &BodyManager, _dt: f64) -> bool {
        if !self.part.is_active() {
            return false;
        }
        let Some((mut body1, mut body2)) = bodies.lock_pair(self.body1, self.body2) else {
            return false;
        };
        let (m1, m2) = (SolverMass::of(&body1), SolverMass::of(&body2));
        let axis = self.world_axis;
        let (min, max) = (self.min_lambda, self.max_lambda);
        self.part
            .solve_velocity_constraint(&mut body1, &m1, &mut body2, &m2, &axis, min, max)
    }

    fn solve_position_constraint(
        &mut self,
        bodies: &BodyManager,
        _dt: f64,
        baumgarte: f64,
    ) -> bool {
        let Some((mut body1, mut body2)) = bodies.lock_pair(self.body1, self.body2) else {
            return false;
        };
        let lambda = self.part.total_lambda();
        let error = self.calculate_properties(&body1, &body2);
        // Position passes recompute the effective mass but keep the impulse.
        self.part.set_total_lambda(lambda);
        if error == 0.0 {
            return false;
        }
        let (m1, m2) = (SolverMass::of(&body1), SolverMass::of(&body2));
        let axis = self.world_axis;
        self.part
            .solve_position_constraint(&mut body1, &m1, &mut body2, &m2, &axis, error, baumgarte)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sim_types::{BodyCreationSettings, MotionType};

    fn pair(velocity: Vector3<f64>) -> (BodyManager, BodyId, BodyId) {
        let mut bodies = BodyManager::new(2);
        let a = bodies
            .create_body(&BodyCreationSettings::sphere(Point3::origin(), 0.1, MotionType::Static))
            .unwrap();
        let b = bodies
            .create_body(
                &BodyCreationSettings::sphere(Point3::new(2.0, 0.0, 0.0), 0.1, MotionType::Dynamic)
                    .with_linear_velocity(velocity),
            )
            .unwrap();
        (bodies, a, b)
    }

    #[test]
    fn test_rod_removes_radial_velocity() {
        let (bodies, a, b) = pair(Vector3::new(1.0, 0.5, 0.0));
        let mut rod = DistanceConstraint::new(a, Point3::origin(), b, Point3::origin(), 2.0);
        assert!(rod.is_active(&bodies));

        rod.setup_velocity_constraint(&bodies, 1.0 / 60.0);
        assert!(rod.solve_velocity_constraint(&bodies, 1.0 / 60.0));

        let v = bodies.lock(b).unwrap().linear_velocity();
        assert_relative_eq!(v.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(v.y, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_rope_is_slack_inside_range() {
        let (bodies, a, b) = pair(Vector3::new(-1.0, 0.0, 0.0));
        let mut rope = DistanceConstraint::new(a, Point3::origin(), b, Point3::origin(), 3.0)
            .with_range(0.0, 3.0);

        rope.setup_velocity_constraint(&bodies, 1.0 / 60.0);
        assert!(!rope.solve_velocity_constraint(&bodies, 1.0 / 60.0));
        assert!(!rope.solve_position_constraint(&bodies, 1.0 / 60.0, 0.2));
    }

    #[test]
    fn test_position_step_shortens_stretched_rod() {
        let (bodies, a, b) = pair(Vector3::zeros());
        let mut rod = DistanceConstraint::new(a, Point3::origin(), b, Point3::origin(), 1.5);
        rod.setup_velocity_constraint(&bodies, 1.0 / 60.0);

        assert!(rod.solve_position_constraint(&bodies, 1.0 / 60.0, 0.5));
        // Error 0.5, effective mass 1, half of it corrected.
        assert_relative_eq!(bodies.lock(b).unwrap().position().x, 1.75, epsilon = 1e-12);
    }

    #[test]
    fn test_disabled_is_inactive() {
        let (bodies, a, b) = pair(Vector3::zeros());
        let mut rod = DistanceConstraint::new(a, Point3::origin(), b, Point3::origin(), 2.0);
        rod.set_enabled(false);
        assert!(!rod.is_active(&bodies));
    }
}
