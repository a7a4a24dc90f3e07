//! Per-island solver step counts.

use sim_types::{Body, PhysicsSettings};

use crate::Constraint;

/// Accumulates step overrides of the bodies and constraints of one island.
///
/// The island uses the largest override. If any member asks for the default
/// (override 0), the default from [`PhysicsSettings`] also takes part in the
/// maximum.
#[derive(Debug, Clone, Copy)]
pub struct SolverStepsCalculator {
    default_velocity_steps: u32,
    default_position_steps: u32,
    num_velocity_steps: u32,
    num_position_steps: u32,
    apply_default_velocity: bool,
    apply_default_position: bool,
}

impl SolverStepsCalculator {
    /// Start a new island.
    #[must_use]
    pub fn new(settings: &PhysicsSettings) -> Self {
        Self {
            default_velocity_steps: settings.num_velocity_steps,
            default_position_steps: settings.num_position_steps,
            num_velocity_steps: 0,
            num_position_steps: 0,
            apply_default_velocity: false,
            apply_default_position: false,
        }
    }

    /// Record one member's overrides.
    pub fn add(&mut self, velocity_override: u32, position_override: u32) {
        self.num_velocity_steps = self.num_velocity_steps.max(velocity_override);
        self.apply_default_velocity |= velocity_override == 0;
        self.num_position_steps = self.num_position_steps.max(position_override);
        self.apply_default_position |= position_override == 0;
    }

    /// Record a body. Only dynamic bodies carry overrides.
    pub fn add_body(&mut self, body: &Body) {
        if body.is_dynamic() {
            let motion = body.motion();
            self.add(motion.num_velocity_steps_override(), motion.num_position_steps_override());
        }
    }

    /// Record a constraint.
    pub fn add_constraint(&mut self, constraint: &dyn Constraint) {
        self.add(
            constraint.num_velocity_steps_override(),
            constraint.num_position_steps_override(),
        );
    }

    /// Fold in the defaults where required.
    pub fn finalize(&mut self) {
        if self.num_velocity_steps == 0 || self.apply_default_velocity {
            self.num_velocity_steps = self.num_velocity_steps.max(self.default_velocity_steps);
        }
        if self.num_position_steps == 0 || self.apply_default_position {
            self.num_position_steps = self.num_position_steps.max(self.default_position_steps);
        }
    }

    /// Velocity steps for the island.
    #[must_use]
    pub fn num_velocity_steps(&self) -> u32 {
        self.num_velocity_steps
    }

    /// Position steps for the island.
    #[must_use]
    pub fn num_position_steps(&self) -> u32 {
        self.num_position_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_island_uses_defaults() {
        let mut calc = SolverStepsCalculator::new(&PhysicsSettings::default());
        calc.finalize();
        assert_eq!(calc.num_velocity_steps(), 10);
        assert_eq!(calc.num_position_steps(), 2);
    }

    #[test]
    fn test_override_only_island() {
        let mut calc = SolverStepsCalculator::new(&PhysicsSettings::default());
        calc.add(4, 1);
        calc.finalize();
        assert_eq!(calc.num_velocity_steps(), 4);
        assert_eq!(calc.num_position_steps(), 1);
    }

    #[test]
    fn test_default_member_raises_low_override() {
        let mut calc = SolverStepsCalculator::new(&PhysicsSettings::default());
        calc.add(4, 5);
        calc.add(0, 0);
        calc.finalize();
        assert_eq!(calc.num_velocity_steps(), 10);
        assert_eq!(calc.num_position_steps(), 5);
    }
}
