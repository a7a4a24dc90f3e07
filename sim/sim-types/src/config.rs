//! Configuration types for the solver.
//!
//! [`PhysicsSettings`] holds tuning values read every step; [`PhysicsLimits`]
//! holds the capacities that fixed-size buffers are allocated with.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Result, SimError};

/// Solver tuning values.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PhysicsSettings {
    /// Fraction of the position error removed per position iteration.
    pub baumgarte: f64,
    /// Bodies closer than this are given a speculative contact.
    pub speculative_contact_distance: f64,
    /// Penetration that is tolerated without position correction.
    pub penetration_slop: f64,
    /// Largest position correction applied in one position iteration.
    pub max_penetration_distance: f64,
    /// A cached body pair is reused when the relative position moved less than
    /// the square root of this.
    pub body_pair_cache_max_delta_position_sq: f64,
    /// A cached body pair is reused when `cos(relative rotation / 2)` is above
    /// this.
    pub body_pair_cache_cos_max_delta_rotation_div2: f64,
    /// Cached contact normals are matched when their dot product is above this.
    pub contact_normal_cos_max_delta_rotation: f64,
    /// Contact points closer than the square root of this to a cached point
    /// inherit its impulses.
    pub contact_point_preserve_lambda_max_dist_sq: f64,
    /// Velocity iterations per step.
    pub num_velocity_steps: u32,
    /// Position iterations per step.
    pub num_position_steps: u32,
    /// Below this normal approach speed restitution is ignored.
    pub min_velocity_for_restitution: f64,
    /// Scale previous impulses before applying them as a warm start.
    pub use_constraint_warm_start: bool,
    /// Reuse narrow-phase results when bodies barely moved.
    pub use_body_pair_contact_cache: bool,
    /// Split large islands into parallel batches.
    pub use_large_island_splitter: bool,
    /// Sort contacts and constraints so results do not depend on threads.
    pub deterministic_simulation: bool,
}

impl Default for PhysicsSettings {
    fn default() -> Self {
        Self {
            baumgarte: 0.2,
            speculative_contact_distance: 0.02,
            penetration_slop: 0.02,
            max_penetration_distance: 0.2,
            body_pair_cache_max_delta_position_sq: 0.001 * 0.001,
            // cos(1 degree)
            body_pair_cache_cos_max_delta_rotation_div2: 0.999_847_695_156_391_2,
            // cos(5 degrees)
            contact_normal_cos_max_delta_rotation: 0.996_194_698_091_745_5,
            contact_point_preserve_lambda_max_dist_sq: 0.01 * 0.01,
            num_velocity_steps: 10,
            num_position_steps: 2,
            min_velocity_for_restitution: 1.0,
            use_constraint_warm_start: true,
            use_body_pair_contact_cache: true,
            use_large_island_splitter: true,
            deterministic_simulation: true,
        }
    }
}

impl PhysicsSettings {
    /// Fewer iterations for interactive use.
    #[must_use]
    pub fn realtime() -> Self {
        Self {
            num_velocity_steps: 6,
            num_position_steps: 1,
            ..Default::default()
        }
    }

    /// More iterations and no cache reuse.
    #[must_use]
    pub fn high_fidelity() -> Self {
        Self {
            num_velocity_steps: 20,
            num_position_steps: 4,
            use_body_pair_contact_cache: false,
            ..Default::default()
        }
    }

    /// Set the iteration counts.
    #[must_use]
    pub fn steps(mut self, velocity: u32, position: u32) -> Self {
        self.num_velocity_steps = velocity;
        self.num_position_steps = position;
        self
    }

    /// Set the Baumgarte factor.
    #[must_use]
    pub fn baumgarte(mut self, baumgarte: f64) -> Self {
        self.baumgarte = baumgarte;
        self
    }

    /// Disable warm starting.
    #[must_use]
    pub fn without_warm_start(mut self) -> Self {
        self.use_constraint_warm_start = false;
        self
    }

    /// Disable the body pair cache.
    #[must_use]
    pub fn without_body_pair_cache(mut self) -> Self {
        self.use_body_pair_contact_cache = false;
        self
    }

    /// Disable large island splitting.
    #[must_use]
    pub fn without_island_splitter(mut self) -> Self {
        self.use_large_island_splitter = false;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.baumgarte) {
            return Err(SimError::invalid_config("baumgarte must be in [0, 1]"));
        }
        if self.speculative_contact_distance < 0.0 || self.penetration_slop < 0.0 {
            return Err(SimError::invalid_config(
                "speculative contact distance and penetration slop must be non-negative",
            ));
        }
        if self.max_penetration_distance <= 0.0 {
            return Err(SimError::invalid_config(
                "max_penetration_distance must be positive",
            ));
        }
        if self.num_velocity_steps == 0 {
            return Err(SimError::invalid_config(
                "num_velocity_steps must be at least 1",
            ));
        }
        for (name, cos) in [
            (
                "body_pair_cache_cos_max_delta_rotation_div2",
                self.body_pair_cache_cos_max_delta_rotation_div2,
            ),
            (
                "contact_normal_cos_max_delta_rotation",
                self.contact_normal_cos_max_delta_rotation,
            ),
        ] {
            if !(-1.0..=1.0).contains(&cos) {
                return Err(SimError::invalid_config(format!("{name} must be a cosine")));
            }
        }
        Ok(())
    }
}

/// Fixed capacities of the per-system buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PhysicsLimits {
    /// Maximum number of bodies.
    pub max_bodies: usize,
    /// Maximum number of cached body pairs per step.
    pub max_body_pairs: usize,
    /// Maximum number of cached manifolds per step. Sensor contacts take a
    /// manifold but no constraint.
    pub max_manifolds: usize,
    /// Maximum number of contact constraints per step.
    pub max_contact_constraints: usize,
    /// Size of the step arena in 32-bit words. At least
    /// [`PhysicsLimits::MIN_STEP_ARENA_WORDS_PER_BODY`] per body; contacts
    /// and split islands take more, and a step that runs out fails with a
    /// capacity error.
    pub step_arena_words: usize,
}

impl Default for PhysicsLimits {
    fn default() -> Self {
        Self {
            max_bodies: 1024,
            max_body_pairs: 4096,
            max_manifolds: 8192,
            max_contact_constraints: 4096,
            step_arena_words: 1 << 20,
        }
    }
}

impl PhysicsLimits {
    /// Arena words island building takes per body when no body touches
    /// another: the body list plus five per-island entries.
    pub const MIN_STEP_ARENA_WORDS_PER_BODY: usize = 8;

    /// Capacities derived from a body count.
    #[must_use]
    pub fn for_bodies(max_bodies: usize) -> Self {
        Self {
            max_bodies,
            max_body_pairs: max_bodies * 4,
            max_manifolds: max_bodies * 8,
            max_contact_constraints: max_bodies * 4,
            step_arena_words: (max_bodies * 64).max(1 << 16),
        }
    }

    /// Validate the capacities.
    pub fn validate(&self) -> Result<()> {
        if self.max_bodies == 0 || self.max_bodies > crate::BodyId::MAX_INDEX as usize {
            return Err(SimError::invalid_config("max_bodies out of range"));
        }
        if self.max_body_pairs == 0 || self.max_manifolds == 0 || self.max_contact_constraints == 0
        {
            return Err(SimError::invalid_config("cache capacities must be positive"));
        }
        let min_arena = self.max_bodies * Self::MIN_STEP_ARENA_WORDS_PER_BODY;
        if self.step_arena_words < min_arena {
            return Err(SimError::invalid_config(format!(
                "step_arena_words must be at least {min_arena} for {} bodies",
                self.max_bodies
            )));
        }
        Ok(())
    }
}
