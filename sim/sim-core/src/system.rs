//! The physics system and its step pipeline.
//!
//! # Example
//!
//! ```
//! use sim_core::{BoundingSphereNarrowPhase, PhysicsSystem};
//! use sim_contact::DefaultContactListener;
//! use sim_types::{BodyCreationSettings, MotionType, PhysicsLimits, PhysicsSettings};
//! use nalgebra::Point3;
//!
//! let mut system = PhysicsSystem::new(PhysicsSettings::default(), PhysicsLimits::for_bodies(16), 1).unwrap();
//! let ball = system
//!     .add_body(&BodyCreationSettings::sphere(Point3::new(0.0, 0.0, 5.0), 0.5, MotionType::Dynamic))
//!     .unwrap();
//!
//! for _ in 0..10 {
//!     let result = system.step(1.0 / 60.0, &BoundingSphereNarrowPhase, &DefaultContactListener).unwrap();
//!     assert!(result.errors.is_empty());
//! }
//!
//! // Falling under gravity.
//! assert!(system.bodies().lock(ball).unwrap().position().z < 5.0);
//! ```

use std::fmt;

use nalgebra::{Point3, UnitQuaternion, Vector3};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use sim_constraint::{
    ConstraintManager, ConstraintRef, Island, IslandBuilder, IslandStatistics, LargeIslandSplitter,
};
use sim_contact::{ContactConstraintManager, ContactListener, ContactManifold};
use sim_types::{
    AllLayers, Body, BodyCreationSettings, BodyId, BodyManager, BroadPhaseLayer, CollisionLayer,
    CollisionLayerPairFilter, CollisionVsBroadPhaseLayerFilter, PhysicsLimits, PhysicsLockContext,
    PhysicsSettings, Result, SimError, StepArena, StepErrorAccumulator, StepErrors,
};
use tracing::{debug, info, warn};

use crate::broad_phase::BroadPhase;
use crate::narrow_phase::NarrowPhase;
use crate::solve::{IslandSolver, SolvePhase};

/// Summary of one step.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepResult {
    /// Contacts dropped because a fixed-capacity buffer was full.
    pub errors: StepErrors,
    /// Body pairs reported by the broad phase.
    pub body_pairs: usize,
    /// Contact constraints solved.
    pub contact_constraints: usize,
    /// Island distribution of the step.
    pub islands: IslandStatistics,
    /// Islands solved as parallel splits.
    pub split_islands: usize,
}

/// Bodies, broad phase, constraints and contacts, advanced by
/// [`PhysicsSystem::step`].
pub struct PhysicsSystem {
    settings: PhysicsSettings,
    limits: PhysicsLimits,
    gravity: Vector3<f64>,
    bodies: BodyManager,
    broad_phase: BroadPhase,
    layer_filter: Box<dyn CollisionVsBroadPhaseLayerFilter>,
    pair_filter: Box<dyn CollisionLayerPairFilter>,
    constraints: ConstraintManager,
    contacts: ContactConstraintManager,
    islands: IslandBuilder,
    splitter: LargeIslandSplitter,
    arena: StepArena,
    errors: StepErrorAccumulator,
    previous_dt: f64,
}

impl fmt::Debug for PhysicsSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicsSystem")
            .field("settings", &self.settings)
            .field("limits", &self.limits)
            .field("gravity", &self.gravity)
            .field("num_bodies", &self.bodies.num_bodies())
            .field("broad_phase", &self.broad_phase)
            .finish_non_exhaustive()
    }
}

impl PhysicsSystem {
    /// Create an empty system with `num_broad_phase_layers` broad-phase
    /// trees. Every layer pair collides until
    /// [`PhysicsSystem::with_layer_filters`] says otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] if the settings, the limits or the
    /// layer count are invalid.
    pub fn new(
        settings: PhysicsSettings,
        limits: PhysicsLimits,
        num_broad_phase_layers: usize,
    ) -> Result<Self> {
        settings.validate()?;
        limits.validate()?;
        let broad_phase = BroadPhase::new(limits.max_bodies, num_broad_phase_layers)?;
        info!(
            max_bodies = limits.max_bodies,
            layers = num_broad_phase_layers,
            "physics system created"
        );
        Ok(Self {
            contacts: ContactConstraintManager::new(&settings, &limits),
            bodies: BodyManager::new(limits.max_bodies),
            arena: StepArena::new(limits.step_arena_words),
            settings,
            limits,
            gravity: Vector3::new(0.0, 0.0, -9.81),
            broad_phase,
            layer_filter: Box::new(AllLayers),
            pair_filter: Box::new(AllLayers),
            constraints: ConstraintManager::new(),
            islands: IslandBuilder::new(),
            splitter: LargeIslandSplitter::new(),
            errors: StepErrorAccumulator::new(),
            previous_dt: 0.0,
        })
    }

    /// Use layer filters for pair finding.
    #[must_use]
    pub fn with_layer_filters(
        mut self,
        layer_filter: impl CollisionVsBroadPhaseLayerFilter + 'static,
        pair_filter: impl CollisionLayerPairFilter + 'static,
    ) -> Self {
        self.layer_filter = Box::new(layer_filter);
        self.pair_filter = Box::new(pair_filter);
        self
    }

    /// Solver settings.
    #[must_use]
    pub fn settings(&self) -> &PhysicsSettings {
        &self.settings
    }

    /// Replace the solver settings.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] and keeps the old settings if the
    /// new ones are invalid.
    pub fn set_settings(&mut self, settings: PhysicsSettings) -> Result<()> {
        settings.validate()?;
        self.contacts.set_settings(&settings);
        self.settings = settings;
        Ok(())
    }

    /// Capacities the system was created with.
    #[must_use]
    pub fn limits(&self) -> &PhysicsLimits {
        &self.limits
    }

    /// Gravity applied to dynamic bodies.
    #[must_use]
    pub fn gravity(&self) -> Vector3<f64> {
        self.gravity
    }

    /// Set gravity.
    pub fn set_gravity(&mut self, gravity: Vector3<f64>) {
        self.gravity = gravity;
    }

    /// All bodies.
    #[must_use]
    pub fn bodies(&self) -> &BodyManager {
        &self.bodies
    }

    /// The broad phase, for queries.
    #[must_use]
    pub fn broad_phase(&self) -> &BroadPhase {
        &self.broad_phase
    }

    /// Contact constraints and cache of the last step.
    #[must_use]
    pub fn contacts(&self) -> &ContactConstraintManager {
        &self.contacts
    }

    /// Create a body and insert it into the broad phase.
    ///
    /// # Errors
    ///
    /// Fails if the body or broad-phase capacity is exhausted or the body
    /// names an unknown broad-phase layer.
    pub fn add_body(&mut self, settings: &BodyCreationSettings) -> Result<BodyId> {
        self.add_bodies(std::slice::from_ref(settings))
            .map(|ids| ids[0])
    }

    /// Create bodies and insert them into the broad phase as one batch.
    ///
    /// # Errors
    ///
    /// See [`PhysicsSystem::add_body`]. No body is created on failure.
    pub fn add_bodies(&mut self, settings: &[BodyCreationSettings]) -> Result<Vec<BodyId>> {
        let mut ids = Vec::with_capacity(settings.len());
        for body_settings in settings {
            match self.bodies.create_body(body_settings) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    self.destroy_bodies(&ids);
                    return Err(e);
                }
            }
        }

        let ctx = PhysicsLockContext::new();
        let mut batch = ids.clone();
        if let Err(e) = self.broad_phase.add_bodies(&ctx, &self.bodies, &mut batch) {
            self.destroy_bodies(&ids);
            return Err(e);
        }
        debug!(added = ids.len(), total = self.bodies.num_bodies(), "bodies added");
        Ok(ids)
    }

    fn destroy_bodies(&mut self, ids: &[BodyId]) {
        for &id in ids {
            let _ = self.bodies.destroy_body(id);
        }
    }

    /// Remove a body from the broad phase and destroy it. Contacts with the
    /// body are reported as removed at the end of the next step.
    ///
    /// # Errors
    ///
    /// Fails if the body does not exist.
    pub fn remove_body(&mut self, id: BodyId) -> Result<Body> {
        if !self.bodies.contains(id) {
            return Err(SimError::InvalidBodyId(id));
        }
        let ctx = PhysicsLockContext::new();
        self.broad_phase.remove_bodies(&ctx, &mut [id])?;
        self.bodies.destroy_body(id)
    }

    /// Teleport a body.
    ///
    /// # Errors
    ///
    /// Fails if the body does not exist.
    pub fn set_position_and_rotation(
        &mut self,
        id: BodyId,
        position: Point3<f64>,
        rotation: UnitQuaternion<f64>,
    ) -> Result<()> {
        self.bodies
            .body_mut(id)
            .ok_or(SimError::InvalidBodyId(id))?
            .set_position_and_rotation(position, rotation);
        let ctx = PhysicsLockContext::new();
        self.broad_phase.notify_bodies_aabb_changed(&ctx, &self.bodies, &[id])
    }

    /// Set the linear velocity of a body.
    ///
    /// # Errors
    ///
    /// Fails if the body does not exist.
    pub fn set_linear_velocity(&mut self, id: BodyId, velocity: Vector3<f64>) -> Result<()> {
        self.bodies
            .body_mut(id)
            .ok_or(SimError::InvalidBodyId(id))?
            .set_linear_velocity(velocity);
        Ok(())
    }

    /// Move a body to other layers.
    ///
    /// # Errors
    ///
    /// Fails if the body does not exist or the broad-phase layer is unknown.
    pub fn set_layers(
        &mut self,
        id: BodyId,
        broad_phase: BroadPhaseLayer,
        collision: CollisionLayer,
    ) -> Result<()> {
        let body = self.bodies.body_mut(id).ok_or(SimError::InvalidBodyId(id))?;
        let previous = (body.broad_phase_layer(), body.collision_layer());
        body.set_layers(broad_phase, collision);

        let ctx = PhysicsLockContext::new();
        let result = self.broad_phase.notify_bodies_layer_changed(&ctx, &self.bodies, &[id]);
        if result.is_err() {
            if let Some(body) = self.bodies.body_mut(id) {
                body.set_layers(previous.0, previous.1);
            }
        }
        result
    }

    /// Register a constraint.
    pub fn add_constraint(&self, constraint: ConstraintRef) {
        let ctx = PhysicsLockContext::new();
        self.constraints.add(&ctx, &[constraint]);
    }

    /// Unregister a constraint.
    pub fn remove_constraint(&self, constraint: &ConstraintRef) {
        let ctx = PhysicsLockContext::new();
        self.constraints.remove(&ctx, std::slice::from_ref(constraint));
    }

    /// Number of registered constraints.
    #[must_use]
    pub fn num_constraints(&self) -> usize {
        self.constraints.num_constraints(&PhysicsLockContext::new())
    }

    /// Advance the simulation by `dt`.
    ///
    /// Capacity problems do not fail the step: the affected contacts are
    /// dropped and reported in [`StepResult::errors`].
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidTimestep`] for a non-positive or non-finite
    /// `dt`, and a capacity error if the broad phase or the step arena run
    /// out of room.
    pub fn step(
        &mut self,
        dt: f64,
        narrow_phase: &dyn NarrowPhase,
        listener: &dyn ContactListener,
    ) -> Result<StepResult> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(SimError::InvalidTimestep(dt));
        }

        let ctx = PhysicsLockContext::new();
        let result = self.run_step(&ctx, dt, narrow_phase, listener);

        // Release in reverse allocation order.
        self.splitter.reset(&mut self.arena);
        self.islands.reset(&mut self.arena);
        self.arena.reset();

        let mut result = result?;
        self.previous_dt = dt;
        result.errors = self.errors.take();
        if !result.errors.is_empty() {
            warn!(errors = %result.errors, "step dropped contacts");
        }
        Ok(result)
    }

    fn run_step(
        &mut self,
        ctx: &PhysicsLockContext,
        dt: f64,
        narrow_phase: &dyn NarrowPhase,
        listener: &dyn ContactListener,
    ) -> Result<StepResult> {
        self.broad_phase.frame_sync(ctx);
        self.broad_phase.update(ctx)?;

        let active_bodies = self.bodies.active_bodies().to_vec();
        self.apply_gravity(&active_bodies, dt);

        let pairs = self.broad_phase.find_colliding_pairs(
            &self.bodies,
            &active_bodies,
            self.settings.speculative_contact_distance,
            &*self.layer_filter,
            &*self.pair_filter,
        );

        let active_constraints = self.constraints.active_constraints(ctx, &self.bodies);
        self.contacts.prepare(dt);
        self.islands.prepare(
            active_bodies.len(),
            active_constraints.len(),
            self.limits.max_contact_constraints,
        );
        self.collide_pairs(&pairs, narrow_phase, listener);
        self.errors.merge(self.contacts.errors());

        let mut constraint_order: Vec<u32> = (0..active_constraints.len() as u32).collect();
        ConstraintManager::sort_constraints(&active_constraints, &mut constraint_order);
        ConstraintManager::setup_velocity_constraints(
            &active_constraints,
            &constraint_order,
            &self.bodies,
            dt,
        );
        ConstraintManager::build_islands(&active_constraints, &self.islands, &self.bodies);

        let num_contacts = u32::try_from(self.contacts.num_constraints()).unwrap_or(u32::MAX);
        self.islands.finalize(
            &mut self.arena,
            &self.bodies,
            &active_constraints,
            num_contacts,
            &self.settings,
        )?;
        let statistics = self.islands.statistics(&self.arena);
        debug!(
            islands = statistics.num_islands,
            largest = statistics.max_bodies_per_island,
            average = statistics.avg_bodies_per_island,
            contacts = num_contacts,
            "islands built"
        );

        let whole_islands = self.plan_islands(&active_constraints)?;

        let warm_start = self.settings.use_constraint_warm_start && self.previous_dt > 0.0;
        let warm_start_ratio = if warm_start { dt / self.previous_dt } else { 0.0 };
        self.solver(&active_constraints, &whole_islands, dt, warm_start_ratio)
            .solve(SolvePhase::Velocity);
        self.contacts.store_applied_impulses();

        self.integrate_positions(&active_bodies, dt);
        self.splitter.prepare_for_solve_positions();
        self.solver(&active_constraints, &whole_islands, dt, warm_start_ratio)
            .solve(SolvePhase::Position);

        active_bodies.par_iter().for_each(|&id| {
            if let Some(mut body) = self.bodies.lock(id) {
                body.update_world_bounds();
            }
        });
        self.broad_phase
            .notify_bodies_aabb_changed(ctx, &self.bodies, &active_bodies)?;

        self.contacts.finalize_contact_cache(listener);

        Ok(StepResult {
            errors: StepErrors::NONE,
            body_pairs: pairs.len(),
            contact_constraints: num_contacts as usize,
            islands: statistics,
            split_islands: self.splitter.split_islands().len(),
        })
    }

    fn solver<'a>(
        &'a self,
        active_constraints: &'a [ConstraintRef],
        whole_islands: &'a [Island],
        dt: f64,
        warm_start_ratio: f64,
    ) -> IslandSolver<'a> {
        IslandSolver {
            bodies: &self.bodies,
            contacts: &self.contacts,
            constraints: active_constraints,
            arena: &self.arena,
            splitter: &self.splitter,
            islands: whole_islands,
            dt,
            warm_start_ratio,
            baumgarte: self.settings.baumgarte,
        }
    }

    fn apply_gravity(&self, active_bodies: &[BodyId], dt: f64) {
        let delta = self.gravity * dt;
        active_bodies.par_iter().for_each(|&id| {
            if let Some(mut body) = self.bodies.lock(id) {
                if body.is_dynamic() {
                    let velocity = body.linear_velocity() + delta;
                    body.set_linear_velocity(velocity);
                }
            }
        });
    }

    fn integrate_positions(&self, active_bodies: &[BodyId], dt: f64) {
        active_bodies.par_iter().for_each(|&id| {
            if let Some(mut body) = self.bodies.lock(id) {
                body.integrate_position(dt);
            }
        });
    }

    /// Serve pairs from the contact cache, run the narrow phase on the rest
    /// in parallel and turn the results into contact constraints in pair
    /// order.
    fn collide_pairs(
        &mut self,
        pairs: &[(BodyId, BodyId)],
        narrow_phase: &dyn NarrowPhase,
        listener: &dyn ContactListener,
    ) {
        let mut misses = Vec::with_capacity(pairs.len());
        for &(a, b) in pairs {
            let (id1, id2) = if a < b { (a, b) } else { (b, a) };
            let Some((body1, body2)) = self.bodies.lock_pair(id1, id2) else {
                continue;
            };
            let lookup = self
                .contacts
                .get_contacts_from_cache(&self.islands, &body1, &body2, listener);
            if !lookup.pair_handled {
                misses.push((id1, id2));
            }
        }

        let bodies = &self.bodies;
        let max_separation = self.settings.speculative_contact_distance;
        let manifolds: Vec<Vec<ContactManifold>> = misses
            .par_iter()
            .map(|&(id1, id2)| {
                bodies.lock_pair(id1, id2).map_or_else(Vec::new, |(body1, body2)| {
                    narrow_phase.collide(&body1, &body2, max_separation)
                })
            })
            .collect();

        for (&(id1, id2), found) in misses.iter().zip(&manifolds) {
            let Some((body1, body2)) = self.bodies.lock_pair(id1, id2) else {
                continue;
            };
            self.contacts
                .add_body_pair_contacts(&self.islands, &body1, &body2, found, listener);
        }
        debug!(
            pairs = pairs.len(),
            cache_hits = pairs.len() - misses.len(),
            constraints = self.contacts.num_constraints(),
            "contacts collected"
        );
    }

    /// Sort island contents, split the large islands and return the islands
    /// that are solved whole, largest first.
    fn plan_islands(&mut self, active_constraints: &[ConstraintRef]) -> Result<Vec<Island>> {
        let sorted = self.islands.sorted_islands(&self.arena).to_vec();
        for &index in &sorted {
            let island = self.islands.island(&self.arena, index);
            ConstraintManager::sort_constraints(
                active_constraints,
                self.arena.slice_mut(island.constraints),
            );
            if self.settings.deterministic_simulation {
                self.contacts.sort_contacts(self.arena.slice_mut(island.contacts));
            }
        }

        let mut splitting = self.settings.use_large_island_splitter;
        if splitting {
            self.splitter.prepare(&self.islands, &mut self.arena)?;
        }
        let mut whole = Vec::with_capacity(sorted.len());
        for &index in &sorted {
            let island = self.islands.island(&self.arena, index);
            if splitting {
                let split = self.splitter.split_island(
                    &island,
                    &mut self.arena,
                    &self.bodies,
                    &self.contacts,
                    active_constraints,
                    &self.settings,
                )?;
                if split {
                    continue;
                }
                // Islands come largest first: the rest are too small as well.
                splitting = false;
            }
            whole.push(island);
        }
        if !self.splitter.split_islands().is_empty() {
            debug!(
                split = self.splitter.split_islands().len(),
                whole = whole.len(),
                "large islands split"
            );
        }
        Ok(whole)
    }
}
