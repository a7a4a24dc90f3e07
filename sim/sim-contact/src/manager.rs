//! The contact constraint manager: turns narrow-phase manifolds into contact
//! constraints, reuses cached contacts and solves the constraints.
//!
//! # Step Protocol
//!
//! ```text
//! prepare(dt)
//!   for every broad-phase pair (lower body id first):
//!     get_contacts_from_cache            -> handled? done
//!     otherwise run the narrow phase and add_body_pair_contacts
//! sort_contacts (per island)
//! warm_start / solve_velocity over index slices
//! store_applied_impulses
//! solve_position over index slices
//! finalize_contact_cache
//! ```
//!
//! Ingestion takes `&mut self` and runs on one thread. The solve functions
//! take `&self`: every constraint sits behind its own mutex, locked before
//! its two bodies.

use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::{Mutex, MutexGuard};
use sim_constraint::{IslandBuilder, SplitContacts, island_link_index};
use sim_types::{Body, BodyId, BodyManager, PhysicsLimits, PhysicsSettings, StepErrors};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::cache::{CachedContactPoint, CachedManifold, ContactCache, NO_MANIFOLD};
use crate::{
    BodyPairKey, CombineFunction, ContactConstraint, ContactListener, ContactManifold,
    ContactPoints, ContactSettings, MAX_CONTACT_POINTS, SubShapeId, SubShapeIdPair,
    ValidateResult, combine_friction, combine_restitution,
};

/// Outcome of [`ContactConstraintManager::get_contacts_from_cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheLookup {
    /// The pair was served from the cache; skip the narrow phase.
    pub pair_handled: bool,
    /// At least one contact constraint was created.
    pub constraint_created: bool,
}

/// Position and rotation of body 2 relative to body 1.
fn relative_transform(body1: &Body, body2: &Body) -> (Vector3<f64>, UnitQuaternion<f64>) {
    let inv_rotation1 = body1.rotation().inverse();
    (
        inv_rotation1 * (body2.position() - body1.position()),
        inv_rotation1 * body2.rotation(),
    )
}

/// Fixed-capacity list of the step's contact constraints.
#[derive(Debug)]
struct ConstraintBuffer {
    constraints: Vec<Mutex<ContactConstraint>>,
    max_constraints: usize,
}

impl ConstraintBuffer {
    /// Build the constraint of `manifold` (already in the write cache at
    /// `manifold_index`) and link it into the islands.
    #[allow(clippy::too_many_arguments)]
    fn add(
        &mut self,
        builder: &IslandBuilder,
        body1: &Body,
        body2: &Body,
        manifold: &CachedManifold,
        manifold_index: u32,
        settings: &ContactSettings,
        physics: &PhysicsSettings,
        dt: f64,
    ) -> Result<(), StepErrors> {
        if self.constraints.len() >= self.max_constraints {
            return Err(StepErrors::CONTACT_CONSTRAINTS_FULL);
        }
        let index = self.constraints.len() as u32;

        let normal = body2.rotation() * manifold.contact_normal;
        let mut constraint =
            ContactConstraint::new(body1, body2, manifold.key, manifold_index, normal, settings);
        for point in &manifold.points {
            constraint.add_point(dt, body1, body2, point, settings, physics);
        }
        self.constraints.push(Mutex::new(constraint));

        builder.link_contact(index, island_link_index(body1), island_link_index(body2));
        Ok(())
    }
}

/// Owns the contact cache and the contact constraints of a step.
///
/// # Example
///
/// ```
/// use nalgebra::{Point3, Vector3};
/// use sim_constraint::IslandBuilder;
/// use sim_contact::{ContactConstraintManager, ContactManifold, DefaultContactListener};
/// use sim_types::{BodyCreationSettings, BodyManager, MotionType, PhysicsLimits, PhysicsSettings};
///
/// let mut bodies = BodyManager::new(2);
/// let floor = bodies
///     .create_body(&BodyCreationSettings::sphere(Point3::origin(), 1.0, MotionType::Static))
///     .unwrap();
/// let ball = bodies
///     .create_body(&BodyCreationSettings::sphere(Point3::new(0.0, 0.0, 1.9), 1.0, MotionType::Dynamic))
///     .unwrap();
///
/// let mut manager = ContactConstraintManager::new(&PhysicsSettings::default(), &PhysicsLimits::default());
/// let mut builder = IslandBuilder::new();
/// builder.prepare(bodies.active_bodies().len(), 0, 16);
/// manager.prepare(1.0 / 60.0);
///
/// let (body1, body2) = bodies.lock_pair(floor, ball).unwrap();
/// let manifold = ContactManifold::single_point(
///     Point3::new(0.0, 0.0, 1.0),
///     Point3::new(0.0, 0.0, 0.9),
///     Vector3::z(),
/// );
/// let created = manager.add_body_pair_contacts(&builder, &body1, &body2, &[manifold], &DefaultContactListener);
///
/// assert!(created);
/// assert_eq!(manager.num_constraints(), 1);
/// ```
#[derive(Debug)]
pub struct ContactConstraintManager {
    settings: PhysicsSettings,
    cache: ContactCache,
    buffer: ConstraintBuffer,
    combine_friction: CombineFunction,
    combine_restitution: CombineFunction,
    errors: StepErrors,
    dt: f64,
}

impl ContactConstraintManager {
    /// Create a manager with capacities from `limits`.
    #[must_use]
    pub fn new(settings: &PhysicsSettings, limits: &PhysicsLimits) -> Self {
        Self {
            settings: settings.clone(),
            cache: ContactCache::new(limits.max_body_pairs, limits.max_manifolds),
            buffer: ConstraintBuffer {
                constraints: Vec::with_capacity(limits.max_contact_constraints),
                max_constraints: limits.max_contact_constraints,
            },
            combine_friction,
            combine_restitution,
            errors: StepErrors::NONE,
            dt: 0.0,
        }
    }

    /// Replace the solver settings.
    pub fn set_settings(&mut self, settings: &PhysicsSettings) {
        self.settings = settings.clone();
    }

    /// Solver settings in use.
    #[must_use]
    pub fn settings(&self) -> &PhysicsSettings {
        &self.settings
    }

    /// Replace the friction combine function.
    pub fn set_combine_friction(&mut self, combine: CombineFunction) {
        self.combine_friction = combine;
    }

    /// Replace the restitution combine function.
    pub fn set_combine_restitution(&mut self, combine: CombineFunction) {
        self.combine_restitution = combine;
    }

    /// Start a step: drop last step's constraints and anything a step that
    /// failed before [`ContactConstraintManager::finalize_contact_cache`]
    /// left in the write cache.
    pub fn prepare(&mut self, dt: f64) {
        self.buffer.constraints.clear();
        self.cache.discard_write();
        self.errors = StepErrors::NONE;
        self.dt = dt;
    }

    /// Number of contact constraints created this step.
    #[must_use]
    pub fn num_constraints(&self) -> usize {
        self.buffer.constraints.len()
    }

    /// Lock contact constraint `index`.
    #[must_use]
    pub fn constraint(&self, index: u32) -> Option<MutexGuard<'_, ContactConstraint>> {
        self.buffer.constraints.get(index as usize).map(Mutex::lock)
    }

    /// The double-buffered cache.
    #[must_use]
    pub fn cache(&self) -> &ContactCache {
        &self.cache
    }

    /// Capacity errors raised this step.
    #[must_use]
    pub fn errors(&self) -> StepErrors {
        self.errors
    }

    fn record(&mut self, errors: StepErrors) {
        if errors.is_empty() || self.errors.contains(errors) {
            self.errors |= errors;
            return;
        }
        warn!(%errors, "contact capacity exceeded, contacts dropped this step");
        self.errors |= errors;
    }

    fn default_settings(
        &self,
        body1: &Body,
        sub_shape1: SubShapeId,
        body2: &Body,
        sub_shape2: SubShapeId,
    ) -> ContactSettings {
        ContactSettings::new(
            (self.combine_friction)(body1, sub_shape1, body2, sub_shape2),
            (self.combine_restitution)(body1, sub_shape1, body2, sub_shape2),
            body1.is_sensor() || body2.is_sensor(),
        )
    }

    /// Try to reuse last step's contacts of a body pair.
    ///
    /// The pair is reused when body 2 moved less than the configured distance
    /// and rotated less than the configured angle relative to body 1. Reused
    /// manifolds are copied to the write cache, reported through
    /// [`ContactListener::on_contact_persisted`] and turned into constraints.
    pub fn get_contacts_from_cache(
        &mut self,
        builder: &IslandBuilder,
        body1: &Body,
        body2: &Body,
        listener: &dyn ContactListener,
    ) -> CacheLookup {
        debug_assert!(body1.id() < body2.id(), "body pair not in canonical order");
        let mut lookup = CacheLookup::default();
        if !self.settings.use_body_pair_contact_cache {
            return lookup;
        }

        let key = BodyPairKey::new(body1.id(), body2.id());
        let Some(old_pair) = self.cache.read().find_body_pair(&key).copied() else {
            return lookup;
        };

        let (delta_position, delta_rotation) = relative_transform(body1, body2);
        if (old_pair.delta_position - delta_position).norm_squared()
            > self.settings.body_pair_cache_max_delta_position_sq
        {
            return lookup;
        }
        // |q1 . q2| is the cosine of half the angle between the rotations.
        if old_pair.delta_rotation.coords.dot(&delta_rotation.coords).abs()
            < self.settings.body_pair_cache_cos_max_delta_rotation_div2
        {
            return lookup;
        }

        // Served from the cache even if the copy fails: the narrow phase would
        // not fit either.
        lookup.pair_handled = true;
        let mut errors = StepErrors::NONE;

        // Keep the old deltas so that slow drift still invalidates the pair.
        if let Err(e) = self.cache.write_mut().create_body_pair(
            key,
            old_pair.delta_position,
            old_pair.delta_rotation,
        ) {
            self.record(e);
            return lookup;
        }

        let old_manifolds: SmallVec<[u32; MAX_CONTACT_POINTS]> =
            self.cache.read().body_pair_manifolds(&old_pair).collect();
        for old_index in old_manifolds {
            let manifold = {
                let (read, _) = self.cache.split_mut();
                let old = read.manifold_mut(old_index);
                old.persisted = true;
                old.clone()
            };
            let new_index = match self.cache.write_mut().add_manifold(&key, manifold.clone()) {
                Ok(index) => index,
                Err(e) => {
                    errors |= e;
                    continue;
                }
            };

            let mut settings = self.default_settings(
                body1,
                manifold.key.sub_shape1,
                body2,
                manifold.key.sub_shape2,
            );
            let reported = Self::world_manifold(body1, body2, &manifold);
            listener.on_contact_persisted(body1, body2, &reported, &mut settings);
            if settings.is_sensor || settings.is_immovable_pair(body1, body2) {
                continue;
            }

            match self.buffer.add(
                builder,
                body1,
                body2,
                &manifold,
                new_index,
                &settings,
                &self.settings,
                self.dt,
            ) {
                Ok(()) => lookup.constraint_created = true,
                Err(e) => errors |= e,
            }
        }

        self.record(errors);
        lookup
    }

    /// Rebuild a world-space manifold from a cached one for the listener.
    fn world_manifold(body1: &Body, body2: &Body, cached: &CachedManifold) -> ContactManifold {
        let normal = body2.rotation() * cached.contact_normal;
        let base_offset = body1.position();
        let mut on1 = ContactPoints::new();
        let mut on2 = ContactPoints::new();
        let mut penetration_depth = f64::NEG_INFINITY;
        for point in &cached.points {
            let p1 = body1.position() + body1.rotation() * point.position1;
            let p2 = body2.position() + body2.rotation() * point.position2;
            penetration_depth = penetration_depth.max((p1 - p2).dot(&normal));
            on1.push(p1 - base_offset);
            on2.push(p2 - base_offset);
        }
        ContactManifold {
            base_offset,
            world_space_normal: normal,
            penetration_depth: if cached.points.is_empty() {
                0.0
            } else {
                penetration_depth
            },
            sub_shape1: cached.key.sub_shape1,
            sub_shape2: cached.key.sub_shape2,
            relative_points_on1: on1,
            relative_points_on2: on2,
        }
    }

    /// Cache a body pair whose narrow phase ran this step. Must be called
    /// before its manifolds are added, even when it has none. Returns false
    /// when the body pair cache is full.
    pub fn add_body_pair(&mut self, body1: &Body, body2: &Body) -> bool {
        debug_assert!(body1.id() < body2.id(), "body pair not in canonical order");
        let key = BodyPairKey::new(body1.id(), body2.id());
        let (delta_position, delta_rotation) = relative_transform(body1, body2);
        match self
            .cache
            .write_mut()
            .create_body_pair(key, delta_position, delta_rotation)
        {
            Ok(()) => true,
            Err(e) => {
                self.record(e);
                false
            }
        }
    }

    /// Cache a new manifold and create its contact constraint.
    ///
    /// Calls [`ContactListener::on_contact_persisted`] if the same sub shapes
    /// touched last step and [`ContactListener::on_contact_added`] otherwise.
    /// Contact points close to a point of last step's manifold inherit its
    /// impulses, provided the normal did not turn too far. Returns true if a
    /// constraint was created.
    pub fn add_contact_constraint(
        &mut self,
        builder: &IslandBuilder,
        body1: &Body,
        body2: &Body,
        manifold: &ContactManifold,
        listener: &dyn ContactListener,
    ) -> bool {
        debug_assert!(body1.id() < body2.id(), "body pair not in canonical order");
        debug_assert!(
            manifold.num_points() <= MAX_CONTACT_POINTS,
            "manifold must be reduced to {MAX_CONTACT_POINTS} points"
        );

        let key =
            SubShapeIdPair::new(body1.id(), manifold.sub_shape1, body2.id(), manifold.sub_shape2);
        let mut settings =
            self.default_settings(body1, manifold.sub_shape1, body2, manifold.sub_shape2);

        let old = {
            let (read, _) = self.cache.split_mut();
            read.find_manifold(&key).map(|index| {
                let old = read.manifold_mut(index);
                old.persisted = true;
                old.clone()
            })
        };
        if old.is_some() {
            listener.on_contact_persisted(body1, body2, manifold, &mut settings);
        } else {
            listener.on_contact_added(body1, body2, manifold, &mut settings);
        }

        let inv_rotation1 = body1.rotation().inverse();
        let inv_rotation2 = body2.rotation().inverse();
        let normal = manifold.world_space_normal;

        // Only carry impulses over when the normal is still roughly the same.
        let old_points = old.as_ref().filter(|old| {
            normal.dot(&(body2.rotation() * old.contact_normal))
                >= self.settings.contact_normal_cos_max_delta_rotation
        });

        let mut cached = CachedManifold {
            key,
            contact_normal: inv_rotation2 * normal,
            points: SmallVec::new(),
            next: NO_MANIFOLD,
            persisted: false,
        };
        for i in 0..manifold.num_points().min(MAX_CONTACT_POINTS) {
            let mut point = CachedContactPoint::from_world(
                &manifold.world_point_on1(i),
                &body1.position(),
                &inv_rotation1,
                &manifold.world_point_on2(i),
                &body2.position(),
                &inv_rotation2,
            );
            if let Some(old) = old_points {
                if let Some(matched) = old.points.iter().find(|p| {
                    (p.position1 - point.position1).norm_squared()
                        < self.settings.contact_point_preserve_lambda_max_dist_sq
                }) {
                    point.non_penetration_lambda = matched.non_penetration_lambda;
                    point.friction_lambda = matched.friction_lambda;
                }
            }
            cached.points.push(point);
        }

        let pair = key.body_pair();
        let index = match self.cache.write_mut().add_manifold(&pair, cached.clone()) {
            Ok(index) => index,
            Err(e) => {
                self.record(e);
                return false;
            }
        };

        if settings.is_sensor || settings.is_immovable_pair(body1, body2) {
            return false;
        }

        match self.buffer.add(
            builder,
            body1,
            body2,
            &cached,
            index,
            &settings,
            &self.settings,
            self.dt,
        ) {
            Ok(()) => true,
            Err(e) => {
                self.record(e);
                false
            }
        }
    }

    /// Cache a body pair and all its narrow-phase manifolds, asking the
    /// listener to validate each manifold first. Returns true if any
    /// constraint was created.
    pub fn add_body_pair_contacts(
        &mut self,
        builder: &IslandBuilder,
        body1: &Body,
        body2: &Body,
        manifolds: &[ContactManifold],
        listener: &dyn ContactListener,
    ) -> bool {
        if !self.add_body_pair(body1, body2) {
            return false;
        }

        let mut created = false;
        let mut accept_all = false;
        for manifold in manifolds {
            if !accept_all {
                match listener.on_contact_validate(body1, body2, manifold) {
                    ValidateResult::AcceptAllContactsForThisBodyPair => accept_all = true,
                    ValidateResult::AcceptContact => {}
                    ValidateResult::RejectContact => continue,
                    ValidateResult::RejectAllContactsForThisBodyPair => break,
                }
            }
            created |= self.add_contact_constraint(builder, body1, body2, manifold, listener);
        }
        created
    }

    /// Order contact indices by body ids, then sub shapes, so the solve order
    /// does not depend on the order pairs were found in.
    pub fn sort_contacts(&self, indices: &mut [u32]) {
        indices.sort_by_cached_key(|&index| {
            *self.buffer.constraints[index as usize].lock().sort_key()
        });
    }

    fn for_each_locked(
        &self,
        indices: &[u32],
        bodies: &BodyManager,
        mut f: impl FnMut(&mut ContactConstraint, &mut Body, &mut Body) -> bool,
    ) -> bool {
        let mut any_impulse = false;
        for &index in indices {
            let mut constraint = self.buffer.constraints[index as usize].lock();
            let (id1, id2) = constraint.body_ids();
            let Some((mut body1, mut body2)) = bodies.lock_pair(id1, id2) else {
                continue;
            };
            any_impulse |= f(&mut *constraint, &mut *body1, &mut *body2);
        }
        any_impulse
    }

    /// Apply last step's impulses scaled by `ratio`.
    pub fn warm_start_velocity_constraints(
        &self,
        indices: &[u32],
        bodies: &BodyManager,
        ratio: f64,
    ) {
        self.for_each_locked(indices, bodies, |constraint, body1, body2| {
            constraint.warm_start(body1, body2, ratio);
            false
        });
    }

    /// One velocity iteration. Returns true if any impulse was applied.
    pub fn solve_velocity_constraints(&self, indices: &[u32], bodies: &BodyManager) -> bool {
        self.for_each_locked(indices, bodies, ContactConstraint::solve_velocity)
    }

    /// One position iteration. Returns true if any body was moved.
    pub fn solve_position_constraints(&self, indices: &[u32], bodies: &BodyManager) -> bool {
        self.for_each_locked(indices, bodies, |constraint, body1, body2| {
            constraint.solve_position(body1, body2, &self.settings)
        })
    }

    /// Write the accumulated impulses of every constraint back to the write
    /// cache for next step's warm start.
    pub fn store_applied_impulses(&mut self) {
        let write = self.cache.write_mut();
        for constraint in &mut self.buffer.constraints {
            let constraint = constraint.get_mut();
            let manifold = write.manifold_mut(constraint.manifold_index());
            constraint.store_applied_impulses(&mut manifold.points);
        }
    }

    /// End the step: report manifolds of last step that were not found again
    /// and swap the cache buffers.
    pub fn finalize_contact_cache(&mut self, listener: &dyn ContactListener) {
        let mut num_removed = 0_usize;
        for manifold in self.cache.read().manifolds() {
            if !manifold.persisted {
                listener.on_contact_removed(&manifold.key);
                num_removed += 1;
            }
        }

        let write = self.cache.write();
        debug!(
            body_pairs = write.num_body_pairs(),
            manifolds = write.num_manifolds(),
            constraints = self.buffer.constraints.len(),
            removed = num_removed,
            "contact cache finalized"
        );
        self.cache.swap();
    }

    /// True if the two bodies had at least one manifold in the last finished
    /// step.
    #[must_use]
    pub fn were_bodies_in_contact(&self, a: BodyId, b: BodyId) -> bool {
        self.cache
            .read()
            .find_body_pair(&BodyPairKey::new(a, b))
            .is_some_and(|pair| pair.first_manifold != NO_MANIFOLD)
    }
}

impl SplitContacts for ContactConstraintManager {
    fn contact_bodies(&self, contact_index: u32) -> (BodyId, BodyId) {
        self.buffer.constraints[contact_index as usize].lock().body_ids()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;
    use sim_types::{BodyCreationSettings, MotionType};
    use std::cell::RefCell;

    const DT: f64 = 1.0 / 60.0;

    #[derive(Default)]
    struct Recorder {
        added: RefCell<u32>,
        persisted: RefCell<u32>,
        removed: RefCell<Vec<SubShapeIdPair>>,
        validate: Option<ValidateResult>,
        make_sensor: bool,
    }

    impl ContactListener for Recorder {
        fn on_contact_validate(&self, _: &Body, _: &Body, _: &ContactManifold) -> ValidateResult {
            self.validate.unwrap_or_default()
        }

        fn on_contact_added(
            &self,
            _: &Body,
            _: &Body,
            _: &ContactManifold,
            settings: &mut ContactSettings,
        ) {
            *self.added.borrow_mut() += 1;
            settings.is_sensor = self.make_sensor;
        }

        fn on_contact_persisted(
            &self,
            _: &Body,
            _: &Body,
            _: &ContactManifold,
            _: &mut ContactSettings,
        ) {
            *self.persisted.borrow_mut() += 1;
        }

        fn on_contact_removed(&self, pair: &SubShapeIdPair) {
            self.removed.borrow_mut().push(*pair);
        }
    }

    struct Scene {
        bodies: BodyManager,
        floor: BodyId,
        ball: BodyId,
        builder: IslandBuilder,
        manager: ContactConstraintManager,
    }

    fn scene(limits: PhysicsLimits) -> Scene {
        let mut bodies = BodyManager::new(4);
        let floor = bodies
            .create_body(&BodyCreationSettings::sphere(Point3::origin(), 1.0, MotionType::Static))
            .unwrap();
        let ball = bodies
            .create_body(&BodyCreationSettings::sphere(
                Point3::new(0.0, 0.0, 1.95),
                1.0,
                MotionType::Dynamic,
            ))
            .unwrap();
        Scene {
            bodies,
            floor,
            ball,
            builder: IslandBuilder::new(),
            manager: ContactConstraintManager::new(&PhysicsSettings::default(), &limits),
        }
    }

    fn manifold(sub_shape: u32) -> ContactManifold {
        let mut m = ContactManifold::single_point(
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(0.0, 0.0, 0.95),
            Vector3::z(),
        );
        m.sub_shape1 = SubShapeId(sub_shape);
        m
    }

    impl Scene {
        fn begin(&mut self) {
            self.builder = IslandBuilder::new();
            self.builder.prepare(self.bodies.active_bodies().len(), 0, 16);
            self.manager.prepare(DT);
        }

        fn narrow_phase(
            &mut self,
            manifolds: &[ContactManifold],
            listener: &dyn ContactListener,
        ) -> bool {
            let (body1, body2) = self.bodies.lock_pair(self.floor, self.ball).unwrap();
            self.manager
                .add_body_pair_contacts(&self.builder, &body1, &body2, manifolds, listener)
        }

        fn from_cache(&mut self, listener: &dyn ContactListener) -> CacheLookup {
            let (body1, body2) = self.bodies.lock_pair(self.floor, self.ball).unwrap();
            self.manager
                .get_contacts_from_cache(&self.builder, &body1, &body2, listener)
        }

        fn end(&mut self, listener: &dyn ContactListener) {
            self.manager.store_applied_impulses();
            self.manager.finalize_contact_cache(listener);
        }

        fn move_ball(&mut self, offset: Vector3<f64>, rotation: UnitQuaternion<f64>) {
            let ball = self.bodies.body_mut(self.ball).unwrap();
            let position = ball.position() + offset;
            ball.set_position_and_rotation(position, rotation);
        }
    }

    #[test]
    fn test_unmoved_pair_is_served_from_cache() {
        let listener = Recorder::default();
        let mut s = scene(PhysicsLimits::default());
        s.begin();
        assert!(s.narrow_phase(&[manifold(0)], &listener));
        s.end(&listener);
        assert_eq!(*listener.added.borrow(), 1);

        s.begin();
        let lookup = s.from_cache(&listener);
        assert!(lookup.pair_handled);
        assert!(lookup.constraint_created);
        assert_eq!(*listener.persisted.borrow(), 1);
        assert_eq!(s.manager.num_constraints(), 1);
        s.end(&listener);
        assert!(listener.removed.borrow().is_empty());
        assert!(s.manager.were_bodies_in_contact(s.ball, s.floor));
    }

    #[test]
    fn test_unfinished_step_is_discarded() {
        let listener = Recorder::default();
        let mut s = scene(PhysicsLimits::default());
        s.begin();
        s.narrow_phase(&[manifold(0)], &listener);
        s.end(&listener);

        // Found again, then the step is abandoned before finalize.
        s.begin();
        assert!(s.from_cache(&listener).pair_handled);
        assert_eq!(s.manager.cache().write().num_body_pairs(), 1);

        s.begin();
        assert_eq!(s.manager.cache().write().num_body_pairs(), 0);
        assert!(s.from_cache(&listener).pair_handled);
        s.end(&listener);
        assert_eq!(s.manager.cache().read().num_body_pairs(), 1);
        assert!(listener.removed.borrow().is_empty());

        // Abandoned again, then the ball leaves: the old manifold is removed.
        s.begin();
        s.from_cache(&listener);
        s.begin();
        s.end(&listener);
        assert_eq!(listener.removed.borrow().len(), 1);
        assert!(!s.manager.were_bodies_in_contact(s.ball, s.floor));
    }

    #[test]
    fn test_moved_pair_misses_cache() {
        let listener = Recorder::default();
        let mut s = scene(PhysicsLimits::default());
        s.begin();
        s.narrow_phase(&[manifold(0)], &listener);
        s.end(&listener);

        // 0.5 mm is inside the 1 mm threshold.
        s.move_ball(Vector3::new(0.0005, 0.0, 0.0), UnitQuaternion::identity());
        s.begin();
        assert!(s.from_cache(&listener).pair_handled);
        s.end(&listener);

        // 2 mm from the cached transform is not.
        s.move_ball(Vector3::new(0.0015, 0.0, 0.0), UnitQuaternion::identity());
        s.begin();
        assert_eq!(s.from_cache(&listener), CacheLookup::default());
    }

    #[test]
    fn test_rotated_pair_misses_cache() {
        let listener = Recorder::default();
        let mut s = scene(PhysicsLimits::default());
        s.begin();
        s.narrow_phase(&[manifold(0)], &listener);
        s.end(&listener);

        // Threshold is cos(1 degree) on the half angle: 1.5 degrees passes.
        let small = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 1.5_f64.to_radians());
        s.move_ball(Vector3::zeros(), small);
        s.begin();
        assert!(s.from_cache(&listener).pair_handled);
        s.end(&listener);

        let large = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 3.0_f64.to_radians());
        s.move_ball(Vector3::zeros(), large);
        s.begin();
        assert!(!s.from_cache(&listener).pair_handled);
    }

    #[test]
    fn test_cache_disabled() {
        let listener = Recorder::default();
        let mut s = scene(PhysicsLimits::default());
        s.manager
            .set_settings(&PhysicsSettings::default().without_body_pair_cache());
        s.begin();
        s.narrow_phase(&[manifold(0)], &listener);
        s.end(&listener);
        s.begin();
        assert!(!s.from_cache(&listener).pair_handled);
    }

    #[test]
    fn test_lambdas_carried_to_new_manifold() {
        let listener = Recorder::default();
        let mut s = scene(PhysicsLimits::default());
        s.begin();
        s.narrow_phase(&[manifold(0)], &listener);
        {
            let mut c = s.manager.buffer.constraints[0].lock();
            let (mut b1, mut b2) = s.bodies.lock_pair(s.floor, s.ball).unwrap();
            b2.set_linear_velocity(Vector3::new(0.0, 0.0, -1.0));
            c.solve_velocity(&mut b1, &mut b2);
        }
        s.end(&listener);

        // The narrow phase runs again (e.g. cache disabled): same sub shapes.
        s.begin();
        s.narrow_phase(&[manifold(0)], &listener);
        assert_eq!(*listener.persisted.borrow(), 1);
        let c = s.manager.constraint(0).unwrap();
        assert_relative_eq!(c.points()[0].non_penetration.total_lambda(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_removed_contact_is_reported() {
        let listener = Recorder::default();
        let mut s = scene(PhysicsLimits::default());
        s.begin();
        s.narrow_phase(&[manifold(0), manifold(1)], &listener);
        s.end(&listener);

        s.begin();
        s.narrow_phase(&[manifold(1)], &listener);
        s.end(&listener);

        let removed = listener.removed.borrow();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].sub_shape1, SubShapeId(0));
    }

    #[test]
    fn test_validate_rejects() {
        let mut s = scene(PhysicsLimits::default());
        let reject_all = Recorder {
            validate: Some(ValidateResult::RejectAllContactsForThisBodyPair),
            ..Recorder::default()
        };
        s.begin();
        assert!(!s.narrow_phase(&[manifold(0), manifold(1)], &reject_all));
        assert_eq!(s.manager.cache().write().num_manifolds(), 0);
        // The body pair itself is still cached.
        assert_eq!(s.manager.cache().write().num_body_pairs(), 1);

        let reject_one = Recorder {
            validate: Some(ValidateResult::RejectContact),
            ..Recorder::default()
        };
        s.begin();
        s.manager.cache.write_mut().prepare(0, 0);
        assert!(!s.narrow_phase(&[manifold(0)], &reject_one));
    }

    #[test]
    fn test_sensor_is_cached_without_constraint() {
        let mut s = scene(PhysicsLimits::default());
        let listener = Recorder {
            make_sensor: true,
            ..Recorder::default()
        };
        s.begin();
        assert!(!s.narrow_phase(&[manifold(0)], &listener));
        assert_eq!(s.manager.num_constraints(), 0);
        assert_eq!(s.manager.cache().write().num_manifolds(), 1);
    }

    #[test]
    fn test_capacity_errors() {
        let listener = Recorder::default();
        let mut s = scene(PhysicsLimits {
            max_manifolds: 2,
            max_contact_constraints: 1,
            ..PhysicsLimits::default()
        });
        s.begin();
        s.narrow_phase(&[manifold(0), manifold(1), manifold(2)], &listener);
        assert_eq!(s.manager.num_constraints(), 1);
        assert!(s.manager.errors().contains(StepErrors::CONTACT_CONSTRAINTS_FULL));
        assert!(s.manager.errors().contains(StepErrors::MANIFOLD_CACHE_FULL));

        s.begin();
        assert_eq!(s.manager.errors(), StepErrors::NONE);
    }

    #[test]
    fn test_sort_contacts_by_key() {
        let listener = Recorder::default();
        let mut s = scene(PhysicsLimits::default());
        s.begin();
        s.narrow_phase(&[manifold(5), manifold(2), manifold(9)], &listener);
        let mut order = vec![0, 1, 2];
        s.manager.sort_contacts(&mut order);
        assert_eq!(order, vec![1, 0, 2]);
        assert_eq!(s.manager.contact_bodies(0), (s.floor, s.ball));
    }

    #[test]
    fn test_contacts_link_islands() {
        let listener = Recorder::default();
        let mut s = scene(PhysicsLimits::default());
        s.begin();
        s.narrow_phase(&[manifold(0)], &listener);
        let mut arena = sim_types::StepArena::new(64);
        s.builder
            .finalize(&mut arena, &s.bodies, &[], 1, &PhysicsSettings::default())
            .unwrap();
        assert_eq!(s.builder.num_islands(), 1);
        let island = s.builder.island(&arena, 0);
        assert_eq!(arena.slice(island.contacts), &[0]);
    }
}
