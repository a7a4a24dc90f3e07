//! Rigid bodies and the body manager.
//!
//! Bodies are stored in fixed slots addressed by [`BodyId`]. Every slot sits
//! behind its own `parking_lot::Mutex` so that solver workers can lock the two
//! bodies of a constraint while other workers touch unrelated bodies. Phases
//! that hold `&mut BodyManager` use `Mutex::get_mut` and never lock.

use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};
use parking_lot::{Mutex, MutexGuard};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Aabb, BroadPhaseLayer, CollisionLayer, Result, SimError};

/// Identifier of a body: a slot index plus a sequence number that changes
/// every time the slot is reused.
///
/// The ordering is total and is used as the tie-break for canonical pair keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BodyId(u32);

impl BodyId {
    /// Sentinel for "no body".
    pub const INVALID: Self = Self(u32::MAX);
    /// Largest slot index that can be encoded.
    pub const MAX_INDEX: u32 = (1 << 23) - 1;

    const SEQUENCE_SHIFT: u32 = 23;

    /// Create a body ID from a slot index and a sequence number.
    #[must_use]
    pub const fn new(index: u32, sequence: u8) -> Self {
        Self((index & Self::MAX_INDEX) | ((sequence as u32) << Self::SEQUENCE_SHIFT))
    }

    /// Slot index of the body.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 & Self::MAX_INDEX
    }

    /// Sequence number of the slot when the body was created.
    #[must_use]
    pub const fn sequence(self) -> u8 {
        ((self.0 >> Self::SEQUENCE_SHIFT) & 0xff) as u8
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// True unless this is [`BodyId::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl std::fmt::Display for BodyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "Body({}:{})", self.index(), self.sequence())
        } else {
            write!(f, "Body(invalid)")
        }
    }
}

/// How a body participates in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MotionType {
    /// Never moves; infinite mass.
    Static,
    /// Moved by its velocity only; infinite mass, never affected by impulses.
    Kinematic,
    /// Fully simulated.
    Dynamic,
}

impl MotionType {
    /// True for kinematic and dynamic bodies.
    #[must_use]
    pub const fn can_move(self) -> bool {
        !matches!(self, Self::Static)
    }
}

/// Mass properties of a rigid body.
///
/// Contains mass and inertia tensor about the center of mass.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MassProperties {
    /// Total mass in kg.
    pub mass: f64,
    /// Inertia tensor about center of mass in local coordinates (kg·m²).
    pub inertia: Matrix3<f64>,
}

impl MassProperties {
    /// Create mass properties with given values.
    #[must_use]
    pub const fn new(mass: f64, inertia: Matrix3<f64>) -> Self {
        Self { mass, inertia }
    }

    /// Create mass properties for a uniform sphere.
    ///
    /// Inertia of a solid sphere: I = (2/5) * m * r²
    #[must_use]
    pub fn sphere(mass: f64, radius: f64) -> Self {
        let i = 0.4 * mass * radius * radius;
        Self {
            mass,
            inertia: Matrix3::from_diagonal(&Vector3::new(i, i, i)),
        }
    }

    /// Create mass properties for a uniform box.
    ///
    /// Inertia of a solid box with dimensions (x, y, z):
    /// - Ixx = (1/12) * m * (y² + z²)
    /// - Iyy = (1/12) * m * (x² + z²)
    /// - Izz = (1/12) * m * (x² + y²)
    #[must_use]
    pub fn box_shape(mass: f64, half_extents: Vector3<f64>) -> Self {
        let x2 = 4.0 * half_extents.x * half_extents.x;
        let y2 = 4.0 * half_extents.y * half_extents.y;
        let z2 = 4.0 * half_extents.z * half_extents.z;

        Self {
            mass,
            inertia: Matrix3::from_diagonal(&Vector3::new(
                mass * (y2 + z2) / 12.0,
                mass * (x2 + z2) / 12.0,
                mass * (x2 + y2) / 12.0,
            )),
        }
    }

    /// Get the inverse mass (0 if mass is infinite/static).
    #[must_use]
    pub fn inverse_mass(&self) -> f64 {
        if self.mass <= 0.0 || self.mass.is_infinite() {
            0.0
        } else {
            1.0 / self.mass
        }
    }

    /// Get the inverse inertia tensor, zero when singular.
    #[must_use]
    pub fn inverse_inertia(&self) -> Matrix3<f64> {
        self.inertia.try_inverse().unwrap_or_else(Matrix3::zeros)
    }

    /// Validate that the mass properties are physically valid.
    pub fn validate(&self) -> Result<()> {
        if self.mass <= 0.0 || !self.mass.is_finite() {
            return Err(SimError::invalid_mass(
                "mass must be positive and finite",
            ));
        }

        let eigenvalues = self.inertia.symmetric_eigenvalues();
        if eigenvalues.iter().any(|&e| e < -1e-10) {
            return Err(SimError::invalid_mass(
                "inertia tensor must be positive semi-definite",
            ));
        }

        Ok(())
    }
}

/// Velocity state and solver-facing mass data of a body.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MotionProperties {
    /// Linear velocity of the center of mass (m/s).
    pub linear_velocity: Vector3<f64>,
    /// Angular velocity (rad/s).
    pub angular_velocity: Vector3<f64>,
    inverse_mass: f64,
    inverse_inertia_local: Matrix3<f64>,
    num_velocity_steps_override: u32,
    num_position_steps_override: u32,
    active_index: u32,
}

impl MotionProperties {
    /// Marks a body that is not in the active body list.
    pub const INACTIVE_INDEX: u32 = u32::MAX;

    fn new(mass: &MassProperties, motion_type: MotionType) -> Self {
        let dynamic = motion_type == MotionType::Dynamic;
        Self {
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            inverse_mass: if dynamic { mass.inverse_mass() } else { 0.0 },
            inverse_inertia_local: if dynamic {
                mass.inverse_inertia()
            } else {
                Matrix3::zeros()
            },
            num_velocity_steps_override: 0,
            num_position_steps_override: 0,
            active_index: Self::INACTIVE_INDEX,
        }
    }

    /// Inverse mass, zero for non-dynamic bodies.
    #[must_use]
    pub fn inverse_mass(&self) -> f64 {
        self.inverse_mass
    }

    /// Inverse inertia in body space.
    #[must_use]
    pub fn inverse_inertia_local(&self) -> &Matrix3<f64> {
        &self.inverse_inertia_local
    }

    /// Requested velocity steps, 0 for the global default.
    #[must_use]
    pub fn num_velocity_steps_override(&self) -> u32 {
        self.num_velocity_steps_override
    }

    /// Requested position steps, 0 for the global default.
    #[must_use]
    pub fn num_position_steps_override(&self) -> u32 {
        self.num_position_steps_override
    }

    /// Index in the active body list, or [`Self::INACTIVE_INDEX`].
    #[must_use]
    pub fn active_index(&self) -> u32 {
        self.active_index
    }
}

/// Everything needed to create a body.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyCreationSettings {
    /// World-space center of mass.
    pub position: Point3<f64>,
    /// World-space orientation.
    pub rotation: UnitQuaternion<f64>,
    /// Motion type.
    pub motion_type: MotionType,
    /// Mass and inertia, ignored for non-dynamic bodies.
    pub mass: MassProperties,
    /// Bounds of the body's shape in body space.
    pub local_bounds: Aabb,
    /// Initial linear velocity.
    pub linear_velocity: Vector3<f64>,
    /// Initial angular velocity.
    pub angular_velocity: Vector3<f64>,
    /// Friction coefficient.
    pub friction: f64,
    /// Restitution coefficient.
    pub restitution: f64,
    /// Sensors detect contacts but never generate impulses.
    pub is_sensor: bool,
    /// Broad-phase layer the body lives in.
    pub broad_phase_layer: BroadPhaseLayer,
    /// Collision layer used for pair filtering.
    pub collision_layer: CollisionLayer,
    /// Velocity steps override, 0 for default.
    pub num_velocity_steps_override: u32,
    /// Position steps override, 0 for default.
    pub num_position_steps_override: u32,
    /// Opaque value for the narrow phase (e.g. a shape handle).
    pub user_data: u64,
}

impl BodyCreationSettings {
    /// A dynamic body with the given bounds half extents.
    #[must_use]
    pub fn new(position: Point3<f64>, half_extents: Vector3<f64>, motion_type: MotionType) -> Self {
        Self {
            position,
            rotation: UnitQuaternion::identity(),
            motion_type,
            mass: MassProperties::box_shape(1.0, half_extents),
            local_bounds: Aabb::from_center(Point3::origin(), half_extents),
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            friction: 0.2,
            restitution: 0.0,
            is_sensor: false,
            broad_phase_layer: BroadPhaseLayer(0),
            collision_layer: CollisionLayer(0),
            num_velocity_steps_override: 0,
            num_position_steps_override: 0,
            user_data: 0,
        }
    }

    /// A sphere-shaped body of the given radius.
    #[must_use]
    pub fn sphere(position: Point3<f64>, radius: f64, motion_type: MotionType) -> Self {
        let mut settings = Self::new(position, Vector3::new(radius, radius, radius), motion_type);
        settings.mass = MassProperties::sphere(1.0, radius);
        settings
    }

    /// Set mass properties.
    #[must_use]
    pub fn with_mass(mut self, mass: MassProperties) -> Self {
        self.mass = mass;
        self
    }

    /// Set the rotation.
    #[must_use]
    pub fn with_rotation(mut self, rotation: UnitQuaternion<f64>) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set the initial linear velocity.
    #[must_use]
    pub fn with_linear_velocity(mut self, velocity: Vector3<f64>) -> Self {
        self.linear_velocity = velocity;
        self
    }

    /// Set friction.
    #[must_use]
    pub fn with_friction(mut self, friction: f64) -> Self {
        self.friction = friction;
        self
    }

    /// Set restitution.
    #[must_use]
    pub fn with_restitution(mut self, restitution: f64) -> Self {
        self.restitution = restitution;
        self
    }

    /// Set both layers.
    #[must_use]
    pub fn with_layers(mut self, broad_phase: BroadPhaseLayer, collision: CollisionLayer) -> Self {
        self.broad_phase_layer = broad_phase;
        self.collision_layer = collision;
        self
    }

    /// Mark the body as a sensor.
    #[must_use]
    pub fn as_sensor(mut self) -> Self {
        self.is_sensor = true;
        self
    }

    /// Override solver step counts.
    #[must_use]
    pub fn with_step_overrides(mut self, velocity: u32, position: u32) -> Self {
        self.num_velocity_steps_override = velocity;
        self.num_position_steps_override = position;
        self
    }

    /// Attach user data.
    #[must_use]
    pub fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }
}

/// A rigid body.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    id: BodyId,
    motion_type: MotionType,
    position: Point3<f64>,
    rotation: UnitQuaternion<f64>,
    local_bounds: Aabb,
    world_bounds: Aabb,
    motion: MotionProperties,
    friction: f64,
    restitution: f64,
    is_sensor: bool,
    broad_phase_layer: BroadPhaseLayer,
    collision_layer: CollisionLayer,
    user_data: u64,
}

impl Body {
    fn from_settings(id: BodyId, settings: &BodyCreationSettings) -> Self {
        let mut motion = MotionProperties::new(&settings.mass, settings.motion_type);
        if settings.motion_type.can_move() {
            motion.linear_velocity = settings.linear_velocity;
            motion.angular_velocity = settings.angular_velocity;
        }
        motion.num_velocity_steps_override = settings.num_velocity_steps_override;
        motion.num_position_steps_override = settings.num_position_steps_override;

        let mut body = Self {
            id,
            motion_type: settings.motion_type,
            position: settings.position,
            rotation: settings.rotation,
            local_bounds: settings.local_bounds,
            world_bounds: settings.local_bounds,
            motion,
            friction: settings.friction,
            restitution: settings.restitution,
            is_sensor: settings.is_sensor,
            broad_phase_layer: settings.broad_phase_layer,
            collision_layer: settings.collision_layer,
            user_data: settings.user_data,
        };
        body.update_world_bounds();
        body
    }

    /// Body ID.
    #[must_use]
    pub fn id(&self) -> BodyId {
        self.id
    }

    /// Motion type.
    #[must_use]
    pub fn motion_type(&self) -> MotionType {
        self.motion_type
    }

    /// True for dynamic bodies.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.motion_type == MotionType::Dynamic
    }

    /// True for static bodies.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.motion_type == MotionType::Static
    }

    /// True when the body is in the active body list.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.motion.active_index != MotionProperties::INACTIVE_INDEX
    }

    /// True for sensors.
    #[must_use]
    pub fn is_sensor(&self) -> bool {
        self.is_sensor
    }

    /// World-space center of mass.
    #[must_use]
    pub fn position(&self) -> Point3<f64> {
        self.position
    }

    /// World-space rotation.
    #[must_use]
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.rotation
    }

    /// Teleport the body. Call [`Body::update_world_bounds`] (done here) and
    /// notify the broad phase afterwards.
    pub fn set_position_and_rotation(
        &mut self,
        position: Point3<f64>,
        rotation: UnitQuaternion<f64>,
    ) {
        self.position = position;
        self.rotation = rotation;
        self.update_world_bounds();
    }

    /// World-space bounding box.
    #[must_use]
    pub fn world_bounds(&self) -> Aabb {
        self.world_bounds
    }

    /// Bounding box of the shape in body space.
    #[must_use]
    pub fn local_bounds(&self) -> Aabb {
        self.local_bounds
    }

    /// Recompute the world-space bounds from the local bounds and transform.
    pub fn update_world_bounds(&mut self) {
        let rot = self.rotation.to_rotation_matrix();
        let center = self.position + rot * self.local_bounds.center().coords;
        let half = self.local_bounds.half_extents();
        let m = rot.matrix().abs();
        self.world_bounds = Aabb::from_center(center, m * half);
    }

    /// Motion properties.
    #[must_use]
    pub fn motion(&self) -> &MotionProperties {
        &self.motion
    }

    /// Mutable motion properties.
    pub fn motion_mut(&mut self) -> &mut MotionProperties {
        &mut self.motion
    }

    /// Inverse mass, zero for non-dynamic bodies.
    #[must_use]
    pub fn inverse_mass(&self) -> f64 {
        self.motion.inverse_mass
    }

    /// World-space inverse inertia: `R * I⁻¹ * Rᵀ`.
    #[must_use]
    pub fn inverse_inertia(&self) -> Matrix3<f64> {
        if !self.is_dynamic() {
            return Matrix3::zeros();
        }
        let r = self.rotation.to_rotation_matrix();
        r.matrix() * self.motion.inverse_inertia_local * r.matrix().transpose()
    }

    /// Linear velocity.
    #[must_use]
    pub fn linear_velocity(&self) -> Vector3<f64> {
        self.motion.linear_velocity
    }

    /// Angular velocity.
    #[must_use]
    pub fn angular_velocity(&self) -> Vector3<f64> {
        self.motion.angular_velocity
    }

    /// Set linear velocity. Ignored for static bodies.
    pub fn set_linear_velocity(&mut self, velocity: Vector3<f64>) {
        if self.motion_type.can_move() {
            self.motion.linear_velocity = velocity;
        }
    }

    /// Set angular velocity. Ignored for static bodies.
    pub fn set_angular_velocity(&mut self, velocity: Vector3<f64>) {
        if self.motion_type.can_move() {
            self.motion.angular_velocity = velocity;
        }
    }

    /// Velocity of a world-space point attached to the body.
    #[must_use]
    pub fn point_velocity(&self, point: &Point3<f64>) -> Vector3<f64> {
        self.motion.linear_velocity + self.motion.angular_velocity.cross(&(point - self.position))
    }

    /// Friction coefficient.
    #[must_use]
    pub fn friction(&self) -> f64 {
        self.friction
    }

    /// Restitution coefficient.
    #[must_use]
    pub fn restitution(&self) -> f64 {
        self.restitution
    }

    /// Broad-phase layer.
    #[must_use]
    pub fn broad_phase_layer(&self) -> BroadPhaseLayer {
        self.broad_phase_layer
    }

    /// Collision layer.
    #[must_use]
    pub fn collision_layer(&self) -> CollisionLayer {
        self.collision_layer
    }

    /// Change both layers. The broad phase must be notified.
    pub fn set_layers(&mut self, broad_phase: BroadPhaseLayer, collision: CollisionLayer) {
        self.broad_phase_layer = broad_phase;
        self.collision_layer = collision;
    }

    /// User data.
    #[must_use]
    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Move the center of mass by `delta` (position solver).
    pub fn add_position_step(&mut self, delta: &Vector3<f64>) {
        self.position += delta;
    }

    /// Move the center of mass by `-delta` (position solver).
    pub fn sub_position_step(&mut self, delta: &Vector3<f64>) {
        self.position -= delta;
    }

    /// Rotate by the small rotation vector `delta` (position solver).
    pub fn add_rotation_step(&mut self, delta: &Vector3<f64>) {
        let angle = delta.norm();
        if angle > 1.0e-9 {
            let q = UnitQuaternion::from_scaled_axis(*delta);
            self.rotation = UnitQuaternion::new_normalize((q * self.rotation).into_inner());
        }
    }

    /// Rotate by `-delta` (position solver).
    pub fn sub_rotation_step(&mut self, delta: &Vector3<f64>) {
        self.add_rotation_step(&-delta);
    }

    /// Advance position and rotation by the current velocities.
    pub fn integrate_position(&mut self, dt: f64) {
        if !self.motion_type.can_move() {
            return;
        }
        self.position += self.motion.linear_velocity * dt;
        self.add_rotation_step(&(self.motion.angular_velocity * dt));
    }
}

/// Owner of all bodies and of the active body list.
#[derive(Debug)]
pub struct BodyManager {
    bodies: Vec<Option<Mutex<Body>>>,
    sequences: Vec<u8>,
    free_slots: Vec<u32>,
    active_bodies: Vec<BodyId>,
    max_bodies: usize,
}

impl BodyManager {
    /// Create a manager that can hold up to `max_bodies` bodies.
    #[must_use]
    pub fn new(max_bodies: usize) -> Self {
        Self {
            bodies: Vec::with_capacity(max_bodies),
            sequences: Vec::with_capacity(max_bodies),
            free_slots: Vec::new(),
            active_bodies: Vec::with_capacity(max_bodies),
            max_bodies,
        }
    }

    /// Maximum number of bodies.
    #[must_use]
    pub fn max_bodies(&self) -> usize {
        self.max_bodies
    }

    /// Number of live bodies.
    #[must_use]
    pub fn num_bodies(&self) -> usize {
        self.bodies.len() - self.free_slots.len()
    }

    /// Create a body. Moving bodies are activated immediately.
    pub fn create_body(&mut self, settings: &BodyCreationSettings) -> Result<BodyId> {
        let index = if let Some(index) = self.free_slots.pop() {
            index
        } else {
            if self.bodies.len() >= self.max_bodies {
                return Err(SimError::capacity_exceeded(
                    "bodies",
                    self.bodies.len() + 1,
                    self.max_bodies,
                ));
            }
            let index = u32::try_from(self.bodies.len()).map_err(|_| {
                SimError::capacity_exceeded("bodies", self.bodies.len(), self.max_bodies)
            })?;
            self.bodies.push(None);
            self.sequences.push(0);
            index
        };

        let slot = index as usize;
        let id = BodyId::new(index, self.sequences[slot]);
        self.bodies[slot] = Some(Mutex::new(Body::from_settings(id, settings)));
        if settings.motion_type.can_move() {
            self.activate_body(id)?;
        }
        Ok(id)
    }

    /// Destroy a body and return its final state. The caller removes it from
    /// the broad phase first.
    pub fn destroy_body(&mut self, id: BodyId) -> Result<Body> {
        self.deactivate_body(id)?;
        let slot = id.index() as usize;
        let body = self.bodies[slot]
            .take()
            .ok_or(SimError::InvalidBodyId(id))?
            .into_inner();
        self.sequences[slot] = self.sequences[slot].wrapping_add(1);
        self.free_slots.push(id.index());
        Ok(body)
    }

    /// Add a moving body to the active list. No-op for static bodies and for
    /// bodies that are already active.
    pub fn activate_body(&mut self, id: BodyId) -> Result<()> {
        let next_index = u32::try_from(self.active_bodies.len()).map_err(|_| {
            SimError::capacity_exceeded("active bodies", self.active_bodies.len(), self.max_bodies)
        })?;
        let body = self.body_mut(id).ok_or(SimError::InvalidBodyId(id))?;
        if !body.motion_type.can_move() || body.is_active() {
            return Ok(());
        }
        body.motion.active_index = next_index;
        self.active_bodies.push(id);
        Ok(())
    }

    /// Remove a body from the active list, patching the index of the body
    /// swapped into its place.
    pub fn deactivate_body(&mut self, id: BodyId) -> Result<()> {
        let body = self.body_mut(id).ok_or(SimError::InvalidBodyId(id))?;
        let index = body.motion.active_index;
        if index == MotionProperties::INACTIVE_INDEX {
            return Ok(());
        }
        body.motion.active_index = MotionProperties::INACTIVE_INDEX;
        self.active_bodies.swap_remove(index as usize);
        if let Some(&moved) = self.active_bodies.get(index as usize) {
            if let Some(moved_body) = self.body_mut(moved) {
                moved_body.motion.active_index = index;
            }
        }
        Ok(())
    }

    /// Bodies that are simulated this step, indexed by active index.
    #[must_use]
    pub fn active_bodies(&self) -> &[BodyId] {
        &self.active_bodies
    }

    fn slot(&self, id: BodyId) -> Option<&Mutex<Body>> {
        let slot = id.index() as usize;
        if self.sequences.get(slot).copied() != Some(id.sequence()) {
            return None;
        }
        self.bodies.get(slot)?.as_ref()
    }

    /// True if `id` refers to a live body.
    #[must_use]
    pub fn contains(&self, id: BodyId) -> bool {
        self.slot(id).is_some()
    }

    /// Lock a single body.
    #[must_use]
    pub fn lock(&self, id: BodyId) -> Option<MutexGuard<'_, Body>> {
        self.slot(id).map(Mutex::lock)
    }

    /// Lock two distinct bodies, always in slot order so that concurrent
    /// callers cannot deadlock. Returns the guards in argument order.
    #[must_use]
    pub fn lock_pair(
        &self,
        a: BodyId,
        b: BodyId,
    ) -> Option<(MutexGuard<'_, Body>, MutexGuard<'_, Body>)> {
        debug_assert_ne!(a.index(), b.index(), "cannot lock a body pair with itself");
        let slot_a = self.slot(a)?;
        let slot_b = self.slot(b)?;
        if a.index() < b.index() {
            let guard_a = slot_a.lock();
            let guard_b = slot_b.lock();
            Some((guard_a, guard_b))
        } else {
            let guard_b = slot_b.lock();
            let guard_a = slot_a.lock();
            Some((guard_a, guard_b))
        }
    }

    /// Exclusive access without locking.
    pub fn body_mut(&mut self, id: BodyId) -> Option<&mut Body> {
        let slot = id.index() as usize;
        if self.sequences.get(slot).copied() != Some(id.sequence()) {
            return None;
        }
        self.bodies.get_mut(slot)?.as_mut().map(Mutex::get_mut)
    }

    /// Iterate over every live body with exclusive access.
    pub fn bodies_mut(&mut self) -> impl Iterator<Item = &mut Body> {
        self.bodies.iter_mut().flatten().map(Mutex::get_mut)
    }
}
