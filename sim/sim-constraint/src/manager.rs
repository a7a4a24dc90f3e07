//! Registry of non-contact constraints and the per-step batch operations on
//! them.

use std::sync::Arc;

use parking_lot::Mutex;
use sim_types::{BodyManager, LockType, MutexLock, PhysicsLockContext};
use tracing::debug;

use crate::{ConstraintRef, IslandBuilder};

/// Owns the list of constraints added to the simulation.
///
/// The list is guarded by a [`LockType::ConstraintsArray`] lock; the batch
/// operations (`setup_*`, `warm_start_*`, `solve_*`) run on the step's active
/// list and take no registry lock.
#[derive(Debug, Default)]
pub struct ConstraintManager {
    constraints: Mutex<Vec<ConstraintRef>>,
}

impl ConstraintManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered constraints.
    #[must_use]
    pub fn num_constraints(&self, ctx: &PhysicsLockContext) -> usize {
        MutexLock::new(ctx, &self.constraints, LockType::ConstraintsArray).len()
    }

    /// Register constraints. Each constraint's index is set to its slot.
    pub fn add(&self, ctx: &PhysicsLockContext, constraints: &[ConstraintRef]) {
        let mut list = MutexLock::new(ctx, &self.constraints, LockType::ConstraintsArray);
        for constraint in constraints {
            let index = u32::try_from(list.len()).unwrap_or(u32::MAX);
            constraint.lock().set_constraint_index(index);
            list.push(Arc::clone(constraint));
        }
        debug!(added = constraints.len(), total = list.len(), "constraints added");
    }

    /// Unregister constraints. The last constraint is moved into each freed
    /// slot and its index updated.
    pub fn remove(&self, ctx: &PhysicsLockContext, constraints: &[ConstraintRef]) {
        let mut list = MutexLock::new(ctx, &self.constraints, LockType::ConstraintsArray);
        for constraint in constraints {
            let index = {
                let mut guard = constraint.lock();
                let index = guard.constraint_index();
                guard.set_constraint_index(u32::MAX);
                index as usize
            };
            if index >= list.len() || !Arc::ptr_eq(&list[index], constraint) {
                continue;
            }
            list.swap_remove(index);
            if let Some(moved) = list.get(index) {
                moved.lock().set_constraint_index(index as u32);
            }
        }
    }

    /// Snapshot of all registered constraints.
    #[must_use]
    pub fn constraints(&self, ctx: &PhysicsLockContext) -> Vec<ConstraintRef> {
        MutexLock::new(ctx, &self.constraints, LockType::ConstraintsArray).clone()
    }

    /// Constraints that must be solved this step, in registry order.
    #[must_use]
    pub fn active_constraints(
        &self,
        ctx: &PhysicsLockContext,
        bodies: &BodyManager,
    ) -> Vec<ConstraintRef> {
        let list = MutexLock::new(ctx, &self.constraints, LockType::ConstraintsArray);
        list.iter()
            .filter(|constraint| constraint.lock().is_active(bodies))
            .cloned()
            .collect()
    }

    /// Link the bodies of every active constraint. The index passed to the
    /// builder is the position in `active`.
    pub fn build_islands(active: &[ConstraintRef], builder: &IslandBuilder, bodies: &BodyManager) {
        for (index, constraint) in active.iter().enumerate() {
            constraint
                .lock()
                .build_islands(index as u32, builder, bodies);
        }
    }

    /// Order indices into `active` by priority, then registry index.
    pub fn sort_constraints(active: &[ConstraintRef], indices: &mut [u32]) {
        let mut keyed: Vec<(u32, u32, u32)> = indices
            .iter()
            .map(|&i| {
                let constraint = active[i as usize].lock();
                (constraint.priority(), constraint.constraint_index(), i)
            })
            .collect();
        keyed.sort_unstable();
        for (slot, (_, _, i)) in indices.iter_mut().zip(keyed) {
            *slot = i;
        }
    }

    /// Prepare the constraints referenced by `indices` for this step.
    pub fn setup_velocity_constraints(
        active: &[ConstraintRef],
        indices: &[u32],
        bodies: &BodyManager,
        dt: f64,
    ) {
        for &i in indices {
            active[i as usize].lock().setup_velocity_constraint(bodies, dt);
        }
    }

    /// Apply scaled impulses of the previous step.
    pub fn warm_start_velocity_constraints(
        active: &[ConstraintRef],
        indices: &[u32],
        bodies: &BodyManager,
        ratio: f64,
    ) {
        for &i in indices {
            active[i as usize]
                .lock()
                .warm_start_velocity_constraint(bodies, ratio);
        }
    }

    /// One velocity iteration. Returns true if any impulse was applied.
    pub fn solve_velocity_constraints(
        active: &[ConstraintRef],
        indices: &[u32],
        bodies: &BodyManager,
        dt: f64,
    ) -> bool {
        let mut any_impulse = false;
        for &i in indices {
            any_impulse |= active[i as usize]
                .lock()
                .solve_velocity_constraint(bodies, dt);
        }
        any_impulse
    }

    /// One position iteration. Returns true if any body was moved.
    pub fn solve_position_constraints(
        active: &[ConstraintRef],
        indices: &[u32],
        bodies: &BodyManager,
        dt: f64,
        baumgarte: f64,
    ) -> bool {
        let mut any_impulse = false;
        for &i in indices {
            any_impulse |= active[i as usize]
                .lock()
                .solve_position_constraint(bodies, dt, baumgarte);
        }
        any_impulse
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::{DistanceConstraint, constraint_ref};
    use nalgebra::Point3;
    use sim_types::{BodyCreationSettings, BodyId, MotionType};

    fn bodies(n: u32) -> (BodyManager, Vec<BodyId>) {
        let mut bodies = BodyManager::new(n as usize);
        let ids = (0..n)
            .map(|i| {
                bodies
                    .create_body(&BodyCreationSettings::sphere(
                        Point3::new(f64::from(i), 0.0, 0.0),
                        0.25,
                        MotionType::Dynamic,
                    ))
                    .unwrap()
            })
            .collect();
        (bodies, ids)
    }

    fn rod(a: BodyId, b: BodyId) -> ConstraintRef {
        constraint_ref(DistanceConstraint::new(a, Point3::origin(), b, Point3::origin(), 1.0))
    }

    #[test]
    fn test_remove_fixes_up_moved_index() {
        let ctx = PhysicsLockContext::new();
        let (_, ids) = bodies(4);
        let manager = ConstraintManager::new();
        let c0 = rod(ids[0], ids[1]);
        let c1 = rod(ids[1], ids[2]);
        let c2 = rod(ids[2], ids[3]);
        manager.add(&ctx, &[c0.clone(), c1.clone(), c2.clone()]);
        assert_eq!(c2.lock().constraint_index(), 2);

        manager.remove(&ctx, &[c0.clone()]);
        assert_eq!(manager.num_constraints(&ctx), 2);
        assert_eq!(c2.lock().constraint_index(), 0);
        assert_eq!(c1.lock().constraint_index(), 1);
        assert_eq!(c0.lock().constraint_index(), u32::MAX);

        // Removing twice is a no-op.
        manager.remove(&ctx, &[c0]);
        assert_eq!(manager.num_constraints(&ctx), 2);
    }

    #[test]
    fn test_active_constraints_skip_disabled() {
        let ctx = PhysicsLockContext::new();
        let (bodies, ids) = bodies(3);
        let manager = ConstraintManager::new();
        let mut disabled =
            DistanceConstraint::new(ids[1], Point3::origin(), ids[2], Point3::origin(), 1.0);
        disabled.set_enabled(false);
        manager.add(&ctx, &[rod(ids[0], ids[1]), constraint_ref(disabled)]);

        let active = manager.active_constraints(&ctx, &bodies);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].lock().body_ids(), (ids[0], ids[1]));
    }

    #[test]
    fn test_sort_by_priority_then_index() {
        let ctx = PhysicsLockContext::new();
        let (_, ids) = bodies(4);
        let manager = ConstraintManager::new();
        let high = constraint_ref(
            DistanceConstraint::new(ids[0], Point3::origin(), ids[1], Point3::origin(), 1.0)
                .with_priority(5),
        );
        manager.add(&ctx, &[high, rod(ids[1], ids[2]), rod(ids[2], ids[3])]);

        let active = manager.constraints(&ctx);
        let mut order = vec![0, 1, 2];
        ConstraintManager::sort_constraints(&active, &mut order);
        assert_eq!(order, vec![1, 2, 0]);
    }
}
