//! Simulation islands.
//!
//! An island is a group of active dynamic bodies connected through contacts
//! or constraints. Islands never share a dynamic body, so they can be solved
//! concurrently without further synchronization.
//!
//! # Algorithm
//!
//! Every active body has an atomic `linked_to` index that starts out pointing
//! at itself. Linking two bodies follows both chains down to their lowest
//! index and points the higher root at the lower one with a compare-exchange,
//! retrying if another thread re-parented the root in between. Linking is
//! lock-free and safe to call from the narrow phase workers.
//!
//! [`IslandBuilder::finalize`] then assigns island indices (the root of each
//! chain is the lowest index of its island, so a single ascending pass
//! suffices), groups bodies, constraints and contacts per island with a
//! counting sort and orders islands largest first. All result buffers live in
//! the [`StepArena`].
//!
//! # Example
//!
//! ```
//! use nalgebra::Point3;
//! use sim_constraint::IslandBuilder;
//! use sim_types::{BodyCreationSettings, BodyManager, MotionType, PhysicsSettings, StepArena};
//!
//! let mut bodies = BodyManager::new(8);
//! for i in 0..4 {
//!     let position = Point3::new(f64::from(i), 0.0, 0.0);
//!     bodies
//!         .create_body(&BodyCreationSettings::sphere(position, 0.5, MotionType::Dynamic))
//!         .unwrap();
//! }
//! let mut arena = StepArena::new(64);
//! let mut builder = IslandBuilder::new();
//!
//! // Four active bodies: {0, 2} and {1, 3} are connected.
//! builder.prepare(4, 0, 2);
//! builder.link_contact(0, 2, 0);
//! builder.link_contact(1, 3, 1);
//! builder
//!     .finalize(&mut arena, &bodies, &[], 2, &PhysicsSettings::default())
//!     .unwrap();
//!
//! assert_eq!(builder.num_islands(), 2);
//! assert_eq!(builder.island_of_body(2), Some(0));
//! assert_eq!(builder.island_of_body(3), Some(1));
//! ```

use std::cmp::Reverse;
use std::sync::atomic::{AtomicU32, Ordering};

use sim_types::{BodyManager, IndexRange, MotionProperties, PhysicsSettings, Result, StepArena};
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{ConstraintRef, SolverStepsCalculator};

const INVALID: u32 = MotionProperties::INACTIVE_INDEX;

/// One island of the current step. Ranges index into the [`StepArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Island {
    /// Island index (before size ordering).
    pub index: u32,
    /// Active-body indices of the island's bodies.
    pub bodies: IndexRange,
    /// Indices into the step's active constraint list.
    pub constraints: IndexRange,
    /// Contact constraint indices.
    pub contacts: IndexRange,
    /// Velocity iterations for this island.
    pub num_velocity_steps: u32,
    /// Position iterations for this island.
    pub num_position_steps: u32,
}

impl Island {
    /// Number of bodies in this island.
    #[must_use]
    pub fn num_bodies(&self) -> u32 {
        self.bodies.len()
    }

    /// Number of non-contact constraints in this island.
    #[must_use]
    pub fn num_constraints(&self) -> u32 {
        self.constraints.len()
    }

    /// Number of contact constraints in this island.
    #[must_use]
    pub fn num_contacts(&self) -> u32 {
        self.contacts.len()
    }

    /// Constraints plus contacts, the measure islands are sorted by.
    #[must_use]
    pub fn num_items(&self) -> u32 {
        self.num_constraints() + self.num_contacts()
    }
}

/// Statistics about island distribution.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IslandStatistics {
    /// Total number of islands.
    pub num_islands: usize,
    /// Maximum bodies in any island.
    pub max_bodies_per_island: usize,
    /// Maximum constraints in any island.
    pub max_constraints_per_island: usize,
    /// Maximum contacts in any island.
    pub max_contacts_per_island: usize,
    /// Average bodies per island.
    pub avg_bodies_per_island: f64,
}

#[derive(Debug)]
struct BodyLink {
    linked_to: AtomicU32,
    island_index: u32,
}

/// Arena ranges of one member kind grouped per island.
#[derive(Debug, Clone, Copy, Default)]
struct Grouped {
    items: IndexRange,
    ends: IndexRange,
}

impl Grouped {
    fn island_range(&self, arena: &StepArena, island: u32) -> IndexRange {
        let ends = arena.slice(self.ends);
        let island = island as usize;
        let begin = if island == 0 { 0 } else { ends[island - 1] };
        self.items.sub(begin, ends[island])
    }
}

/// Builds islands from body links, then groups constraints and contacts.
#[derive(Debug, Default)]
pub struct IslandBuilder {
    body_links: Vec<BodyLink>,
    constraint_links: Vec<AtomicU32>,
    contact_links: Vec<AtomicU32>,
    num_active_bodies: u32,
    num_islands: u32,
    bodies: Grouped,
    constraints: Grouped,
    contacts: Grouped,
    velocity_steps: IndexRange,
    position_steps: IndexRange,
    sorted: IndexRange,
    finalized: bool,
}

impl IslandBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset links for a new step.
    ///
    /// `max_contacts` bounds the contact indices that will be linked.
    pub fn prepare(
        &mut self,
        num_active_bodies: usize,
        num_constraints: usize,
        max_contacts: usize,
    ) {
        self.num_active_bodies = u32::try_from(num_active_bodies).unwrap_or(INVALID);
        self.body_links.clear();
        self.body_links.extend((0..self.num_active_bodies).map(|i| BodyLink {
            linked_to: AtomicU32::new(i),
            island_index: INVALID,
        }));
        reset_links(&mut self.constraint_links, num_constraints);
        reset_links(&mut self.contact_links, max_contacts);
        self.num_islands = 0;
        self.finalized = false;
    }

    /// Number of active bodies this step.
    #[must_use]
    pub fn num_active_bodies(&self) -> u32 {
        self.num_active_bodies
    }

    fn lowest_body_index(&self, index: u32) -> u32 {
        let mut index = index;
        loop {
            let next = self.body_links[index as usize].linked_to.load(Ordering::Relaxed);
            if next == index {
                return index;
            }
            index = next;
        }
    }

    /// Put two active bodies in the same island.
    ///
    /// Indices at or above the active body count (static, kinematic or
    /// inactive bodies) are ignored. Safe to call concurrently.
    pub fn link_bodies(&self, first: u32, second: u32) {
        if first >= self.num_active_bodies || second >= self.num_active_bodies {
            return;
        }

        let mut first_root = first;
        let mut second_root = second;
        loop {
            first_root = self.lowest_body_index(first_root);
            second_root = self.lowest_body_index(second_root);

            if first_root != second_root {
                // Always link the higher root to the lower. A root points at
                // itself; if it no longer does it was re-parented, so retry.
                let (high, low) = if first_root < second_root {
                    (second_root, first_root)
                } else {
                    (first_root, second_root)
                };
                let link = &self.body_links[high as usize].linked_to;
                if let Err(current) =
                    link.compare_exchange_weak(high, low, Ordering::Relaxed, Ordering::Relaxed)
                {
                    if high == first_root {
                        first_root = current;
                    } else {
                        second_root = current;
                    }
                    continue;
                }
            }

            // Shorten the chains of the bodies we started from.
            let lowest = first_root.min(second_root);
            self.body_links[first as usize]
                .linked_to
                .fetch_min(lowest, Ordering::Relaxed);
            self.body_links[second as usize]
                .linked_to
                .fetch_min(lowest, Ordering::Relaxed);
            return;
        }
    }

    /// Link the bodies of active constraint `index` and remember which
    /// island it belongs to.
    pub fn link_constraint(&self, index: u32, first: u32, second: u32) {
        self.link_bodies(first, second);
        if let Some(link) = self.constraint_links.get(index as usize) {
            link.store(first.min(second), Ordering::Relaxed);
        }
    }

    /// Link the bodies of contact constraint `index` and remember which
    /// island it belongs to.
    pub fn link_contact(&self, index: u32, first: u32, second: u32) {
        self.link_bodies(first, second);
        if let Some(link) = self.contact_links.get(index as usize) {
            link.store(first.min(second), Ordering::Relaxed);
        }
    }

    /// Assign island indices and build the per-island buffers.
    ///
    /// `active` is the step's active constraint list (the indices passed to
    /// [`IslandBuilder::link_constraint`] index into it) and `num_contacts`
    /// the number of contact constraints created.
    pub fn finalize(
        &mut self,
        arena: &mut StepArena,
        bodies: &BodyManager,
        active: &[ConstraintRef],
        num_contacts: u32,
        settings: &PhysicsSettings,
    ) -> Result<()> {
        debug_assert!(!self.finalized, "islands finalized twice");
        self.assign_island_indices();

        let num_islands = self.num_islands;
        let n = self.num_active_bodies;
        let body_members = (0..n).map(|i| (i, self.body_links[i as usize].island_index));
        let body_group = group_by_island(arena, num_islands, body_members)?;
        let constraint_group = group_by_island(
            arena,
            num_islands,
            self.linked_members(&self.constraint_links, active.len() as u32),
        )?;
        let contact_group = group_by_island(
            arena,
            num_islands,
            self.linked_members(&self.contact_links, num_contacts),
        )?;
        self.bodies = body_group;
        self.constraints = constraint_group;
        self.contacts = contact_group;

        self.velocity_steps = arena.alloc(num_islands as usize)?;
        self.position_steps = arena.alloc(num_islands as usize)?;
        for island in 0..num_islands {
            let mut steps = SolverStepsCalculator::new(settings);
            for &body_index in arena.slice(self.bodies.island_range(arena, island)) {
                let id = bodies.active_bodies().get(body_index as usize);
                if let Some(body) = id.and_then(|&id| bodies.lock(id)) {
                    steps.add_body(&body);
                }
            }
            for &constraint_index in arena.slice(self.constraints.island_range(arena, island)) {
                steps.add_constraint(&*active[constraint_index as usize].lock());
            }
            steps.finalize();
            arena.slice_mut(self.velocity_steps)[island as usize] = steps.num_velocity_steps();
            arena.slice_mut(self.position_steps)[island as usize] = steps.num_position_steps();
        }

        let sizes: Vec<Reverse<u32>> = (0..num_islands)
            .map(|island| {
                Reverse(
                    self.constraints.island_range(arena, island).len()
                        + self.contacts.island_range(arena, island).len(),
                )
            })
            .collect();
        self.sorted = arena.alloc(num_islands as usize)?;
        let sorted = arena.slice_mut(self.sorted);
        for (slot, island) in sorted.iter_mut().zip(0..) {
            *slot = island;
        }
        sorted.sort_unstable_by_key(|&island| (sizes[island as usize], island));

        self.finalized = true;
        debug!(
            num_islands,
            num_bodies = n,
            num_constraints = self.constraints.items.len(),
            num_contacts = self.contacts.items.len(),
            "islands built"
        );
        Ok(())
    }

    fn assign_island_indices(&mut self) {
        let mut num_islands = 0;
        for i in 0..self.num_active_bodies {
            let root = self.lowest_body_index(i);
            let island = if root == i {
                num_islands += 1;
                num_islands - 1
            } else {
                self.body_links[root as usize].island_index
            };
            let link = &mut self.body_links[i as usize];
            *link.linked_to.get_mut() = root;
            link.island_index = island;
        }
        self.num_islands = num_islands;
    }

    fn linked_members<'a>(
        &'a self,
        links: &'a [AtomicU32],
        count: u32,
    ) -> impl Iterator<Item = (u32, u32)> + Clone + 'a {
        links
            .iter()
            .take(count as usize)
            .zip(0..)
            .filter_map(move |(link, index)| {
                let body = link.load(Ordering::Relaxed);
                self.body_links
                    .get(body as usize)
                    .map(|body_link| (index, body_link.island_index))
            })
    }

    /// Number of islands found by the last [`IslandBuilder::finalize`].
    #[must_use]
    pub fn num_islands(&self) -> u32 {
        self.num_islands
    }

    /// Island of an active body.
    #[must_use]
    pub fn island_of_body(&self, active_index: u32) -> Option<u32> {
        let island = self.body_links.get(active_index as usize)?.island_index;
        (island != INVALID).then_some(island)
    }

    /// Island indices ordered by constraint plus contact count, largest
    /// first; ties keep the lower island index first.
    #[must_use]
    pub fn sorted_islands<'a>(&self, arena: &'a StepArena) -> &'a [u32] {
        if self.finalized { arena.slice(self.sorted) } else { &[] }
    }

    /// Describe island `index`.
    #[must_use]
    pub fn island(&self, arena: &StepArena, index: u32) -> Island {
        Island {
            index,
            bodies: self.bodies.island_range(arena, index),
            constraints: self.constraints.island_range(arena, index),
            contacts: self.contacts.island_range(arena, index),
            num_velocity_steps: arena.slice(self.velocity_steps)[index as usize],
            num_position_steps: arena.slice(self.position_steps)[index as usize],
        }
    }

    /// Distribution of the current islands.
    #[must_use]
    pub fn statistics(&self, arena: &StepArena) -> IslandStatistics {
        if self.num_islands == 0 || !self.finalized {
            return IslandStatistics::default();
        }
        let islands: Vec<Island> = (0..self.num_islands).map(|i| self.island(arena, i)).collect();
        IslandStatistics {
            num_islands: islands.len(),
            max_bodies_per_island: islands
                .iter()
                .map(|i| i.num_bodies() as usize)
                .max()
                .unwrap_or(0),
            max_constraints_per_island: islands
                .iter()
                .map(|i| i.num_constraints() as usize)
                .max()
                .unwrap_or(0),
            max_contacts_per_island: islands
                .iter()
                .map(|i| i.num_contacts() as usize)
                .max()
                .unwrap_or(0),
            avg_bodies_per_island: f64::from(self.num_active_bodies) / islands.len() as f64,
        }
    }

    /// Release the arena buffers, in reverse allocation order.
    pub fn reset(&mut self, arena: &mut StepArena) {
        if !self.finalized {
            return;
        }
        arena.free(self.sorted);
        arena.free(self.position_steps);
        arena.free(self.velocity_steps);
        for group in [self.contacts, self.constraints, self.bodies] {
            arena.free(group.ends);
            arena.free(group.items);
        }
        self.finalized = false;
        self.num_islands = 0;
    }
}

fn reset_links(links: &mut Vec<AtomicU32>, len: usize) {
    links.clear();
    links.resize_with(len, || AtomicU32::new(INVALID));
}

/// Counting sort of `(item, island)` pairs into an item buffer plus a buffer
/// of per-island end offsets.
fn group_by_island<I>(arena: &mut StepArena, num_islands: u32, members: I) -> Result<Grouped>
where
    I: Iterator<Item = (u32, u32)> + Clone,
{
    let total = members.clone().count();
    let items = arena.alloc(total)?;
    let ends = arena.alloc(num_islands as usize)?;
    let (item_slice, end_slice) = arena.slice_pair_mut(items, ends);

    for (_, island) in members.clone() {
        end_slice[island as usize] += 1;
    }
    let mut start = 0;
    for end in end_slice.iter_mut() {
        let count = *end;
        *end = start;
        start += count;
    }
    for (item, island) in members {
        let cursor = &mut end_slice[island as usize];
        item_slice[*cursor as usize] = item;
        *cursor += 1;
    }
    Ok(Grouped { items, ends })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::{DistanceConstraint, constraint_ref};
    use nalgebra::Point3;
    use sim_types::{BodyCreationSettings, BodyId, MotionType};

    fn dynamic_bodies(n: u32) -> (BodyManager, Vec<BodyId>) {
        let mut bodies = BodyManager::new(n as usize);
        let ids = (0..n)
            .map(|i| {
                bodies
                    .create_body(&BodyCreationSettings::sphere(
                        Point3::new(f64::from(i) * 3.0, 0.0, 0.0),
                        0.5,
                        MotionType::Dynamic,
                    ))
                    .unwrap()
            })
            .collect();
        (bodies, ids)
    }

    fn finalize(
        builder: &mut IslandBuilder,
        arena: &mut StepArena,
        bodies: &BodyManager,
        contacts: u32,
    ) {
        builder
            .finalize(arena, bodies, &[], contacts, &PhysicsSettings::default())
            .unwrap();
    }

    #[test]
    fn test_unlinked_bodies_form_single_islands() {
        let (bodies, _) = dynamic_bodies(3);
        let mut arena = StepArena::new(64);
        let mut builder = IslandBuilder::new();
        builder.prepare(3, 0, 0);
        finalize(&mut builder, &mut arena, &bodies, 0);

        assert_eq!(builder.num_islands(), 3);
        for i in 0..3 {
            let island = builder.island(&arena, i);
            assert_eq!(arena.slice(island.bodies), &[i]);
            assert_eq!(island.num_velocity_steps, 10);
        }
    }

    #[test]
    fn test_chain_links_transitively() {
        let (bodies, _) = dynamic_bodies(5);
        let mut arena = StepArena::new(64);
        let mut builder = IslandBuilder::new();
        builder.prepare(5, 0, 4);
        builder.link_contact(0, 4, 3);
        builder.link_contact(1, 3, 1);
        builder.link_contact(2, 1, 0);
        finalize(&mut builder, &mut arena, &bodies, 3);

        assert_eq!(builder.num_islands(), 2);
        let big = builder.island(&arena, builder.sorted_islands(&arena)[0]);
        assert_eq!(arena.slice(big.bodies), &[0, 1, 3, 4]);
        assert_eq!(arena.slice(big.contacts), &[0, 1, 2]);
        assert_eq!(builder.island_of_body(2), Some(1));
    }

    #[test]
    fn test_static_side_does_not_link() {
        let (bodies, _) = dynamic_bodies(2);
        let mut arena = StepArena::new(64);
        let mut builder = IslandBuilder::new();
        builder.prepare(2, 0, 2);
        builder.link_contact(0, 0, INVALID);
        builder.link_contact(1, INVALID, 1);
        finalize(&mut builder, &mut arena, &bodies, 2);

        assert_eq!(builder.num_islands(), 2);
        assert_eq!(arena.slice(builder.island(&arena, 0).contacts), &[0]);
        assert_eq!(arena.slice(builder.island(&arena, 1).contacts), &[1]);
    }

    #[test]
    fn test_islands_sorted_largest_first_with_index_ties() {
        let (bodies, _) = dynamic_bodies(6);
        let mut arena = StepArena::new(128);
        let mut builder = IslandBuilder::new();
        builder.prepare(6, 0, 8);
        // Island {0,1}: 1 contact, island {2,3}: 3 contacts, island {4,5}: 1 contact.
        builder.link_contact(0, 0, 1);
        builder.link_contact(1, 2, 3);
        builder.link_contact(2, 3, 2);
        builder.link_contact(3, 2, 3);
        builder.link_contact(4, 5, 4);
        finalize(&mut builder, &mut arena, &bodies, 5);

        assert_eq!(builder.sorted_islands(&arena), &[1, 0, 2]);
        let stats = builder.statistics(&arena);
        assert_eq!(stats.num_islands, 3);
        assert_eq!(stats.max_contacts_per_island, 3);
        assert_eq!(stats.avg_bodies_per_island, 2.0);
    }

    #[test]
    fn test_constraints_grouped_with_step_overrides() {
        let (bodies, ids) = dynamic_bodies(4);
        let active = vec![
            constraint_ref(
                DistanceConstraint::new(ids[2], Point3::origin(), ids[3], Point3::origin(), 3.0)
                    .with_step_overrides(25, 0),
            ),
            constraint_ref(DistanceConstraint::new(
                ids[0],
                Point3::origin(),
                ids[1],
                Point3::origin(),
                3.0,
            )),
        ];
        let mut arena = StepArena::new(128);
        let mut builder = IslandBuilder::new();
        builder.prepare(4, active.len(), 0);
        crate::ConstraintManager::build_islands(&active, &builder, &bodies);
        builder
            .finalize(&mut arena, &bodies, &active, 0, &PhysicsSettings::default())
            .unwrap();

        assert_eq!(builder.num_islands(), 2);
        let first = builder.island(&arena, 0);
        let second = builder.island(&arena, 1);
        assert_eq!(arena.slice(first.constraints), &[1]);
        assert_eq!(arena.slice(second.constraints), &[0]);
        assert_eq!(first.num_velocity_steps, 10);
        assert_eq!(second.num_velocity_steps, 25);
        assert_eq!(second.num_position_steps, 2);
    }

    #[test]
    fn test_concurrent_linking_matches_sequential() {
        use rayon::prelude::*;

        let n = 512_u32;
        let (bodies, _) = dynamic_bodies(n);
        let mut arena = StepArena::new(8 * 1024);
        let mut builder = IslandBuilder::new();
        builder.prepare(n as usize, 0, n as usize);
        // Pairs (i, i + 2) join all even and all odd bodies.
        (0..n - 2).into_par_iter().for_each(|i| builder.link_contact(i, i + 2, i));
        finalize(&mut builder, &mut arena, &bodies, n - 2);

        assert_eq!(builder.num_islands(), 2);
        for i in 0..n {
            assert_eq!(builder.island_of_body(i), Some(i % 2));
        }
    }

    #[test]
    fn test_reset_releases_arena() {
        let (bodies, _) = dynamic_bodies(3);
        let mut arena = StepArena::new(64);
        let mut builder = IslandBuilder::new();
        builder.prepare(3, 0, 1);
        builder.link_contact(0, 0, 1);
        finalize(&mut builder, &mut arena, &bodies, 1);
        assert!(arena.used() > 0);

        builder.reset(&mut arena);
        assert_eq!(arena.used(), 0);
        assert!(builder.sorted_islands(&arena).is_empty());
    }
}
