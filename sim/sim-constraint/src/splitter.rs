//! Splitting large islands into batches that can be solved in parallel.
//!
//! A large island is graph-colored into up to 31 parallel splits: within one
//! split no two contacts or constraints touch the same dynamic body, so all
//! items of a split can be solved concurrently. Items that do not fit in any
//! of the parallel splits, and splits that end up too small to be worth
//! sharing, go to a final non-parallel split that is solved by one thread.
//!
//! Splits are processed in order, one iteration at a time. Workers claim
//! batches of [`BATCH_SIZE`] items through a single 64-bit status word:
//!
//! ```text
//! bits 48..64  iteration (0 = warm start)
//! bits 32..48  split index
//! bits  0..32  next item to hand out
//! ```
//!
//! The worker that retires the last item of a split advances the status to
//! the next non-empty split (or the next iteration), which releases the
//! waiting workers.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use sim_types::{
    Body, BodyId, BodyManager, IndexRange, PhysicsSettings, Result, StepArena,
};
use tracing::{debug, trace};

use crate::{ConstraintRef, Island, IslandBuilder, SolverStepsCalculator};

/// Number of splits per island, including the non-parallel one.
pub const NUM_SPLITS: usize = 32;

/// Index of the split that is solved by a single thread.
pub const NON_PARALLEL_SPLIT_INDEX: u32 = NUM_SPLITS as u32 - 1;

/// Islands with at least this many constraints plus contacts are split.
pub const LARGE_ISLAND_THRESHOLD: u32 = 128;

/// Parallel splits with fewer items are merged into the non-parallel split.
pub const SPLIT_COMBINE_THRESHOLD: u32 = 32;

/// Items handed out per batch.
pub const BATCH_SIZE: u32 = 16;

const ITERATION_SHIFT: u32 = 48;
const SPLIT_SHIFT: u32 = 32;
const SPLIT_BITS: u64 = 0xffff;
const ITEM_MASK: u64 = 0xffff_ffff;

/// Body pairs of contact constraints, as seen by the splitter.
pub trait SplitContacts {
    /// The two bodies of contact constraint `contact_index`.
    fn contact_bodies(&self, contact_index: u32) -> (BodyId, BodyId);
}

/// Split-mask index of a body: only active dynamic bodies take part in
/// split assignment.
#[must_use]
pub fn split_body_index(body: &Body) -> Option<u32> {
    (body.is_dynamic() && body.is_active()).then(|| body.motion().active_index())
}

/// Per-body bit masks of the splits a body already appears in.
#[derive(Debug)]
pub struct SplitMasks<'a> {
    masks: &'a mut [u32],
}

impl<'a> SplitMasks<'a> {
    /// Wrap one mask word per active body.
    pub fn new(masks: &'a mut [u32]) -> Self {
        Self { masks }
    }

    /// Mask of an active body.
    #[must_use]
    pub fn mask(&self, active_index: u32) -> u32 {
        self.masks[active_index as usize]
    }

    /// Assign an item touching `first` and `second` (split-mask indices, see
    /// [`split_body_index`]) to the lowest split neither body is in yet.
    ///
    /// Returns [`NON_PARALLEL_SPLIT_INDEX`] when all parallel splits are
    /// taken.
    pub fn assign_split(&mut self, first: Option<u32>, second: Option<u32>) -> u32 {
        match (first, second) {
            (Some(a), Some(b)) => {
                let split = lowest_free_split(self.masks[a as usize] | self.masks[b as usize]);
                let bit = 1 << split;
                self.masks[a as usize] |= bit;
                self.masks[b as usize] |= bit;
                split
            }
            (Some(a), None) | (None, Some(a)) => {
                let split = lowest_free_split(self.masks[a as usize]);
                self.masks[a as usize] |= 1 << split;
                split
            }
            (None, None) => NON_PARALLEL_SPLIT_INDEX,
        }
    }

    /// [`SplitMasks::assign_split`] for two bodies looked up by id.
    pub fn assign_split_bodies(
        &mut self,
        bodies: &BodyManager,
        first: BodyId,
        second: BodyId,
    ) -> u32 {
        let index = |id| bodies.lock(id).and_then(|body| split_body_index(&body));
        let (first, second) = (index(first), index(second));
        self.assign_split(first, second)
    }

    /// Force an item touching `body` into the non-parallel split.
    pub fn assign_to_non_parallel_split(&mut self, body: Option<u32>) -> u32 {
        if let Some(index) = body {
            self.masks[index as usize] |= 1 << NON_PARALLEL_SPLIT_INDEX;
        }
        NON_PARALLEL_SPLIT_INDEX
    }
}

fn lowest_free_split(used: u32) -> u32 {
    (!used).trailing_zeros().min(NON_PARALLEL_SPLIT_INDEX)
}

/// Items of one split. Both ranges index into the splitter's item buffer in
/// the [`StepArena`]; contacts come first in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Split {
    /// Contact constraint indices.
    pub contacts: IndexRange,
    /// Active constraint indices.
    pub constraints: IndexRange,
}

impl Split {
    /// Constraints plus contacts.
    #[must_use]
    pub fn num_items(&self) -> u32 {
        self.contacts.len() + self.constraints.len()
    }
}

/// A batch handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitBatch {
    /// Index of the split island in [`LargeIslandSplitter::split_islands`].
    pub split_island: u32,
    /// Active constraint indices to solve, as an arena range.
    pub constraints: IndexRange,
    /// Contact constraint indices to solve, as an arena range.
    pub contacts: IndexRange,
    /// Iteration 0: warm start instead of solving.
    pub first_iteration: bool,
}

impl SplitBatch {
    /// Number of items in the batch.
    #[must_use]
    pub fn num_items(&self) -> u32 {
        self.constraints.len() + self.contacts.len()
    }
}

/// Outcome of asking for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Everything available is being processed; try again later.
    WaitingForBatch,
    /// A batch to process.
    BatchRetrieved(SplitBatch),
    /// No more work.
    AllBatchesDone,
}

/// Result of retiring a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDone {
    /// The batch belonged to the last iteration.
    pub last_iteration: bool,
    /// The split island has no more iterations.
    pub final_batch: bool,
}

/// The splits of one large island and their shared progress.
#[derive(Debug)]
pub struct Splits {
    splits: [Split; NUM_SPLITS],
    island_index: u32,
    num_splits: u32,
    num_iterations: u32,
    num_velocity_steps: u32,
    num_position_steps: u32,
    status: AtomicU64,
    items_processed: AtomicU32,
}

const fn status(iteration: u32, split: u32) -> u64 {
    ((iteration as u64) << ITERATION_SHIFT) | ((split as u64) << SPLIT_SHIFT)
}

const fn status_iteration(status: u64) -> u32 {
    (status >> ITERATION_SHIFT) as u32
}

const fn status_split(status: u64) -> u32 {
    ((status >> SPLIT_SHIFT) & SPLIT_BITS) as u32
}

const fn status_item(status: u64) -> u32 {
    (status & ITEM_MASK) as u32
}

impl Splits {
    fn new(island_index: u32, num_velocity_steps: u32, num_position_steps: u32) -> Self {
        Self {
            splits: [Split::default(); NUM_SPLITS],
            island_index,
            num_splits: 0,
            // Iteration 0 warm starts.
            num_iterations: num_velocity_steps + 1,
            num_velocity_steps,
            num_position_steps,
            // Item at the sentinel: nothing can be fetched until started.
            status: AtomicU64::new(ITEM_MASK),
            items_processed: AtomicU32::new(0),
        }
    }

    /// Island these splits belong to.
    #[must_use]
    pub fn island_index(&self) -> u32 {
        self.island_index
    }

    /// Number of parallel splits, excluding the non-parallel one.
    #[must_use]
    pub fn num_splits(&self) -> u32 {
        self.num_splits
    }

    /// Split `index` (`NON_PARALLEL_SPLIT_INDEX` for the non-parallel split).
    #[must_use]
    pub fn split(&self, index: u32) -> &Split {
        &self.splits[index as usize]
    }

    /// Iterations of the current phase.
    #[must_use]
    pub fn num_iterations(&self) -> u32 {
        self.num_iterations
    }

    /// Velocity steps of the island.
    #[must_use]
    pub fn num_velocity_steps(&self) -> u32 {
        self.num_velocity_steps
    }

    /// Position steps of the island.
    #[must_use]
    pub fn num_position_steps(&self) -> u32 {
        self.num_position_steps
    }

    fn start_first_batch(&self) {
        let split = if self.num_splits > 0 { 0 } else { NON_PARALLEL_SPLIT_INDEX };
        self.items_processed.store(0, Ordering::Release);
        self.status.store(status(0, split), Ordering::Release);
    }

    fn fetch_next_batch(&self, split_island: u32) -> FetchStatus {
        // Read first so waiting workers do not push the item counter.
        let current = self.status.load(Ordering::Acquire);
        if status_iteration(current) >= self.num_iterations {
            return FetchStatus::AllBatchesDone;
        }
        if status_item(current) >= self.splits[status_split(current) as usize].num_items() {
            return FetchStatus::WaitingForBatch;
        }

        let current = self.status.fetch_add(u64::from(BATCH_SIZE), Ordering::Acquire);
        let iteration = status_iteration(current);
        if iteration >= self.num_iterations {
            return FetchStatus::AllBatchesDone;
        }
        let split_index = status_split(current);
        debug_assert!(split_index < self.num_splits || split_index == NON_PARALLEL_SPLIT_INDEX);
        let split = &self.splits[split_index as usize];
        let item_begin = status_item(current);
        let num_items = split.num_items();

        let (constraints, contacts) = if split_index == NON_PARALLEL_SPLIT_INDEX {
            // Taken as a whole by the worker that claims item 0.
            if item_begin != 0 {
                return FetchStatus::WaitingForBatch;
            }
            (split.constraints, split.contacts)
        } else {
            if item_begin >= num_items {
                return FetchStatus::WaitingForBatch;
            }
            let item_end = (item_begin + BATCH_SIZE).min(num_items);
            let num_constraints = split.constraints.len();
            let constraints = split
                .constraints
                .sub(item_begin.min(num_constraints), item_end.min(num_constraints));
            let contacts = split.contacts.sub(
                item_begin.max(num_constraints) - num_constraints,
                item_end.max(num_constraints) - num_constraints,
            );
            (constraints, contacts)
        };

        FetchStatus::BatchRetrieved(SplitBatch {
            split_island,
            constraints,
            contacts,
            first_iteration: iteration == 0,
        })
    }

    fn mark_batch_processed(&self, num_processed: u32) -> BatchDone {
        debug_assert!(num_processed > 0, "marking an empty batch");

        // Split and iteration cannot change until this batch is retired.
        let current = self.status.load(Ordering::Relaxed);
        let mut split_index = status_split(current);
        let mut iteration = status_iteration(current);
        let num_items = self.splits[split_index as usize].num_items();
        let last_iteration = iteration + 1 == self.num_iterations;

        let total = self.items_processed.fetch_add(num_processed, Ordering::AcqRel) + num_processed;
        if total >= num_items {
            debug_assert_eq!(total, num_items, "retired more items than the split holds");
            self.items_processed.store(0, Ordering::Release);

            // Advance to the next non-empty split.
            loop {
                if split_index == NON_PARALLEL_SPLIT_INDEX {
                    split_index = 0;
                    iteration += 1;
                } else {
                    split_index += 1;
                }
                if split_index >= self.num_splits {
                    split_index = NON_PARALLEL_SPLIT_INDEX;
                }
                if iteration >= self.num_iterations
                    || self.splits[split_index as usize].num_items() > 0
                {
                    break;
                }
            }
            self.status.store(status(iteration, split_index), Ordering::Release);
        }

        BatchDone {
            last_iteration,
            final_batch: iteration >= self.num_iterations,
        }
    }
}

/// Splits the largest islands of a step and hands out their batches.
#[derive(Debug, Default)]
pub struct LargeIslandSplitter {
    num_active_bodies: u32,
    masks: IndexRange,
    items: IndexRange,
    items_next_free: u32,
    num_planned: u32,
    split_islands: Vec<Splits>,
    prepared: bool,
}

impl LargeIslandSplitter {
    /// Create an idle splitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve arena space for every island large enough to be split.
    ///
    /// Islands are visited in the builder's size order, so counting stops at
    /// the first island below [`LARGE_ISLAND_THRESHOLD`].
    pub fn prepare(&mut self, builder: &IslandBuilder, arena: &mut StepArena) -> Result<()> {
        let mut num_planned = 0;
        let mut total_items = 0;
        for &index in builder.sorted_islands(arena) {
            let size = builder.island(arena, index).num_items();
            if size < LARGE_ISLAND_THRESHOLD {
                break;
            }
            num_planned += 1;
            total_items += size;
        }

        self.split_islands.clear();
        self.items_next_free = 0;
        self.num_planned = num_planned;
        self.num_active_bodies = builder.num_active_bodies();
        self.prepared = false;
        if total_items > 0 {
            let masks = arena.alloc(self.num_active_bodies as usize)?;
            self.items = match arena.alloc(total_items as usize) {
                Ok(items) => items,
                Err(e) => {
                    arena.free(masks);
                    return Err(e);
                }
            };
            self.masks = masks;
            self.split_islands.reserve(num_planned as usize);
            self.prepared = true;
            debug!(num_planned, total_items, "large islands found");
        }
        Ok(())
    }

    /// Number of islands [`LargeIslandSplitter::prepare`] found large enough.
    #[must_use]
    pub fn num_planned(&self) -> u32 {
        self.num_planned
    }

    /// Split `island` if it is large enough. Returns false for small islands,
    /// which the caller solves as a whole.
    pub fn split_island(
        &mut self,
        island: &Island,
        arena: &mut StepArena,
        bodies: &BodyManager,
        contacts: &dyn SplitContacts,
        active: &[ConstraintRef],
        settings: &PhysicsSettings,
    ) -> Result<bool> {
        if island.num_items() < LARGE_ISLAND_THRESHOLD || !self.prepared {
            return Ok(false);
        }

        let island_bodies = arena.slice(island.bodies).to_vec();
        let island_contacts = arena.slice(island.contacts).to_vec();
        let island_constraints = arena.slice(island.constraints).to_vec();

        let mut steps = SolverStepsCalculator::new(settings);
        let mut contacts_per_split = [0_u32; NUM_SPLITS];
        let mut constraints_per_split = [0_u32; NUM_SPLITS];
        let mut contact_split = Vec::with_capacity(island_contacts.len());
        let mut constraint_split = Vec::with_capacity(island_constraints.len());
        {
            let mask_words = arena.slice_mut(self.masks);
            for &body in &island_bodies {
                mask_words[body as usize] = 0;
            }
            let mut masks = SplitMasks::new(mask_words);

            for &contact in &island_contacts {
                let (first, second) = contacts.contact_bodies(contact);
                let mut index = |id| {
                    bodies.lock(id).and_then(|body| {
                        steps.add_body(&body);
                        split_body_index(&body)
                    })
                };
                let (first, second) = (index(first), index(second));
                let split = masks.assign_split(first, second);
                contacts_per_split[split as usize] += 1;
                contact_split.push(split);
            }

            for &constraint in &island_constraints {
                let constraint = active[constraint as usize].lock();
                let split = constraint.build_island_splits(&mut masks, bodies);
                constraints_per_split[split as usize] += 1;
                constraint_split.push(split);
                steps.add_constraint(&*constraint);
            }
        }
        steps.finalize();

        let split_island = u32::try_from(self.split_islands.len()).unwrap_or(u32::MAX);
        let mut splits = Splits::new(
            island.index,
            steps.num_velocity_steps(),
            steps.num_position_steps(),
        );

        // Allocate each split's range, folding small splits into the
        // non-parallel one. The non-parallel split is visited last so it
        // sees every merged count.
        let mut remap = [NON_PARALLEL_SPLIT_INDEX; NUM_SPLITS];
        let mut contact_cursor = [0_u32; NUM_SPLITS];
        let mut constraint_cursor = [0_u32; NUM_SPLITS];
        let mut offset = self.items_next_free;
        for s in 0..NUM_SPLITS {
            let num_items = contacts_per_split[s] + constraints_per_split[s];
            let split_index = s as u32;
            if num_items < SPLIT_COMBINE_THRESHOLD && split_index < NON_PARALLEL_SPLIT_INDEX {
                remap[s] = NON_PARALLEL_SPLIT_INDEX;
                let last = NON_PARALLEL_SPLIT_INDEX as usize;
                contacts_per_split[last] += contacts_per_split[s];
                constraints_per_split[last] += constraints_per_split[s];
                continue;
            }

            let target = if split_index < NON_PARALLEL_SPLIT_INDEX {
                splits.num_splits += 1;
                splits.num_splits - 1
            } else {
                NON_PARALLEL_SPLIT_INDEX
            };
            remap[s] = target;

            let contacts_end = offset + contacts_per_split[s];
            let constraints_end = contacts_end + constraints_per_split[s];
            let split = &mut splits.splits[target as usize];
            split.contacts = self.items.sub(offset, contacts_end);
            split.constraints = self.items.sub(contacts_end, constraints_end);
            contact_cursor[target as usize] = offset;
            constraint_cursor[target as usize] = contacts_end;
            offset = constraints_end;
        }

        let items = arena.slice_mut(self.items);
        for (&contact, &split) in island_contacts.iter().zip(&contact_split) {
            let cursor = &mut contact_cursor[remap[split as usize] as usize];
            items[*cursor as usize] = contact;
            *cursor += 1;
        }
        for (&constraint, &split) in island_constraints.iter().zip(&constraint_split) {
            let cursor = &mut constraint_cursor[remap[split as usize] as usize];
            items[*cursor as usize] = constraint;
            *cursor += 1;
        }
        self.items_next_free = offset;

        trace!(
            island = island.index,
            split_island,
            num_splits = splits.num_splits,
            non_parallel = splits.split(NON_PARALLEL_SPLIT_INDEX).num_items(),
            "island split"
        );
        splits.start_first_batch();
        self.split_islands.push(splits);
        Ok(true)
    }

    /// Islands split so far this step.
    #[must_use]
    pub fn split_islands(&self) -> &[Splits] {
        &self.split_islands
    }

    /// Claim the next batch of any split island.
    pub fn fetch_next_batch(&self) -> FetchStatus {
        let mut all_done = true;
        for (index, splits) in (0_u32..).zip(&self.split_islands) {
            match splits.fetch_next_batch(index) {
                FetchStatus::AllBatchesDone => {}
                FetchStatus::WaitingForBatch => all_done = false,
                retrieved @ FetchStatus::BatchRetrieved(_) => return retrieved,
            }
        }
        if all_done {
            FetchStatus::AllBatchesDone
        } else {
            FetchStatus::WaitingForBatch
        }
    }

    /// Retire a batch returned by [`LargeIslandSplitter::fetch_next_batch`].
    pub fn mark_batch_processed(&self, batch: &SplitBatch) -> BatchDone {
        self.split_islands[batch.split_island as usize].mark_batch_processed(batch.num_items())
    }

    /// Switch every split island to the position phase.
    pub fn prepare_for_solve_positions(&mut self) {
        for splits in &mut self.split_islands {
            splits.num_iterations = splits.num_position_steps;
            splits.start_first_batch();
        }
    }

    /// Release the arena buffers.
    pub fn reset(&mut self, arena: &mut StepArena) {
        if self.prepared {
            arena.free(self.items);
            arena.free(self.masks);
        }
        self.split_islands.clear();
        self.items_next_free = 0;
        self.num_planned = 0;
        self.prepared = false;
    }
}
