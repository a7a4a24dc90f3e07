//! Parallel island solver.
//!
//! Workers pull work from two sources: batches of split islands from the
//! [`LargeIslandSplitter`] and whole islands from a shared cursor. Split
//! batches come first since other workers may be waiting on their
//! iteration to finish; a worker that would otherwise wait takes a whole
//! island instead.

use std::sync::atomic::{AtomicUsize, Ordering};

use sim_constraint::{
    ConstraintManager, ConstraintRef, FetchStatus, Island, LargeIslandSplitter, SplitBatch,
};
use sim_contact::ContactConstraintManager;
use sim_types::{BodyManager, StepArena};
use tracing::trace;

/// Which half of the solve to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SolvePhase {
    Velocity,
    Position,
}

/// Everything the workers share during a solve.
pub(crate) struct IslandSolver<'a> {
    pub bodies: &'a BodyManager,
    pub contacts: &'a ContactConstraintManager,
    pub constraints: &'a [ConstraintRef],
    pub arena: &'a StepArena,
    pub splitter: &'a LargeIslandSplitter,
    /// Islands that were not split, largest first.
    pub islands: &'a [Island],
    pub dt: f64,
    pub warm_start_ratio: f64,
    pub baumgarte: f64,
}

impl IslandSolver<'_> {
    /// Run `phase` over all islands on the rayon pool and return when every
    /// island is done.
    pub fn solve(&self, phase: SolvePhase) {
        let next_island = AtomicUsize::new(0);
        let workers = rayon::current_num_threads().max(1);
        trace!(?phase, workers, islands = self.islands.len(), "solving islands");
        rayon::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| self.worker(phase, &next_island));
            }
        });
    }

    fn worker(&self, phase: SolvePhase, next_island: &AtomicUsize) {
        loop {
            match self.splitter.fetch_next_batch() {
                FetchStatus::BatchRetrieved(batch) => {
                    self.solve_batch(phase, &batch);
                    if self.splitter.mark_batch_processed(&batch).final_batch {
                        trace!(?phase, split_island = batch.split_island, "split island solved");
                    }
                }
                FetchStatus::WaitingForBatch => {
                    if !self.solve_next_island(phase, next_island) {
                        std::thread::yield_now();
                    }
                }
                FetchStatus::AllBatchesDone => {
                    if !self.solve_next_island(phase, next_island) {
                        return;
                    }
                }
            }
        }
    }

    fn solve_next_island(&self, phase: SolvePhase, next_island: &AtomicUsize) -> bool {
        let index = next_island.fetch_add(1, Ordering::Relaxed);
        let Some(island) = self.islands.get(index) else {
            return false;
        };
        match phase {
            SolvePhase::Velocity => self.solve_island_velocities(island),
            SolvePhase::Position => self.solve_island_positions(island),
        }
        true
    }

    fn warm_start(&self, constraints: &[u32], contacts: &[u32]) {
        ConstraintManager::warm_start_velocity_constraints(
            self.constraints,
            constraints,
            self.bodies,
            self.warm_start_ratio,
        );
        self.contacts
            .warm_start_velocity_constraints(contacts, self.bodies, self.warm_start_ratio);
    }

    fn solve_velocities(&self, constraints: &[u32], contacts: &[u32]) -> bool {
        let applied = ConstraintManager::solve_velocity_constraints(
            self.constraints,
            constraints,
            self.bodies,
            self.dt,
        );
        applied | self.contacts.solve_velocity_constraints(contacts, self.bodies)
    }

    fn solve_positions(&self, constraints: &[u32], contacts: &[u32]) -> bool {
        let applied = ConstraintManager::solve_position_constraints(
            self.constraints,
            constraints,
            self.bodies,
            self.dt,
            self.baumgarte,
        );
        applied | self.contacts.solve_position_constraints(contacts, self.bodies)
    }

    fn solve_batch(&self, phase: SolvePhase, batch: &SplitBatch) {
        let constraints = self.arena.slice(batch.constraints);
        let contacts = self.arena.slice(batch.contacts);
        match phase {
            SolvePhase::Velocity if batch.first_iteration => self.warm_start(constraints, contacts),
            SolvePhase::Velocity => {
                self.solve_velocities(constraints, contacts);
            }
            // Position iterations have no warm start; iteration 0 solves.
            SolvePhase::Position => {
                self.solve_positions(constraints, contacts);
            }
        }
    }

    fn solve_island_velocities(&self, island: &Island) {
        let constraints = self.arena.slice(island.constraints);
        let contacts = self.arena.slice(island.contacts);
        self.warm_start(constraints, contacts);
        for _ in 0..island.num_velocity_steps {
            if !self.solve_velocities(constraints, contacts) {
                break;
            }
        }
    }

    fn solve_island_positions(&self, island: &Island) {
        let constraints = self.arena.slice(island.constraints);
        let contacts = self.arena.slice(island.contacts);
        for _ in 0..island.num_position_steps {
            if !self.solve_positions(constraints, contacts) {
                break;
            }
        }
    }
}
