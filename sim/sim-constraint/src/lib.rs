//! Constraints, islands and island splitting for the parallel contact solver.
//!
//! This crate sits between the body types and the contact manager:
//!
//! - [`AxisConstraintPart`]: the single-axis impulse solver used by contacts
//!   and by [`DistanceConstraint`]
//! - [`Constraint`] and [`ConstraintManager`]: non-contact constraints
//! - [`IslandBuilder`]: groups active bodies, constraints and contacts into
//!   islands that can be solved independently
//! - [`LargeIslandSplitter`]: colors large islands into splits whose batches
//!   can be solved by several workers at once
//! - [`SolverStepsCalculator`]: per-island iteration counts
//!
//! # Step Order
//!
//! ```text
//! ConstraintManager::active_constraints
//!   -> IslandBuilder::prepare
//!   -> link (constraints here, contacts from the narrow phase)
//!   -> IslandBuilder::finalize
//!   -> LargeIslandSplitter::prepare / split_island
//!   -> velocity batches -> prepare_for_solve_positions -> position batches
//!   -> LargeIslandSplitter::reset -> IslandBuilder::reset
//! ```
//!
//! # Example
//!
//! ```
//! use nalgebra::Point3;
//! use sim_constraint::{ConstraintManager, DistanceConstraint, constraint_ref};
//! use sim_types::{BodyCreationSettings, BodyManager, MotionType, PhysicsLockContext};
//!
//! let mut bodies = BodyManager::new(4);
//! let a = bodies
//!     .create_body(&BodyCreationSettings::sphere(Point3::origin(), 0.5, MotionType::Static))
//!     .unwrap();
//! let b = bodies
//!     .create_body(&BodyCreationSettings::sphere(Point3::new(0.0, 0.0, -2.0), 0.5, MotionType::Dynamic))
//!     .unwrap();
//!
//! let ctx = PhysicsLockContext::new();
//! let manager = ConstraintManager::new();
//! manager.add(&ctx, &[constraint_ref(DistanceConstraint::new(
//!     a, Point3::origin(), b, Point3::origin(), 2.0,
//! ))]);
//!
//! assert_eq!(manager.active_constraints(&ctx, &bodies).len(), 1);
//! ```

#![doc(html_root_url = "https://docs.rs/sim-constraint/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,
    clippy::cast_possible_truncation, // indices are bounded by u32 capacities
    clippy::cast_precision_loss,
    clippy::missing_errors_doc,
)]

mod axis_part;
mod constraint;
mod islands;
mod manager;
mod splitter;
mod steps;

pub use axis_part::{AxisConstraintPart, SolverMass};
pub use constraint::{
    Constraint, ConstraintRef, DistanceConstraint, constraint_ref, island_link_index,
};
pub use islands::{Island, IslandBuilder, IslandStatistics};
pub use manager::ConstraintManager;
pub use splitter::{
    BATCH_SIZE, BatchDone, FetchStatus, LARGE_ISLAND_THRESHOLD, LargeIslandSplitter,
    NON_PARALLEL_SPLIT_INDEX, NUM_SPLITS, SPLIT_COMBINE_THRESHOLD, Split, SplitBatch,
    SplitContacts, SplitMasks, Splits, split_body_index,
};
pub use steps::SolverStepsCalculator;

// Re-export types needed to implement constraints
pub use sim_types::{BodyId, BodyManager, Vector3};
