//! Contact caching and contact constraints for the parallel rigid-body solver.
//!
//! This crate turns narrow-phase results into impulse constraints:
//!
//! - [`ContactManifold`]: contact surface reported by the narrow phase
//! - [`ContactListener`]: validate / added / persisted / removed callbacks
//! - [`ContactCache`]: double-buffered cache of body pairs and manifolds used
//!   to skip the narrow phase and to warm start
//! - [`ContactConstraint`]: non-penetration plus two friction axes per point
//! - [`ContactConstraintManager`]: ingestion, solving and cache finalization
//!
//! # Contact Model
//!
//! Each contact point is solved as three [`sim_constraint::AxisConstraintPart`]s
//! with accumulated impulses:
//!
//! ```text
//! λ_n ≥ 0                      non-penetration
//! |(λ_t1, λ_t2)| ≤ μ λ_n        friction circle
//! ```
//!
//! Bodies that are apart but approaching get a speculative contact whose bias
//! lets them close the gap in one step but not more. Restitution is applied
//! when the approach speed exceeds
//! [`PhysicsSettings::min_velocity_for_restitution`].
//!
//! # Capacity
//!
//! The caches and the constraint buffer have fixed capacities. Running out is
//! not an error: the contact is dropped for the step and the matching
//! [`StepErrors`] bit is raised (see [`ContactConstraintManager::errors`]).
//!
//! # Layer 0
//!
//! This is a Layer 0 crate with **zero Bevy dependencies**.

#![doc(html_root_url = "https://docs.rs/sim-contact/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,
    clippy::cast_possible_truncation, // indices are bounded by u32 capacities
    clippy::similar_names,
)]

mod cache;
mod constraint;
mod listener;
mod manager;
mod manifold;

pub use cache::{
    CachedBodyPair, CachedContactPoint, CachedManifold, ContactCache, ManifoldCache, ManifoldIter,
    NO_MANIFOLD,
};
pub use constraint::{ContactConstraint, WorldContactPoint, normalized_perpendicular};
pub use listener::{ContactListener, DefaultContactListener, ValidateResult};
pub use manager::{CacheLookup, ContactConstraintManager};
pub use manifold::{
    BodyPairKey, CombineFunction, ContactManifold, ContactPoints, ContactSettings,
    MAX_CONTACT_POINTS, SubShapeId, SubShapeIdPair, combine_friction, combine_restitution,
};

// Re-export types that appear in the public API
pub use sim_types::{BodyId, PhysicsSettings, StepErrors};
