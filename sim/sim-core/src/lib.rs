//! Broad phase, step pipeline and parallel island solver.
//!
//! This crate ties the body, constraint and contact crates together into a
//! steppable [`PhysicsSystem`]:
//!
//! - [`BroadPhase`]: one quad tree per broad-phase layer, pair finding and
//!   ray, box, sphere and point queries
//! - [`NarrowPhase`]: seam through which shape code reports contacts
//! - [`PhysicsSystem`]: owns everything and runs [`PhysicsSystem::step`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Broad phase                            │
//! │  update dirty trees → find colliding pairs (rayon)          │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Contacts and constraints                    │
//! │  cache lookup → narrow phase (rayon) → contact constraints  │
//! │  link bodies into islands                                   │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Islands                               │
//! │  finalize → split large islands → workers solve velocities, │
//! │  integrate, solve positions                                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Layer 0 Crate
//!
//! This is a Layer 0 crate with **zero Bevy dependencies**. It can be used in:
//!
//! - Headless simulation loops
//! - Analysis tools
//! - Other engines
//!
//! # Quick Start
//!
//! ```
//! use sim_core::{BoundingSphereNarrowPhase, PhysicsSystem};
//! use sim_contact::DefaultContactListener;
//! use sim_types::{BodyCreationSettings, MotionType, PhysicsLimits, PhysicsSettings};
//! use nalgebra::Point3;
//!
//! let mut system = PhysicsSystem::new(PhysicsSettings::default(), PhysicsLimits::for_bodies(64), 1).unwrap();
//!
//! // A ball resting on a large static sphere.
//! system
//!     .add_body(&BodyCreationSettings::sphere(Point3::origin(), 10.0, MotionType::Static))
//!     .unwrap();
//! let ball = system
//!     .add_body(&BodyCreationSettings::sphere(Point3::new(0.0, 0.0, 10.5), 0.5, MotionType::Dynamic))
//!     .unwrap();
//!
//! for _ in 0..60 {
//!     system.step(1.0 / 60.0, &BoundingSphereNarrowPhase, &DefaultContactListener).unwrap();
//! }
//!
//! let height = system.bodies().lock(ball).unwrap().position().z;
//! assert!((height - 10.5).abs() < 0.05);
//! ```

#![doc(html_root_url = "https://docs.rs/sim-core/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,     // Many methods can't be const due to nalgebra
    clippy::cast_possible_truncation, // layer and node indices are bounded by their capacities
    clippy::cast_precision_loss,
    clippy::missing_errors_doc,
)]

pub mod broad_phase;
mod narrow_phase;
mod solve;
mod system;

pub use broad_phase::{
    AaBoxCast, AddState, AllHitCollector, AnyHitCollector, BodyTracker, BroadPhase, CastResult,
    ClosestHitCollector, CollectorHit, CollisionCollector, CollisionLayerFilter, LayerStats,
    PairCollisionLayerFilter, QueryFilter, RayCast,
};
pub use narrow_phase::{BoundingSphereNarrowPhase, NarrowPhase};
pub use system::{PhysicsSystem, StepResult};

// Re-export commonly used types
pub use sim_types::{
    Aabb, Body, BodyCreationSettings, BodyId, BroadPhaseLayer, CollisionLayer, MotionType,
    PhysicsLimits, PhysicsLockContext, PhysicsSettings, SimError, StepErrors,
};
