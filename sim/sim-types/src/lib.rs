//! Core types for the parallel rigid-body contact solver.
//!
//! This crate provides the foundational types shared by the broad phase, the
//! contact manager, the island builder and the island splitter:
//!
//! - [`BodyId`], [`Body`], [`BodyManager`] - Body identity, state and storage
//! - [`MotionType`] - Static / kinematic / dynamic dispatch tag
//! - [`Aabb`], [`OrientedBox`] - Bounding volumes
//! - [`BroadPhaseLayer`], [`CollisionLayer`] and their filters
//! - [`PhysicsSettings`], [`PhysicsLimits`] - Tuning values and capacities
//! - [`SimError`], [`StepErrors`] - Fatal and step-local errors
//! - [`PhysicsLockContext`] - Ranked lock bookkeeping, one per thread
//! - [`StepArena`], [`IndexRange`] - Step-scoped scratch storage
//!
//! # Layer 0
//!
//! This is a Layer 0 crate with **zero Bevy dependencies**. It can be used in:
//!
//! - Headless simulation loops
//! - Analysis tools
//! - Other engines
//!
//! # Example
//!
//! ```
//! use sim_types::{BodyCreationSettings, BodyManager, MotionType};
//! use nalgebra::Point3;
//!
//! let mut bodies = BodyManager::new(16);
//! let id = bodies
//!     .create_body(&BodyCreationSettings::sphere(Point3::new(0.0, 0.0, 1.0), 0.5, MotionType::Dynamic))
//!     .unwrap();
//!
//! assert_eq!(bodies.active_bodies(), &[id]);
//! assert_eq!(bodies.lock(id).unwrap().position().z, 1.0);
//! ```

#![doc(html_root_url = "https://docs.rs/sim-types/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
// Allow certain clippy lints that are overly pedantic for type definitions
#![allow(
    clippy::missing_const_for_fn,     // Many methods can't be const due to nalgebra
    clippy::suboptimal_flops,          // mul_add style changes aren't always clearer
    clippy::cast_precision_loss,       // usize to f64 is fine for counts
    clippy::cast_possible_truncation,  // indices are bounded by BodyId::MAX_INDEX
    clippy::missing_errors_doc,        // Error docs added where non-obvious
)]

mod aabb;
mod arena;
mod body;
mod config;
mod error;
mod layers;
mod lock;

pub use aabb::{Aabb, Axis, OrientedBox};
pub use arena::{IndexRange, StepArena};
pub use body::{
    Body, BodyCreationSettings, BodyId, BodyManager, MassProperties, MotionProperties, MotionType,
};
pub use config::{PhysicsLimits, PhysicsSettings};
pub use error::{SimError, StepErrorAccumulator, StepErrors};
pub use layers::{
    AllLayers, BroadPhaseLayer, BroadPhaseLayerFilter, CollisionLayer, CollisionLayerPairFilter,
    CollisionVsBroadPhaseLayerFilter, LayerTable,
};
pub use lock::{LockType, MutexLock, PhysicsLockContext, SharedLock, UniqueLock};

// Re-export math types for convenience
pub use nalgebra::{Isometry3, Matrix3, Point3, UnitQuaternion, Vector3};

/// Result type for simulation operations.
pub type Result<T> = std::result::Result<T, SimError>;
