//! Error types for simulation operations.
//!
//! Two kinds of failure exist:
//!
//! - [`SimError`]: API misuse or invalid configuration, returned through
//!   [`crate::Result`].
//! - [`StepErrors`]: capacity exhaustion while a step runs. These never abort
//!   the step; the offending pair or constraint is dropped for that step and
//!   the bit is reported to the caller when the step completes.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::BodyId;

/// Errors that can occur during simulation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    /// Invalid body ID referenced.
    #[error("invalid body ID: {0}")]
    InvalidBodyId(BodyId),

    /// Body was already inserted into the broad phase.
    #[error("body {0} is already in the broad phase")]
    AlreadyInBroadPhase(BodyId),

    /// Body is not present in the broad phase.
    #[error("body {0} is not in the broad phase")]
    NotInBroadPhase(BodyId),

    /// Invalid timestep.
    #[error("invalid timestep: {0} (must be positive and finite)")]
    InvalidTimestep(f64),

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// A fixed-capacity resource ran out of room.
    #[error("capacity exceeded for {resource}: requested {requested}, available {available}")]
    CapacityExceeded {
        /// Name of the exhausted resource.
        resource: &'static str,
        /// Amount requested.
        requested: usize,
        /// Amount still available.
        available: usize,
    },

    /// Invalid mass properties.
    #[error("invalid mass properties: {reason}")]
    InvalidMassProperties {
        /// Description of what's wrong.
        reason: String,
    },
}

impl SimError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid mass properties error.
    #[must_use]
    pub fn invalid_mass(reason: impl Into<String>) -> Self {
        Self::InvalidMassProperties {
            reason: reason.into(),
        }
    }

    /// Create a capacity exceeded error.
    #[must_use]
    pub const fn capacity_exceeded(
        resource: &'static str,
        requested: usize,
        available: usize,
    ) -> Self {
        Self::CapacityExceeded {
            resource,
            requested,
            available,
        }
    }

    /// Check if this is a configuration error.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }

    /// Check if this is a capacity error.
    #[must_use]
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

bitflags::bitflags! {
    /// Bit set of non-fatal errors raised while running a step.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StepErrors: u32 {
        /// The manifold cache ran out of entries; some contacts were dropped.
        const MANIFOLD_CACHE_FULL = 0b0000_0001;
        /// The body pair cache ran out of entries; some pairs were dropped.
        const BODY_PAIR_CACHE_FULL = 0b0000_0010;
        /// The contact constraint buffer ran out of room.
        const CONTACT_CONSTRAINTS_FULL = 0b0000_0100;
    }
}

impl StepErrors {
    /// No errors.
    pub const NONE: Self = Self::empty();
}

impl fmt::Display for StepErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<_> = self
            .iter()
            .map(|flag| {
                if flag == Self::MANIFOLD_CACHE_FULL {
                    "manifold cache full"
                } else if flag == Self::BODY_PAIR_CACHE_FULL {
                    "body pair cache full"
                } else {
                    "contact constraints full"
                }
            })
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Shared accumulator that per-thread [`StepErrors`] are merged into.
#[derive(Debug, Default)]
pub struct StepErrorAccumulator(AtomicU32);

impl StepErrorAccumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Merge a thread's local errors.
    pub fn merge(&self, errors: StepErrors) {
        if !errors.is_empty() {
            self.0.fetch_or(errors.bits(), Ordering::Relaxed);
        }
    }

    /// Read the merged errors and clear the accumulator.
    pub fn take(&self) -> StepErrors {
        StepErrors::from_bits_truncate(self.0.swap(0, Ordering::AcqRel))
    }
}
