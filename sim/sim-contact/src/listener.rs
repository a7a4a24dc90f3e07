//! Contact event callbacks.

use sim_types::Body;

use crate::{ContactManifold, ContactSettings, SubShapeIdPair};

/// Answer of [`ContactListener::on_contact_validate`].
///
/// Ordered from strongest accept to strongest reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ValidateResult {
    /// Accept this manifold and every further manifold of the body pair
    /// without asking again.
    #[default]
    AcceptAllContactsForThisBodyPair,
    /// Accept this manifold only.
    AcceptContact,
    /// Reject this manifold only.
    RejectContact,
    /// Reject this and every further manifold of the body pair.
    RejectAllContactsForThisBodyPair,
}

/// Receives contact events while the contact constraints of a step are built.
///
/// Bodies are passed with the lower [`sim_types::BodyId`] first. The callbacks
/// run while the step holds the bodies; they may read them but must not try
/// to lock any body.
pub trait ContactListener {
    /// Called for every new or re-detected manifold before it becomes a
    /// constraint.
    fn on_contact_validate(
        &self,
        body1: &Body,
        body2: &Body,
        manifold: &ContactManifold,
    ) -> ValidateResult {
        let _ = (body1, body2, manifold);
        ValidateResult::AcceptAllContactsForThisBodyPair
    }

    /// A manifold that did not exist last step. `settings` may be changed.
    fn on_contact_added(
        &self,
        body1: &Body,
        body2: &Body,
        manifold: &ContactManifold,
        settings: &mut ContactSettings,
    ) {
        let _ = (body1, body2, manifold, settings);
    }

    /// A manifold that also existed last step. `settings` may be changed.
    fn on_contact_persisted(
        &self,
        body1: &Body,
        body2: &Body,
        manifold: &ContactManifold,
        settings: &mut ContactSettings,
    ) {
        let _ = (body1, body2, manifold, settings);
    }

    /// A manifold of last step that was not found again. The bodies may no
    /// longer exist, so only the ids are passed.
    fn on_contact_removed(&self, pair: &SubShapeIdPair) {
        let _ = pair;
    }
}

/// Listener that accepts every contact and ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContactListener;

impl ContactListener for DefaultContactListener {}
