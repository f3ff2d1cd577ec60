use std::collections::{HashMap, HashSet};

use crate::protocol::EntityId;
use crate::store::{MergedUpdate, UpdateReason};

/// A control the user is actively manipulating (pointer down, or keyboard
/// focus on an interactive input). Held between claim and release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FocusClaim {
    pub entity_id: EntityId,
    pub control: String,
}

impl FocusClaim {
    pub fn new(entity_id: impl Into<EntityId>, control: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            control: control.into(),
        }
    }
}

/// Decides, per merged-view update, whether to paint now or defer until the
/// user lets go of the control. Deferred updates queue one per entity,
/// latest wins; earlier queued updates are discarded, not merged.
#[derive(Default)]
pub struct RenderGate {
    claims: HashSet<FocusClaim>,
    queued: HashMap<EntityId, MergedUpdate>,
}

impl RenderGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an update. Returns it when it may paint immediately, `None`
    /// when it was queued behind a live focus claim.
    pub fn offer(&mut self, update: MergedUpdate) -> Option<MergedUpdate> {
        if update.reason == UpdateReason::Removed {
            // The entity is gone; any claim or queued paint for it is moot.
            self.claims.retain(|claim| claim.entity_id != update.entity_id);
            self.queued.remove(&update.entity_id);
            return Some(update);
        }
        if update.reason.is_forced() {
            self.queued.remove(&update.entity_id);
            return Some(update);
        }
        if self.entity_claimed(&update.entity_id) {
            self.queued.insert(update.entity_id.clone(), update);
            return None;
        }
        Some(update)
    }

    pub fn claim(&mut self, claim: FocusClaim) {
        self.claims.insert(claim);
    }

    /// Release a claim. Returns the queued update to flush, if this was the
    /// entity's last claim and something was deferred.
    pub fn release(&mut self, claim: &FocusClaim) -> Option<MergedUpdate> {
        self.claims.remove(claim);
        if self.entity_claimed(&claim.entity_id) {
            return None;
        }
        self.queued.remove(&claim.entity_id)
    }

    /// The document became visible again; flush every queue not pinned by a
    /// live claim.
    pub fn document_visible(&mut self) -> Vec<MergedUpdate> {
        let flushable: Vec<EntityId> = self
            .queued
            .keys()
            .filter(|id| !self.entity_claimed(id))
            .cloned()
            .collect();
        flushable
            .into_iter()
            .filter_map(|id| self.queued.remove(&id))
            .collect()
    }

    pub fn clear(&mut self) {
        self.claims.clear();
        self.queued.clear();
    }

    fn entity_claimed(&self, entity_id: &EntityId) -> bool {
        self.claims.iter().any(|claim| claim.entity_id == *entity_id)
    }
}
