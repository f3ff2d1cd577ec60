use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// Lifecycle of an optimistic local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    /// Registered, quiet period still running.
    Pending,
    /// The coalescer has a command for this field on the wire.
    InFlight,
    /// A newer mutation of the same field replaced this one.
    Superseded,
    /// An authoritative snapshot confirmed the value within tolerance.
    Resolved,
}

/// Predicate deciding whether an authoritative value is close enough to a
/// requested one to settle the edit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tolerance {
    Exact,
    /// Numeric distance; falls back to equality for non-numeric values.
    Within(f64),
}

impl Tolerance {
    pub fn accepts(&self, authoritative: &Value, requested: &Value) -> bool {
        match self {
            Tolerance::Exact => authoritative == requested,
            Tolerance::Within(eps) => match (authoritative.as_f64(), requested.as_f64()) {
                (Some(a), Some(r)) => (a - r).abs() <= *eps,
                _ => authoritative == requested,
            },
        }
    }
}

/// An optimistic local value awaiting server confirmation.
#[derive(Debug, Clone)]
pub struct PendingEdit {
    pub value: Value,
    pub requested_at: Instant,
    pub window: Duration,
    pub tolerance: Tolerance,
    pub state: EditState,
}

impl PendingEdit {
    pub fn new(value: Value, window: Duration, tolerance: Tolerance, now: Instant) -> Self {
        Self {
            value,
            requested_at: now,
            window,
            tolerance,
            state: EditState::Pending,
        }
    }

    /// Whether this edit still overlays the authoritative value.
    pub fn is_live(&self) -> bool {
        matches!(self.state, EditState::Pending | EditState::InFlight)
    }

    /// The reconciliation window has elapsed; authoritative wins.
    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.requested_at) > self.window
    }

    pub fn supersede(&mut self) {
        self.state = EditState::Superseded;
    }

    pub fn resolve(&mut self) {
        self.state = EditState::Resolved;
    }

    pub fn mark_in_flight(&mut self) {
        if self.state == EditState::Pending {
            self.state = EditState::InFlight;
        }
    }
}
