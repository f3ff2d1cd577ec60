use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::protocol::EntityId;

#[derive(Debug, Clone)]
struct Prediction {
    entity_id: EntityId,
    target_ms: u64,
    requested_at: Instant,
}

/// Optimistic display of a seek target while authoritative snapshots catch
/// up. Snapshots lag a seek by up to a polling interval; without this the
/// progress bar would visibly jump back after every seek.
///
/// One prediction at a time, scoped to the active entity. It ends the moment
/// the authoritative value reaches the target within tolerance, the window
/// expires, the active entity changes, or a newer seek supersedes it; after
/// that the authoritative value is shown unconditionally.
pub struct SeekPredictor {
    window: Duration,
    tolerance_ms: u64,
    active: Option<Prediction>,
}

impl SeekPredictor {
    pub fn new(window: Duration, tolerance_ms: u64) -> Self {
        Self {
            window,
            tolerance_ms,
            active: None,
        }
    }

    /// Record an issued seek. Supersedes any previous prediction.
    pub fn note_seek(&mut self, entity_id: EntityId, target_ms: u64, duration_ms: u64, now: Instant) {
        let target_ms = clamp_progress(target_ms, duration_ms);
        self.active = Some(Prediction {
            entity_id,
            target_ms,
            requested_at: now,
        });
    }

    /// Resolve the progress value to display for `entity_id`. Terminal
    /// conditions clear the prediction and fall back to `authoritative_ms`.
    pub fn resolve(
        &mut self,
        entity_id: &EntityId,
        authoritative_ms: u64,
        duration_ms: u64,
        playing: bool,
        now: Instant,
    ) -> u64 {
        let Some(prediction) = &self.active else {
            return authoritative_ms;
        };
        if prediction.entity_id != *entity_id {
            trace!("seek prediction superseded by entity switch");
            self.active = None;
            return authoritative_ms;
        }
        if now.duration_since(prediction.requested_at) > self.window {
            trace!("seek prediction window expired");
            self.active = None;
            return authoritative_ms;
        }
        if authoritative_ms + self.tolerance_ms >= prediction.target_ms {
            trace!("seek prediction reconciled");
            self.active = None;
            return authoritative_ms;
        }
        // Still waiting: show the target, advanced locally while playback
        // runs so the bar does not freeze.
        let advanced = if playing {
            prediction.target_ms + now.duration_since(prediction.requested_at).as_millis() as u64
        } else {
            prediction.target_ms
        };
        clamp_progress(advanced, duration_ms)
    }

    /// The active entity changed; any prediction for the old one is void.
    pub fn clear(&mut self) {
        self.active = None;
    }

    pub fn is_predicting(&self) -> bool {
        self.active.is_some()
    }
}

fn clamp_progress(value_ms: u64, duration_ms: u64) -> u64 {
    if duration_ms == 0 {
        value_ms
    } else {
        value_ms.min(duration_ms)
    }
}
