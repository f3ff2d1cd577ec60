use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::protocol::{EntityId, FieldKey};

/// What a timer is for. Part of the registry key, so one entity/field pair
/// can hold several timers without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    /// Quiet-period debounce for a coalescer lane.
    Debounce,
    /// Periodic sweep of expired pending edits.
    EditExpiry,
    /// Periodic re-render of locally advancing playback progress.
    RenderTick,
}

/// Registry key: `(entity, field, purpose)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub entity_id: Option<EntityId>,
    pub field: Option<FieldKey>,
    pub purpose: TimerPurpose,
}

impl TimerKey {
    pub fn debounce(entity_id: EntityId, field: FieldKey) -> Self {
        Self {
            entity_id: Some(entity_id),
            field: Some(field),
            purpose: TimerPurpose::Debounce,
        }
    }

    pub fn global(purpose: TimerPurpose) -> Self {
        Self {
            entity_id: None,
            field: None,
            purpose,
        }
    }
}

/// Every timer the session arms lives here, so cancellation on teardown is a
/// single sweep instead of many ad-hoc clears. Fired timers re-enter the
/// session loop as events.
pub struct TimerRegistry {
    fired: mpsc::UnboundedSender<TimerKey>,
    timers: Mutex<HashMap<TimerKey, JoinHandle<()>>>,
}

impl TimerRegistry {
    pub fn new(fired: mpsc::UnboundedSender<TimerKey>) -> Self {
        Self {
            fired,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Arm a one-shot timer. Re-arming an existing key replaces it, which is
    /// exactly the debounce reset a coalescer lane needs.
    pub fn schedule(&self, key: TimerKey, delay: Duration) {
        let fired = self.fired.clone();
        let send_key = key.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = fired.send(send_key);
        });
        if let Some(previous) = self.timers.lock().insert(key, handle) {
            previous.abort();
        }
    }

    /// Arm a repeating timer that fires every `period` until cancelled.
    pub fn schedule_repeating(&self, key: TimerKey, period: Duration) {
        let fired = self.fired.clone();
        let send_key = key.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.tick().await; // the immediate first tick is not a period
            loop {
                ticker.tick().await;
                if fired.send(send_key.clone()).is_err() {
                    return;
                }
            }
        });
        if let Some(previous) = self.timers.lock().insert(key, handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self, key: &TimerKey) {
        if let Some(handle) = self.timers.lock().remove(key) {
            handle.abort();
        }
    }

    /// Cancel every timer scoped to one entity (active-entity switch).
    pub fn cancel_entity(&self, entity_id: &EntityId) {
        let mut timers = self.timers.lock();
        timers.retain(|key, handle| {
            if key.entity_id.as_ref() == Some(entity_id) {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// The teardown sweep: after this returns, no timer fires.
    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
