use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::protocol::{EntityId, EntityKind, EntitySnapshot, FieldKey};

pub mod pending;

pub use pending::{EditState, PendingEdit, Tolerance};

/// Why a merged-view update was emitted. Every reason except `Snapshot`
/// bypasses the render gate: local edits must track the user's gesture, and
/// edit resolution / removal must never leave a stale control behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    Snapshot,
    LocalEdit,
    EditResolved,
    Removed,
}

impl UpdateReason {
    pub fn is_forced(&self) -> bool {
        !matches!(self, UpdateReason::Snapshot)
    }
}

/// A merged view (authoritative value with unresolved optimistic overlays)
/// handed downstream whenever a tracked entity changes.
#[derive(Debug, Clone)]
pub struct MergedUpdate {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    /// `None` when the entity was removed.
    pub view: Option<Value>,
    pub reason: UpdateReason,
}

/// Handle returned from [`EntityStore::subscribe`]; drop it or call
/// [`EntityStore::unsubscribe`] with `id` to stop receiving updates.
pub struct StoreSubscription {
    pub id: u64,
    pub updates: mpsc::UnboundedReceiver<MergedUpdate>,
}

struct Subscriber {
    filter: Option<EntityId>,
    tx: mpsc::UnboundedSender<MergedUpdate>,
}

struct TrackedEntity {
    kind: EntityKind,
    /// Absent until the first snapshot arrives (the entity may be created by
    /// a local edit first).
    authoritative: Option<Value>,
    /// Receipt-order stamp of `authoritative`; only ever moves forward.
    stamp: u64,
    pending: HashMap<FieldKey, PendingEdit>,
}

impl TrackedEntity {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            authoritative: None,
            stamp: 0,
            pending: HashMap::new(),
        }
    }

    /// Authoritative value with live optimistic overlays applied field by
    /// field. A pending edit never hides snapshot data for other fields.
    fn merged(&self) -> Value {
        let mut map = match &self.authoritative {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => return other.clone(),
            None => Map::new(),
        };
        for (field, edit) in &self.pending {
            if edit.is_live() {
                map.insert(field.clone(), edit.value.clone());
            }
        }
        Value::Object(map)
    }
}

#[derive(Default)]
struct StoreInner {
    entities: HashMap<EntityId, TrackedEntity>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
}

/// Single source of truth for what the service last said the world looks
/// like, merged with edits in flight. All operations are synchronous over
/// in-memory state; every other component goes through this contract.
#[derive(Default)]
pub struct EntityStore {
    inner: Mutex<StoreInner>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to merged-view updates, optionally filtered to one entity.
    pub fn subscribe(&self, filter: Option<EntityId>) -> StoreSubscription {
        let (tx, updates) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, Subscriber { filter, tx });
        StoreSubscription { id, updates }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().subscribers.remove(&id);
    }

    /// Apply a full collection snapshot. Entities of `kind` that are absent
    /// from `entities` and older than this snapshot are removed.
    pub fn apply_collection(
        &self,
        kind: EntityKind,
        entities: Vec<EntitySnapshot>,
        stamp: u64,
        now: Instant,
    ) {
        let mut inner = self.inner.lock();
        let mut seen: Vec<EntityId> = Vec::with_capacity(entities.len());
        for snapshot in entities {
            let id = snapshot.id.clone();
            seen.push(id.clone());
            let value = snapshot.into_value();
            apply_value(&mut inner, id, kind, value, stamp, now);
        }
        let removed: Vec<EntityId> = inner
            .entities
            .iter()
            .filter(|(id, entity)| {
                entity.kind == kind && entity.stamp < stamp && !seen.contains(id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in removed {
            let entity = inner.entities.remove(&id);
            if let Some(entity) = entity {
                trace!(entity_id = %id, "entity removed by snapshot");
                emit(
                    &mut inner,
                    MergedUpdate {
                        entity_id: id,
                        kind: entity.kind,
                        view: None,
                        reason: UpdateReason::Removed,
                    },
                );
            }
        }
    }

    /// Apply a snapshot for a single entity, replacing its value.
    pub fn apply_snapshot(
        &self,
        entity_id: EntityId,
        kind: EntityKind,
        value: Value,
        stamp: u64,
        now: Instant,
    ) {
        let mut inner = self.inner.lock();
        apply_value(&mut inner, entity_id, kind, value, stamp, now);
    }

    /// Apply a delta event: shallow-merge changed fields over the stored
    /// authoritative value.
    pub fn apply_event(
        &self,
        entity_id: EntityId,
        kind: EntityKind,
        changed: Map<String, Value>,
        stamp: u64,
        now: Instant,
    ) {
        let mut inner = self.inner.lock();
        let mut base = match inner.entities.get(&entity_id).and_then(|e| e.authoritative.clone()) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (field, value) in changed {
            base.insert(field, value);
        }
        apply_value(&mut inner, entity_id, kind, Value::Object(base), stamp, now);
    }

    /// Register an optimistic local edit. Supersedes any live edit on the
    /// same field and emits the merged view immediately for instant feedback.
    pub fn register_local_edit(
        &self,
        entity_id: EntityId,
        kind: EntityKind,
        field: FieldKey,
        value: Value,
        window: Duration,
        tolerance: Tolerance,
        now: Instant,
    ) {
        let mut inner = self.inner.lock();
        let entity = inner
            .entities
            .entry(entity_id.clone())
            .or_insert_with(|| TrackedEntity::new(kind));
        if let Some(previous) = entity.pending.get_mut(&field) {
            previous.supersede();
        }
        entity
            .pending
            .insert(field, PendingEdit::new(value, window, tolerance, now));
        let update = MergedUpdate {
            entity_id,
            kind: entity.kind,
            view: Some(entity.merged()),
            reason: UpdateReason::LocalEdit,
        };
        emit(&mut inner, update);
    }

    /// The coalescer put a command for this field on the wire.
    pub fn note_edit_in_flight(&self, entity_id: &EntityId, field: &str) {
        let mut inner = self.inner.lock();
        if let Some(edit) = inner
            .entities
            .get_mut(entity_id)
            .and_then(|e| e.pending.get_mut(field))
        {
            edit.mark_in_flight();
        }
    }

    /// Drop edits whose reconciliation window has elapsed; authoritative
    /// wins. Emits an update for every entity whose merged view changed.
    pub fn sweep_expired(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let mut changed: Vec<(EntityId, EntityKind, Value)> = Vec::new();
        for (id, entity) in inner.entities.iter_mut() {
            let before = entity.pending.len();
            entity
                .pending
                .retain(|_, edit| edit.is_live() && !edit.expired(now));
            if entity.pending.len() != before {
                changed.push((id.clone(), entity.kind, entity.merged()));
            }
        }
        for (entity_id, kind, view) in changed {
            emit(
                &mut inner,
                MergedUpdate {
                    entity_id,
                    kind,
                    view: Some(view),
                    reason: UpdateReason::Snapshot,
                },
            );
        }
    }

    /// Current merged view for one entity.
    pub fn merged_view(&self, entity_id: &EntityId) -> Option<Value> {
        let inner = self.inner.lock();
        inner.entities.get(entity_id).map(|e| e.merged())
    }

    /// Build a merged update on demand (re-renders outside the snapshot
    /// path, e.g. the playback tick or an active-entity switch).
    pub fn merged_update(&self, entity_id: &EntityId, reason: UpdateReason) -> Option<MergedUpdate> {
        let inner = self.inner.lock();
        inner.entities.get(entity_id).map(|entity| MergedUpdate {
            entity_id: entity_id.clone(),
            kind: entity.kind,
            view: Some(entity.merged()),
            reason,
        })
    }

    /// Forget everything (session stop).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entities.clear();
    }

    #[cfg(test)]
    fn stamp_of(&self, entity_id: &EntityId) -> Option<u64> {
        self.inner.lock().entities.get(entity_id).map(|e| e.stamp)
    }

    #[cfg(test)]
    fn live_edits(&self, entity_id: &EntityId) -> usize {
        self.inner
            .lock()
            .entities
            .get(entity_id)
            .map(|e| e.pending.values().filter(|p| p.is_live()).count())
            .unwrap_or(0)
    }
}

/// Core snapshot application: stale-stamp discard, store, resolve pending
/// edits by tolerance, emit the merged view.
fn apply_value(
    inner: &mut StoreInner,
    entity_id: EntityId,
    kind: EntityKind,
    value: Value,
    stamp: u64,
    now: Instant,
) {
    let entity = inner
        .entities
        .entry(entity_id.clone())
        .or_insert_with(|| TrackedEntity::new(kind));
    if stamp <= entity.stamp {
        trace!(entity_id = %entity_id, stamp, stored = entity.stamp, "discarding stale snapshot");
        return;
    }
    entity.stamp = stamp;
    entity.authoritative = Some(value);

    let mut resolved = false;
    let authoritative = entity.authoritative.clone();
    entity.pending.retain(|field, edit| {
        if !edit.is_live() {
            return false;
        }
        let confirmed = authoritative
            .as_ref()
            .and_then(|v| v.get(field.as_str()))
            .is_some_and(|server_value| edit.tolerance.accepts(server_value, &edit.value));
        if confirmed {
            edit.resolve();
            resolved = true;
            return false;
        }
        !edit.expired(now)
    });

    let update = MergedUpdate {
        entity_id,
        kind: entity.kind,
        view: Some(entity.merged()),
        reason: if resolved {
            UpdateReason::EditResolved
        } else {
            UpdateReason::Snapshot
        },
    };
    emit(inner, update);
}

fn emit(inner: &mut StoreInner, update: MergedUpdate) {
    inner.subscribers.retain(|_, sub| {
        let wanted = sub
            .filter
            .as_ref()
            .is_none_or(|filter| *filter == update.entity_id);
        if !wanted {
            return true;
        }
        sub.tx.send(update.clone()).is_ok()
    });
}
