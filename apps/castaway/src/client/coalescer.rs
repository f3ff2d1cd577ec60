use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::timers::{TimerKey, TimerRegistry};
use crate::protocol::{Command, CommandError, EntityId, FieldKey};

/// Outbound command boundary: HTTP in production, in-memory fakes in tests.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn submit(
        &self,
        request_id: &str,
        entity_id: &EntityId,
        command: &Command,
    ) -> Result<(), CommandError>;
}

/// Completion of a dispatched command, re-entering the session loop.
#[derive(Debug)]
pub struct CommandSettled {
    pub entity_id: EntityId,
    pub field: FieldKey,
    pub request_id: String,
    pub result: Result<(), CommandError>,
}

/// A dispatch the session should mirror into the store (`Pending` →
/// `InFlight`).
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub entity_id: EntityId,
    pub field: FieldKey,
    pub request_id: String,
}

struct Lane {
    latest: Command,
    in_flight: Option<JoinHandle<()>>,
    queued: Option<Command>,
}

/// Collapses bursts of local mutations into one outbound command per quiet
/// period, with at most one command in flight per `(entity, field)` lane. A
/// value arriving while a command is outstanding parks in the lane and goes
/// out the moment the in-flight command settles, preserving order.
pub struct EditCoalescer {
    sink: Arc<dyn CommandSink>,
    timers: Arc<TimerRegistry>,
    settled_tx: mpsc::UnboundedSender<CommandSettled>,
    quiet_period: Duration,
    lanes: HashMap<(EntityId, FieldKey), Lane>,
}

impl EditCoalescer {
    pub fn new(
        sink: Arc<dyn CommandSink>,
        timers: Arc<TimerRegistry>,
        settled_tx: mpsc::UnboundedSender<CommandSettled>,
        quiet_period: Duration,
    ) -> Self {
        Self {
            sink,
            timers,
            settled_tx,
            quiet_period,
            lanes: HashMap::new(),
        }
    }

    /// Record a mid-gesture mutation. Re-arms the lane's quiet-period timer;
    /// if a command is already in flight the value parks instead.
    pub fn note_mutation(&mut self, entity_id: EntityId, command: Command) {
        let field: FieldKey = command.field_key().to_string();
        let key = (entity_id.clone(), field.clone());
        let lane = self.lanes.entry(key).or_insert_with(|| Lane {
            latest: command.clone(),
            in_flight: None,
            queued: None,
        });
        lane.latest = command;
        if lane.in_flight.is_some() {
            lane.queued = Some(lane.latest.clone());
            return;
        }
        self.timers
            .schedule(TimerKey::debounce(entity_id, field), self.quiet_period);
    }

    /// Terminal commit (pointer release): bypass the quiet period and flush
    /// now, unless a command is already outstanding.
    pub fn commit(&mut self, entity_id: EntityId, command: Command) -> Option<Dispatched> {
        let field: FieldKey = command.field_key().to_string();
        let key = (entity_id.clone(), field.clone());
        let lane = self.lanes.entry(key).or_insert_with(|| Lane {
            latest: command.clone(),
            in_flight: None,
            queued: None,
        });
        lane.latest = command;
        self.timers
            .cancel(&TimerKey::debounce(entity_id.clone(), field.clone()));
        if lane.in_flight.is_some() {
            lane.queued = Some(lane.latest.clone());
            return None;
        }
        Some(self.dispatch(entity_id, field))
    }

    /// A quiet-period timer fired for this lane.
    pub fn on_quiet_period(&mut self, entity_id: EntityId, field: FieldKey) -> Option<Dispatched> {
        let lane = self.lanes.get(&(entity_id.clone(), field.clone()))?;
        if lane.in_flight.is_some() {
            return None;
        }
        Some(self.dispatch(entity_id, field))
    }

    /// An in-flight command settled; a parked value goes out immediately.
    pub fn on_settled(&mut self, settled: &CommandSettled) -> Option<Dispatched> {
        let key = (settled.entity_id.clone(), settled.field.clone());
        let lane = self.lanes.get_mut(&key)?;
        lane.in_flight = None;
        if lane.queued.take().is_some() {
            return Some(self.dispatch(settled.entity_id.clone(), settled.field.clone()));
        }
        None
    }

    fn dispatch(&mut self, entity_id: EntityId, field: FieldKey) -> Dispatched {
        let key = (entity_id.clone(), field.clone());
        let lane = self.lanes.get_mut(&key).expect("dispatch on missing lane");
        let command = lane.latest.clone();
        let request_id = Uuid::new_v4().to_string();
        debug!(entity_id = %entity_id, field = %field, request_id = %request_id, "dispatching command");

        let sink = self.sink.clone();
        let settled_tx = self.settled_tx.clone();
        let task_entity = entity_id.clone();
        let task_field = field.clone();
        let task_request = request_id.clone();
        lane.in_flight = Some(tokio::spawn(async move {
            let result = sink.submit(&task_request, &task_entity, &command).await;
            let _ = settled_tx.send(CommandSettled {
                entity_id: task_entity,
                field: task_field,
                request_id: task_request,
                result,
            });
        }));

        Dispatched {
            entity_id,
            field,
            request_id,
        }
    }

    /// Abort every in-flight dispatch. Nothing settles after this returns.
    pub fn abort_all(&mut self) {
        for lane in self.lanes.values_mut() {
            if let Some(handle) = lane.in_flight.take() {
                handle.abort();
            }
        }
        self.lanes.clear();
    }

    #[cfg(test)]
    fn has_in_flight(&self, entity_id: &str, field: &str) -> bool {
        self.lanes
            .get(&(entity_id.to_string(), field.to_string()))
            .is_some_and(|lane| lane.in_flight.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time;

    struct RecordingSink {
        calls: Mutex<Vec<(EntityId, Command)>>,
        latency: Duration,
        fail: Mutex<bool>,
    }

    impl RecordingSink {
        fn new(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                latency,
                fail: Mutex::new(false),
            })
        }

        fn calls(&self) -> Vec<(EntityId, Command)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn submit(
            &self,
            _request_id: &str,
            entity_id: &EntityId,
            command: &Command,
        ) -> Result<(), CommandError> {
            time::sleep(self.latency).await;
            self.calls.lock().push((entity_id.clone(), command.clone()));
            if *self.fail.lock() {
                Err(CommandError::Rejected {
                    status: 409,
                    message: "conflict".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct Rig {
        coalescer: EditCoalescer,
        sink: Arc<RecordingSink>,
        timer_rx: mpsc::UnboundedReceiver<TimerKey>,
        settled_rx: mpsc::UnboundedReceiver<CommandSettled>,
    }

    fn rig(quiet: Duration, latency: Duration) -> Rig {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        let sink = RecordingSink::new(latency);
        let coalescer = EditCoalescer::new(
            sink.clone(),
            Arc::new(TimerRegistry::new(timer_tx)),
            settled_tx,
            quiet,
        );
        Rig {
            coalescer,
            sink,
            timer_rx,
            settled_rx,
        }
    }

    /// Drain fired timers into the coalescer, the way the session loop does.
    fn pump_timers(rig: &mut Rig) -> Vec<Dispatched> {
        let mut dispatched = Vec::new();
        while let Ok(key) = rig.timer_rx.try_recv() {
            let entity = key.entity_id.clone().unwrap();
            let field = key.field.clone().unwrap();
            if let Some(d) = rig.coalescer.on_quiet_period(entity, field) {
                dispatched.push(d);
            }
        }
        dispatched
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_one_command_with_final_value() {
        let mut rig = rig(Duration::from_millis(120), Duration::ZERO);
        for percent in [50u8, 70, 55] {
            rig.coalescer
                .note_mutation("n1".into(), Command::SetVolume { percent });
            time::sleep(Duration::from_millis(30)).await;
        }
        time::sleep(Duration::from_millis(150)).await;
        pump_timers(&mut rig);
        time::sleep(Duration::from_millis(1)).await;

        let calls = rig.sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, Command::SetVolume { percent: 55 });
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_during_flight_parks_and_follows() {
        let mut rig = rig(Duration::from_millis(50), Duration::from_millis(200));
        rig.coalescer
            .note_mutation("n1".into(), Command::SetVolume { percent: 40 });
        time::sleep(Duration::from_millis(60)).await;
        pump_timers(&mut rig);
        assert!(rig.coalescer.has_in_flight("n1", "volume_percent"));

        // Arrives while the first command is on the wire.
        rig.coalescer
            .note_mutation("n1".into(), Command::SetVolume { percent: 90 });
        time::sleep(Duration::from_millis(250)).await;
        let settled = rig.settled_rx.try_recv().unwrap();
        assert!(settled.result.is_ok());
        let follow = rig.coalescer.on_settled(&settled);
        assert!(follow.is_some());
        time::sleep(Duration::from_millis(250)).await;

        let calls = rig.sink.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, Command::SetVolume { percent: 40 });
        assert_eq!(calls[1].1, Command::SetVolume { percent: 90 });
    }

    #[tokio::test(start_paused = true)]
    async fn commit_flushes_without_waiting() {
        let mut rig = rig(Duration::from_millis(120), Duration::ZERO);
        rig.coalescer
            .note_mutation("n1".into(), Command::SetVolume { percent: 40 });
        let dispatched = rig
            .coalescer
            .commit("n1".into(), Command::SetVolume { percent: 42 });
        assert!(dispatched.is_some());
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(rig.sink.calls().len(), 1);
        assert_eq!(rig.sink.calls()[0].1, Command::SetVolume { percent: 42 });

        // The stale quiet-period timer must not produce a second send.
        time::sleep(Duration::from_millis(200)).await;
        let settled = rig.settled_rx.try_recv().unwrap();
        rig.coalescer.on_settled(&settled);
        pump_timers(&mut rig);
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(rig.sink.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_settles_and_releases_the_lane() {
        let mut rig = rig(Duration::from_millis(50), Duration::ZERO);
        *rig.sink.fail.lock() = true;
        rig.coalescer
            .commit("n1".into(), Command::SetVolume { percent: 40 });
        time::sleep(Duration::from_millis(1)).await;
        let settled = rig.settled_rx.try_recv().unwrap();
        assert!(settled.result.is_err());
        rig.coalescer.on_settled(&settled);
        assert!(!rig.coalescer.has_in_flight("n1", "volume_percent"));

        // The lane accepts new work after a failure.
        *rig.sink.fail.lock() = false;
        rig.coalescer
            .commit("n1".into(), Command::SetVolume { percent: 45 });
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(rig.sink.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_lanes_do_not_serialize_each_other() {
        let mut rig = rig(Duration::from_millis(50), Duration::from_millis(500));
        rig.coalescer
            .commit("n1".into(), Command::SetVolume { percent: 40 });
        rig.coalescer
            .commit("n2".into(), Command::SetVolume { percent: 60 });
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(rig.sink.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_all_prevents_late_settles() {
        let mut rig = rig(Duration::from_millis(50), Duration::from_millis(200));
        rig.coalescer
            .commit("n1".into(), Command::SetVolume { percent: 40 });
        rig.coalescer.abort_all();
        time::sleep(Duration::from_millis(500)).await;
        assert!(rig.settled_rx.try_recv().is_err());
        assert!(rig.sink.calls().is_empty());
    }
}
