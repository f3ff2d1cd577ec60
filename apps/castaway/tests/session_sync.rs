//! End-to-end session scenarios against an in-memory service boundary:
//! push frames and command submissions are both faked, so every test runs
//! on tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time;

use castaway_client_core::client::coalescer::CommandSink;
use castaway_client_core::client::render_gate::FocusClaim;
use castaway_client_core::config::Config;
use castaway_client_core::protocol::{
    Command, CommandError, EntityId, EntityKind, EntitySnapshot,
};
use castaway_client_core::session::{Session, SessionHandle};
use castaway_client_core::store::{MergedUpdate, UpdateReason};
use castaway_client_core::transport::{
    PushConnector, PushLink, SnapshotApi, TransportError,
};

/// Hands out one scripted push connection; reconnect attempts hang forever.
struct ScriptedPush {
    link: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ScriptedPush {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                link: Mutex::new(Some(rx)),
            }),
            tx,
        )
    }
}

#[async_trait]
impl PushConnector for ScriptedPush {
    async fn connect(&self) -> Result<Box<dyn PushLink>, TransportError> {
        let taken = self.link.lock().take();
        match taken {
            Some(rx) => Ok(Box::new(ScriptedLink { rx })),
            None => {
                // Keep the supervisor suspended without touching the clock.
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

struct ScriptedLink {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl PushLink for ScriptedLink {
    async fn next_frame(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Snapshot endpoint that always answers with nothing.
struct EmptyApi;

#[async_trait]
impl SnapshotApi for EmptyApi {
    async fn fetch(&self, _kind: EntityKind) -> Result<Vec<EntitySnapshot>, TransportError> {
        Ok(Vec::new())
    }
}

struct RecordingSink {
    calls: Mutex<Vec<(EntityId, Command)>>,
    latency: Mutex<Duration>,
    fail: Mutex<bool>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
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
        let latency = *self.latency.lock();
        time::sleep(latency).await;
        self.calls.lock().push((entity_id.clone(), command.clone()));
        if *self.fail.lock() {
            Err(CommandError::Rejected {
                status: 409,
                message: "another controller owns this node".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

struct Rig {
    handle: SessionHandle,
    push: mpsc::UnboundedSender<String>,
    sink: Arc<RecordingSink>,
}

fn test_config() -> Config {
    Config {
        quiet_period: Duration::from_millis(120),
        edit_window: Duration::from_millis(5_000),
        seek_window: Duration::from_millis(3_000),
        seek_tolerance_ms: 750,
        // Keep the background cadences out of short test windows.
        poll_interval: Duration::from_secs(3_600),
        render_tick: Duration::from_secs(3_600),
        reconnect_base: Duration::from_secs(3_600),
        prefs_path: None,
        ..Config::default()
    }
}

async fn start_rig(config: Config) -> Rig {
    let (push, push_tx) = ScriptedPush::new();
    let sink = RecordingSink::new();
    let handle = Session::start(config, push, Arc::new(EmptyApi), sink.clone());
    // Let the supervisor pick up the scripted connection.
    time::sleep(Duration::from_millis(1)).await;
    Rig {
        handle,
        push: push_tx,
        sink,
    }
}

fn node_snapshot_frame(entities: &[(&str, serde_json::Value)]) -> String {
    let entities: Vec<serde_json::Value> = entities
        .iter()
        .map(|(id, fields)| {
            let mut object = fields.clone();
            object["id"] = json!(id);
            object
        })
        .collect();
    json!({ "type": "snapshot", "kind": "node", "entities": entities }).to_string()
}

fn player_snapshot_frame(id: &str, progress_ms: u64, playing: bool) -> String {
    json!({
        "type": "snapshot",
        "kind": "player_status",
        "entities": [{
            "id": id,
            "progress_ms": progress_ms,
            "duration_ms": 180_000,
            "is_playing": playing,
        }],
    })
    .to_string()
}

async fn next_view(rig: &mut Rig) -> MergedUpdate {
    time::timeout(Duration::from_secs(5), rig.handle.views.recv())
        .await
        .expect("view update within deadline")
        .expect("views channel open")
}

fn drain_views(rig: &mut Rig) {
    while rig.handle.views.try_recv().is_ok() {}
}

#[tokio::test(start_paused = true)]
async fn volume_drag_produces_exactly_one_command() {
    let mut rig = start_rig(test_config()).await;
    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "volume_percent": 50 }))]))
        .unwrap();
    let _ = next_view(&mut rig).await;

    // Two drag steps within 100 ms: 50 -> 70 -> 55.
    rig.handle
        .mutate("n1".into(), EntityKind::Node, Command::SetVolume { percent: 70 });
    time::sleep(Duration::from_millis(50)).await;
    rig.handle
        .mutate("n1".into(), EntityKind::Node, Command::SetVolume { percent: 55 });
    time::sleep(Duration::from_millis(300)).await;

    let calls = rig.sink.calls();
    assert_eq!(calls.len(), 1, "burst must coalesce to one command");
    assert_eq!(calls[0], ("n1".to_string(), Command::SetVolume { percent: 55 }));

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn optimistic_volume_survives_stale_snapshot_until_confirmed() {
    let mut rig = start_rig(test_config()).await;
    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "volume_percent": 50 }))]))
        .unwrap();
    let _ = next_view(&mut rig).await;

    rig.handle
        .mutate("n1".into(), EntityKind::Node, Command::SetVolume { percent: 80 });
    let local = next_view(&mut rig).await;
    assert_eq!(local.reason, UpdateReason::LocalEdit);
    assert_eq!(local.view.unwrap()["volume_percent"], 80);

    // A stale snapshot (still 50) must not revert the slider.
    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "volume_percent": 50 }))]))
        .unwrap();
    let update = next_view(&mut rig).await;
    assert_eq!(update.view.unwrap()["volume_percent"], 80);

    // The confirming snapshot resolves the edit and paints authoritative.
    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "volume_percent": 80 }))]))
        .unwrap();
    let update = next_view(&mut rig).await;
    assert_eq!(update.reason, UpdateReason::EditResolved);
    assert_eq!(update.view.unwrap()["volume_percent"], 80);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn focused_control_defers_snapshots_until_release() {
    let mut rig = start_rig(test_config()).await;
    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "name": "Kitchen" }))]))
        .unwrap();
    let _ = next_view(&mut rig).await;

    let claim = FocusClaim::new("n1", "name");
    rig.handle.claim_focus(claim.clone());
    time::sleep(Duration::from_millis(1)).await;

    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "name": "Garage" }))]))
        .unwrap();
    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "name": "Garage 2" }))]))
        .unwrap();
    time::sleep(Duration::from_millis(50)).await;
    assert!(
        rig.handle.views.try_recv().is_err(),
        "no update may reach a focused region"
    );

    rig.handle.release_focus(claim);
    let flushed = next_view(&mut rig).await;
    assert_eq!(flushed.view.unwrap()["name"], "Garage 2");
    assert!(rig.handle.views.try_recv().is_err(), "flushed exactly once");

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn seek_prediction_masks_lagging_snapshots_then_expires() {
    let mut rig = start_rig(test_config()).await;
    rig.push
        .send(player_snapshot_frame("ch1", 55_000, false))
        .unwrap();
    let _ = next_view(&mut rig).await;
    rig.handle.select_channel("ch1".into());
    time::sleep(Duration::from_millis(1)).await;
    drain_views(&mut rig);

    rig.handle.seek(90_000);
    let predicted = next_view(&mut rig).await;
    assert_eq!(predicted.view.unwrap()["progress_ms"], 90_000);

    // A stale poll inside the window reports the old position.
    rig.push
        .send(player_snapshot_frame("ch1", 60_000, false))
        .unwrap();
    let update = next_view(&mut rig).await;
    assert_eq!(update.view.unwrap()["progress_ms"], 90_000);

    // Window expires with no confirming snapshot: authoritative wins.
    time::sleep(Duration::from_millis(3_500)).await;
    rig.push
        .send(player_snapshot_frame("ch1", 61_000, false))
        .unwrap();
    let update = next_view(&mut rig).await;
    assert_eq!(update.view.unwrap()["progress_ms"], 61_000);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn seek_confirmation_within_tolerance_hands_back_to_authoritative() {
    let mut rig = start_rig(test_config()).await;
    rig.push
        .send(player_snapshot_frame("ch1", 10_000, false))
        .unwrap();
    let _ = next_view(&mut rig).await;
    rig.handle.select_channel("ch1".into());
    time::sleep(Duration::from_millis(1)).await;
    drain_views(&mut rig);

    rig.handle.seek(90_000);
    let _ = next_view(&mut rig).await;

    rig.push
        .send(player_snapshot_frame("ch1", 89_600, true))
        .unwrap();
    let update = next_view(&mut rig).await;
    assert_eq!(update.view.unwrap()["progress_ms"], 89_600);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn command_rejection_raises_notice_and_keeps_optimistic_value() {
    let mut rig = start_rig(test_config()).await;
    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "volume_percent": 50 }))]))
        .unwrap();
    let _ = next_view(&mut rig).await;
    *rig.sink.fail.lock() = true;

    rig.handle
        .commit("n1".into(), EntityKind::Node, Command::SetVolume { percent: 80 });
    time::sleep(Duration::from_millis(50)).await;

    let notice = rig.handle.notices.try_recv().expect("rejection notice");
    assert!(notice.message.contains("another controller"));

    // No rollback: the overlay stays until the next authoritative snapshot.
    let local = next_view(&mut rig).await;
    assert_eq!(local.view.unwrap()["volume_percent"], 80);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn queued_value_follows_in_flight_command_in_order() {
    let mut rig = start_rig(test_config()).await;
    *rig.sink.latency.lock() = Duration::from_millis(400);
    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "volume_percent": 50 }))]))
        .unwrap();
    let _ = next_view(&mut rig).await;

    rig.handle
        .commit("n1".into(), EntityKind::Node, Command::SetVolume { percent: 60 });
    time::sleep(Duration::from_millis(100)).await;
    // First command still on the wire; these park and collapse.
    rig.handle
        .mutate("n1".into(), EntityKind::Node, Command::SetVolume { percent: 65 });
    rig.handle
        .mutate("n1".into(), EntityKind::Node, Command::SetVolume { percent: 72 });
    time::sleep(Duration::from_millis(1_000)).await;

    let calls = rig.sink.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, Command::SetVolume { percent: 60 });
    assert_eq!(calls[1].1, Command::SetVolume { percent: 72 });

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn teardown_cancels_timers_and_in_flight_commands() {
    let mut rig = start_rig(test_config()).await;
    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "volume_percent": 50 }))]))
        .unwrap();
    let _ = next_view(&mut rig).await;

    *rig.sink.latency.lock() = Duration::from_secs(10);
    // One edit pending its quiet period, one command in flight.
    rig.handle
        .commit("n1".into(), EntityKind::Node, Command::SetVolume { percent: 60 });
    rig.handle
        .mutate("n1".into(), EntityKind::Node, Command::SetVolume { percent: 70 });
    time::sleep(Duration::from_millis(10)).await;

    rig.handle.stop().await;
    time::sleep(Duration::from_secs(60)).await;

    assert!(
        rig.sink.calls().is_empty(),
        "no command may complete after teardown"
    );
    // The session task is gone; once the pre-stop updates drain, nothing
    // can repaint.
    drain_views(&mut rig);
    let _ = rig.push.send(node_snapshot_frame(&[("n1", json!({ "volume_percent": 10 }))]));
    time::sleep(Duration::from_secs(1)).await;
    assert!(rig.handle.views.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn entity_removed_by_full_snapshot_reaches_the_view() {
    let mut rig = start_rig(test_config()).await;
    rig.push
        .send(node_snapshot_frame(&[
            ("n1", json!({ "name": "Kitchen" })),
            ("n2", json!({ "name": "Porch" })),
        ]))
        .unwrap();
    let _ = next_view(&mut rig).await;
    let _ = next_view(&mut rig).await;

    rig.push
        .send(node_snapshot_frame(&[("n1", json!({ "name": "Kitchen" }))]))
        .unwrap();
    let mut saw_removal = false;
    for _ in 0..2 {
        let update = next_view(&mut rig).await;
        if update.reason == UpdateReason::Removed {
            assert_eq!(update.entity_id, "n2");
            assert!(update.view.is_none());
            saw_removal = true;
        }
    }
    assert!(saw_removal);

    rig.handle.stop().await;
}
