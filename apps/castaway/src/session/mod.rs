use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::client::coalescer::{CommandSettled, CommandSink, EditCoalescer};
use crate::client::predictor::SeekPredictor;
use crate::client::render_gate::{FocusClaim, RenderGate};
use crate::client::timers::{TimerKey, TimerPurpose, TimerRegistry};
use crate::config::Config;
use crate::protocol::{Command, EntityId, EntityKind, ServerFrame, fields};
use crate::store::{EntityStore, MergedUpdate, Tolerance, UpdateReason};
use crate::transport::{
    PushConnector, ReceiptClock, SnapshotApi, TransportChannel, TransportEvent, TransportTuning,
};

pub mod prefs;

use prefs::Preferences;

/// Severity of a user-visible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
}

/// Non-blocking, user-visible condition (the toast channel). Nothing that
/// flows through here is fatal.
#[derive(Debug, Clone)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Requests from the embedding UI into the session loop.
#[derive(Debug)]
pub enum ControlRequest {
    /// A mid-gesture control mutation (slider drag step, EQ nudge).
    Mutate {
        entity_id: EntityId,
        kind: EntityKind,
        command: Command,
    },
    /// Terminal commit of a gesture (pointer release): flush immediately.
    Commit {
        entity_id: EntityId,
        kind: EntityKind,
        command: Command,
    },
    /// Seek within the active channel's track.
    Seek { position_ms: u64 },
    ClaimFocus(FocusClaim),
    ReleaseFocus(FocusClaim),
    VisibilityChanged(bool),
    SelectChannel(EntityId),
    Shutdown,
}

/// Running session handle. `views` carries gated merged-view updates,
/// `notices` the toast-level conditions.
pub struct SessionHandle {
    control: mpsc::UnboundedSender<ControlRequest>,
    pub views: mpsc::UnboundedReceiver<MergedUpdate>,
    pub notices: mpsc::UnboundedReceiver<Notice>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn controls(&self) -> mpsc::UnboundedSender<ControlRequest> {
        self.control.clone()
    }

    pub fn mutate(&self, entity_id: EntityId, kind: EntityKind, command: Command) {
        let _ = self.control.send(ControlRequest::Mutate {
            entity_id,
            kind,
            command,
        });
    }

    pub fn commit(&self, entity_id: EntityId, kind: EntityKind, command: Command) {
        let _ = self.control.send(ControlRequest::Commit {
            entity_id,
            kind,
            command,
        });
    }

    pub fn seek(&self, position_ms: u64) {
        let _ = self.control.send(ControlRequest::Seek { position_ms });
    }

    pub fn claim_focus(&self, claim: FocusClaim) {
        let _ = self.control.send(ControlRequest::ClaimFocus(claim));
    }

    pub fn release_focus(&self, claim: FocusClaim) {
        let _ = self.control.send(ControlRequest::ReleaseFocus(claim));
    }

    pub fn set_visibility(&self, visible: bool) {
        let _ = self.control.send(ControlRequest::VisibilityChanged(visible));
    }

    pub fn select_channel(&self, channel_id: EntityId) {
        let _ = self.control.send(ControlRequest::SelectChannel(channel_id));
    }

    /// Stop the session and wait for teardown to finish. After this, no
    /// timer fires and no command completion mutates state.
    pub async fn stop(&mut self) {
        let _ = self.control.send(ControlRequest::Shutdown);
        let _ = (&mut self.task).await;
    }
}

/// Playback bookkeeping for the locally-advancing progress display.
struct PlaybackState {
    entity_id: EntityId,
    received_at: Instant,
    progress_ms: u64,
    duration_ms: u64,
    playing: bool,
}

/// The session actor: owns every component, fed by one event loop, so all
/// reconciliation, coalescing, and gating decisions are serialized.
pub struct Session {
    config: Config,
    store: EntityStore,
    transport: TransportChannel,
    coalescer: EditCoalescer,
    gate: RenderGate,
    predictor: SeekPredictor,
    timers: Arc<TimerRegistry>,
    prefs: Preferences,
    active_channel: Option<EntityId>,
    playback: Option<PlaybackState>,
    views: mpsc::UnboundedSender<MergedUpdate>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl Session {
    /// Start a session against the given service boundary. The transport
    /// starts connecting immediately; entity state arrives as it lands.
    pub fn start(
        config: Config,
        connector: Arc<dyn PushConnector>,
        api: Arc<dyn SnapshotApi>,
        sink: Arc<dyn CommandSink>,
    ) -> SessionHandle {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (views_tx, views_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<CommandSettled>();
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();

        let timers = Arc::new(TimerRegistry::new(timer_tx));
        let mut transport = TransportChannel::new(
            connector,
            api,
            TransportTuning {
                reconnect_base: config.reconnect_base,
                reconnect_cap: config.reconnect_cap,
                reconnect_ceiling: config.reconnect_ceiling,
                advisory_threshold: config.advisory_threshold,
                poll_interval: config.poll_interval,
            },
            transport_tx,
            ReceiptClock::default(),
        );
        transport.start();

        let coalescer = EditCoalescer::new(
            sink,
            Arc::clone(&timers),
            settled_tx,
            config.quiet_period,
        );

        timers.schedule_repeating(
            TimerKey::global(TimerPurpose::RenderTick),
            config.render_tick,
        );
        timers.schedule_repeating(
            TimerKey::global(TimerPurpose::EditExpiry),
            config.render_tick,
        );

        let prefs = match &config.prefs_path {
            Some(path) => Preferences::load(path),
            None => Preferences::default(),
        };
        let active_channel = prefs.active_channel.clone();
        if let Some(channel) = &active_channel {
            debug!(channel = %channel, "restored active channel preference");
        }

        let store = EntityStore::new();
        let mut store_sub = store.subscribe(None);

        let mut session = Session {
            predictor: SeekPredictor::new(config.seek_window, config.seek_tolerance_ms),
            config,
            store,
            transport,
            coalescer,
            gate: RenderGate::new(),
            timers,
            prefs,
            active_channel,
            playback: None,
            views: views_tx,
            notices: notices_tx,
        };

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(request) = control_rx.recv() => {
                        if session.handle_control(request) {
                            break;
                        }
                    }
                    Some(event) = transport_rx.recv() => session.handle_transport(event),
                    Some(key) = timer_rx.recv() => session.handle_timer(key),
                    Some(settled) = settled_rx.recv() => session.handle_settled(settled),
                    Some(update) = store_sub.updates.recv() => session.handle_store_update(update),
                    else => break,
                }
            }
            session.teardown();
        });

        SessionHandle {
            control: control_tx,
            views: views_rx,
            notices: notices_rx,
            task,
        }
    }

    /// Returns `true` on shutdown.
    fn handle_control(&mut self, request: ControlRequest) -> bool {
        match request {
            ControlRequest::Mutate {
                entity_id,
                kind,
                command,
            } => {
                self.register_edit(&entity_id, kind, &command);
                self.coalescer.note_mutation(entity_id, command);
            }
            ControlRequest::Commit {
                entity_id,
                kind,
                command,
            } => {
                self.register_edit(&entity_id, kind, &command);
                if let Some(dispatched) = self.coalescer.commit(entity_id, command) {
                    self.store
                        .note_edit_in_flight(&dispatched.entity_id, &dispatched.field);
                }
            }
            ControlRequest::Seek { position_ms } => self.handle_seek(position_ms),
            ControlRequest::ClaimFocus(claim) => self.gate.claim(claim),
            ControlRequest::ReleaseFocus(claim) => {
                if let Some(update) = self.gate.release(&claim) {
                    let _ = self.views.send(update);
                }
            }
            ControlRequest::VisibilityChanged(visible) => {
                if visible {
                    for update in self.gate.document_visible() {
                        let _ = self.views.send(update);
                    }
                }
            }
            ControlRequest::SelectChannel(channel_id) => self.select_channel(channel_id),
            ControlRequest::Shutdown => return true,
        }
        false
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame { frame, stamp } => {
                let now = Instant::now();
                match frame {
                    ServerFrame::Snapshot { kind, entities } => {
                        self.store.apply_collection(kind, entities, stamp, now);
                    }
                    ServerFrame::Event { kind, id, fields } => {
                        self.store.apply_event(id, kind, fields, stamp, now);
                    }
                    ServerFrame::Ack { request_id } => {
                        trace!(request_id = %request_id, "command acknowledged on push channel");
                    }
                    ServerFrame::Unknown => {}
                }
            }
            TransportEvent::Phase(phase) => {
                info!(phase = ?phase, "transport phase changed");
            }
            TransportEvent::Advisory(message) => {
                let _ = self.notices.send(Notice {
                    level: NoticeLevel::Warning,
                    message,
                });
            }
        }
    }

    fn handle_timer(&mut self, key: TimerKey) {
        match key.purpose {
            TimerPurpose::Debounce => {
                if let (Some(entity_id), Some(field)) = (key.entity_id, key.field) {
                    if let Some(dispatched) = self.coalescer.on_quiet_period(entity_id, field) {
                        self.store
                            .note_edit_in_flight(&dispatched.entity_id, &dispatched.field);
                    }
                }
            }
            TimerPurpose::EditExpiry => self.store.sweep_expired(Instant::now()),
            TimerPurpose::RenderTick => self.tick_playback(),
        }
    }

    fn handle_settled(&mut self, settled: CommandSettled) {
        if let Err(err) = &settled.result {
            // The optimistic value stays; the next authoritative snapshot
            // is the correction.
            warn!(entity_id = %settled.entity_id, field = %settled.field, error = %err, "command failed");
            let _ = self.notices.send(Notice {
                level: NoticeLevel::Warning,
                message: format!("Change could not be applied: {err}"),
            });
        }
        if let Some(dispatched) = self.coalescer.on_settled(&settled) {
            self.store
                .note_edit_in_flight(&dispatched.entity_id, &dispatched.field);
        }
    }

    fn handle_store_update(&mut self, mut update: MergedUpdate) {
        if update.kind == EntityKind::PlayerStatus
            && self.active_channel.as_ref() == Some(&update.entity_id)
        {
            self.refresh_playback(&mut update);
        }
        if let Some(update) = self.gate.offer(update) {
            let _ = self.views.send(update);
        }
    }

    fn handle_seek(&mut self, position_ms: u64) {
        let Some(channel_id) = self.active_channel.clone() else {
            debug!("seek ignored: no active channel");
            return;
        };
        let duration_ms = self
            .store
            .merged_view(&channel_id)
            .as_ref()
            .and_then(|view| view.get(fields::DURATION))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.predictor
            .note_seek(channel_id.clone(), position_ms, duration_ms, Instant::now());
        if let Some(dispatched) = self
            .coalescer
            .commit(channel_id.clone(), Command::Seek { position_ms })
        {
            self.store
                .note_edit_in_flight(&dispatched.entity_id, &dispatched.field);
        }
        // Paint the predicted position right away.
        if let Some(update) = self
            .store
            .merged_update(&channel_id, UpdateReason::LocalEdit)
        {
            self.handle_store_update(update);
        }
    }

    fn select_channel(&mut self, channel_id: EntityId) {
        if self.active_channel.as_ref() == Some(&channel_id) {
            return;
        }
        // Prediction state is scoped to the previous entity.
        self.predictor.clear();
        self.playback = None;
        self.active_channel = Some(channel_id.clone());
        self.prefs.active_channel = Some(channel_id.clone());
        if let Some(path) = &self.config.prefs_path {
            self.prefs.store(path);
        }
        if let Some(update) = self
            .store
            .merged_update(&channel_id, UpdateReason::Snapshot)
        {
            self.handle_store_update(update);
        }
    }

    fn register_edit(&mut self, entity_id: &EntityId, kind: EntityKind, command: &Command) {
        if matches!(command, Command::Seek { .. }) {
            // Seek display is the predictor's job, not a store overlay.
            return;
        }
        self.store.register_local_edit(
            entity_id.clone(),
            kind,
            command.field_key().to_string(),
            command.optimistic_value(),
            self.config.edit_window,
            tolerance_for(command, self.config.seek_tolerance_ms),
            Instant::now(),
        );
    }

    /// Rebase playback bookkeeping on a fresh merged view and overlay the
    /// displayed progress (local advancement + seek prediction).
    fn refresh_playback(&mut self, update: &mut MergedUpdate) {
        let Some(view) = update.view.as_mut() else {
            self.playback = None;
            return;
        };
        let now = Instant::now();
        let progress_ms = view
            .get(fields::PROGRESS)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let duration_ms = view
            .get(fields::DURATION)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let playing = view
            .get(fields::PLAYING)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.playback = Some(PlaybackState {
            entity_id: update.entity_id.clone(),
            received_at: now,
            progress_ms,
            duration_ms,
            playing,
        });
        let display =
            self.predictor
                .resolve(&update.entity_id, progress_ms, duration_ms, playing, now);
        if let Some(slot) = view.get_mut(fields::PROGRESS) {
            *slot = Value::from(display);
        } else if let Value::Object(map) = view {
            map.insert(fields::PROGRESS.to_string(), Value::from(display));
        }
    }

    /// Advance the displayed progress between snapshots so the bar never
    /// freezes; re-renders through the gate like any other update.
    fn tick_playback(&mut self) {
        let Some(playback) = &self.playback else {
            return;
        };
        if !playback.playing && !self.predictor.is_predicting() {
            return;
        }
        let now = Instant::now();
        let mut base = playback.progress_ms;
        if playback.playing {
            base += now.duration_since(playback.received_at).as_millis() as u64;
            if playback.duration_ms > 0 {
                base = base.min(playback.duration_ms);
            }
        }
        let entity_id = playback.entity_id.clone();
        let duration_ms = playback.duration_ms;
        let playing = playback.playing;
        let display = self
            .predictor
            .resolve(&entity_id, base, duration_ms, playing, now);
        let Some(mut update) = self.store.merged_update(&entity_id, UpdateReason::Snapshot) else {
            return;
        };
        if let Some(view) = update.view.as_mut() {
            if let Some(slot) = view.get_mut(fields::PROGRESS) {
                *slot = Value::from(display);
            } else if let Value::Object(map) = view {
                map.insert(fields::PROGRESS.to_string(), Value::from(display));
            }
        }
        if let Some(update) = self.gate.offer(update) {
            let _ = self.views.send(update);
        }
    }

    /// Scoped-acquisition teardown: one sweep over the timer registry, the
    /// transport, the in-flight commands, and the entity state.
    fn teardown(&mut self) {
        self.timers.cancel_all();
        self.transport.stop();
        self.coalescer.abort_all();
        self.gate.clear();
        self.store.clear();
        info!("session stopped");
    }
}

fn tolerance_for(command: &Command, seek_tolerance_ms: u64) -> Tolerance {
    match command {
        Command::SetVolume { .. } => Tolerance::Within(1.0),
        Command::AssignChannel { .. } => Tolerance::Exact,
        Command::SetEqBands { .. } => Tolerance::Exact,
        Command::Seek { .. } => Tolerance::Within(seek_tolerance_ms as f64),
        Command::SetPlaying { .. } => Tolerance::Exact,
    }
}
