use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::protocol::{EntityKind, EntitySnapshot, ServerFrame};

pub mod http;
pub mod websocket;

/// Connection lifecycle of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPhase {
    Disconnected,
    Connecting,
    Connected,
    /// Push is down; timed polling keeps the view fresh while reconnecting.
    PollingFallback,
}

/// Errors raised at the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("poll failed: {0}")]
    Poll(String),
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

/// A live push connection; yields raw frames until the peer goes away.
#[async_trait]
pub trait PushLink: Send {
    async fn next_frame(&mut self) -> Option<String>;
}

/// Establishes push connections. The seam tests replace with an in-memory
/// pair.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushLink>, TransportError>;
}

/// Idempotent snapshot GETs, one entity collection per call.
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    async fn fetch(&self, kind: EntityKind) -> Result<Vec<EntitySnapshot>, TransportError>;
}

/// Inbound transport events, consumed by the session loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// A parsed frame with its receipt-order stamp.
    Frame { frame: ServerFrame, stamp: u64 },
    Phase(TransportPhase),
    /// Sustained connection failure worth telling the user about.
    Advisory(String),
}

/// Session-monotonic receipt-order clock; stamps start at 1. Push frames
/// stamp on receipt. The poller captures a stamp *before* issuing its GET:
/// the response carries data that is at best as fresh as the request, so a
/// poll that races a newer push frame loses at the store.
#[derive(Clone, Default)]
pub struct ReceiptClock(Arc<AtomicU64>);

impl ReceiptClock {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Reconnect/poll tuning, copied out of [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct TransportTuning {
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// Attempt counter stops growing here, capping the delay.
    pub reconnect_ceiling: u32,
    /// Consecutive failed attempts before a user-visible advisory.
    pub advisory_threshold: u32,
    pub poll_interval: Duration,
}

/// `min(base * 2^attempt, cap)`.
fn backoff_delay(tuning: &TransportTuning, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    tuning
        .reconnect_base
        .saturating_mul(factor)
        .min(tuning.reconnect_cap)
}

struct Shared {
    connector: Arc<dyn PushConnector>,
    api: Arc<dyn SnapshotApi>,
    tuning: TransportTuning,
    events: mpsc::UnboundedSender<TransportEvent>,
    clock: ReceiptClock,
    phase: RwLock<TransportPhase>,
    last_connected_at: Mutex<Option<Instant>>,
    /// Fallback poller task; shared so `stop()` can abort it even while the
    /// supervisor owns its lifecycle.
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn set_phase(&self, next: TransportPhase) {
        let changed = {
            let mut phase = self.phase.write();
            if *phase == next {
                false
            } else {
                *phase = next;
                true
            }
        };
        if changed {
            debug!(phase = ?next, "transport phase");
            let _ = self.events.send(TransportEvent::Phase(next));
        }
    }

    fn ensure_poller(self: &Arc<Self>) {
        let mut slot = self.poller.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let shared = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            run_poller(shared).await;
        }));
    }

    fn stop_poller(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}

/// Push connection supervisor with polling fallback.
///
/// `start()` is idempotent; `stop()` tears everything down and leaves no
/// live timer: the supervisor and poller are the only tasks, and both are
/// aborted (also on drop).
pub struct TransportChannel {
    shared: Arc<Shared>,
    supervisor: Option<JoinHandle<()>>,
}

impl TransportChannel {
    pub fn new(
        connector: Arc<dyn PushConnector>,
        api: Arc<dyn SnapshotApi>,
        tuning: TransportTuning,
        events: mpsc::UnboundedSender<TransportEvent>,
        clock: ReceiptClock,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                api,
                tuning,
                events,
                clock,
                phase: RwLock::new(TransportPhase::Disconnected),
                last_connected_at: Mutex::new(None),
                poller: Mutex::new(None),
            }),
            supervisor: None,
        }
    }

    pub fn phase(&self) -> TransportPhase {
        *self.shared.phase.read()
    }

    pub fn last_connected_at(&self) -> Option<Instant> {
        *self.shared.last_connected_at.lock()
    }

    /// Start the supervisor. Safe to call repeatedly.
    pub fn start(&mut self) {
        if self.supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.supervisor = Some(tokio::spawn(async move {
            run_supervisor(shared).await;
        }));
    }

    /// Tear down the socket, the reconnect timer, and the fallback poller.
    pub fn stop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
        self.shared.stop_poller();
        self.shared.set_phase(TransportPhase::Disconnected);
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
        self.shared.stop_poller();
    }
}

async fn run_supervisor(shared: Arc<Shared>) {
    let mut attempt: u32 = 0;
    let mut advised = false;
    loop {
        // The view must never be more than one poll interval stale, even
        // while a connect attempt is still pending.
        shared.ensure_poller();
        shared.set_phase(TransportPhase::Connecting);
        match shared.connector.connect().await {
            Ok(mut link) => {
                attempt = 0;
                advised = false;
                // Push is healthy; polling must stop this instant.
                shared.stop_poller();
                *shared.last_connected_at.lock() = Some(Instant::now());
                shared.set_phase(TransportPhase::Connected);
                info!("push channel connected");

                while let Some(raw) = link.next_frame().await {
                    let Some(frame) = ServerFrame::parse(&raw) else {
                        continue;
                    };
                    if matches!(frame, ServerFrame::Unknown) {
                        trace!("ignoring unknown frame kind");
                        continue;
                    }
                    let stamp = shared.clock.next();
                    if shared
                        .events
                        .send(TransportEvent::Frame { frame, stamp })
                        .is_err()
                    {
                        return;
                    }
                }
                debug!("push channel closed");
            }
            Err(err) => {
                debug!(error = %err, attempt, "push connect failed");
            }
        }

        // Polling resumes before the reconnect timer runs, so the outage
        // never leaves the view more than one poll interval stale.
        shared.ensure_poller();
        shared.set_phase(TransportPhase::PollingFallback);
        if attempt >= shared.tuning.advisory_threshold && !advised {
            advised = true;
            let _ = shared.events.send(TransportEvent::Advisory(
                "Live updates are unavailable; falling back to periodic refresh.".to_string(),
            ));
        }
        let delay = backoff_delay(&shared.tuning, attempt);
        attempt = (attempt + 1).min(shared.tuning.reconnect_ceiling);
        time::sleep(delay).await;
    }
}

/// Full-state poll at a fixed interval. Runs only while push is down; poll
/// failures are transient and retried on the next tick.
async fn run_poller(shared: Arc<Shared>) {
    let mut ticker = time::interval(shared.tuning.poll_interval);
    loop {
        ticker.tick().await;
        // Stamp before the request goes out, not when the response lands.
        let stamp = shared.clock.next();
        for kind in EntityKind::ALL {
            match shared.api.fetch(kind).await {
                Ok(entities) => {
                    let frame = ServerFrame::Snapshot { kind, entities };
                    if shared
                        .events
                        .send(TransportEvent::Frame { frame, stamp })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    debug!(error = %err, kind = kind.as_str(), "fallback poll failed");
                }
            }
        }
    }
}
