//! Per-session connection state machine.
//!
//! One `SessionRunner` governs one WhatsApp session: it owns the auth
//! directory, the socket, reconnect scheduling, the QR relay, the auth-wipe
//! paths and the Bad-MAC circuit breaker, and it hosts the outbound queue
//! drain and the inbound relay. All events and timers for a session run on
//! its own supervision task, so state transitions are naturally serialized.

mod cache;
mod inbound;
mod outbound;

pub use cache::{CONTACT_CACHE_CAP, ContactCache};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::alias::IdentityAliasStore;
use crate::config::Config;
use crate::edge::EdgeClient;
use crate::qr;
use crate::wa::{CloseReason, ErrorKind, SocketFactory, WaEvent, WaSocket};

pub const STATUS_CONNECTING: &str = "CONNECTING";
pub const STATUS_CONNECTED: &str = "CONNECTED";
pub const STATUS_DISCONNECTED: &str = "DISCONNECTED";

/// Reconnect schedule in seconds, indexed by attempt; saturates at the end.
const RECONNECT_SCHEDULE_SECS: [u64; 6] = [2, 5, 10, 20, 40, 60];
/// Stream-515 restarts use a small uniform random delay instead.
const RESTART_DELAY_MS: std::ops::RangeInclusive<u64> = 2_000..=5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    WipedPendingRestart,
}

/// Typed handle back to the supervisor. Runners hold it weakly; the manager
/// owns the runners (parent-owns-child, never the other way around).
#[async_trait]
pub trait RunnerHost: Send + Sync {
    fn is_desired(&self, session_id: &str) -> bool;
    /// Drop the runtime for a session so `ensure_running` starts fresh.
    async fn reset_runtime(&self, session_id: &str);
    async fn ensure_running(&self, session_id: &str);
}

/// Sliding window of decrypt failures plus the breaker cooldown floor.
pub struct BadMacWindow {
    hits: VecDeque<Instant>,
    breaker_until: Option<Instant>,
    window: Duration,
    threshold: usize,
    cooldown: Duration,
}

impl BadMacWindow {
    pub fn new(window: Duration, threshold: usize, cooldown: Duration) -> Self {
        Self { hits: VecDeque::new(), breaker_until: None, window, threshold, cooldown }
    }

    /// Record one decrypt failure. Returns true when the breaker fires, in
    /// which case the cooldown floor is armed and the window cleared.
    pub fn record(&mut self, now: Instant) -> bool {
        self.hits.push_back(now);
        while let Some(&front) = self.hits.front() {
            if now.duration_since(front) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        let cooling = self.breaker_until.is_some_and(|until| now < until);
        if self.hits.len() >= self.threshold && !cooling {
            self.breaker_until = Some(now + self.cooldown);
            self.hits.clear();
            return true;
        }
        false
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }

    pub fn hit_count(&self) -> usize {
        self.hits.len()
    }
}

enum DriveEnd {
    /// Shutdown was signaled; `stop()` owns the cleanup.
    Shutdown,
    Closed(CloseReason),
    /// The Bad-MAC breaker fired mid-connection.
    Breaker,
    /// Socket creation failed before any event arrived.
    ConnectFailed,
}

enum NextStep {
    Exit,
    Retry(Duration),
}

pub struct SessionRunner {
    pub id: String,
    cfg: Arc<Config>,
    pub(crate) edge: Arc<EdgeClient>,
    pub(crate) http: reqwest::Client,
    factory: Arc<dyn SocketFactory>,
    host: Weak<dyn RunnerHost>,
    pub(crate) alias: IdentityAliasStore,

    state: StdMutex<ConnectionState>,
    connected_at: StdMutex<Option<Instant>>,
    own_jid: StdMutex<Option<String>>,
    priority: AtomicI64,
    reconnect_attempt: AtomicU32,
    intentional_stop: AtomicBool,
    running: AtomicBool,
    bad_mac: StdMutex<BadMacWindow>,
    pub(crate) contact_cache: StdMutex<ContactCache>,

    pub(crate) socket: Mutex<Option<Arc<dyn WaSocket>>>,
    outbound_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) outbound_busy: AtomicBool,
    outbound_stop: Notify,

    shutdown: Notify,
}

impl SessionRunner {
    pub fn new(
        id: &str,
        cfg: Arc<Config>,
        edge: Arc<EdgeClient>,
        http: reqwest::Client,
        factory: Arc<dyn SocketFactory>,
        host: Weak<dyn RunnerHost>,
    ) -> Arc<Self> {
        let auth_dir = cfg.auth_dir(id);
        Arc::new(Self {
            id: id.to_string(),
            alias: IdentityAliasStore::new(id, &auth_dir),
            bad_mac: StdMutex::new(BadMacWindow::new(
                cfg.bad_mac_window,
                cfg.bad_mac_threshold,
                cfg.bad_mac_cooldown,
            )),
            contact_cache: StdMutex::new(ContactCache::new(CONTACT_CACHE_CAP)),
            cfg,
            edge,
            http,
            factory,
            host,
            state: StdMutex::new(ConnectionState::Idle),
            connected_at: StdMutex::new(None),
            own_jid: StdMutex::new(None),
            priority: AtomicI64::new(0),
            reconnect_attempt: AtomicU32::new(0),
            intentional_stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            socket: Mutex::new(None),
            outbound_task: Mutex::new(None),
            outbound_busy: AtomicBool::new(false),
            outbound_stop: Notify::new(),
            shutdown: Notify::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap() = next;
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn set_priority(&self, priority: i64) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn priority(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt.load(Ordering::Relaxed)
    }

    pub fn bad_mac_hits(&self) -> usize {
        self.bad_mac.lock().unwrap().hit_count()
    }

    pub(crate) fn own_jid(&self) -> Option<String> {
        self.own_jid.lock().unwrap().clone()
    }

    /// A session that is not Open can stop at any time; an Open one only
    /// after the cooldown, so momentary priority flips don't thrash it.
    pub fn can_stop(&self, cooldown: Duration) -> bool {
        if self.state() != ConnectionState::Open {
            return true;
        }
        self.connected_at
            .lock()
            .unwrap()
            .is_some_and(|at| at.elapsed() >= cooldown)
    }

    /// Start the supervision loop unless it is already running.
    pub fn spawn(self: &Arc<Self>) {
        if self.running.load(Ordering::SeqCst) {
            return;
        }
        let runner = Arc::clone(self);
        tokio::spawn(runner.run());
    }

    async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(target: "Runner", "[{}] run loop already active", self.id);
            return;
        }
        let _guard = scopeguard::guard((), |_| {
            self.running.store(false, Ordering::SeqCst);
        });

        loop {
            if self.intentional_stop.load(Ordering::SeqCst) {
                break;
            }
            match self.connect_and_drive().await {
                NextStep::Exit => break,
                NextStep::Retry(delay) => {
                    debug!(target: "Runner", "[{}] reconnecting in {delay:?}", self.id);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown.notified() => break,
                    }
                }
            }
        }
        debug!(target: "Runner", "[{}] supervision loop ended", self.id);
    }

    async fn connect_and_drive(self: &Arc<Self>) -> NextStep {
        self.set_state(ConnectionState::Connecting);
        let auth_dir = self.cfg.auth_dir(&self.id);
        if let Err(e) = tokio::fs::create_dir_all(&auth_dir).await {
            error!(target: "Runner", "[{}] cannot create auth dir: {e}", self.id);
            return self.backoff_step();
        }

        self.edge.update_status(&self.id, STATUS_CONNECTING, None).await;

        let created = self.factory.create_socket(&self.id, &auth_dir).await;
        let (socket, mut events) = match created {
            Ok(pair) => pair,
            Err(e) => {
                error!(target: "Runner", "[{}] socket creation failed: {e}", self.id);
                self.set_state(ConnectionState::Idle);
                return self.after_close(DriveEnd::ConnectFailed).await;
            }
        };
        *self.socket.lock().await = Some(Arc::clone(&socket));

        let end = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break DriveEnd::Shutdown,
                event = events.recv() => match event {
                    None => break DriveEnd::Closed(CloseReason::classify(None, "event stream ended")),
                    Some(WaEvent::Close { reason }) => break DriveEnd::Closed(reason),
                    Some(event) => {
                        if self.handle_event(event, &socket).await {
                            break DriveEnd::Breaker;
                        }
                    }
                },
            }
        };

        self.after_close(end).await
    }

    /// Handle one non-close event. Returns true when the Bad-MAC breaker
    /// fired and the connection must be torn down.
    async fn handle_event(self: &Arc<Self>, event: WaEvent, socket: &Arc<dyn WaSocket>) -> bool {
        match event {
            WaEvent::Qr { code } => {
                match qr::to_png_data_url(&code) {
                    Ok(data_url) => {
                        info!(target: "Runner", "[{}] relaying pairing QR", self.id);
                        self.edge
                            .update_status(&self.id, STATUS_CONNECTING, Some(&data_url))
                            .await;
                    }
                    Err(e) => {
                        error!(target: "Runner", "[{}] QR render failed: {e}", self.id);
                    }
                }
                false
            }
            WaEvent::Open { own_jid } => {
                info!(target: "Runner", "[{}] connection open as {own_jid}", self.id);
                *self.own_jid.lock().unwrap() = Some(own_jid);
                self.set_state(ConnectionState::Open);
                *self.connected_at.lock().unwrap() = Some(Instant::now());
                self.reconnect_attempt.store(0, Ordering::Relaxed);
                self.bad_mac.lock().unwrap().clear();
                self.edge.update_status(&self.id, STATUS_CONNECTED, None).await;
                self.start_outbound().await;
                false
            }
            WaEvent::StreamError { detail } => {
                let kind = ErrorKind::from_text(&detail);
                if kind.counts_for_bad_mac() {
                    let fired = self.bad_mac.lock().unwrap().record(Instant::now());
                    if fired {
                        warn!(
                            target: "Runner",
                            "[{}] decrypt failure threshold reached, tripping breaker",
                            self.id
                        );
                        socket.end("bad mac breaker").await;
                        return true;
                    }
                    debug!(target: "Runner", "[{}] decrypt failure recorded ({kind:?})", self.id);
                } else {
                    warn!(target: "Runner", "[{}] stream error: {detail}", self.id);
                }
                false
            }
            WaEvent::MessageUpsert { kind, messages } => {
                if kind.is_relayed() {
                    self.handle_upsert(socket, messages).await;
                }
                false
            }
            WaEvent::Close { .. } => unreachable!("close handled by the drive loop"),
        }
    }

    async fn after_close(self: &Arc<Self>, end: DriveEnd) -> NextStep {
        match end {
            DriveEnd::Shutdown => {
                // stop() posts the status and tears the socket down.
                NextStep::Exit
            }
            DriveEnd::ConnectFailed => {
                self.edge.update_status(&self.id, STATUS_DISCONNECTED, None).await;
                self.decide_next(None).await
            }
            DriveEnd::Closed(reason) => {
                info!(
                    target: "Runner",
                    "[{}] connection closed ({:?}): {}",
                    self.id, reason.kind, reason.detail
                );
                self.leave_open().await;
                self.edge.update_status(&self.id, STATUS_DISCONNECTED, None).await;
                self.decide_next(Some(reason)).await
            }
            DriveEnd::Breaker => {
                self.leave_open().await;
                self.edge.update_status(&self.id, STATUS_DISCONNECTED, None).await;
                self.wipe_auth_and_restart().await;
                NextStep::Exit
            }
        }
    }

    async fn decide_next(self: &Arc<Self>, reason: Option<CloseReason>) -> NextStep {
        if self.intentional_stop.load(Ordering::SeqCst) {
            return NextStep::Exit;
        }
        let Some(host) = self.host.upgrade() else {
            return NextStep::Exit;
        };
        if !host.is_desired(&self.id) {
            info!(target: "Runner", "[{}] no longer desired, not reconnecting", self.id);
            return NextStep::Exit;
        }

        match reason {
            Some(reason) if reason.kind.wipes_auth() => {
                warn!(
                    target: "Runner",
                    "[{}] session invalidated ({:?}), wiping auth state",
                    self.id, reason.kind
                );
                self.wipe_auth_and_restart().await;
                NextStep::Exit
            }
            Some(reason) if reason.kind == ErrorKind::Restart515 => {
                let delay = Duration::from_millis(rand::thread_rng().gen_range(RESTART_DELAY_MS));
                NextStep::Retry(delay)
            }
            _ => self.backoff_step(),
        }
    }

    fn backoff_step(&self) -> NextStep {
        let attempt = self.reconnect_attempt.fetch_add(1, Ordering::Relaxed);
        NextStep::Retry(backoff_delay(attempt))
    }

    /// Tear down Open-state bookkeeping after a close.
    async fn leave_open(&self) {
        self.stop_outbound().await;
        *self.connected_at.lock().unwrap() = None;
        *self.socket.lock().await = None;
        self.set_state(ConnectionState::Idle);
    }

    /// Delete the session's auth material and restart through the manager:
    /// the runtime is reset so the next connect starts from a clean slate.
    async fn wipe_auth_and_restart(&self) {
        self.set_state(ConnectionState::WipedPendingRestart);
        let auth_dir = self.cfg.auth_dir(&self.id);
        match tokio::fs::remove_dir_all(&auth_dir).await {
            Ok(()) => info!(target: "Runner", "[{}] auth directory wiped", self.id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(target: "Runner", "[{}] auth wipe failed: {e}", self.id),
        }
        if let Some(host) = self.host.upgrade() {
            host.reset_runtime(&self.id).await;
            host.ensure_running(&self.id).await;
        }
    }

    /// Graceful stop, driven by the manager: suppress reconnection, end the
    /// socket, stop the queue drain, report DISCONNECTED.
    pub async fn stop(&self) {
        self.intentional_stop.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Closing);
        // notify_one stores a permit, so a loop that is mid-await elsewhere
        // still observes the shutdown on its next select.
        self.shutdown.notify_one();
        self.stop_outbound().await;
        if let Some(socket) = self.socket.lock().await.take() {
            socket.end("intentional stop").await;
        }
        *self.connected_at.lock().unwrap() = None;
        self.set_state(ConnectionState::Idle);
        self.edge.update_status(&self.id, STATUS_DISCONNECTED, None).await;
        info!(target: "Runner", "[{}] stopped", self.id);
    }

    async fn start_outbound(self: &Arc<Self>) {
        let mut slot = self.outbound_task.lock().await;
        if slot.is_some() {
            return;
        }
        let runner = Arc::clone(self);
        let poll = self.cfg.queue_poll;
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(poll) => runner.outbound_tick().await,
                    _ = runner.outbound_stop.notified() => return,
                }
            }
        }));
        debug!(target: "Outbound", "[{}] queue drain started", self.id);
    }

    async fn stop_outbound(&self) {
        let task = self.outbound_task.lock().await.take();
        if let Some(task) = task {
            // Permit-storing notify: the signal lands even mid-tick.
            self.outbound_stop.notify_one();
            // The current tick finishes; every call inside it is bounded by
            // the HTTP timeout.
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(target: "Outbound", "[{}] drain task panicked: {e}", self.id);
                }
            }
            debug!(target: "Outbound", "[{}] queue drain stopped", self.id);
        }
    }

    #[cfg(test)]
    pub(crate) async fn test_attach_socket(&self, socket: Arc<dyn WaSocket>) {
        *self.socket.lock().await = Some(socket);
        self.set_state(ConnectionState::Open);
        *self.connected_at.lock().unwrap() = Some(Instant::now());
    }
}

/// Backoff schedule lookup, saturating at the final entry.
pub fn backoff_delay(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(RECONNECT_SCHEDULE_SECS.len() - 1);
    Duration::from_secs(RECONNECT_SCHEDULE_SECS[idx])
}
