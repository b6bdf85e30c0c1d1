//! Top-level supervisor.
//!
//! The discovery cycle asks the control plane which sessions this worker
//! should run, takes the cluster lock for each target, and creates or stops
//! session runners accordingly. The manager owns every runtime; runners
//! reach back only through the [`RunnerHost`] trait.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::sleep;

use crate::config::Config;
use crate::edge::EdgeClient;
use crate::lock::{LockCoordinator, process_owner_id};
use crate::runner::{RunnerHost, SessionRunner};
use crate::wa::SocketFactory;

const ELIGIBLE_LIMIT: u32 = 50;
const ELIGIBLE_ORDER: &str = "priority.desc";

pub struct InstanceManager {
    cfg: Arc<Config>,
    edge: Arc<EdgeClient>,
    http: reqwest::Client,
    factory: Arc<dyn SocketFactory>,
    pub lock: Arc<LockCoordinator>,
    self_ref: Weak<InstanceManager>,

    runtimes: Mutex<HashMap<String, Arc<SessionRunner>>>,
    desired: StdMutex<HashSet<String>>,
    discovery_busy: AtomicBool,
    stopping: AtomicBool,
    shutdown: Notify,
    lost_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl InstanceManager {
    pub fn new(
        cfg: Arc<Config>,
        edge: Arc<EdgeClient>,
        http: reqwest::Client,
        factory: Arc<dyn SocketFactory>,
    ) -> Arc<Self> {
        let (lock, lost_rx) = LockCoordinator::new(
            Arc::clone(&edge),
            process_owner_id(),
            cfg.lock_ttl,
            cfg.lock_renew,
        );
        Arc::new_cyclic(|self_ref| Self {
            cfg,
            edge,
            http,
            factory,
            lock,
            self_ref: self_ref.clone(),
            runtimes: Mutex::new(HashMap::new()),
            desired: StdMutex::new(HashSet::new()),
            discovery_busy: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            lost_rx: Mutex::new(Some(lost_rx)),
        })
    }

    /// Discovery loop plus the lost-lock listener. Runs until `shutdown`.
    pub async fn run(self: Arc<Self>) {
        let listener = Arc::clone(&self);
        tokio::spawn(async move { listener.lost_lock_loop().await });

        info!(
            target: "Manager",
            "discovery every {:?}, owner {}", self.cfg.discovery_poll, process_owner_id()
        );
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            self.discovery_cycle().await;
            tokio::select! {
                _ = sleep(self.cfg.discovery_poll) => {}
                _ = self.shutdown.notified() => break,
            }
        }
        debug!(target: "Manager", "discovery loop ended");
    }

    async fn lost_lock_loop(self: Arc<Self>) {
        let Some(mut lost_rx) = self.lost_rx.lock().await.take() else {
            return;
        };
        while let Some(session_id) = lost_rx.recv().await {
            warn!(target: "Manager", "[{session_id}] lock lost, stopping session");
            self.stop_session(&session_id).await;
        }
    }

    /// One discovery pass: fetch settings and eligibility concurrently,
    /// compute the desired set, start targets, stop the rest. Non-reentrant
    /// via the busy flag.
    pub async fn discovery_cycle(&self) {
        if self.discovery_busy.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = scopeguard::guard((), |_| {
            self.discovery_busy.store(false, Ordering::SeqCst);
        });
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        let (settings, eligible) = tokio::join!(
            self.edge.get_settings(),
            self.edge.list_eligible(true, ELIGIBLE_LIMIT, ELIGIBLE_ORDER),
        );
        let eligible = match eligible {
            Ok(eligible) => eligible,
            Err(e) => {
                error!(target: "Manager", "eligibility fetch failed: {e}");
                return;
            }
        };

        let mut candidates: Vec<(String, i64)> = eligible
            .into_iter()
            .filter_map(|instance| {
                let id = instance.id.filter(|id| !id.is_empty())?;
                Some((id, instance.priority.unwrap_or(0)))
            })
            .collect();
        // Stable sort: equal priorities keep their control-plane order.
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let max_active = settings
            .and_then(|s| s.max_active_instances)
            .unwrap_or(self.cfg.max_active_instances_fallback)
            .max(0) as usize;
        let targets: Vec<(String, i64)> = if max_active > 0 {
            candidates.into_iter().take(max_active).collect()
        } else {
            candidates
        };

        {
            let mut desired = self.desired.lock().unwrap();
            desired.clear();
            desired.extend(targets.iter().map(|(id, _)| id.clone()));
        }
        debug!(
            target: "Manager",
            "desired set: {:?} (max_active {max_active})",
            targets.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>()
        );

        for (session_id, priority) in &targets {
            self.ensure_running_with_priority(session_id, *priority).await;
        }

        let current: Vec<(String, Arc<SessionRunner>)> = self
            .runtimes
            .lock()
            .await
            .iter()
            .map(|(id, runner)| (id.clone(), Arc::clone(runner)))
            .collect();
        let desired = self.desired.lock().unwrap().clone();
        for (session_id, runner) in current {
            if desired.contains(&session_id) {
                continue;
            }
            if runner.can_stop(self.cfg.stop_cooldown) {
                info!(target: "Manager", "[{session_id}] no longer targeted, stopping");
                self.stop_session(&session_id).await;
            } else {
                debug!(
                    target: "Manager",
                    "[{session_id}] de-scheduled but inside stop cooldown"
                );
            }
        }
    }

    async fn ensure_running_with_priority(&self, session_id: &str, priority: i64) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        if !self.lock.acquire(session_id).await {
            debug!(target: "Manager", "[{session_id}] lock unavailable, skipping");
            return;
        }

        let runner = {
            let mut runtimes = self.runtimes.lock().await;
            Arc::clone(runtimes.entry(session_id.to_string()).or_insert_with(|| {
                let host: Weak<dyn RunnerHost> = self.self_ref.clone();
                SessionRunner::new(
                    session_id,
                    Arc::clone(&self.cfg),
                    Arc::clone(&self.edge),
                    self.http.clone(),
                    Arc::clone(&self.factory),
                    host,
                )
            }))
        };
        runner.set_priority(priority);
        runner.spawn();
    }

    /// Remove and stop a runtime, then release its lock. Safe to call for
    /// unknown sessions.
    async fn stop_session(&self, session_id: &str) {
        let runner = self.runtimes.lock().await.remove(session_id);
        if let Some(runner) = runner {
            runner.stop().await;
        }
        self.lock.release(session_id).await;
    }

    /// Ordered shutdown: stop discovery, stop every runtime, release every
    /// lock.
    pub async fn shutdown(&self) {
        info!(target: "Manager", "shutting down");
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
        self.desired.lock().unwrap().clear();

        let ids: Vec<String> = self.runtimes.lock().await.keys().cloned().collect();
        for session_id in ids {
            self.stop_session(&session_id).await;
        }
        self.lock.release_all().await;
        info!(target: "Manager", "shutdown complete");
    }

    pub async fn runtime_ids(&self) -> Vec<String> {
        self.runtimes.lock().await.keys().cloned().collect()
    }

    pub async fn runtime(&self, session_id: &str) -> Option<Arc<SessionRunner>> {
        self.runtimes.lock().await.get(session_id).cloned()
    }

    pub fn desired_ids(&self) -> HashSet<String> {
        self.desired.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunnerHost for InstanceManager {
    fn is_desired(&self, session_id: &str) -> bool {
        self.desired.lock().unwrap().contains(session_id)
    }

    async fn reset_runtime(&self, session_id: &str) {
        self.runtimes.lock().await.remove(session_id);
    }

    async fn ensure_running(&self, session_id: &str) {
        // Priority is reasserted by the next discovery pass.
        self.ensure_running_with_priority(session_id, 0).await;
    }
}
