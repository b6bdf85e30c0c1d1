//! Cluster-wide session lock coordination.
//!
//! The control plane enforces one owner per session; this module makes sure
//! this process only drives sessions it holds the lock for, renews held
//! locks on a timer, and reports lost ownership so the manager can stop the
//! session. One renewal task per held lock, created and destroyed together
//! with its ownership entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::edge::EdgeClient;

/// `<hostname>:<pid>`, the identity this process acquires locks under.
pub fn process_owner_id() -> String {
    let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into());
    format!("{hostname}:{}", std::process::id())
}

struct HeldLock {
    token: Option<String>,
    renew_task: JoinHandle<()>,
}

pub struct LockCoordinator {
    edge: Arc<EdgeClient>,
    owner: String,
    ttl: Duration,
    renew_every: Duration,
    held: Mutex<HashMap<String, HeldLock>>,
    lost_tx: mpsc::UnboundedSender<String>,
}

impl LockCoordinator {
    /// Returns the coordinator plus the channel on which lost session ids
    /// are delivered.
    pub fn new(
        edge: Arc<EdgeClient>,
        owner: String,
        ttl: Duration,
        renew_every: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            edge,
            owner,
            ttl,
            renew_every,
            held: Mutex::new(HashMap::new()),
            lost_tx,
        });
        (coordinator, lost_rx)
    }

    pub async fn is_held(&self, session_id: &str) -> bool {
        self.held.lock().await.contains_key(session_id)
    }

    /// Try to take the lock for a session. Idempotent while held: a second
    /// call returns true without touching the control plane, so there is
    /// never more than one renewal task per session.
    pub async fn acquire(self: &Arc<Self>, session_id: &str) -> bool {
        if self.is_held(session_id).await {
            return true;
        }

        let response = match self
            .edge
            .acquire_lock(session_id, &self.owner, self.ttl.as_millis() as u64)
            .await
        {
            Ok(response) => response,
            Err(e) if e.status_code() == Some(404) => {
                info!(target: "Lock", "[{session_id}] unknown to control plane, skipping");
                return false;
            }
            Err(e) => {
                error!(target: "Lock", "[{session_id}] acquire failed: {e}");
                return false;
            }
        };

        if !response.acquired {
            warn!(
                target: "Lock",
                "[{session_id}] held elsewhere (owner {})",
                response.instance_owner.as_deref().unwrap_or("?")
            );
            return false;
        }

        let renew_task = tokio::spawn(Arc::clone(self).renew_loop(session_id.to_string()));
        self.held.lock().await.insert(
            session_id.to_string(),
            HeldLock { token: response.lock_token, renew_task },
        );
        info!(target: "Lock", "[{session_id}] acquired as {}", self.owner);
        true
    }

    async fn renew_loop(self: Arc<Self>, session_id: String) {
        loop {
            tokio::time::sleep(self.renew_every).await;

            let token = match self.held.lock().await.get(&session_id) {
                Some(held) => held.token.clone(),
                // Released concurrently; the task dies with the entry.
                None => return,
            };

            let renewed = self
                .edge
                .renew_lock(
                    &session_id,
                    &self.owner,
                    self.ttl.as_millis() as u64,
                    token.as_deref(),
                )
                .await;

            match renewed {
                Ok(response) if response.acquired => {
                    if response.lock_token.is_some() {
                        if let Some(held) = self.held.lock().await.get_mut(&session_id) {
                            held.token = response.lock_token;
                        }
                    }
                }
                Ok(response) => {
                    warn!(
                        target: "Lock",
                        "[{session_id}] renewal rejected, now owned by {}",
                        response.instance_owner.as_deref().unwrap_or("?")
                    );
                    self.lose(&session_id).await;
                    return;
                }
                Err(e) => {
                    error!(target: "Lock", "[{session_id}] renewal failed: {e}");
                    self.lose(&session_id).await;
                    return;
                }
            }
        }
    }

    /// Drop local ownership and notify the manager. Called from the renew
    /// task itself, so the task handle is dropped rather than aborted.
    async fn lose(&self, session_id: &str) {
        self.held.lock().await.remove(session_id);
        let _ = self.lost_tx.send(session_id.to_string());
    }

    /// Release a held lock: stop renewing, tell the control plane, and
    /// clear local state no matter what the HTTP call says.
    pub async fn release(&self, session_id: &str) {
        let Some(held) = self.held.lock().await.remove(session_id) else {
            return;
        };
        held.renew_task.abort();

        if let Err(e) = self
            .edge
            .release_lock(session_id, &self.owner, held.token.as_deref())
            .await
        {
            warn!(target: "Lock", "[{session_id}] release failed (lock will expire): {e}");
        } else {
            info!(target: "Lock", "[{session_id}] released");
        }
    }

    /// Best-effort release of every held lock, for shutdown.
    pub async fn release_all(&self) {
        let ids: Vec<String> = self.held.lock().await.keys().cloned().collect();
        for id in ids {
            self.release(&id).await;
        }
    }

    #[cfg(test)]
    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }
}
