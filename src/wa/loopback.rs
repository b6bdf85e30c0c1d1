//! In-process socket backend.
//!
//! Implements the full [`SocketFactory`] contract without any network: a
//! fresh session emits one QR, "pairs" by writing a credential marker into
//! the auth directory, then opens. Sends are acknowledged with generated
//! receipts and recorded; media is served from an in-memory store. This is
//! the backend behind `WA_BACKEND=loopback` and the integration tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use super::{
    MediaRef, OutboundPayload, SendReceipt, SocketFactory, WaError, WaEvent, WaSocket,
};

const CREDS_FILE: &str = "creds.json";

#[derive(Debug, Serialize, Deserialize)]
struct Creds {
    me: String,
    paired_at: String,
}

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub to: String,
    pub payload: OutboundPayload,
}

#[derive(Default)]
struct SessionState {
    events: Option<mpsc::Sender<WaEvent>>,
    sent: Vec<SentRecord>,
}

#[derive(Default)]
struct Bus {
    sessions: Mutex<HashMap<String, SessionState>>,
    media: Mutex<HashMap<String, Vec<u8>>>,
}

/// Shared loopback bus, one per process.
#[derive(Default)]
pub struct LoopbackFactory {
    bus: Arc<Bus>,
}

impl LoopbackFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register downloadable media under an id sockets can resolve.
    pub async fn put_media(&self, id: &str, bytes: Vec<u8>) {
        self.bus.media.lock().await.insert(id.to_string(), bytes);
    }

    /// Deliver an event to a live session, e.g. a message upsert.
    pub async fn inject(&self, session_id: &str, event: WaEvent) -> bool {
        let sessions = self.bus.sessions.lock().await;
        match sessions.get(session_id).and_then(|s| s.events.as_ref()) {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Everything sent through a session's socket so far.
    pub async fn sent(&self, session_id: &str) -> Vec<SentRecord> {
        self.bus
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }

    fn own_jid_for(session_id: &str) -> String {
        // Stable pseudo phone number derived from the session id.
        let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
        for b in session_id.bytes() {
            acc ^= u64::from(b);
            acc = acc.wrapping_mul(0x1_0000_01b3);
        }
        format!("55{:010}@s.whatsapp.net", acc % 10_000_000_000)
    }
}

struct LoopbackSocket {
    session_id: String,
    own_jid: String,
    bus: Arc<Bus>,
    counter: AtomicU64,
}

#[async_trait]
impl WaSocket for LoopbackSocket {
    fn own_jid(&self) -> Option<String> {
        Some(self.own_jid.clone())
    }

    async fn send(&self, to: &str, payload: OutboundPayload) -> Result<SendReceipt, WaError> {
        let mut sessions = self.bus.sessions.lock().await;
        let state = sessions.entry(self.session_id.clone()).or_default();
        state.sent.push(SentRecord { to: to.to_string(), payload });
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(SendReceipt { message_id: format!("LOOP.{}.{n}", self.session_id) })
    }

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, WaError> {
        self.bus
            .media
            .lock()
            .await
            .get(&media.id)
            .cloned()
            .ok_or_else(|| WaError::Media(format!("unknown media id {}", media.id)))
    }

    async fn end(&self, reason: &str) {
        debug!(target: "Loopback", "[{}] socket ended: {reason}", self.session_id);
        // Dropping the sender closes the event stream.
        let mut sessions = self.bus.sessions.lock().await;
        if let Some(state) = sessions.get_mut(&self.session_id) {
            state.events = None;
        }
    }
}

#[async_trait]
impl SocketFactory for LoopbackFactory {
    async fn create_socket(
        &self,
        session_id: &str,
        auth_dir: &Path,
    ) -> Result<(Arc<dyn WaSocket>, mpsc::Receiver<WaEvent>), WaError> {
        let (tx, rx) = mpsc::channel(64);
        let own_jid = Self::own_jid_for(session_id);
        let creds_path = auth_dir.join(CREDS_FILE);

        let paired = tokio::fs::try_exists(&creds_path)
            .await
            .map_err(|e| WaError::Auth(e.to_string()))?;
        if !paired {
            let code: String = {
                let mut rng = rand::thread_rng();
                (0..4)
                    .map(|_| format!("{:08x}", rng.gen_range(0..=u32::MAX)))
                    .collect::<Vec<_>>()
                    .join(",")
            };
            tx.send(WaEvent::Qr { code }).await.ok();

            let creds = Creds {
                me: own_jid.clone(),
                paired_at: chrono::Utc::now().to_rfc3339(),
            };
            let body = serde_json::to_vec_pretty(&creds)
                .map_err(|e| WaError::Auth(e.to_string()))?;
            tokio::fs::write(&creds_path, body)
                .await
                .map_err(|e| WaError::Auth(e.to_string()))?;
            info!(target: "Loopback", "[{session_id}] paired new credentials");
        }

        tx.send(WaEvent::Open { own_jid: own_jid.clone() }).await.ok();

        {
            let mut sessions = self.bus.sessions.lock().await;
            let state = sessions.entry(session_id.to_string()).or_default();
            state.events = Some(tx);
        }

        let socket = Arc::new(LoopbackSocket {
            session_id: session_id.to_string(),
            own_jid,
            bus: self.bus.clone(),
            counter: AtomicU64::new(0),
        });
        Ok((socket, rx))
    }
}
