//! Typed HTTP client for the edge control plane.
//!
//! Every worker interaction with the control plane goes through here:
//! discovery inputs, status updates, the outbound queue, inbound relay,
//! contact resolution, media upload, lock coordination and session refresh.
//! The client is stateless; callers decide how to react to each error.

use base64::Engine as _;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

const BODY_SNIPPET_MAX: usize = 2048;

/// Substrings in 500 bodies that mean "row already exists".
const DUPLICATE_MARKERS: &[&str] = &[
    "duplicate key value",
    "contacts_instance_id_jid_key",
    "23505",
];

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("{endpoint}: {source}")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint}: status {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
    #[error("{endpoint}: invalid response: {detail}")]
    Decode {
        endpoint: &'static str,
        detail: String,
    },
}

impl EdgeError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport { source, .. } => source.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport { source, .. } if source.is_timeout())
    }

    /// 409, or a 500 whose body names a unique-constraint violation.
    /// Callers treat these as "the row already exists", which is benign.
    pub fn is_duplicate_conflict(&self) -> bool {
        match self {
            Self::Status { status: 409, .. } => true,
            Self::Status { status: 500, body, .. } => {
                DUPLICATE_MARKERS.iter().any(|m| body.contains(m))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    #[serde(default)]
    pub max_active_instances: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EligibleInstance {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct EligibleResponse {
    #[serde(default)]
    instances: Vec<EligibleInstance>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueuedMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockResponse {
    #[serde(default)]
    pub acquired: bool,
    #[serde(default)]
    pub instance_owner: Option<String>,
    #[serde(default)]
    pub lock_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContactResponse {
    #[serde(default)]
    contact_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PrimaryJidResponse {
    #[serde(default)]
    jid_pn: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadResponse {
    media_url: String,
}

/// Payload for `POST /inbound`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InboundPayload {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    pub from: String,
    pub to: String,
    /// Empty string when only media is present.
    pub body: String,
    pub wa_message_id: String,
    pub from_me: bool,
    pub chat_id_norm: String,
    pub sender_jid_raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_pn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_contact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

pub struct EdgeClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

impl EdgeClient {
    pub fn new(http: reqwest::Client, base_url: String, secret: String) -> Self {
        Self { http, base_url, secret }
    }

    pub async fn get_settings(&self) -> Option<WorkerSettings> {
        match self
            .get_json::<WorkerSettings>("worker-settings", "/worker-settings", &[])
            .await
        {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!(target: "Edge", "worker-settings unavailable: {e}");
                None
            }
        }
    }

    pub async fn list_eligible(
        &self,
        enabled: bool,
        limit: u32,
        order: &str,
    ) -> Result<Vec<EligibleInstance>, EdgeError> {
        let response: EligibleResponse = self
            .get_json(
                "eligible-instances",
                "/eligible-instances",
                &[
                    ("enabled", enabled.to_string()),
                    ("limit", limit.to_string()),
                    ("order", order.to_string()),
                ],
            )
            .await?;
        Ok(response.instances)
    }

    /// Fire-and-forget status report. Failures are logged, never returned.
    pub async fn update_status(&self, instance_id: &str, status: &str, qr_code: Option<&str>) {
        let body = json!({
            "instanceId": instance_id,
            "status": status,
            "qr_code": qr_code,
        });
        if let Err(e) = self
            .post_ok("update-status", "/update-status", &body)
            .await
        {
            warn!(target: "Edge", "[{instance_id}] update-status {status} failed: {e}");
        }
    }

    pub async fn list_queued(&self, instance_id: &str) -> Result<Vec<QueuedMessage>, EdgeError> {
        self.get_json(
            "queued-messages",
            "/queued-messages",
            &[("instanceId", instance_id.to_string())],
        )
        .await
    }

    pub async fn mark_sent(
        &self,
        message_id: &str,
        wa_message_id: &str,
        send_debug: &serde_json::Value,
    ) -> Result<(), EdgeError> {
        let body = json!({
            "messageId": message_id,
            "wa_message_id": wa_message_id,
            "send_debug": send_debug,
        });
        self.post_ok("mark-sent", "/mark-sent", &body).await
    }

    /// Best-effort failure report: a failed mark-failed must never stop the
    /// queue drain.
    pub async fn mark_failed(
        &self,
        message_id: &str,
        error: &str,
        send_debug: &serde_json::Value,
    ) {
        let body = json!({
            "messageId": message_id,
            "error": error,
            "send_debug": send_debug,
        });
        if let Err(e) = self.post_ok("mark-failed", "/mark-failed", &body).await {
            warn!(target: "Edge", "mark-failed for {message_id} failed: {e}");
        }
    }

    pub async fn post_inbound(&self, payload: &InboundPayload) -> Result<(), EdgeError> {
        self.post_ok("inbound", "/inbound", payload).await
    }

    pub async fn resolve_contact(
        &self,
        instance_id: &str,
        jid: &str,
        jid_type: &str,
        push_name: Option<&str>,
    ) -> Result<Option<String>, EdgeError> {
        let body = json!({
            "instanceId": instance_id,
            "jid": jid,
            "jid_type": jid_type,
            "push_name": push_name,
        });
        let response: ContactResponse = self
            .post_json("contacts-resolve", "/contacts/resolve", &body)
            .await?;
        Ok(response.contact_id)
    }

    pub async fn primary_jid(
        &self,
        instance_id: &str,
        jid: &str,
    ) -> Result<Option<String>, EdgeError> {
        let response: Option<PrimaryJidResponse> = self
            .get_json(
                "contacts-primary-jid",
                "/contacts/primary-jid",
                &[
                    ("instanceId", instance_id.to_string()),
                    ("jid", jid.to_string()),
                ],
            )
            .await?;
        Ok(response.and_then(|r| r.jid_pn))
    }

    pub async fn upload_media(
        &self,
        instance_id: &str,
        message_id: &str,
        mime_type: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<String, EdgeError> {
        let body = json!({
            "instanceId": instance_id,
            "messageId": message_id,
            "mime_type": mime_type,
            "file_name": file_name,
            "bytes_base64": base64::engine::general_purpose::STANDARD.encode(bytes),
        });
        let response: UploadResponse = self
            .post_json("upload-media", "/upload-media", &body)
            .await?;
        Ok(response.media_url)
    }

    pub async fn refresh_session(
        &self,
        instance_id: &str,
        jid: &str,
        trigger: &str,
    ) -> Result<(), EdgeError> {
        let body = json!({
            "instanceId": instance_id,
            "jid": jid,
            "trigger": trigger,
        });
        self.post_ok("sessions-refresh", "/sessions/refresh", &body).await
    }

    pub async fn acquire_lock(
        &self,
        instance_id: &str,
        owner: &str,
        ttl_ms: u64,
    ) -> Result<LockResponse, EdgeError> {
        self.lock_op("instance-lock-acquire", "acquire", instance_id, owner, ttl_ms, None)
            .await
    }

    pub async fn renew_lock(
        &self,
        instance_id: &str,
        owner: &str,
        ttl_ms: u64,
        token: Option<&str>,
    ) -> Result<LockResponse, EdgeError> {
        self.lock_op("instance-lock-renew", "renew", instance_id, owner, ttl_ms, token)
            .await
    }

    pub async fn release_lock(
        &self,
        instance_id: &str,
        owner: &str,
        token: Option<&str>,
    ) -> Result<LockResponse, EdgeError> {
        self.lock_op("instance-lock-release", "release", instance_id, owner, 0, token)
            .await
    }

    async fn lock_op(
        &self,
        endpoint: &'static str,
        op: &str,
        instance_id: &str,
        owner: &str,
        ttl_ms: u64,
        token: Option<&str>,
    ) -> Result<LockResponse, EdgeError> {
        let mut body = json!({
            "instanceId": instance_id,
            "instance_owner": owner,
            "ttl_ms": ttl_ms,
        });
        if let Some(token) = token {
            body["lock_token"] = json!(token);
        }
        let path = format!("/instance-lock/{op}");
        self.post_json(endpoint, &path, &body).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, EdgeError> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret)
            .query(query)
            .send()
            .await
            .map_err(|source| EdgeError::Transport { endpoint, source })?;
        Self::decode(endpoint, response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
        body: &B,
    ) -> Result<T, EdgeError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret)
            .json(body)
            .send()
            .await
            .map_err(|source| EdgeError::Transport { endpoint, source })?;
        Self::decode(endpoint, response).await
    }

    /// POST where only the status matters; the body is discarded.
    async fn post_ok<B: Serialize + ?Sized>(
        &self,
        endpoint: &'static str,
        path: &str,
        body: &B,
    ) -> Result<(), EdgeError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret)
            .json(body)
            .send()
            .await
            .map_err(|source| EdgeError::Transport { endpoint, source })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::status_error(endpoint, status.as_u16(), response).await)
        }
    }

    async fn decode<T: DeserializeOwned>(
        endpoint: &'static str,
        response: reqwest::Response,
    ) -> Result<T, EdgeError> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::status_error(endpoint, status.as_u16(), response).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|source| EdgeError::Transport { endpoint, source })?;
        serde_json::from_slice(&bytes).map_err(|e| EdgeError::Decode {
            endpoint,
            detail: e.to_string(),
        })
    }

    async fn status_error(
        endpoint: &'static str,
        status: u16,
        response: reqwest::Response,
    ) -> EdgeError {
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > BODY_SNIPPET_MAX {
            // Cut on a char boundary; truncate panics mid-codepoint.
            let mut cut = BODY_SNIPPET_MAX;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        EdgeError::Status { endpoint, status, body }
    }
}
