//! Outbound queue drain.
//!
//! Every tick pulls the session's queued messages from the control plane,
//! resolves each destination, sends through the socket with session-refresh
//! recovery for transient decrypt failures, and reports the outcome as
//! mark-sent or mark-failed. A per-message failure never stops the drain.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{Value, json};
use tokio::time::sleep;

use crate::edge::QueuedMessage;
use crate::jid::{self, OutboundTarget};
use crate::media;
use crate::wa::{ErrorKind, OutboundPayload, SendReceipt, WaSocket};

use super::SessionRunner;

const MALFORMED_MESSAGE: &str = "malformed-message";
const LID_WITHOUT_MAPPING: &str = "lid_without_mapping";
const REFRESH_TRIGGER: &str = "no_matching_sessions";
/// Sleep between send attempts after a session refresh.
const SESSION_REFRESH_BACKOFF_MS: [u64; 3] = [1_000, 2_000, 5_000];

const DEFAULT_AUDIO_MIME: &str = "audio/ogg";
const DEFAULT_DOCUMENT_MIME: &str = "application/octet-stream";

impl SessionRunner {
    /// One queue pass. Reentrancy-safe: overlapping ticks are refused by
    /// the busy flag, so at most one pass runs per session.
    pub(crate) async fn outbound_tick(self: &std::sync::Arc<Self>) {
        if self.outbound_busy.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let _guard = scopeguard::guard((), |_| {
            self.outbound_busy.store(false, AtomicOrdering::SeqCst);
        });

        if !self.is_open() {
            return;
        }
        let Some(socket) = self.socket.lock().await.clone() else {
            return;
        };

        let queued = match self.edge.list_queued(&self.id).await {
            Ok(queued) => queued,
            Err(e) => {
                error!(target: "Outbound", "[{}] queue fetch failed: {e}", self.id);
                return;
            }
        };
        if queued.is_empty() {
            return;
        }
        info!(target: "Outbound", "[{}] draining {} queued message(s)", self.id, queued.len());

        for message in queued {
            self.process_queued(&socket, message).await;
        }
    }

    async fn process_queued(
        &self,
        socket: &std::sync::Arc<dyn WaSocket>,
        message: QueuedMessage,
    ) {
        let Some(message_id) = message.id.clone().filter(|id| !id.is_empty()) else {
            warn!(target: "Outbound", "[{}] dropping queued record without id", self.id);
            return;
        };
        let to_valid = message.to.clone().filter(|to| !to.trim().is_empty());
        let has_content = message.body.is_some() || message.media_url.is_some();
        let Some(to) = to_valid else {
            self.edge
                .mark_failed(
                    &message_id,
                    MALFORMED_MESSAGE,
                    &json!({ "reason": "missing to" }),
                )
                .await;
            return;
        };
        if !has_content {
            self.edge
                .mark_failed(
                    &message_id,
                    MALFORMED_MESSAGE,
                    &json!({ "reason": "missing body and media_url", "to_original": to }),
                )
                .await;
            return;
        }

        let started_at = chrono::Utc::now();
        let destination = match self.resolve_destination(&to).await {
            Ok(destination) => destination,
            Err(reason) => {
                self.edge
                    .mark_failed(
                        &message_id,
                        &reason,
                        &json!({
                            "to_original": to,
                            "error": reason,
                            "started_at": started_at.to_rfc3339(),
                        }),
                    )
                    .await;
                return;
            }
        };

        let payload = match self.build_payload(&message_id, &message).await {
            Ok(payload) => payload,
            Err(reason) => {
                self.edge
                    .mark_failed(
                        &message_id,
                        &reason,
                        &json!({
                            "to_original": to,
                            "to_normalized": destination,
                            "error": reason,
                            "started_at": started_at.to_rfc3339(),
                        }),
                    )
                    .await;
                return;
            }
        };

        match self.send_with_recovery(socket, &destination, payload).await {
            Ok((receipt, attempts, attempt_errors)) => {
                let send_debug = json!({
                    "to_original": to,
                    "to_normalized": destination,
                    "attempts": attempts,
                    "attempt_errors": attempt_errors,
                    "started_at": started_at.to_rfc3339(),
                    "finished_at": chrono::Utc::now().to_rfc3339(),
                });
                if let Err(e) = self
                    .edge
                    .mark_sent(&message_id, &receipt.message_id, &send_debug)
                    .await
                {
                    error!(target: "Outbound", "[{}] mark-sent {message_id} failed: {e}", self.id);
                } else {
                    debug!(
                        target: "Outbound",
                        "[{}] sent {message_id} as {}", self.id, receipt.message_id
                    );
                }
            }
            Err((error_text, attempts, attempt_errors)) => {
                error!(
                    target: "Outbound",
                    "[{}] send {message_id} failed after {attempts} attempt(s): {error_text}",
                    self.id
                );
                let send_debug = json!({
                    "to_original": to,
                    "to_normalized": destination,
                    "attempts": attempts,
                    "attempt_errors": attempt_errors,
                    "started_at": started_at.to_rfc3339(),
                    "finished_at": chrono::Utc::now().to_rfc3339(),
                });
                self.edge.mark_failed(&message_id, &error_text, &send_debug).await;
            }
        }
    }

    /// Resolve a queued `to` into a sendable JID. `@lid` destinations need
    /// a primary-jid mapping from the control plane.
    pub(crate) async fn resolve_destination(&self, to: &str) -> Result<String, String> {
        match jid::normalize_outbound_to(to) {
            OutboundTarget::Ready(destination) => Ok(destination),
            OutboundTarget::NeedsPrimaryJid(lid) => {
                match self.edge.primary_jid(&self.id, &lid).await {
                    Ok(Some(pn)) if jid::is_pn(&pn) => Ok(pn),
                    Ok(_) => Err(LID_WITHOUT_MAPPING.to_string()),
                    Err(e) => {
                        error!(
                            target: "Outbound",
                            "[{}] primary-jid lookup for {lid} failed: {e}", self.id
                        );
                        Err(LID_WITHOUT_MAPPING.to_string())
                    }
                }
            }
        }
    }

    /// Materialize the message content: text directly, media fetched into
    /// memory over plain HTTP and wrapped per type.
    async fn build_payload(
        &self,
        message_id: &str,
        message: &QueuedMessage,
    ) -> Result<OutboundPayload, String> {
        let Some(url) = message.media_url.as_deref() else {
            return Ok(OutboundPayload::Text {
                body: message.body.clone().unwrap_or_default(),
            });
        };

        let bytes = media::fetch(&self.http, url)
            .await
            .map_err(|e| format!("media_download_failed: {e}"))?;

        let payload = match message.media_type.as_deref().unwrap_or("") {
            "image" => OutboundPayload::Image {
                bytes,
                mime: message.mime_type.clone(),
                caption: message.body.clone(),
            },
            "video" => OutboundPayload::Video {
                bytes,
                mime: message.mime_type.clone(),
                caption: message.body.clone(),
            },
            "audio" => OutboundPayload::Audio {
                bytes,
                mime: message
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AUDIO_MIME.to_string()),
                ptt: false,
            },
            _ => OutboundPayload::Document {
                bytes,
                mime: message
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DOCUMENT_MIME.to_string()),
                file_name: message
                    .file_name
                    .clone()
                    .unwrap_or_else(|| format!("document-{message_id}")),
                caption: message.body.clone(),
            },
        };
        Ok(payload)
    }

    /// Send with session-refresh recovery: a `no matching sessions` failure
    /// asks the control plane to refresh the Signal session, backs off and
    /// retries. Any other error ends the loop immediately. The JID is
    /// re-canonicalized before every attempt, since a refresh can land a
    /// new alias pair.
    async fn send_with_recovery(
        &self,
        socket: &std::sync::Arc<dyn WaSocket>,
        destination: &str,
        payload: OutboundPayload,
    ) -> Result<(SendReceipt, u32, Vec<Value>), (String, u32, Vec<Value>)> {
        let max_attempts = self.cfg.decrypt_retry_max_attempts + 1;
        let mut attempt_errors: Vec<Value> = Vec::new();

        for attempt in 0..max_attempts {
            let target = self.alias.resolve_canonical(destination, None).await;
            match socket.send(&target, payload.clone()).await {
                Ok(receipt) => return Ok((receipt, attempt + 1, attempt_errors)),
                Err(e) if e.kind() == ErrorKind::SignalNoSession && attempt + 1 < max_attempts => {
                    warn!(
                        target: "Outbound",
                        "[{}] no matching sessions for {target}, refreshing (attempt {})",
                        self.id,
                        attempt + 1
                    );
                    attempt_errors.push(json!({
                        "attempt": attempt + 1,
                        "error": e.to_string(),
                    }));
                    if let Err(refresh_err) = self
                        .edge
                        .refresh_session(&self.id, &target, REFRESH_TRIGGER)
                        .await
                    {
                        warn!(
                            target: "Outbound",
                            "[{}] session refresh failed: {refresh_err}", self.id
                        );
                    }
                    let idx = (attempt as usize).min(SESSION_REFRESH_BACKOFF_MS.len() - 1);
                    sleep(Duration::from_millis(SESSION_REFRESH_BACKOFF_MS[idx])).await;
                }
                Err(e) => {
                    attempt_errors.push(json!({
                        "attempt": attempt + 1,
                        "error": e.to_string(),
                    }));
                    return Err((e.to_string(), attempt + 1, attempt_errors));
                }
            }
        }

        let attempts = max_attempts;
        Err((
            "no matching sessions found after session refresh retries".to_string(),
            attempts,
            attempt_errors,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::runner::{RunnerHost, SessionRunner};
    use crate::testutil::{static_host, test_config, test_edge};
    use crate::wa::mock::{MockFactory, MockSocket};
    use crate::wa::{SocketFactory, WaError};

    struct Fixture {
        runner: Arc<SessionRunner>,
        socket: Arc<MockSocket>,
        _host: Arc<dyn RunnerHost>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(server: &MockServer, open: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(test_config(&server.uri(), dir.path(), &[]));
        let factory = MockFactory::new(false);
        let factory_dyn: Arc<dyn SocketFactory> = factory.clone();
        let host = static_host();
        let runner = SessionRunner::new(
            "s1",
            cfg,
            test_edge(&server.uri()),
            reqwest::Client::new(),
            factory_dyn,
            Arc::downgrade(&host),
        );
        let (socket_dyn, _events) = factory.create_socket("s1", dir.path()).await.unwrap();
        if open {
            runner.test_attach_socket(socket_dyn).await;
        }
        let socket = factory.socket("s1").await;
        Fixture { runner, socket, _host: host, _dir: dir }
    }

    fn queue_response(messages: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(messages)
    }

    async fn mount_ok(server: &MockServer, p: &str) {
        Mock::given(method("POST"))
            .and(path(p))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn digits_destination_is_sent_and_marked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queued-messages"))
            .respond_with(queue_response(json!([
                {"id": "m1", "to": "5511999999999", "body": "hi"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mark-sent"))
            .and(body_partial_json(json!({"messageId": "m1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, true).await;
        f.runner.outbound_tick().await;

        let sent = f.socket.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "5511999999999@s.whatsapp.net");
        assert!(matches!(
            &sent[0].payload,
            OutboundPayload::Text { body } if body == "hi"
        ));
    }

    #[tokio::test]
    async fn lid_destination_uses_primary_jid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queued-messages"))
            .respond_with(queue_response(json!([
                {"id": "m2", "to": "1203630@lid", "body": "hi"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/contacts/primary-jid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jid_pn": "5511888@s.whatsapp.net"
            })))
            .mount(&server)
            .await;
        mount_ok(&server, "/mark-sent").await;

        let f = fixture(&server, true).await;
        f.runner.outbound_tick().await;

        let sent = f.socket.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "5511888@s.whatsapp.net");
    }

    #[tokio::test]
    async fn unmapped_lid_is_marked_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queued-messages"))
            .respond_with(queue_response(json!([
                {"id": "m2", "to": "1203630@lid", "body": "hi"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/contacts/primary-jid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mark-failed"))
            .and(body_partial_json(json!({
                "messageId": "m2",
                "error": "lid_without_mapping",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, true).await;
        f.runner.outbound_tick().await;
        assert!(f.socket.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn refreshes_session_on_no_matching_sessions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queued-messages"))
            .respond_with(queue_response(json!([
                {"id": "m3", "to": "5511999999999", "body": "retry me"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sessions/refresh"))
            .and(body_partial_json(json!({
                "instanceId": "s1",
                "trigger": "no_matching_sessions",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mark-sent"))
            .and(body_partial_json(json!({"messageId": "m3"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, true).await;
        {
            let mut script = f.socket.send_script.lock().await;
            for _ in 0..2 {
                script.push_back(Err(WaError::protocol(
                    crate::wa::ErrorKind::SignalNoSession,
                    "No matching sessions found for message",
                )));
            }
        }

        // Two failed attempts sleep 1 s + 2 s before the third succeeds.
        f.runner.outbound_tick().await;

        let sent = f.socket.sent.lock().await;
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn other_send_errors_fail_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queued-messages"))
            .respond_with(queue_response(json!([
                {"id": "m4", "to": "5511999999999", "body": "x"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sessions/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mark-failed"))
            .and(body_partial_json(json!({"messageId": "m4"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, true).await;
        f.socket.send_script.lock().await.push_back(Err(WaError::protocol(
            crate::wa::ErrorKind::Other,
            "recipient unavailable",
        )));
        f.runner.outbound_tick().await;
        assert!(f.socket.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_records_are_failed_or_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queued-messages"))
            .respond_with(queue_response(json!([
                {"to": "5511999999999", "body": "no id"},
                {"id": "m5", "to": "5511999999999"},
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mark-failed"))
            .and(body_partial_json(json!({
                "messageId": "m5",
                "error": "malformed-message",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, true).await;
        f.runner.outbound_tick().await;
        assert!(f.socket.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn media_document_gets_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/m/doc1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queued-messages"))
            .respond_with(queue_response(json!([{
                "id": "m6",
                "to": "5511999999999",
                "body": "the report",
                "media_url": format!("{}/m/doc1", server.uri()),
                "media_type": "document",
            }])))
            .mount(&server)
            .await;
        mount_ok(&server, "/mark-sent").await;

        let f = fixture(&server, true).await;
        f.runner.outbound_tick().await;

        let sent = f.socket.sent.lock().await;
        assert_eq!(sent.len(), 1);
        match &sent[0].payload {
            OutboundPayload::Document { bytes, mime, file_name, caption } => {
                assert_eq!(bytes, b"%PDF");
                assert_eq!(mime, "application/octet-stream");
                assert_eq!(file_name, "document-m6");
                assert_eq!(caption.as_deref(), Some("the report"));
            }
            other => panic!("expected document payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overlapping_ticks_are_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queued-messages"))
            .respond_with(queue_response(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let f = fixture(&server, true).await;
        // A tick is already in flight; this one must yield immediately.
        f.runner.outbound_busy.store(true, AtomicOrdering::SeqCst);
        f.runner.outbound_tick().await;
        f.runner.outbound_busy.store(false, AtomicOrdering::SeqCst);
    }

    #[tokio::test]
    async fn ticks_do_nothing_when_not_open() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queued-messages"))
            .respond_with(queue_response(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let f = fixture(&server, false).await;
        f.runner.outbound_tick().await;
    }

    #[tokio::test]
    async fn audio_defaults_to_ogg_without_ptt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/m/voice"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"OggS".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queued-messages"))
            .respond_with(queue_response(json!([{
                "id": "m7",
                "to": "5511999999999",
                "media_url": format!("{}/m/voice", server.uri()),
                "media_type": "audio",
            }])))
            .mount(&server)
            .await;
        mount_ok(&server, "/mark-sent").await;

        let f = fixture(&server, true).await;
        f.runner.outbound_tick().await;

        let sent = f.socket.sent.lock().await;
        match &sent[0].payload {
            OutboundPayload::Audio { mime, ptt, .. } => {
                assert_eq!(mime, "audio/ogg");
                assert!(!ptt);
            }
            other => panic!("expected audio payload, got {other:?}"),
        }
    }
}
