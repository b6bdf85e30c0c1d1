//! End-to-end worker flows: loopback socket backend against a mock control
//! plane. Exercises discovery → lock → pairing → queue drain and the
//! inbound relay, through the public API only.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use whatsapp_edge_worker::config::Config;
use whatsapp_edge_worker::edge::EdgeClient;
use whatsapp_edge_worker::manager::InstanceManager;
use whatsapp_edge_worker::wa::loopback::LoopbackFactory;
use whatsapp_edge_worker::wa::{
    InboundMessage, MediaRef, MessageContent, MessageKey, UpsertKind, WaEvent,
};

fn config(edge_url: &str, base: &std::path::Path) -> Arc<Config> {
    let vars = [
        ("EDGE_BASE_URL", edge_url.to_string()),
        ("WORKER_SECRET", "integration-secret".to_string()),
        ("AUTH_BASE", base.join("auth").display().to_string()),
        ("MEDIA_BASE", base.join("media").display().to_string()),
        ("QUEUE_POLL_MS", "50".to_string()),
        ("DISCOVERY_POLL_MS", "100".to_string()),
    ];
    Arc::new(
        Config::from_lookup(|name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
        })
        .expect("config"),
    )
}

async fn wait_until<F>(timeout: Duration, mut probe: F) -> bool
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct Plane {
    server: MockServer,
}

impl Plane {
    async fn start(session_id: &str) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/worker-settings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "max_active_instances": 1
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/eligible-instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "instances": [{"id": session_id, "priority": 1}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/instance-lock/acquire"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "acquired": true,
                "instance_owner": "it",
                "lock_token": "tok",
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/instance-lock/release"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acquired": false})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/update-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
        Self { server }
    }

    async fn connected_reported(&self) -> bool {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .any(|r| {
                r.url.path() == "/update-status"
                    && String::from_utf8_lossy(&r.body).contains("CONNECTED")
            })
    }

    async fn requests_to(&self, p: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == p)
            .count()
    }
}

fn boot(
    plane: &Plane,
    base: &std::path::Path,
) -> (Arc<InstanceManager>, Arc<LoopbackFactory>) {
    let cfg = config(&plane.server.uri(), base);
    let http = reqwest::Client::new();
    let edge = Arc::new(EdgeClient::new(
        http.clone(),
        plane.server.uri(),
        "integration-secret".into(),
    ));
    let factory = LoopbackFactory::new();
    let manager = InstanceManager::new(cfg, edge, http, factory.clone());
    (manager, factory)
}

#[tokio::test]
async fn boots_pairs_and_drains_the_queue() {
    let plane = Plane::start("s-int-1").await;
    // One queued text message, then an empty queue.
    Mock::given(method("GET"))
        .and(path("/queued-messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "q1", "to": "5511999999999", "body": "hello out there"}
        ])))
        .up_to_n_times(1)
        .mount(&plane.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/queued-messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&plane.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mark-sent"))
        .and(body_partial_json(json!({"messageId": "q1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&plane.server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (manager, factory) = boot(&plane, dir.path());
    let run_task = tokio::spawn(Arc::clone(&manager).run());

    let delivered = wait_until(Duration::from_secs(5), async || {
        !factory.sent("s-int-1").await.is_empty()
    })
    .await;
    assert!(delivered, "queued message should reach the socket");

    let sent = factory.sent("s-int-1").await;
    assert_eq!(sent[0].to, "5511999999999@s.whatsapp.net");

    // First boot pairs: a QR data URL must have been relayed upstream.
    let qr_posted = plane
        .server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .any(|r| {
            r.url.path() == "/update-status"
                && String::from_utf8_lossy(&r.body).contains("data:image/png;base64,")
        });
    assert!(qr_posted, "pairing QR should be posted as a data URL");

    manager.shutdown().await;
    run_task.abort();
    assert!(manager.runtime_ids().await.is_empty());
}

#[tokio::test]
async fn relays_inbound_text_with_contact_resolution() {
    let plane = Plane::start("s-int-2").await;
    Mock::given(method("GET"))
        .and(path("/queued-messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&plane.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/contacts/resolve"))
        .and(body_partial_json(json!({
            "instanceId": "s-int-2",
            "jid": "5511222333444@s.whatsapp.net",
            "jid_type": "pn",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "contact_id": "contact-9"
        })))
        .expect(1)
        .mount(&plane.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/inbound"))
        .and(body_partial_json(json!({
            "instanceId": "s-int-2",
            "body": "hi worker",
            "chat_id_norm": "5511222333444@s.whatsapp.net",
            "sender_contact_id": "contact-9",
            "from_me": false,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&plane.server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (manager, factory) = boot(&plane, dir.path());
    let run_task = tokio::spawn(Arc::clone(&manager).run());

    assert!(
        wait_until(Duration::from_secs(5), async || plane.connected_reported().await).await,
        "session should report CONNECTED"
    );

    let message = InboundMessage {
        key: MessageKey {
            remote_jid: Some("5511222333444@s.whatsapp.net".into()),
            from_me: false,
            id: "wamid-inb-1".into(),
            participant: None,
        },
        sender_lid: None,
        sender_pn: Some("5511222333444@s.whatsapp.net".into()),
        push_name: Some("Ana".into()),
        content: Some(MessageContent::Conversation("hi worker".into())),
    };
    assert!(
        factory
            .inject(
                "s-int-2",
                WaEvent::MessageUpsert { kind: UpsertKind::Notify, messages: vec![message] },
            )
            .await
    );

    assert!(
        wait_until(Duration::from_secs(5), async || {
            plane.requests_to("/inbound").await == 1
        })
        .await,
        "inbound payload should be posted"
    );

    manager.shutdown().await;
    run_task.abort();
}

#[tokio::test]
async fn media_upload_failure_skips_the_inbound_post() {
    let plane = Plane::start("s-int-3").await;
    Mock::given(method("GET"))
        .and(path("/queued-messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&plane.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload-media"))
        .respond_with(ResponseTemplate::new(500).set_body_string("storage offline"))
        .expect(1)
        .mount(&plane.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/inbound"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(0)
        .mount(&plane.server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (manager, factory) = boot(&plane, dir.path());
    let run_task = tokio::spawn(Arc::clone(&manager).run());

    assert!(
        wait_until(Duration::from_secs(5), async || plane.connected_reported().await).await
    );

    factory.put_media("med-1", b"JFIF....".to_vec()).await;
    let message = InboundMessage {
        key: MessageKey {
            remote_jid: Some("5511222333444@s.whatsapp.net".into()),
            from_me: false,
            id: "wamid-med-1".into(),
            participant: None,
        },
        sender_lid: None,
        sender_pn: Some("5511222333444@s.whatsapp.net".into()),
        push_name: None,
        content: Some(MessageContent::Image {
            caption: Some("see this".into()),
            media: MediaRef {
                id: "med-1".into(),
                mime_type: Some("image/jpeg".into()),
                file_name: Some("photo.jpg".into()),
                file_size: Some(8),
            },
        }),
    };
    assert!(
        factory
            .inject(
                "s-int-3",
                WaEvent::MessageUpsert { kind: UpsertKind::Notify, messages: vec![message] },
            )
            .await
    );

    assert!(
        wait_until(Duration::from_secs(5), async || {
            plane.requests_to("/upload-media").await == 1
        })
        .await,
        "upload should be attempted"
    );
    // Give the relay a moment to (incorrectly) post; the expect(0) above
    // also guards this on shutdown.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(plane.requests_to("/inbound").await, 0);

    manager.shutdown().await;
    run_task.abort();
}

#[tokio::test]
async fn media_inbound_is_uploaded_and_relayed() {
    let plane = Plane::start("s-int-4").await;
    Mock::given(method("GET"))
        .and(path("/queued-messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&plane.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/contacts/resolve"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "contact_id": "contact-4"
        })))
        .mount(&plane.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload-media"))
        .and(body_partial_json(json!({
            "instanceId": "s-int-4",
            "mime_type": "image/jpeg",
            "file_name": "f_rias_2025.jpg",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "media_url": "https://cdn.example.com/stored-1"
        })))
        .expect(1)
        .mount(&plane.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/inbound"))
        .and(body_partial_json(json!({
            "media_type": "image",
            "media_url": "https://cdn.example.com/stored-1",
            "body": "beach",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&plane.server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (manager, factory) = boot(&plane, dir.path());
    let run_task = tokio::spawn(Arc::clone(&manager).run());

    assert!(
        wait_until(Duration::from_secs(5), async || plane.connected_reported().await).await
    );

    factory.put_media("med-4", b"JFIFdata".to_vec()).await;
    let message = InboundMessage {
        key: MessageKey {
            remote_jid: Some("5511222333444@s.whatsapp.net".into()),
            from_me: false,
            id: "wamid-med-4".into(),
            participant: None,
        },
        sender_lid: None,
        sender_pn: Some("5511222333444@s.whatsapp.net".into()),
        push_name: None,
        content: Some(MessageContent::Image {
            caption: Some("beach".into()),
            media: MediaRef {
                id: "med-4".into(),
                mime_type: Some("image/jpeg".into()),
                file_name: Some("férias 2025.jpg".into()),
                file_size: None,
            },
        }),
    };
    assert!(
        factory
            .inject(
                "s-int-4",
                WaEvent::MessageUpsert { kind: UpsertKind::Notify, messages: vec![message] },
            )
            .await
    );

    assert!(
        wait_until(Duration::from_secs(5), async || {
            plane.requests_to("/inbound").await == 1
        })
        .await,
        "media message should be relayed with its uploaded URL"
    );

    manager.shutdown().await;
    run_task.abort();
}
