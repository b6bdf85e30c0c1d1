//! Client-library boundary.
//!
//! The WhatsApp protocol library is a collaborator of this worker, not part
//! of it. This module defines the contract the supervisor drives: a factory
//! that opens a socket bound to a session's auth directory and hands back an
//! event stream, plus the message and error model the rest of the worker
//! consumes. The `loopback` backend implements the contract in-process;
//! production deployments plug a protocol backend in through
//! [`SocketFactory`].

pub mod loopback;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Disconnect code the client library reports when the account was logged
/// out remotely.
pub const CODE_LOGGED_OUT: u16 = 401;
/// Stream code asking the client to restart the connection.
pub const CODE_RESTART_REQUIRED: u16 = 515;

/// Tagged classification of everything that can go wrong on a session.
///
/// Callers branch on this, never on raw message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    LoggedOut,
    BadSession,
    Restart515,
    Timeout,
    HttpStatus(u16),
    SignalDecrypt,
    SignalNoSession,
    BadMac,
    DuplicateContact,
    Other,
}

impl ErrorKind {
    /// Classify an error message emitted by the client library.
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if lower.contains("bad mac") {
            Self::BadMac
        } else if lower.contains("failed to decrypt message") {
            Self::SignalDecrypt
        } else if lower.contains("no matching sessions found") {
            Self::SignalNoSession
        } else if lower.contains("bad session") {
            Self::BadSession
        } else if lower.contains("logged out") {
            Self::LoggedOut
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else {
            Self::Other
        }
    }

    /// Errors the Bad-MAC circuit breaker counts: cryptographic session
    /// corruption surfacing as decrypt failures.
    pub fn counts_for_bad_mac(self) -> bool {
        matches!(self, Self::BadMac | Self::SignalDecrypt | Self::SignalNoSession)
    }

    /// Disconnects that invalidate the on-disk auth material.
    pub fn wipes_auth(self) -> bool {
        matches!(self, Self::LoggedOut | Self::BadSession)
    }
}

#[derive(Debug, Clone, Error)]
pub enum WaError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("{detail}")]
    Protocol { kind: ErrorKind, detail: String },
    #[error("media unavailable: {0}")]
    Media(String),
    #[error("auth state: {0}")]
    Auth(String),
}

impl WaError {
    pub fn protocol(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Protocol { kind, detail: detail.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol { kind, .. } => *kind,
            Self::NotConnected => ErrorKind::Other,
            Self::Media(_) => ErrorKind::Other,
            Self::Auth(_) => ErrorKind::BadSession,
        }
    }
}

/// Why a connection closed.
#[derive(Debug, Clone)]
pub struct CloseReason {
    pub kind: ErrorKind,
    pub status_code: Option<u16>,
    pub detail: String,
}

impl CloseReason {
    /// Build a reason from whatever the client library surfaced: a stream
    /// status code, an error message, or both.
    pub fn classify(status_code: Option<u16>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let kind = match status_code {
            Some(CODE_LOGGED_OUT) => ErrorKind::LoggedOut,
            Some(CODE_RESTART_REQUIRED) => ErrorKind::Restart515,
            _ => ErrorKind::from_text(&detail),
        };
        Self { kind, status_code, detail }
    }
}

/// Upsert notification class, mirroring the client library's event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Notify,
    Append,
    Other,
}

impl UpsertKind {
    /// Only live notifications and appended history tails are relayed.
    pub fn is_relayed(self) -> bool {
        matches!(self, Self::Notify | Self::Append)
    }
}

/// Opaque handle to a downloadable media attachment.
#[derive(Debug, Clone, Default)]
pub struct MediaRef {
    /// Backend-scoped identifier used by [`WaSocket::download_media`].
    pub id: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageKey {
    pub remote_jid: Option<String>,
    pub from_me: bool,
    pub id: String,
    /// Sender within a group chat.
    pub participant: Option<String>,
}

#[derive(Debug, Clone)]
pub enum MessageContent {
    Conversation(String),
    ExtendedText { text: String },
    Image { caption: Option<String>, media: MediaRef },
    Video { caption: Option<String>, media: MediaRef },
    Audio { media: MediaRef },
    Document { caption: Option<String>, media: MediaRef },
}

/// One message from a `messages.upsert` batch, reduced to the fields the
/// relay consumes.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub key: MessageKey,
    /// `@lid` alternate identity of the sender, when the library knows it.
    pub sender_lid: Option<String>,
    /// Phone JID of the sender, when the library knows it.
    pub sender_pn: Option<String>,
    pub push_name: Option<String>,
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone)]
pub enum WaEvent {
    /// Raw pairing QR payload. Never logged.
    Qr { code: String },
    Open { own_jid: String },
    Close { reason: CloseReason },
    /// Non-fatal error surfaced while the connection stays up. Decrypt
    /// failures arrive here and feed the Bad-MAC breaker.
    StreamError { detail: String },
    MessageUpsert { kind: UpsertKind, messages: Vec<InboundMessage> },
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
}

/// Outbound content, already fetched into memory.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Text { body: String },
    Image { bytes: Vec<u8>, mime: Option<String>, caption: Option<String> },
    Video { bytes: Vec<u8>, mime: Option<String>, caption: Option<String> },
    Audio { bytes: Vec<u8>, mime: String, ptt: bool },
    Document { bytes: Vec<u8>, mime: String, file_name: String, caption: Option<String> },
}

#[async_trait]
pub trait WaSocket: Send + Sync {
    /// JID this session is logged in as, once known.
    fn own_jid(&self) -> Option<String>;

    async fn send(&self, to: &str, payload: OutboundPayload) -> Result<SendReceipt, WaError>;

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, WaError>;

    /// Tear the connection down. The event stream ends shortly after.
    async fn end(&self, reason: &str);
}

#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Open a socket for `session_id` using the auth material under
    /// `auth_dir`. Returns the command handle and the event stream.
    async fn create_socket(
        &self,
        session_id: &str,
        auth_dir: &Path,
    ) -> Result<(Arc<dyn WaSocket>, mpsc::Receiver<WaEvent>), WaError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_decrypt_failures() {
        assert_eq!(ErrorKind::from_text("Bad MAC error"), ErrorKind::BadMac);
        assert_eq!(
            ErrorKind::from_text("Failed to decrypt message with any known session"),
            ErrorKind::SignalDecrypt
        );
        assert_eq!(
            ErrorKind::from_text("No matching sessions found for message"),
            ErrorKind::SignalNoSession
        );
        assert!(ErrorKind::from_text("bad mac").counts_for_bad_mac());
        assert!(!ErrorKind::from_text("connection reset").counts_for_bad_mac());
    }

    #[test]
    fn classifies_close_codes() {
        let reason = CloseReason::classify(Some(CODE_LOGGED_OUT), "connection closed");
        assert_eq!(reason.kind, ErrorKind::LoggedOut);
        assert!(reason.kind.wipes_auth());

        let reason = CloseReason::classify(Some(CODE_RESTART_REQUIRED), "stream errored");
        assert_eq!(reason.kind, ErrorKind::Restart515);

        let reason = CloseReason::classify(None, "bad session detected");
        assert_eq!(reason.kind, ErrorKind::BadSession);
        assert!(reason.kind.wipes_auth());

        let reason = CloseReason::classify(Some(503), "service unavailable");
        assert_eq!(reason.kind, ErrorKind::Other);
    }
}
