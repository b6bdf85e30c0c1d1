//! Inbound relay: message upserts → control plane.
//!
//! Each relayed message goes through identity-alias learning, chat
//! canonicalization, content extraction, the media download/upload pipeline
//! and sender contact resolution before the inbound post. Media failures
//! skip the message entirely so the control plane never sees a partial
//! record.

use std::time::Duration;

use log::{debug, error, warn};

use crate::edge::InboundPayload;
use crate::jid;
use crate::wa::{InboundMessage, MediaRef, MessageContent, WaSocket};

use super::SessionRunner;

/// How long a successful contact resolution stays cached.
const CONTACT_CACHE_SUCCESS_TTL: Duration = Duration::from_secs(6 * 60 * 60);

const MAX_FILE_NAME_CHARS: usize = 120;

/// Media classes as the control plane names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
        }
    }

    fn default_mime(self) -> &'static str {
        match self {
            Self::Image => "image/jpeg",
            Self::Video => "video/mp4",
            Self::Audio => "audio/ogg",
            Self::Document => "application/octet-stream",
        }
    }

    fn default_extension(self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Video => "mp4",
            Self::Audio => "ogg",
            Self::Document => "bin",
        }
    }
}

/// What the extraction pass distilled from a message.
pub struct ExtractedContent<'a> {
    pub media_class: Option<MediaClass>,
    pub body: String,
    pub media: Option<&'a MediaRef>,
}

/// Pull body and media out of a message, in the priority order the content
/// variants are checked: conversation, extended text, image, video, audio,
/// document. Returns None when there is neither body nor media.
pub fn extract_content(content: Option<&MessageContent>) -> Option<ExtractedContent<'_>> {
    let extracted = match content? {
        MessageContent::Conversation(text) => ExtractedContent {
            media_class: None,
            body: text.clone(),
            media: None,
        },
        MessageContent::ExtendedText { text } => ExtractedContent {
            media_class: None,
            body: text.clone(),
            media: None,
        },
        MessageContent::Image { caption, media } => ExtractedContent {
            media_class: Some(MediaClass::Image),
            body: caption.clone().unwrap_or_default(),
            media: Some(media),
        },
        MessageContent::Video { caption, media } => ExtractedContent {
            media_class: Some(MediaClass::Video),
            body: caption.clone().unwrap_or_default(),
            media: Some(media),
        },
        MessageContent::Audio { media } => ExtractedContent {
            media_class: Some(MediaClass::Audio),
            body: String::new(),
            media: Some(media),
        },
        MessageContent::Document { caption, media } => ExtractedContent {
            media_class: Some(MediaClass::Document),
            body: caption.clone().unwrap_or_default(),
            media: Some(media),
        },
    };
    if extracted.body.is_empty() && extracted.media.is_none() {
        return None;
    }
    Some(extracted)
}

/// `[^a-zA-Z0-9._-] → _`, capped at 120 characters.
pub fn sanitize_file_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_CHARS)
        .collect()
}

/// Extension inference: mime map, then the file name's own extension, then
/// the media-class default.
pub fn infer_extension(mime: &str, file_name: Option<&str>, class: MediaClass) -> &'static str {
    let bare = mime.split(';').next().unwrap_or("").trim();
    let from_mime = match bare {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "video/mp4" => Some("mp4"),
        "video/3gpp" => Some("3gp"),
        "audio/ogg" => Some("ogg"),
        "audio/mpeg" => Some("mp3"),
        "audio/mp4" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/amr" => Some("amr"),
        "application/pdf" => Some("pdf"),
        _ => None,
    };
    if let Some(ext) = from_mime {
        return ext;
    }
    if let Some(name) = file_name {
        if let Some((_, ext)) = name.rsplit_once('.') {
            if !ext.is_empty() && ext.len() <= 5 && ext.bytes().all(|b| b.is_ascii_alphanumeric())
            {
                match ext {
                    "jpg" | "jpeg" => return "jpg",
                    "png" => return "png",
                    "webp" => return "webp",
                    "gif" => return "gif",
                    "mp4" => return "mp4",
                    "ogg" | "opus" => return "ogg",
                    "mp3" => return "mp3",
                    "pdf" => return "pdf",
                    "txt" => return "txt",
                    _ => {}
                }
            }
        }
    }
    class.default_extension()
}

/// `jid_type` value the contact-resolve endpoint expects.
pub fn jid_type_of(jid_str: &str) -> &'static str {
    if jid::is_lid(jid_str) {
        "lid"
    } else if jid::is_group(jid_str) {
        "group"
    } else {
        "pn"
    }
}

impl SessionRunner {
    pub(crate) async fn handle_upsert(
        &self,
        socket: &std::sync::Arc<dyn WaSocket>,
        messages: Vec<InboundMessage>,
    ) {
        for message in messages {
            self.relay_message(socket, message).await;
        }
    }

    async fn relay_message(&self, socket: &std::sync::Arc<dyn WaSocket>, message: InboundMessage) {
        let Some(chat_id) = message.key.remote_jid.clone() else {
            return;
        };

        // Learn the LID/PN pair whenever the library surfaced both sides.
        if let (Some(lid), Some(pn)) = (&message.sender_lid, &message.sender_pn) {
            if let Err(e) = self.alias.remember_pair(lid, pn).await {
                warn!(target: "Inbound", "[{}] alias persist failed: {e}", self.id);
            }
        }

        let is_group = jid::is_group(&chat_id);
        let from_me = message.key.from_me;
        let own_jid = socket.own_jid().or_else(|| self.own_jid());

        let sender_pn = message.sender_pn.clone().filter(|pn| jid::is_pn(pn));
        let chat_fallback = if is_group || from_me { None } else { sender_pn.as_deref() };
        let chat_id_norm = self.alias.resolve_canonical(&chat_id, chat_fallback).await;

        let sender_jid_raw = if is_group {
            message
                .key
                .participant
                .clone()
                .unwrap_or_else(|| chat_id.clone())
        } else if from_me {
            own_jid.clone().unwrap_or_else(|| chat_id.clone())
        } else {
            chat_id.clone()
        };
        let contact_jid = if from_me {
            chat_id_norm.clone()
        } else {
            sender_pn.clone().unwrap_or_else(|| sender_jid_raw.clone())
        };

        let Some(extracted) = extract_content(message.content.as_ref()) else {
            debug!(
                target: "Inbound",
                "[{}] skipping {} (no body or media)", self.id, message.key.id
            );
            return;
        };

        let mut media_url = None;
        let mut mime_type = None;
        let mut file_name = None;
        let mut file_size = None;
        if let (Some(class), Some(media)) = (extracted.media_class, extracted.media) {
            let bytes = match socket.download_media(media).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        target: "Inbound",
                        "[{}] media download for {} failed, skipping: {e}",
                        self.id, message.key.id
                    );
                    return;
                }
            };

            let mime = media
                .mime_type
                .clone()
                .unwrap_or_else(|| class.default_mime().to_string());
            let extension = infer_extension(&mime, media.file_name.as_deref(), class);
            let raw_name = media
                .file_name
                .clone()
                .unwrap_or_else(|| format!("{}-{}.{extension}", class.as_str(), message.key.id));
            let safe_name = sanitize_file_name(&raw_name);

            let uploaded = self
                .edge
                .upload_media(&self.id, &message.key.id, &mime, &safe_name, &bytes)
                .await;
            let url = match uploaded {
                Ok(url) => url,
                Err(e) => {
                    // No partial inbound post for media messages.
                    error!(
                        target: "Inbound",
                        "[{}] media upload for {} failed, skipping: {e}",
                        self.id, message.key.id
                    );
                    return;
                }
            };

            file_size = media.file_size.or(Some(bytes.len() as u64));
            media_url = Some(url);
            mime_type = Some(mime);
            file_name = Some(safe_name);
        }

        let sender_contact_id = if from_me {
            None
        } else {
            self.resolve_sender_contact(&contact_jid, message.push_name.as_deref())
                .await
        };

        let own = own_jid.unwrap_or_default();
        let (from, to) = if from_me {
            (own.clone(), chat_id_norm.clone())
        } else {
            (chat_id_norm.clone(), own)
        };

        let payload = InboundPayload {
            instance_id: self.id.clone(),
            from,
            to,
            body: extracted.body,
            wa_message_id: message.key.id.clone(),
            from_me,
            chat_id_norm,
            sender_jid_raw,
            sender_pn,
            sender_contact_id,
            push_name: message.push_name,
            media_type: extracted.media_class.map(|c| c.as_str().to_string()),
            media_url,
            mime_type,
            file_name,
            file_size,
        };

        match self.edge.post_inbound(&payload).await {
            Ok(()) => debug!(target: "Inbound", "[{}] relayed {}", self.id, message.key.id),
            Err(e) => error!(
                target: "Inbound",
                "[{}] inbound post for {} failed: {e}", self.id, message.key.id
            ),
        }
    }

    /// Contact id for the sender, through the session-local cache. Failed
    /// and duplicate resolutions are cached as `None` with their own
    /// cooldowns so the control plane is not hammered.
    async fn resolve_sender_contact(
        &self,
        contact_jid: &str,
        push_name: Option<&str>,
    ) -> Option<String> {
        if let Some(cached) = self.contact_cache.lock().unwrap().get(contact_jid) {
            return cached;
        }

        let resolved = self
            .edge
            .resolve_contact(&self.id, contact_jid, jid_type_of(contact_jid), push_name)
            .await;

        let (contact_id, ttl) = match resolved {
            Ok(contact_id) => (contact_id, CONTACT_CACHE_SUCCESS_TTL),
            Err(e) if e.is_duplicate_conflict() => {
                debug!(
                    target: "Inbound",
                    "[{}] contact {contact_jid} already exists, cooling down", self.id
                );
                (None, self.cfg.contact_duplicate_cooldown)
            }
            Err(e) => {
                error!(
                    target: "Inbound",
                    "[{}] contact resolve for {contact_jid} failed: {e}", self.id
                );
                (None, self.cfg.contact_error_cooldown)
            }
        };

        self.contact_cache
            .lock()
            .unwrap()
            .insert(contact_jid, contact_id.clone(), ttl);
        contact_id
    }
}
