//! String-level JID helpers.
//!
//! The worker never parses JIDs structurally; the control plane and the
//! client library both speak suffixed strings (`@s.whatsapp.net`, `@g.us`,
//! `@lid`), so classification stays at the suffix level.

pub const PN_SUFFIX: &str = "@s.whatsapp.net";
pub const GROUP_SUFFIX: &str = "@g.us";
pub const LID_SUFFIX: &str = "@lid";

pub fn is_pn(jid: &str) -> bool {
    jid.ends_with(PN_SUFFIX)
}

pub fn is_group(jid: &str) -> bool {
    jid.ends_with(GROUP_SUFFIX)
}

pub fn is_lid(jid: &str) -> bool {
    jid.ends_with(LID_SUFFIX)
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// `<digits>-<digits>`, the legacy group id shape.
fn is_group_id(s: &str) -> bool {
    match s.split_once('-') {
        Some((a, b)) => is_all_digits(a) && is_all_digits(b),
        None => false,
    }
}

/// Destination of a queued message after suffix normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundTarget {
    /// Sendable as-is.
    Ready(String),
    /// A `@lid` pseudonym; needs a primary-jid lookup before sending.
    NeedsPrimaryJid(String),
}

/// Normalize a raw `to` field into a sendable JID.
///
/// Idempotent: feeding a `Ready` output back in returns the same value.
pub fn normalize_outbound_to(to: &str) -> OutboundTarget {
    let to = to.trim();
    if is_lid(to) {
        return OutboundTarget::NeedsPrimaryJid(to.to_string());
    }
    if to.contains(GROUP_SUFFIX) || to.contains(PN_SUFFIX) {
        return OutboundTarget::Ready(to.to_string());
    }
    if is_all_digits(to) {
        return OutboundTarget::Ready(format!("{to}{PN_SUFFIX}"));
    }
    if is_group_id(to) {
        return OutboundTarget::Ready(format!("{to}{GROUP_SUFFIX}"));
    }
    OutboundTarget::Ready(to.to_string())
}
