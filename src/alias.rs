//! Persistent LID ↔ phone-number alias map, one file per session.
//!
//! WhatsApp addresses the same user both by `@lid` pseudonym and by phone
//! JID, and switches between them across reconnects. Remembering every
//! observed pair lets the worker canonicalize identities so chats survive
//! the aliasing. The map is small and rewritten whole on change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::jid;

pub const ALIAS_MAP_FILE: &str = "identity-alias-map.json";

#[derive(Debug, Error)]
pub enum AliasError {
    #[error("alias map io: {0}")]
    Io(#[from] std::io::Error),
    #[error("alias map encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AliasMaps {
    #[serde(default)]
    lid_to_pn: HashMap<String, String>,
    #[serde(default)]
    pn_to_lid: HashMap<String, String>,
}

pub struct IdentityAliasStore {
    session_id: String,
    path: PathBuf,
    /// Lazily loaded on first use.
    maps: Mutex<Option<AliasMaps>>,
}

impl IdentityAliasStore {
    pub fn new(session_id: &str, auth_dir: &Path) -> Self {
        Self {
            session_id: session_id.to_string(),
            path: auth_dir.join(ALIAS_MAP_FILE),
            maps: Mutex::new(None),
        }
    }

    /// Record a LID/PN pair in both directions. Returns whether anything
    /// changed; the file is only rewritten when it did.
    pub async fn remember_pair(&self, lid: &str, pn: &str) -> Result<bool, AliasError> {
        if !jid::is_lid(lid) || !jid::is_pn(pn) {
            return Ok(false);
        }

        let mut guard = self.maps.lock().await;
        let maps = self.loaded(&mut guard).await;

        let mut changed = false;
        if maps.lid_to_pn.get(lid).map(String::as_str) != Some(pn) {
            // Drop a stale inverse entry so the maps stay exact inverses.
            if let Some(old_pn) = maps.lid_to_pn.insert(lid.to_string(), pn.to_string()) {
                if maps.pn_to_lid.get(&old_pn).map(String::as_str) == Some(lid) {
                    maps.pn_to_lid.remove(&old_pn);
                }
            }
            changed = true;
        }
        if maps.pn_to_lid.get(pn).map(String::as_str) != Some(lid) {
            if let Some(old_lid) = maps.pn_to_lid.insert(pn.to_string(), lid.to_string()) {
                if maps.lid_to_pn.get(&old_lid).map(String::as_str) == Some(pn) {
                    maps.lid_to_pn.remove(&old_lid);
                }
            }
            changed = true;
        }

        if changed {
            self.persist(maps).await?;
            debug!(target: "Alias", "[{}] learned pair {lid} <-> {pn}", self.session_id);
        }
        Ok(changed)
    }

    /// Canonical identity for a JID: a known phone JID wherever possible.
    ///
    /// Order matters: an explicit phone fallback wins, then a learned LID
    /// mapping, then the input itself. Idempotent for a fixed map.
    pub async fn resolve_canonical(&self, raw: &str, fallback_pn: Option<&str>) -> String {
        if let Some(fallback) = fallback_pn {
            if jid::is_pn(fallback) {
                return fallback.to_string();
            }
        }
        if jid::is_lid(raw) {
            let mut guard = self.maps.lock().await;
            let maps = self.loaded(&mut guard).await;
            if let Some(pn) = maps.lid_to_pn.get(raw) {
                return pn.clone();
            }
        }
        raw.to_string()
    }

    pub async fn lid_for(&self, pn: &str) -> Option<String> {
        let mut guard = self.maps.lock().await;
        let maps = self.loaded(&mut guard).await;
        maps.pn_to_lid.get(pn).cloned()
    }

    async fn loaded<'a>(&self, guard: &'a mut Option<AliasMaps>) -> &'a mut AliasMaps {
        if guard.is_none() {
            let maps = match tokio::fs::read(&self.path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(maps) => maps,
                    Err(e) => {
                        warn!(
                            target: "Alias",
                            "[{}] alias map unreadable, starting fresh: {e}",
                            self.session_id
                        );
                        AliasMaps::default()
                    }
                },
                Err(_) => AliasMaps::default(),
            };
            *guard = Some(maps);
        }
        guard.as_mut().expect("just populated")
    }

    /// Whole-file atomic rewrite: temp file in the same directory, then
    /// rename over the target.
    async fn persist(&self, maps: &AliasMaps) -> Result<(), AliasError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(maps)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
