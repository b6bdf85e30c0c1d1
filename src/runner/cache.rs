//! Session-local contact resolution cache.
//!
//! Maps a JID to its resolved contact id (or to a cached `None` after a
//! failed or duplicate resolve, so the control plane is not hammered).
//! Bounded at 500 entries with expiry on read and oldest-expiry eviction.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const CONTACT_CACHE_CAP: usize = 500;

struct Entry {
    contact_id: Option<String>,
    expires_at: Instant,
}

pub struct ContactCache {
    entries: HashMap<String, Entry>,
    cap: usize,
}

impl ContactCache {
    pub fn new(cap: usize) -> Self {
        Self { entries: HashMap::new(), cap }
    }

    /// `None` = miss; `Some(inner)` = cached result, where `inner` may be a
    /// negative entry. Expired entries are dropped on read.
    pub fn get(&mut self, jid: &str) -> Option<Option<String>> {
        match self.entries.get(jid) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.contact_id.clone()),
            Some(_) => {
                self.entries.remove(jid);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, jid: &str, contact_id: Option<String>, ttl: Duration) {
        self.entries.insert(
            jid.to_string(),
            Entry { contact_id, expires_at: Instant::now() + ttl },
        );
        if self.entries.len() > self.cap {
            self.shrink();
        }
    }

    /// Soft purge: drop expired entries first, then the soonest-to-expire
    /// until back under the cap.
    fn shrink(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        while self.entries.len() > self.cap {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(jid, _)| jid.clone());
            match oldest {
                Some(jid) => {
                    self.entries.remove(&jid);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_positive_and_negative_entries() {
        let mut cache = ContactCache::new(10);
        cache.insert("a@s.whatsapp.net", Some("c1".into()), Duration::from_secs(60));
        cache.insert("b@s.whatsapp.net", None, Duration::from_secs(60));

        assert_eq!(cache.get("a@s.whatsapp.net"), Some(Some("c1".into())));
        assert_eq!(cache.get("b@s.whatsapp.net"), Some(None));
        assert_eq!(cache.get("c@s.whatsapp.net"), None);
    }

    #[test]
    fn expires_on_read() {
        let mut cache = ContactCache::new(10);
        cache.insert("a@s.whatsapp.net", Some("c1".into()), Duration::ZERO);
        assert_eq!(cache.get("a@s.whatsapp.net"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_soonest_expiry_over_cap() {
        let mut cache = ContactCache::new(2);
        cache.insert("a", Some("c1".into()), Duration::from_secs(10));
        cache.insert("b", Some("c2".into()), Duration::from_secs(100));
        cache.insert("c", Some("c3".into()), Duration::from_secs(50));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(Some("c2".into())));
        assert_eq!(cache.get("c"), Some(Some("c3".into())));
    }

    #[test]
    fn purges_expired_before_evicting_live_entries() {
        let mut cache = ContactCache::new(2);
        cache.insert("dead", Some("c0".into()), Duration::ZERO);
        cache.insert("a", Some("c1".into()), Duration::from_secs(10));
        cache.insert("b", Some("c2".into()), Duration::from_secs(10));

        // The expired entry absorbs the eviction.
        assert_eq!(cache.get("a"), Some(Some("c1".into())));
        assert_eq!(cache.get("b"), Some(Some("c2".into())));
    }
}
