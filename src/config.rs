//! Worker configuration, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DISCOVERY_POLL_MS: u64 = 10_000;
const DEFAULT_QUEUE_POLL_MS: u64 = 2_000;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_AUTH_BASE: &str = "/data/auth";
const DEFAULT_MEDIA_BASE: &str = "/data/media";
const DEFAULT_LOCK_TTL_MS: u64 = 30_000;
const MIN_LOCK_TTL_MS: u64 = 5_000;
const MIN_LOCK_RENEW_MS: u64 = 2_000;
const DEFAULT_BAD_MAC_WINDOW_MS: u64 = 60_000;
const DEFAULT_BAD_MAC_THRESHOLD: usize = 20;
const DEFAULT_BAD_MAC_COOLDOWN_MS: u64 = 300_000;
const DEFAULT_CONTACT_ERROR_COOLDOWN_MS: u64 = 60_000;
const DEFAULT_CONTACT_DUPLICATE_COOLDOWN_MS: u64 = 300_000;
const DEFAULT_STOP_COOLDOWN_MS: u64 = 60_000;
const DEFAULT_DECRYPT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_WA_BACKEND: &str = "loopback";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane base URL, trailing `/inbound` stripped.
    pub edge_base_url: String,
    /// Bearer token for every control-plane call.
    pub worker_secret: String,
    pub port: u16,
    pub discovery_poll: Duration,
    pub queue_poll: Duration,
    pub http_timeout: Duration,
    pub auth_base: PathBuf,
    pub media_base: PathBuf,
    /// Fallback when `/worker-settings` is unreachable.
    pub max_active_instances_fallback: i64,
    pub lock_ttl: Duration,
    pub lock_renew: Duration,
    pub bad_mac_window: Duration,
    pub bad_mac_threshold: usize,
    pub bad_mac_cooldown: Duration,
    pub contact_error_cooldown: Duration,
    pub contact_duplicate_cooldown: Duration,
    pub stop_cooldown: Duration,
    /// Extra send attempts after a `no matching sessions` failure.
    pub decrypt_retry_max_attempts: u32,
    pub wa_backend: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from any variable source. Tests feed a map here so
    /// they never touch process-global environment state.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let edge_base_url = lookup("EDGE_BASE_URL")
            .map(|v| strip_edge_base(&v))
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("EDGE_BASE_URL"))?;
        let worker_secret = lookup("WORKER_SECRET")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("WORKER_SECRET"))?;

        let lock_ttl_ms =
            parse_u64(&lookup, "INSTANCE_LOCK_TTL_MS", DEFAULT_LOCK_TTL_MS)?.max(MIN_LOCK_TTL_MS);
        let lock_renew_ms = match lookup("INSTANCE_LOCK_RENEW_MS") {
            Some(_) => parse_u64(&lookup, "INSTANCE_LOCK_RENEW_MS", 0)?,
            None => lock_ttl_ms / 2,
        }
        .max(MIN_LOCK_RENEW_MS);

        Ok(Self {
            edge_base_url,
            worker_secret,
            port: parse_u64(&lookup, "PORT", u64::from(DEFAULT_PORT))? as u16,
            discovery_poll: ms(parse_u64(&lookup, "DISCOVERY_POLL_MS", DEFAULT_DISCOVERY_POLL_MS)?),
            queue_poll: ms(parse_u64(&lookup, "QUEUE_POLL_MS", DEFAULT_QUEUE_POLL_MS)?),
            http_timeout: ms(parse_u64(&lookup, "HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS)?),
            auth_base: PathBuf::from(
                lookup("AUTH_BASE").unwrap_or_else(|| DEFAULT_AUTH_BASE.to_string()),
            ),
            media_base: PathBuf::from(
                lookup("MEDIA_BASE").unwrap_or_else(|| DEFAULT_MEDIA_BASE.to_string()),
            ),
            max_active_instances_fallback: parse_i64(&lookup, "MAX_ACTIVE_INSTANCES", 0)?,
            lock_ttl: ms(lock_ttl_ms),
            lock_renew: ms(lock_renew_ms),
            bad_mac_window: ms(parse_u64(&lookup, "BAD_MAC_WINDOW_MS", DEFAULT_BAD_MAC_WINDOW_MS)?),
            bad_mac_threshold: parse_u64(
                &lookup,
                "BAD_MAC_THRESHOLD",
                DEFAULT_BAD_MAC_THRESHOLD as u64,
            )? as usize,
            bad_mac_cooldown: ms(parse_u64(
                &lookup,
                "BAD_MAC_COOLDOWN_MS",
                DEFAULT_BAD_MAC_COOLDOWN_MS,
            )?),
            contact_error_cooldown: ms(parse_u64(
                &lookup,
                "CONTACT_RESOLVE_ERROR_COOLDOWN_MS",
                DEFAULT_CONTACT_ERROR_COOLDOWN_MS,
            )?),
            contact_duplicate_cooldown: ms(parse_u64(
                &lookup,
                "CONTACT_RESOLVE_DUPLICATE_COOLDOWN_MS",
                DEFAULT_CONTACT_DUPLICATE_COOLDOWN_MS,
            )?),
            stop_cooldown: ms(parse_u64(&lookup, "STOP_COOLDOWN_MS", DEFAULT_STOP_COOLDOWN_MS)?),
            decrypt_retry_max_attempts: parse_u64(
                &lookup,
                "DECRYPT_RETRY_MAX_ATTEMPTS",
                u64::from(DEFAULT_DECRYPT_RETRY_MAX_ATTEMPTS),
            )? as u32,
            wa_backend: lookup("WA_BACKEND").unwrap_or_else(|| DEFAULT_WA_BACKEND.to_string()),
        })
    }

    pub fn auth_dir(&self, session_id: &str) -> PathBuf {
        self.auth_base.join(session_id)
    }

    pub fn media_dir(&self, session_id: &str) -> PathBuf {
        self.media_base.join(session_id)
    }
}

/// The control plane is sometimes configured with its inbound endpoint as
/// the base; accept that and strip it back to the root.
fn strip_edge_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    trimmed.strip_suffix("/inbound").unwrap_or(trimmed).to_string()
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn parse_u64<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

fn parse_i64<F>(lookup: &F, name: &'static str, default: i64) -> Result<i64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}
