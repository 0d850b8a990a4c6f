//! Runtime configuration.
//!
//! Values come from environment variables with validated fallbacks; an
//! invalid value is ignored and the default kept.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::BackoffPolicy;

/// Tunables for the local store, the sync queue and the consent gate.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// SQLite database file
    pub db_path: PathBuf,

    /// First retry delay
    pub base_delay: Duration,

    /// Upper bound for a single retry delay (before jitter)
    pub max_delay: Duration,

    /// Failures after which an item is flagged permanently failed
    pub max_attempts: u32,

    /// Random extra delay, as a fraction of the computed delay
    pub jitter: f64,

    /// Bound on a single remote call
    pub remote_timeout: Duration,

    /// Periodic drain while online
    pub sync_interval: Duration,

    /// Consent re-check interval for mounted gates
    pub consent_poll_interval: Duration,

    /// Limit on resident media bytes (`None` = unlimited)
    pub storage_quota_bytes: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("carevista.db"),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            max_attempts: 5,
            jitter: 0.2,
            remote_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(30),
            consent_poll_interval: Duration::from_secs(5),
            storage_quota_bytes: None,
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
}

impl SyncConfig {
    /// Load config overrides from environment (best-effort).
    ///
    /// Supported:
    /// - CAREVISTA_DB_PATH
    /// - CAREVISTA_SYNC_BASE_DELAY_MS
    /// - CAREVISTA_SYNC_MAX_DELAY_MS
    /// - CAREVISTA_SYNC_MAX_ATTEMPTS
    /// - CAREVISTA_SYNC_JITTER (0.0 ..= 1.0)
    /// - CAREVISTA_REMOTE_TIMEOUT_MS
    /// - CAREVISTA_SYNC_INTERVAL_MS
    /// - CAREVISTA_CONSENT_POLL_MS
    /// - CAREVISTA_STORAGE_QUOTA_BYTES
    #[must_use]
    pub fn from_env_or_default() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("CAREVISTA_DB_PATH") {
            if !v.trim().is_empty() {
                cfg.db_path = PathBuf::from(v.trim());
            }
        }

        if let Some(d) = env_millis("CAREVISTA_SYNC_BASE_DELAY_MS") {
            cfg.base_delay = d;
        }
        if let Some(d) = env_millis("CAREVISTA_SYNC_MAX_DELAY_MS") {
            cfg.max_delay = d;
        }
        if cfg.max_delay < cfg.base_delay {
            cfg.max_delay = cfg.base_delay;
        }

        if let Ok(v) = std::env::var("CAREVISTA_SYNC_MAX_ATTEMPTS") {
            if let Ok(n) = v.trim().parse::<u32>() {
                if n > 0 {
                    cfg.max_attempts = n;
                }
            }
        }

        if let Ok(v) = std::env::var("CAREVISTA_SYNC_JITTER") {
            if let Ok(x) = v.trim().parse::<f64>() {
                if x.is_finite() && (0.0..=1.0).contains(&x) {
                    cfg.jitter = x;
                }
            }
        }

        if let Some(d) = env_millis("CAREVISTA_REMOTE_TIMEOUT_MS") {
            cfg.remote_timeout = d;
        }
        if let Some(d) = env_millis("CAREVISTA_SYNC_INTERVAL_MS") {
            cfg.sync_interval = d;
        }
        if let Some(d) = env_millis("CAREVISTA_CONSENT_POLL_MS") {
            cfg.consent_poll_interval = d;
        }

        if let Ok(v) = std::env::var("CAREVISTA_STORAGE_QUOTA_BYTES") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.storage_quota_bytes = Some(n);
            }
        }

        cfg
    }

    /// Retry policy derived from the delay settings.
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.base_delay,
            cap: self.max_delay,
            max_attempts: self.max_attempts,
            jitter: self.jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.base_delay, Duration::from_secs(2));
        assert_eq!(cfg.max_delay, Duration::from_secs(120));
        assert_eq!(cfg.max_attempts, 5);
        assert!(cfg.storage_quota_bytes.is_none());

        let policy = cfg.backoff();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.cap, Duration::from_secs(120));
    }
}
