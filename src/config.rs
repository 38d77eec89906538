//! # Config — Environment-Driven Settings
//!
//! All tunables come from environment variables (loaded from `.env` via
//! `dotenvy` in `main`). Every option has a default except `DATABASE_URL`
//! and, on workers, `WORKER_ENDPOINT_PUBLIC_URL` — the public URL is never
//! auto-detected because the address a worker binds to is rarely the
//! address the coordinator can reach it on.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Parse an env var with a fallback default.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Config {
    /// PostgreSQL connection string shared by coordinator and workers.
    pub database_url: String,
    /// Base directory for checkpoint artifacts. Must be writable by workers
    /// and readable by the coordinator.
    pub checkpoint_dir: PathBuf,
    /// Units (epochs / bars) between periodic checkpoints.
    pub checkpoint_unit_interval: u64,
    /// Seconds between periodic checkpoints; fires if it elapses before the
    /// unit interval does.
    pub checkpoint_time_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    /// Workers silent longer than this are marked UNRESPONSIVE.
    pub heartbeat_timeout_seconds: u64,
    /// RUNNING operations without a heartbeat for this long are failed ORPHANED.
    pub orphan_timeout_seconds: u64,
    /// Window in which PENDING_RECONCILIATION may resolve back to RUNNING.
    pub reconciliation_grace_seconds: u64,
    /// Coordinator base URL used by workers for registration and heartbeats.
    pub coordinator_url: String,
    /// URL the coordinator uses to dispatch to this worker. Required on
    /// workers, unused on the coordinator.
    pub worker_endpoint_public_url: Option<String>,
    pub coordinator_port: u16,
    pub worker_port: u16,
    /// Terminal operation records older than this are deleted by the
    /// housekeeping sweep.
    pub operation_retention_hours: i64,
    /// Checkpoints older than this are deleted by the housekeeping sweep.
    pub checkpoint_retention_hours: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL is required (set it in the environment or .env)")?;

        let cfg = Config {
            database_url,
            checkpoint_dir: PathBuf::from(
                std::env::var("CHECKPOINT_DIR").unwrap_or_else(|_| "checkpoints".to_string()),
            ),
            checkpoint_unit_interval: env_parse("CHECKPOINT_UNIT_INTERVAL", 5),
            checkpoint_time_interval_seconds: env_parse("CHECKPOINT_TIME_INTERVAL_SECONDS", 300),
            heartbeat_interval_seconds: env_parse("HEARTBEAT_INTERVAL_SECONDS", 15),
            heartbeat_timeout_seconds: env_parse("HEARTBEAT_TIMEOUT_SECONDS", 60),
            orphan_timeout_seconds: env_parse("ORPHAN_TIMEOUT_SECONDS", 60),
            reconciliation_grace_seconds: env_parse("RECONCILIATION_GRACE_SECONDS", 60),
            coordinator_url: std::env::var("COORDINATOR_URL")
                .unwrap_or_else(|_| "http://localhost:7100".to_string()),
            worker_endpoint_public_url: std::env::var("WORKER_ENDPOINT_PUBLIC_URL").ok(),
            coordinator_port: env_parse("COORDINATOR_PORT", 7100),
            worker_port: env_parse("WORKER_PORT", 7200),
            operation_retention_hours: env_parse("OPERATION_RETENTION_HOURS", 720),
            checkpoint_retention_hours: env_parse("CHECKPOINT_RETENTION_HOURS", 720),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations where orphan detection could race a healthy
    /// heartbeat: both grace windows must exceed the heartbeat interval.
    pub fn validate(&self) -> Result<()> {
        if self.orphan_timeout_seconds <= self.heartbeat_interval_seconds {
            bail!(
                "ORPHAN_TIMEOUT_SECONDS ({}) must exceed HEARTBEAT_INTERVAL_SECONDS ({})",
                self.orphan_timeout_seconds,
                self.heartbeat_interval_seconds
            );
        }
        if self.reconciliation_grace_seconds <= self.heartbeat_interval_seconds {
            bail!(
                "RECONCILIATION_GRACE_SECONDS ({}) must exceed HEARTBEAT_INTERVAL_SECONDS ({})",
                self.reconciliation_grace_seconds,
                self.heartbeat_interval_seconds
            );
        }
        if let Some(url) = &self.worker_endpoint_public_url {
            url::Url::parse(url).with_context(|| {
                format!("WORKER_ENDPOINT_PUBLIC_URL is not a valid URL: {}", url)
            })?;
        }
        Ok(())
    }

    /// The public URL, required when running as a worker.
    pub fn require_worker_endpoint(&self) -> Result<&str> {
        self.worker_endpoint_public_url.as_deref().context(
            "WORKER_ENDPOINT_PUBLIC_URL is required for workers; it is never auto-detected",
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn checkpoint_time_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_time_interval_seconds)
    }
}

impl Default for Config {
    /// Defaults suitable for tests; `database_url` is empty and must be
    /// filled in by the caller.
    fn default() -> Self {
        Config {
            database_url: String::new(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_unit_interval: 5,
            checkpoint_time_interval_seconds: 300,
            heartbeat_interval_seconds: 15,
            heartbeat_timeout_seconds: 60,
            orphan_timeout_seconds: 60,
            reconciliation_grace_seconds: 60,
            coordinator_url: "http://localhost:7100".to_string(),
            worker_endpoint_public_url: None,
            coordinator_port: 7100,
            worker_port: 7200,
            operation_retention_hours: 720,
            checkpoint_retention_hours: 720,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.orphan_timeout_seconds > cfg.heartbeat_interval_seconds);
        assert!(cfg.reconciliation_grace_seconds > cfg.heartbeat_interval_seconds);
    }

    #[test]
    fn orphan_timeout_must_exceed_heartbeat_interval() {
        let cfg = Config {
            orphan_timeout_seconds: 10,
            heartbeat_interval_seconds: 15,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn grace_must_exceed_heartbeat_interval() {
        let cfg = Config {
            reconciliation_grace_seconds: 5,
            heartbeat_interval_seconds: 15,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_worker_endpoint_rejected() {
        let cfg = Config {
            worker_endpoint_public_url: Some("not a url".to_string()),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn require_worker_endpoint_errors_when_unset() {
        let cfg = Config::default();
        assert!(cfg.require_worker_endpoint().is_err());
    }
}
