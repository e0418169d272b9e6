// Copyright (c) 2025 - Cowboy AI, Inc.
//! Provisioner Configuration
//!
//! Knobs for the scheduler: worker pool width per account context, retry
//! policy for transient adapter errors, polling policy for external
//! transitions, and the bounded waits for peering acceptance and resource
//! readiness.
//!
//! Every value has a default; `from_env` overrides from `PROVISIONER_*`
//! variables and the `with_*` builders override in code.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{ProvisioningError, ProvisioningResult};

/// Environment variable names
pub mod env {
    pub const WORKERS_PER_CONTEXT: &str = "PROVISIONER_WORKERS_PER_CONTEXT";
    pub const RETRY_MAX_ATTEMPTS: &str = "PROVISIONER_RETRY_MAX_ATTEMPTS";
    pub const RETRY_BASE_DELAY_MS: &str = "PROVISIONER_RETRY_BASE_DELAY_MS";
    pub const RETRY_MAX_DELAY_MS: &str = "PROVISIONER_RETRY_MAX_DELAY_MS";
    pub const POLL_INITIAL_MS: &str = "PROVISIONER_POLL_INITIAL_MS";
    pub const POLL_MAX_MS: &str = "PROVISIONER_POLL_MAX_MS";
    pub const ACCEPTANCE_TIMEOUT_MS: &str = "PROVISIONER_ACCEPTANCE_TIMEOUT_MS";
    pub const READINESS_TIMEOUT_MS: &str = "PROVISIONER_READINESS_TIMEOUT_MS";
    pub const SNAPSHOT_PATH: &str = "PROVISIONER_SNAPSHOT_PATH";
    pub const PURGE_ZONE_RECORDS: &str = "PROVISIONER_PURGE_ZONE_RECORDS";
}

/// Bounded exponential backoff for transient adapter errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling for any single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Whether to add jitter to delay
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no delay
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Deterministic delay before attempt `attempt + 1` (0-indexed), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Backoff for polling external transitions, always with a ceiling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    #[serde(default = "default_poll_initial_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_poll_max_ms")]
    pub max_interval_ms: u64,
}

fn default_poll_initial_ms() -> u64 {
    500
}
fn default_poll_max_ms() -> u64 {
    15_000
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_poll_initial_ms(),
            max_interval_ms: default_poll_max_ms(),
        }
    }
}

impl PollPolicy {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.initial_interval_ms))
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Concurrent nodes per account context
    pub workers_per_context: usize,

    pub retry: RetryPolicy,

    pub poll: PollPolicy,

    /// Bounded wait in milliseconds for a peering connection to become
    /// active after accept
    pub acceptance_timeout_ms: u64,

    /// Bounded wait in milliseconds for any other resource to report available
    pub readiness_timeout_ms: u64,

    /// Where the file snapshot store keeps state
    pub snapshot_path: PathBuf,

    /// Clear a removed zone's declared records before deleting it;
    /// otherwise any non-system record fails the delete
    #[serde(default)]
    pub purge_zone_records: bool,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            workers_per_context: 4,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            acceptance_timeout_ms: 300_000,
            readiness_timeout_ms: 600_000,
            snapshot_path: PathBuf::from("provisioner-state.json"),
            purge_zone_records: false,
        }
    }
}

impl ProvisionerConfig {
    /// Defaults overridden by any `PROVISIONER_*` variables that are set
    ///
    /// # Errors
    /// `Configuration` when a variable is set but does not parse or is zero
    /// where zero is meaningless.
    pub fn from_env() -> ProvisioningResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ProvisioningResult<Self> {
        let mut config = Self::default();

        if let Some(workers) = parse_var::<usize>(&lookup, env::WORKERS_PER_CONTEXT)? {
            if workers == 0 {
                return Err(ProvisioningError::Configuration(format!(
                    "{} must be at least 1",
                    env::WORKERS_PER_CONTEXT
                )));
            }
            config.workers_per_context = workers;
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, env::RETRY_MAX_ATTEMPTS)? {
            config.retry.max_attempts = attempts.max(1);
        }
        if let Some(ms) = parse_var(&lookup, env::RETRY_BASE_DELAY_MS)? {
            config.retry.base_delay_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, env::RETRY_MAX_DELAY_MS)? {
            config.retry.max_delay_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, env::POLL_INITIAL_MS)? {
            config.poll.initial_interval_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, env::POLL_MAX_MS)? {
            config.poll.max_interval_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, env::ACCEPTANCE_TIMEOUT_MS)? {
            config.acceptance_timeout_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, env::READINESS_TIMEOUT_MS)? {
            config.readiness_timeout_ms = ms;
        }
        if let Some(path) = lookup(env::SNAPSHOT_PATH) {
            config.snapshot_path = PathBuf::from(path);
        }
        if let Some(purge) = parse_var(&lookup, env::PURGE_ZONE_RECORDS)? {
            config.purge_zone_records = purge;
        }

        Ok(config)
    }

    pub fn with_workers_per_context(mut self, workers: usize) -> Self {
        self.workers_per_context = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_acceptance_timeout(mut self, timeout: Duration) -> Self {
        self.acceptance_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = path.into();
        self
    }

    pub fn with_zone_record_purge(mut self, purge: bool) -> Self {
        self.purge_zone_records = purge;
        self
    }

    pub fn acceptance_timeout(&self) -> Duration {
        Duration::from_millis(self.acceptance_timeout_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> ProvisioningResult<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ProvisioningError::Configuration(format!("{name}: cannot parse '{raw}'"))
        }),
    }
}
