//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on how long the scheduler sleeps between ticks. Wakeups from
/// new requests, released usages and status changes cut the sleep short.
pub const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Poll interval while draining a backend for clean shutdown.
pub const CLEAN_SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// Poll interval while a committed model load waits for in-flight
/// generations to release.
pub const MODEL_LOAD_POLL: Duration = Duration::from_millis(100);

/// How long fresh pressure is allowed to age before the scheduler commits a
/// model swap, when more than one loader is free. Young pressure often
/// resolves on its own as a matching backend releases.
pub const PRESSURE_DEFER_WINDOW: Duration = Duration::from_millis(1500);

/// Backoff between backend init attempts.
pub const INIT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// What the stagnation watchdog does when no open request has completed for
/// `max_timeout_minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallAction {
    /// Fail every open request at once. A silent backend pool is treated as
    /// a registry-wide fault.
    FailAll,
    /// Fail only requests whose individual deadline has passed and leave the
    /// pool to recover.
    FailExpired,
}

/// Tunables for the backend registry and scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How many times a backend init is attempted before the record goes to
    /// ERRORED. Configuration refusals are never retried.
    pub max_backend_init_attempts: u32,
    /// Per-request deadline, in minutes. `get_next_backend` callers may pass
    /// a shorter wait.
    pub per_request_timeout_minutes: u64,
    /// Registry-wide stagnation deadline, in minutes. If no open request
    /// completes for this long the watchdog fires per `stall_action`.
    pub max_timeout_minutes: u64,
    /// Stagnation watchdog behavior.
    pub stall_action: StallAction,
    /// Where the registry persists real backend records. `None` disables
    /// persistence entirely.
    pub registry_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_backend_init_attempts: 3,
            per_request_timeout_minutes: 60,
            max_timeout_minutes: 20,
            stall_action: StallAction::FailAll,
            registry_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn per_request_timeout(&self) -> Duration {
        Duration::from_secs(self.per_request_timeout_minutes * 60)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_minutes * 60)
    }
}
