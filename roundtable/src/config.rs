//! Runtime configuration
//!
//! Defaults are tuned for an interactive multi-user deployment. Values can be
//! loaded from TOML and then overridden through `ROUNDTABLE_*` environment
//! variables.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, RoundtableError};

/// Default sentinel that lets an agent end the conversation voluntarily.
pub const DEFAULT_SENTINEL: &str = "TERMINATE";

/// Top-level configuration shared by the session manager and every
/// orchestrator it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundtableConfig {
    pub sessions: SessionLimits,
    pub orchestrator: OrchestratorDefaults,
    /// Ring buffer size of each session's event history.
    pub event_history_capacity: usize,
}

impl Default for RoundtableConfig {
    fn default() -> Self {
        Self {
            sessions: SessionLimits::default(),
            orchestrator: OrchestratorDefaults::default(),
            event_history_capacity: 512,
        }
    }
}

/// Session pool caps and expiry rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    pub max_sessions: usize,
    pub max_sessions_per_user: usize,
    /// Inactivity after which a session is expired.
    pub max_idle_secs: u64,
    /// Absolute lifetime of a session regardless of activity.
    pub max_session_secs: u64,
    /// Inactivity after which an active session is reported as idle.
    pub idle_after_secs: u64,
    pub reaper_interval_secs: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 256,
            max_sessions_per_user: 8,
            max_idle_secs: 30 * 60,
            max_session_secs: 24 * 60 * 60,
            idle_after_secs: 5 * 60,
            reaper_interval_secs: 30,
        }
    }
}

impl SessionLimits {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn max_session_time(&self) -> Duration {
        Duration::from_secs(self.max_session_secs)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

/// Defaults applied to a team when its own config leaves a field unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorDefaults {
    pub max_rounds: u32,
    /// Livelock guard: max consecutive turns by one agent.
    pub consecutive_cap: u32,
    /// Number of trailing turns visible to a Brain call.
    pub history_window: usize,
    pub turn_timeout_ms: u64,
    /// Extra attempts after the first failed Brain call.
    pub brain_retries: u32,
    pub retry_backoff_ms: u64,
    pub sentinel: String,
    /// Turns included in an `inspect` snapshot.
    pub snapshot_turns: usize,
    /// Finished tasks kept for inspection before the oldest are evicted.
    pub retained_tasks: usize,
}

impl Default for OrchestratorDefaults {
    fn default() -> Self {
        Self {
            max_rounds: 20,
            consecutive_cap: 3,
            history_window: 20,
            turn_timeout_ms: 120_000,
            brain_retries: 2,
            retry_backoff_ms: 250,
            sentinel: DEFAULT_SENTINEL.to_string(),
            snapshot_turns: 10,
            retained_tasks: 64,
        }
    }
}

impl OrchestratorDefaults {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Checks shared by the manager-wide defaults and per-session overrides.
    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(RoundtableError::config("max_rounds must be > 0"));
        }
        if self.consecutive_cap == 0 {
            return Err(RoundtableError::config("consecutive_cap must be > 0"));
        }
        if self.history_window == 0 {
            return Err(RoundtableError::config("history_window must be > 0"));
        }
        if self.turn_timeout_ms == 0 {
            return Err(RoundtableError::config("turn_timeout_ms must be > 0"));
        }
        if self.sentinel.trim().is_empty() {
            return Err(RoundtableError::config("sentinel must not be empty"));
        }
        Ok(())
    }
}

impl RoundtableConfig {
    /// Parse a TOML document. Missing tables fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| RoundtableError::config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RoundtableError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loaded roundtable config");
        Self::from_toml_str(&raw)
    }

    /// Apply `ROUNDTABLE_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let s = &mut self.sessions;
        override_field(&lookup, "ROUNDTABLE_MAX_SESSIONS", &mut s.max_sessions);
        override_field(
            &lookup,
            "ROUNDTABLE_MAX_SESSIONS_PER_USER",
            &mut s.max_sessions_per_user,
        );
        override_field(&lookup, "ROUNDTABLE_MAX_IDLE_SECS", &mut s.max_idle_secs);
        override_field(
            &lookup,
            "ROUNDTABLE_MAX_SESSION_SECS",
            &mut s.max_session_secs,
        );
        override_field(
            &lookup,
            "ROUNDTABLE_REAPER_INTERVAL_SECS",
            &mut s.reaper_interval_secs,
        );

        let o = &mut self.orchestrator;
        override_field(&lookup, "ROUNDTABLE_MAX_ROUNDS", &mut o.max_rounds);
        override_field(&lookup, "ROUNDTABLE_TURN_TIMEOUT_MS", &mut o.turn_timeout_ms);
        override_field(&lookup, "ROUNDTABLE_BRAIN_RETRIES", &mut o.brain_retries);
        override_field(&lookup, "ROUNDTABLE_RETAINED_TASKS", &mut o.retained_tasks);
        if let Some(sentinel) = lookup("ROUNDTABLE_SENTINEL") {
            o.sentinel = sentinel;
        }

        override_field(
            &lookup,
            "ROUNDTABLE_EVENT_HISTORY",
            &mut self.event_history_capacity,
        );

        self.validate()?;
        Ok(self)
    }

    /// Reject configurations that would make the pool or the loop unusable.
    pub fn validate(&self) -> Result<()> {
        let s = &self.sessions;
        if s.max_sessions == 0 || s.max_sessions_per_user == 0 {
            return Err(RoundtableError::config("session caps must be non-zero"));
        }
        if s.max_sessions_per_user > s.max_sessions {
            return Err(RoundtableError::config(format!(
                "max_sessions_per_user ({}) exceeds max_sessions ({})",
                s.max_sessions_per_user, s.max_sessions
            )));
        }
        if s.reaper_interval_secs == 0 {
            return Err(RoundtableError::config("reaper_interval_secs must be > 0"));
        }
        self.orchestrator.validate()?;
        if self.event_history_capacity == 0 {
            return Err(RoundtableError::config(
                "event_history_capacity must be > 0",
            ));
        }
        Ok(())
    }
}

fn override_field<T, F>(lookup: &F, key: &str, field: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *field = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparsable config override"),
        }
    }
}
