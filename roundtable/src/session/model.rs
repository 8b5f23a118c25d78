//! Session record and its reported views.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{OrchestratorDefaults, SessionLimits};
use crate::context::ContextStore;
use crate::error::{Result, RoundtableError};
use crate::events::{Event, SharedEventBus};
use crate::orchestrator::SharedOrchestrator;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    /// No activity for `idle_after`; still usable.
    Idle,
    Expired,
    Closed,
}

impl SessionStatus {
    /// Whether callers may still reach the session.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Expired => write!(f, "expired"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Per-session overrides supplied at creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub max_idle_secs: Option<u64>,
    #[serde(default)]
    pub max_session_secs: Option<u64>,
    /// Replaces the manager-wide orchestrator defaults for this session.
    #[serde(default)]
    pub orchestrator: Option<OrchestratorDefaults>,
    #[serde(default)]
    pub metadata: Value,
}

impl SessionConfig {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    /// Sub-second durations round up to whole seconds.
    pub fn with_max_idle(mut self, idle: Duration) -> Self {
        self.max_idle_secs = Some(whole_secs(idle));
        self
    }

    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_session_secs = Some(whole_secs(lifetime));
        self
    }

    /// Reject overrides that would leave the session unusable on arrival.
    pub fn validate(&self) -> Result<()> {
        if self.max_idle_secs == Some(0) {
            return Err(RoundtableError::config("max_idle_secs must be > 0"));
        }
        if self.max_session_secs == Some(0) {
            return Err(RoundtableError::config("max_session_secs must be > 0"));
        }
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.validate()?;
        }
        Ok(())
    }
}

fn whole_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Timeouts resolved for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionTimeouts {
    pub max_idle: Duration,
    pub max_lifetime: Duration,
    pub idle_after: Duration,
}

impl SessionTimeouts {
    pub(crate) fn resolve(limits: &SessionLimits, config: &SessionConfig) -> Self {
        Self {
            max_idle: config
                .max_idle_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| limits.max_idle_time()),
            max_lifetime: config
                .max_session_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| limits.max_session_time()),
            idle_after: limits.idle_after(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub tasks_submitted: u64,
    pub turns_committed: u64,
    pub events_emitted: u64,
    pub context_keys: usize,
}

/// Serializable view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub owner_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub active_leases: usize,
    pub pending_delete: bool,
    pub counters: SessionCounters,
}

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    pub scanned: usize,
    pub marked_idle: usize,
    pub expired: usize,
    /// Deletions deferred by an earlier lease, completed this pass.
    pub deleted: usize,
    /// Due for teardown but held by a lease.
    pub deferred: usize,
}

impl ReapReport {
    pub fn removed(&self) -> usize {
        self.expired + self.deleted
    }
}

/// Why a session is due for expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Idle,
    Lifetime,
}

impl ExpiryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle_timeout",
            Self::Lifetime => "session_timeout",
        }
    }
}

/// One user's isolated context, event bus and orchestrator.
pub struct Session {
    id: SessionId,
    owner_id: String,
    label: Option<String>,
    timeouts: SessionTimeouts,
    created_at: DateTime<Utc>,
    last_active: Mutex<DateTime<Utc>>,
    status: Mutex<SessionStatus>,
    context: Arc<ContextStore>,
    bus: SharedEventBus,
    orchestrator: SharedOrchestrator,
    leases: AtomicUsize,
    pending_delete: AtomicBool,
    events_emitted: Arc<AtomicU64>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        owner_id: String,
        label: Option<String>,
        timeouts: SessionTimeouts,
        context: Arc<ContextStore>,
        bus: SharedEventBus,
        orchestrator: SharedOrchestrator,
        events_emitted: Arc<AtomicU64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            label,
            timeouts,
            created_at: now,
            last_active: Mutex::new(now),
            status: Mutex::new(SessionStatus::Active),
            context,
            bus,
            orchestrator,
            leases: AtomicUsize::new(0),
            pending_delete: AtomicBool::new(false),
            events_emitted,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn orchestrator(&self) -> &SharedOrchestrator {
        &self.orchestrator
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        *self.last_active.lock()
    }

    /// Refresh `last_active_at`; an idle session becomes active again.
    pub fn touch(&self) {
        *self.last_active.lock() = Utc::now();
        let mut status = self.status.lock();
        if *status == SessionStatus::Idle {
            *status = SessionStatus::Active;
        }
    }

    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    pub fn is_leased(&self) -> bool {
        self.active_leases() > 0
    }

    pub fn is_pending_delete(&self) -> bool {
        self.pending_delete.load(Ordering::Acquire)
    }

    pub fn info(&self) -> SessionInfo {
        let stats = self.orchestrator.stats();
        SessionInfo {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            status: self.status(),
            label: self.label.clone(),
            created_at: self.created_at,
            last_active_at: self.last_active(),
            active_leases: self.active_leases(),
            pending_delete: self.is_pending_delete(),
            counters: SessionCounters {
                tasks_submitted: stats.tasks_submitted(),
                turns_committed: stats.turns_committed(),
                events_emitted: self.events_emitted.load(Ordering::Relaxed),
                context_keys: self.context.len(),
            },
        }
    }

    /// Expiry check against a caller-supplied clock.
    pub fn expiry_due(&self, now: DateTime<Utc>) -> Option<ExpiryReason> {
        if elapsed(self.created_at, now) > self.timeouts.max_lifetime {
            return Some(ExpiryReason::Lifetime);
        }
        if elapsed(self.last_active(), now) > self.timeouts.max_idle {
            return Some(ExpiryReason::Idle);
        }
        None
    }

    pub(crate) fn idle_due(&self, now: DateTime<Utc>) -> bool {
        self.status() == SessionStatus::Active
            && elapsed(self.last_active(), now) > self.timeouts.idle_after
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    pub(crate) fn acquire_lease(&self) {
        self.leases.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_lease(&self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_pending_delete(&self) {
        self.pending_delete.store(true, Ordering::Release);
    }

    pub(crate) fn session_event(&self, event_type: &str, payload: Value) -> Event {
        Event::new(event_type, payload).for_session(self.id.clone())
    }

    /// Release everything the session owns. Returns the number of tasks
    /// that were still running.
    pub(crate) fn teardown(&self, status: SessionStatus) -> usize {
        self.set_status(status);
        let cancelled = self.orchestrator.cancel_all();
        self.context.clear();
        self.bus.clear_listeners();
        cancelled
    }

    pub(crate) fn describe(&self) -> Value {
        json!({ "owner_id": self.owner_id, "label": self.label })
    }
}

/// Non-negative elapsed time between two instants.
fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_liveness() {
        assert!(SessionStatus::Active.is_live());
        assert!(SessionStatus::Idle.is_live());
        assert!(!SessionStatus::Expired.is_live());
        assert_eq!(SessionStatus::Closed.to_string(), "closed");
    }

    #[test]
    fn test_timeouts_prefer_session_overrides() {
        let limits = SessionLimits::default();
        let config = SessionConfig::labeled("demo").with_max_idle(Duration::from_secs(1));
        let timeouts = SessionTimeouts::resolve(&limits, &config);
        assert_eq!(timeouts.max_idle, Duration::from_secs(1));
        assert_eq!(timeouts.max_lifetime, limits.max_session_time());
    }

    #[test]
    fn test_sub_second_overrides_round_up() {
        let config = SessionConfig::default()
            .with_max_idle(Duration::from_millis(500))
            .with_max_lifetime(Duration::from_millis(1500));
        assert_eq!(config.max_idle_secs, Some(1));
        assert_eq!(config.max_session_secs, Some(2));
        config.validate().unwrap();

        let zero = SessionConfig::default().with_max_idle(Duration::ZERO);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_validate_checks_orchestrator_override() {
        let config = SessionConfig {
            orchestrator: Some(OrchestratorDefaults {
                history_window: 0,
                ..OrchestratorDefaults::default()
            }),
            ..SessionConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Config);
    }

    #[test]
    fn test_elapsed_never_negative() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(5);
        assert_eq!(elapsed(later, now), Duration::ZERO);
        assert_eq!(elapsed(now, later), Duration::from_secs(5));
    }

    #[test]
    fn test_reap_report_removed() {
        let report = ReapReport {
            expired: 2,
            deleted: 1,
            ..ReapReport::default()
        };
        assert_eq!(report.removed(), 3);
    }
}
