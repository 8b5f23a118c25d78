//! Concurrency-safe registry of isolated sessions.
//!
//! The registry is the only structure shared between callers. Lookups take
//! the read lock and may run concurrently; create, delete, reap and shutdown
//! take the write lock. Everything a session owns is built before the write
//! lock is taken, so a refused creation leaves nothing behind.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    ReapReport, Session, SessionConfig, SessionId, SessionInfo, SessionStatus, SessionTimeouts,
};
use crate::agents::Collaborators;
use crate::config::RoundtableConfig;
use crate::context::ContextStore;
use crate::error::{Result, RoundtableError};
use crate::events::types::{SESSION_CLOSED, SESSION_CREATED, SESSION_EXPIRED, SESSION_IDLE};
use crate::events::EventBus;
use crate::orchestrator::Orchestrator;

pub type SharedSessionManager = Arc<SessionManager>;

pub struct SessionManager {
    config: RoundtableConfig,
    collaborators: Collaborators,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: RoundtableConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            collaborators,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn shared(self) -> SharedSessionManager {
        Arc::new(self)
    }

    pub fn config(&self) -> &RoundtableConfig {
        &self.config
    }

    /// Allocate a fresh context store, event bus and orchestrator for `user_id`.
    pub async fn create_session(&self, user_id: &str, config: SessionConfig) -> Result<SessionInfo> {
        if user_id.trim().is_empty() {
            return Err(RoundtableError::config("user id must not be empty"));
        }

        config.validate()?;

        let session = self.build_session(user_id, &config);
        let limits = &self.config.sessions;
        {
            let mut sessions = self.sessions.write().await;
            let now = Utc::now();
            let live: Vec<&Arc<Session>> = sessions
                .values()
                .filter(|s| Self::reachable(s, now))
                .collect();
            if live.len() >= limits.max_sessions {
                warn!(user_id, max = limits.max_sessions, "Session capacity reached");
                return Err(RoundtableError::capacity(format!(
                    "global session limit of {} reached",
                    limits.max_sessions
                )));
            }
            let owned = live.iter().filter(|s| s.owner_id() == user_id).count();
            if owned >= limits.max_sessions_per_user {
                warn!(user_id, max = limits.max_sessions_per_user, "Per-user session cap reached");
                return Err(RoundtableError::capacity(format!(
                    "user '{user_id}' already holds {owned} sessions (limit {})",
                    limits.max_sessions_per_user
                )));
            }
            sessions.insert(session.id().to_string(), Arc::clone(&session));
        }

        info!(session_id = %session.id(), user_id, "Session created");
        session
            .bus()
            .emit(session.session_event(SESSION_CREATED, session.describe()));
        Ok(session.info())
    }

    fn build_session(&self, user_id: &str, config: &SessionConfig) -> Arc<Session> {
        let id = format!("sess-{}", Uuid::new_v4());
        let bus = EventBus::with_capacity(self.config.event_history_capacity).shared();

        let events_emitted = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&events_emitted);
        bus.on(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        let context = Arc::new(ContextStore::new(id.clone(), Arc::clone(&bus)));
        let defaults = config
            .orchestrator
            .clone()
            .unwrap_or_else(|| self.config.orchestrator.clone());
        let orchestrator = Orchestrator::new(
            id.clone(),
            defaults,
            self.collaborators.clone(),
            Arc::clone(&bus),
        )
        .shared();

        Arc::new(Session::new(
            id,
            user_id.to_string(),
            config.label.clone(),
            SessionTimeouts::resolve(&self.config.sessions, config),
            context,
            bus,
            orchestrator,
            events_emitted,
        ))
    }

    /// Look up a live session. Expired, closed, or delete-pending sessions are
    /// reported as not found.
    pub async fn get_session(&self, id: &str) -> Result<Arc<Session>> {
        let sessions = self.sessions.read().await;
        Self::live(&sessions, id, Utc::now()).cloned()
    }

    fn live<'a>(
        sessions: &'a HashMap<SessionId, Arc<Session>>,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<&'a Arc<Session>> {
        match sessions.get(id) {
            Some(session) if Self::reachable(session, now) => Ok(session),
            _ => Err(RoundtableError::not_found("session", id)),
        }
    }

    /// Live, not delete-pending, and inside its idle and lifetime limits.
    fn reachable(session: &Session, now: DateTime<Utc>) -> bool {
        session.status().is_live()
            && !session.is_pending_delete()
            && session.expiry_due(now).is_none()
    }

    /// Scoped access: refreshes activity on entry and holds off teardown
    /// until the guard drops.
    pub async fn session_context(&self, id: &str) -> Result<SessionGuard> {
        let sessions = self.sessions.read().await;
        let session = Arc::clone(Self::live(&sessions, id, Utc::now())?);
        session.acquire_lease();
        session.touch();
        debug!(session_id = %id, leases = session.active_leases(), "Session leased");
        Ok(SessionGuard { session })
    }

    pub async fn touch(&self, id: &str) -> Result<()> {
        self.get_session(id).await?.touch();
        Ok(())
    }

    /// Sessions visible to callers, optionally filtered by owner.
    pub async fn list_sessions(&self, owner: Option<&str>) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let now = Utc::now();
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .filter(|s| owner.map_or(true, |o| s.owner_id() == o))
            .filter(|s| Self::reachable(s, now))
            .map(|s| s.info())
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Release a session. Unknown ids succeed; a leased session is torn down
    /// by the first reaper pass after its last lease drops.
    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get(id).cloned() else {
            debug!(session_id = %id, "Delete of unknown session ignored");
            return Ok(false);
        };

        if session.is_leased() {
            session.mark_pending_delete();
            info!(session_id = %id, leases = session.active_leases(), "Session delete deferred");
            return Ok(true);
        }

        sessions.remove(id);
        drop(sessions);
        Self::close(&session, "deleted");
        Ok(true)
    }

    pub async fn reap(&self) -> ReapReport {
        self.reap_at(Utc::now()).await
    }

    /// One reaper pass evaluated at `now`.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();
        let mut sessions = self.sessions.write().await;
        report.scanned = sessions.len();

        let ids: Vec<SessionId> = sessions.keys().cloned().collect();
        for id in ids {
            let Some(session) = sessions.get(&id).cloned() else {
                continue;
            };

            if session.is_pending_delete() {
                if session.is_leased() {
                    report.deferred += 1;
                } else {
                    sessions.remove(&id);
                    Self::close(&session, "deferred_delete");
                    report.deleted += 1;
                }
                continue;
            }

            if let Some(reason) = session.expiry_due(now) {
                if session.is_leased() {
                    report.deferred += 1;
                    continue;
                }
                sessions.remove(&id);
                session.set_status(SessionStatus::Expired);
                session.bus().emit(session.session_event(
                    SESSION_EXPIRED,
                    json!({ "reason": reason.as_str(), "owner_id": session.owner_id() }),
                ));
                let cancelled = session.teardown(SessionStatus::Expired);
                info!(
                    session_id = %id,
                    reason = reason.as_str(),
                    cancelled_tasks = cancelled,
                    "Session expired"
                );
                report.expired += 1;
                continue;
            }

            if session.idle_due(now) {
                session.set_status(SessionStatus::Idle);
                session
                    .bus()
                    .emit(session.session_event(SESSION_IDLE, json!({})));
                debug!(session_id = %id, "Session marked idle");
                report.marked_idle += 1;
            }
        }

        if report.removed() > 0 || report.marked_idle > 0 {
            info!(
                expired = report.expired,
                deleted = report.deleted,
                idle = report.marked_idle,
                deferred = report.deferred,
                "Reaper pass"
            );
        }
        report
    }

    /// Tear down every session. Returns how many were closed.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            Self::close(session, "shutdown");
        }
        info!(closed = drained.len(), "Session manager shut down");
        drained.len()
    }

    fn close(session: &Session, reason: &str) {
        session.bus().emit(
            session.session_event(SESSION_CLOSED, json!({ "reason": reason })),
        );
        let cancelled = session.teardown(SessionStatus::Closed);
        info!(session_id = %session.id(), reason, cancelled_tasks = cancelled, "Session closed");
    }
}

/// Lease on a session; derefs to [`Session`].
pub struct SessionGuard {
    session: Arc<Session>,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.release_lease();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionLimits;
    use crate::error::ErrorCode;
    use serde_json::json;
    use std::time::Duration;

    fn manager_with(limits: SessionLimits) -> SessionManager {
        let config = RoundtableConfig {
            sessions: limits,
            ..RoundtableConfig::default()
        };
        SessionManager::new(config, Collaborators::new()).unwrap()
    }

    fn manager() -> SessionManager {
        manager_with(SessionLimits::default())
    }

    fn later(secs: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(secs)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let mgr = manager();
        let info = mgr
            .create_session("alice", SessionConfig::labeled("demo"))
            .await
            .unwrap();
        assert_eq!(info.status, SessionStatus::Active);
        assert_eq!(info.label.as_deref(), Some("demo"));

        let session = mgr.get_session(&info.id).await.unwrap();
        assert_eq!(session.owner_id(), "alice");
        assert_eq!(session.bus().history(Some(SESSION_CREATED)).len(), 1);

        let err = mgr.get_session("sess-missing").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_capacity_caps_leave_no_partial_state() {
        let mgr = manager_with(SessionLimits {
            max_sessions: 2,
            max_sessions_per_user: 1,
            ..SessionLimits::default()
        });
        mgr.create_session("alice", SessionConfig::default())
            .await
            .unwrap();

        let err = mgr
            .create_session("alice", SessionConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Capacity);
        assert_eq!(err.code().http_status(), 503);
        assert_eq!(mgr.session_count().await, 1);

        mgr.create_session("bob", SessionConfig::default())
            .await
            .unwrap();
        let err = mgr
            .create_session("carol", SessionConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Capacity);
        assert_eq!(mgr.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let mgr = manager();
        let info = mgr
            .create_session("alice", SessionConfig::default())
            .await
            .unwrap();
        let session = mgr.get_session(&info.id).await.unwrap();

        assert!(mgr.delete_session(&info.id).await.unwrap());
        assert!(!mgr.delete_session(&info.id).await.unwrap());
        assert!(mgr.get_session(&info.id).await.is_err());
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_leased_delete_defers_to_reaper() {
        let mgr = manager();
        let info = mgr
            .create_session("alice", SessionConfig::default())
            .await
            .unwrap();

        let guard = mgr.session_context(&info.id).await.unwrap();
        guard.context().set("draft", json!("v1"), None);
        assert!(mgr.delete_session(&info.id).await.unwrap());

        // still usable by the lease holder, invisible to everyone else
        assert_eq!(guard.context().get("draft"), Some(json!("v1")));
        assert!(mgr.get_session(&info.id).await.is_err());

        let report = mgr.reap().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(guard.status(), SessionStatus::Active);

        drop(guard);
        let report = mgr.reap().await;
        assert_eq!(report.deleted, 1);
        assert_eq!(mgr.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_idle_expiry_emits_one_event() {
        let mgr = manager();
        let info = mgr
            .create_session(
                "alice",
                SessionConfig::default().with_max_idle(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        let session = mgr.get_session(&info.id).await.unwrap();
        let bus = Arc::clone(session.bus());

        let report = mgr.reap_at(later(2)).await;
        assert_eq!(report.expired, 1);
        assert_eq!(session.status(), SessionStatus::Expired);
        assert_eq!(bus.history(Some(SESSION_EXPIRED)).len(), 1);

        let report = mgr.reap_at(later(4)).await;
        assert_eq!(report.expired, 0);
        assert_eq!(bus.history(Some(SESSION_EXPIRED)).len(), 1);
        assert!(mgr.get_session(&info.id).await.is_err());
    }

    #[tokio::test]
    async fn test_lifetime_expiry_and_idle_marking() {
        let mgr = manager_with(SessionLimits {
            idle_after_secs: 5,
            ..SessionLimits::default()
        });
        let short = mgr
            .create_session(
                "alice",
                SessionConfig::default().with_max_lifetime(Duration::from_secs(3)),
            )
            .await
            .unwrap();
        let long = mgr
            .create_session("bob", SessionConfig::default())
            .await
            .unwrap();

        let report = mgr.reap_at(later(10)).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.marked_idle, 1);
        assert!(mgr.get_session(&short.id).await.is_err());

        let idle = mgr.get_session(&long.id).await.unwrap();
        assert_eq!(idle.status(), SessionStatus::Idle);
        mgr.touch(&long.id).await.unwrap();
        assert_eq!(idle.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_lease_blocks_expiry() {
        let mgr = manager();
        let info = mgr
            .create_session(
                "alice",
                SessionConfig::default().with_max_idle(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        let guard = mgr.session_context(&info.id).await.unwrap();
        let report = mgr.reap_at(later(5)).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(guard.status(), SessionStatus::Active);
        assert_eq!(guard.active_leases(), 1);
    }

    #[tokio::test]
    async fn test_list_and_shutdown() {
        let mgr = manager();
        mgr.create_session("alice", SessionConfig::default())
            .await
            .unwrap();
        mgr.create_session("alice", SessionConfig::default())
            .await
            .unwrap();
        mgr.create_session("bob", SessionConfig::default())
            .await
            .unwrap();

        assert_eq!(mgr.list_sessions(None).await.len(), 3);
        assert_eq!(mgr.list_sessions(Some("alice")).await.len(), 2);

        assert_eq!(mgr.shutdown().await, 3);
        assert!(mgr.list_sessions(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_counters_track_bus_activity() {
        let mgr = manager();
        let info = mgr
            .create_session("alice", SessionConfig::default())
            .await
            .unwrap();
        let session = mgr.get_session(&info.id).await.unwrap();
        session.context().set("a", json!(1), None);
        session.context().set("b", json!(2), None);

        let counters = session.info().counters;
        assert_eq!(counters.context_keys, 2);
        // session_created + two context_updated
        assert_eq!(counters.events_emitted, 3);
    }
}
