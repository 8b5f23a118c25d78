//! Multi-user session isolation and lifecycle
//!
//! Each session owns exactly one [`ContextStore`](crate::context::ContextStore),
//! one [`EventBus`](crate::events::EventBus) and one
//! [`Orchestrator`](crate::orchestrator::Orchestrator). Nothing is shared
//! between sessions except the stateless collaborators.

pub mod manager;
pub mod model;
pub mod reaper;

pub use manager::{SessionGuard, SessionManager, SharedSessionManager};
pub use model::{
    ExpiryReason, ReapReport, Session, SessionConfig, SessionCounters, SessionId, SessionInfo,
    SessionStatus,
};
pub use reaper::ReaperHandle;
