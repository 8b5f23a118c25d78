//! Roundtable Library
//!
//! Turn-taking multi-agent conversations hosted in isolated user sessions.
//!
//! This library provides:
//! - An orchestrator that drives agents through a conversation one turn at a
//!   time, with step-through execution, breakpoints, injection and speaker
//!   overrides for a human operator
//! - Speaker selection policies (round-robin, random, rule-based, delegated)
//!   guarded against one agent holding the floor
//! - Sentinel-based termination with per-role permission
//! - A session manager that isolates each user's context store, event bus and
//!   orchestrator, with capacity caps and a background reaper
//!
//! # Collaborators
//!
//! The language-model call, tools and semantic memory are reached through the
//! [`Brain`], [`SpeakerChooser`], [`ToolRegistry`] and [`Memory`] traits.
//! Register implementations in a [`Collaborators`] value and hand it to the
//! [`SessionManager`].
//!
//! # Usage
//!
//! ```ignore
//! let manager = SessionManager::new(RoundtableConfig::load("roundtable.toml")?
//!     .with_env_overrides()?, collaborators)?
//!     .shared();
//! let reaper = manager.spawn_reaper();
//!
//! let info = manager.create_session("alice", SessionConfig::default()).await?;
//! let session = manager.session_context(&info.id).await?;
//! let task = session.orchestrator().submit(team, "Draft the launch plan")?;
//! let snapshot = session.orchestrator().run(&task).await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod agents;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod session;

// Re-export error types
pub use error::{ErrorCode, Result, RoundtableError, StructuredError};

// Re-export configuration
pub use config::{OrchestratorDefaults, RoundtableConfig, SessionLimits, DEFAULT_SENTINEL};

// Re-export collaborator contracts
pub use agents::{
    Brain, BrainChooser, BrainError, Candidate, Collaborators, InMemoryMemory, Memory,
    MemoryFactory, MemoryItem, MemoryScope, SpeakerChooser, ThinkRequest, ToolRegistry,
};

// Re-export event types
pub use events::{Event, EventBus, EventFilter, ListenerHandle, SharedEventBus};

// Re-export context types
pub use context::{ContextEntry, ContextSnapshot, ContextStore};

// Re-export orchestrator types
pub use orchestrator::{
    AgentSpec, Breakpoint, BreakpointKind, CancelMode, CompletionReason, ExecutionMode,
    FailureReason, InjectOptions, Orchestrator, PauseCause, SelectionPolicy, SelectionRule,
    SharedOrchestrator, SpeakerSelector, TaskSnapshot, TaskStatus, TeamConfig,
    TerminationDetector, ToolCall, ToolResult, Turn,
};

// Re-export session types
pub use session::{
    ReapReport, ReaperHandle, Session, SessionConfig, SessionGuard, SessionInfo, SessionManager,
    SessionStatus, SharedSessionManager,
};
