//! Turn-taking orchestration with step-through debugging
//!
//! ```text
//! PENDING ──step──▶ RUNNING ◀──continue / inject / step*── PAUSED
//!                     │  └──────── step-through / breakpoint ──▶│
//!                     ├──sentinel / max-rounds──▶ COMPLETED
//!                     ├──selection / brain / timeout──▶ FAILED
//!   (any non-terminal)└──cancel──▶ CANCELLED
//!
//! * step resumes only a step-through pause
//! ```

pub mod engine;
pub mod selector;
pub mod state;
pub mod team;
pub mod termination;
pub mod types;

pub use engine::{Orchestrator, OrchestratorStats, SharedOrchestrator};
pub use selector::{Proposal, Selection, SpeakerSelector};
pub use state::{TaskState, TransitionError, TransitionRecord};
pub use team::{AgentSpec, RuleSource, SelectionPolicy, SelectionRule, TeamConfig, TeamSettings};
pub use termination::{TerminationCheck, TerminationDetector};
pub use types::{
    AgentId, Breakpoint, BreakpointKind, CancelMode, CompletionReason, ExecutionMode,
    FailureReason, InjectOptions, PauseCause, TaskFailure, TaskId, TaskSnapshot, TaskStatus,
    TaskSummary, ToolCall, ToolResult, Turn, HUMAN_SPEAKER, USER_SPEAKER,
};
