//! Task, turn and breakpoint data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::TransitionRecord;

pub type TaskId = String;
pub type AgentId = String;

/// Speaker id used for the submitter's opening message.
pub const USER_SPEAKER: &str = "user";
/// Default speaker id for operator injections.
pub const HUMAN_SPEAKER: &str = "human";

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, no turn requested yet.
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled],
            Self::Running => &[
                Self::Paused,
                Self::Completed,
                Self::Failed,
                Self::Cancelled,
            ],
            Self::Paused => &[Self::Running, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Autonomous,
    /// Pause after every committed turn.
    StepThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointKind {
    /// Speaker differs from the previous agent speaker.
    Handoff,
    /// Turn requested a tool invocation.
    ToolCall,
    /// Turn production raised.
    Error,
}

impl std::fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handoff => write!(f, "handoff"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub kind: BreakpointKind,
    pub task_id: TaskId,
    pub enabled: bool,
}

/// Tool invocation requested by a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Tool outcome folded into the requesting turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: Value,
}

impl ToolResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::String(message.into()),
        }
    }

    /// Plain text form used for rule matching.
    pub fn as_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// One atomic contribution to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Monotonic per task, starting at 0 for the opening message.
    pub sequence: u64,
    pub speaker: AgentId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub terminal: bool,
    pub injected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl Turn {
    pub fn new(sequence: u64, speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sequence,
            speaker: speaker.into(),
            content: content.into(),
            timestamp: Utc::now(),
            terminal: false,
            injected: false,
            tool_call: None,
            tool_result: None,
            metadata: Value::Null,
        }
    }

    pub fn injected(sequence: u64, speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            injected: true,
            ..Self::new(sequence, speaker, content)
        }
    }

    /// Text custom selection rules match against.
    pub fn tool_text(&self) -> Option<String> {
        self.tool_result.as_ref().map(ToolResult::as_text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", content = "kind", rename_all = "snake_case")]
pub enum PauseCause {
    StepThrough,
    Breakpoint(BreakpointKind),
    Error,
}

impl PauseCause {
    /// Whether `step` may resume from this pause directly.
    pub fn allows_step(self) -> bool {
        matches!(self, Self::StepThrough)
    }
}

impl std::fmt::Display for PauseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepThrough => write!(f, "step_through"),
            Self::Breakpoint(kind) => write!(f, "breakpoint:{kind}"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionReason {
    /// A permitted speaker emitted the sentinel.
    Sentinel,
    MaxRounds,
}

impl CompletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sentinel => "sentinel",
            Self::MaxRounds => "max-rounds",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Selection,
    BrainUnavailable,
    Timeout,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Selection => "selection",
            Self::BrainUnavailable => "brain_unavailable",
            Self::Timeout => "timeout",
        }
    }
}

/// Why a task failed, with the triggering message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub reason: FailureReason,
    pub message: String,
}

/// How `cancel` treats a turn that is already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Let the in-flight turn finish and record it.
    #[default]
    Finish,
    /// Abort the awaited call and discard its result.
    Abandon,
}

/// Options for an operator injection.
#[derive(Debug, Clone, Default)]
pub struct InjectOptions {
    /// Speaker id recorded on the turn. Defaults to `human`.
    pub speaker: Option<String>,
    /// Free-form metadata stored on the turn.
    pub metadata: Value,
}

impl InjectOptions {
    pub fn as_speaker(speaker: impl Into<String>) -> Self {
        Self {
            speaker: Some(speaker.into()),
            metadata: Value::Null,
        }
    }
}

/// Read-only view returned by `inspect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub session_id: String,
    pub team: String,
    pub status: TaskStatus,
    pub execution_mode: ExecutionMode,
    pub current_speaker: Option<AgentId>,
    pub round_count: u32,
    pub max_rounds: u32,
    pub breakpoints: Vec<Breakpoint>,
    pub pause_cause: Option<PauseCause>,
    pub pending_override: Option<AgentId>,
    pub completion: Option<CompletionReason>,
    pub failure: Option<TaskFailure>,
    pub last_error: Option<String>,
    pub total_turns: usize,
    /// Most recent turns, oldest first.
    pub last_turns: Vec<Turn>,
    pub transitions: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row returned by `tasks()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub team: String,
    pub status: TaskStatus,
    pub round_count: u32,
    pub current_speaker: Option<AgentId>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for status in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(status.valid_transitions().is_empty());
        }
        assert!(TaskStatus::Paused
            .valid_transitions()
            .contains(&TaskStatus::Running));
        assert!(!TaskStatus::Pending
            .valid_transitions()
            .contains(&TaskStatus::Paused));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_value(CompletionReason::MaxRounds).unwrap(),
            json!("max-rounds")
        );
        assert_eq!(
            serde_json::to_value(BreakpointKind::ToolCall).unwrap(),
            json!("tool_call")
        );
        assert_eq!(
            serde_json::to_value(PauseCause::Breakpoint(BreakpointKind::Handoff)).unwrap(),
            json!({"cause": "breakpoint", "kind": "handoff"})
        );
        assert_eq!(TaskStatus::Paused.to_string(), "paused");
    }

    #[test]
    fn test_tool_result_text() {
        assert_eq!(ToolResult::failed("boom").as_text(), "boom");
        assert_eq!(ToolResult::ok(json!({"n": 1})).as_text(), r#"{"n":1}"#);

        let mut turn = Turn::new(3, "coder", "running tests");
        assert!(turn.tool_text().is_none());
        turn.tool_result = Some(ToolResult::ok(json!("all green")));
        assert_eq!(turn.tool_text().as_deref(), Some("all green"));
    }

    #[test]
    fn test_only_step_through_pause_allows_step() {
        assert!(PauseCause::StepThrough.allows_step());
        assert!(!PauseCause::Error.allows_step());
        assert!(!PauseCause::Breakpoint(BreakpointKind::Handoff).allows_step());
    }
}
