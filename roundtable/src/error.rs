//! Error types
//!
//! Every failure carries a stable [`ErrorCode`] distinct from its message so
//! callers (and transport layers) can branch without string matching.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for roundtable operations
pub type Result<T> = std::result::Result<T, RoundtableError>;

/// Stable, machine-readable reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[serde(rename = "CONFIG_ERROR")]
    Config,
    #[serde(rename = "SELECTION_ERROR")]
    Selection,
    #[serde(rename = "TOOL_ERROR")]
    Tool,
    Timeout,
    #[serde(rename = "CAPACITY_EXCEEDED")]
    Capacity,
    NotFound,
    InvalidState,
    BrainUnavailable,
    #[serde(rename = "LISTENER_ERROR")]
    Listener,
    #[serde(rename = "STORE_ERROR")]
    Store,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "CONFIG_ERROR",
            Self::Selection => "SELECTION_ERROR",
            Self::Tool => "TOOL_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Capacity => "CAPACITY_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::BrainUnavailable => "BRAIN_UNAVAILABLE",
            Self::Listener => "LISTENER_ERROR",
            Self::Store => "STORE_ERROR",
        }
    }

    /// Status code a transport surface should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::InvalidState => 409,
            Self::Capacity => 503,
            Self::Config | Self::Selection => 400,
            Self::Timeout => 504,
            Self::BrainUnavailable => 502,
            Self::Tool | Self::Listener | Self::Store => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur across sessions, tasks and the event plumbing
#[derive(Error, Debug, Clone)]
pub enum RoundtableError {
    /// Bad team/session/runtime configuration. Never retried.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// No valid next speaker could be chosen
    #[error("Speaker selection failed: {message}")]
    Selection { message: String },

    /// A tool invocation failed. Folded into the transcript by the orchestrator.
    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// A single turn exceeded its time budget
    #[error("Turn timed out after {}ms", .elapsed.as_millis())]
    Timeout { elapsed: Duration },

    /// Session creation refused by global or per-user caps
    #[error("Capacity exceeded: {message}")]
    Capacity { message: String },

    /// Unknown or expired session/task
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Operation not permitted in the current state
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState { operation: String, state: String },

    /// The Brain collaborator could not produce a turn after the retry budget
    #[error("Brain unavailable after {attempts} attempt(s): {message}")]
    BrainUnavailable { attempts: u32, message: String },

    /// A listener failed while handling an event
    #[error("Listener error: {message}")]
    Listener { message: String },

    /// Stored payload could not be read or written
    #[error("Store error: {message}")]
    Store { message: String },
}

impl RoundtableError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn selection(message: impl Into<String>) -> Self {
        Self::Selection {
            message: message.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::Capacity {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_state(operation: impl Into<String>, state: impl ToString) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Stable reason code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Config { .. } => ErrorCode::Config,
            Self::Selection { .. } => ErrorCode::Selection,
            Self::Tool { .. } => ErrorCode::Tool,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Capacity { .. } => ErrorCode::Capacity,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::BrainUnavailable { .. } => ErrorCode::BrainUnavailable,
            Self::Listener { .. } => ErrorCode::Listener,
            Self::Store { .. } => ErrorCode::Store,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Selection { .. } | Self::BrainUnavailable { .. } | Self::Capacity { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Agent-friendly form of this error
    pub fn to_structured(&self) -> StructuredError {
        let recovery = match self.code() {
            ErrorCode::Config => "Fix the team or session configuration and resubmit",
            ErrorCode::Selection => "Override the next speaker or adjust the selection policy",
            ErrorCode::Tool => "Inspect the tool result folded into the transcript",
            ErrorCode::Timeout => "Raise the turn timeout or resubmit the task",
            ErrorCode::Capacity => "Delete idle sessions or retry later",
            ErrorCode::NotFound => "Create a new session or submit a new task",
            ErrorCode::InvalidState => "Inspect the task status before retrying",
            ErrorCode::BrainUnavailable => "Check the model backend and resubmit",
            ErrorCode::Listener => "Check the failing listener; delivery continued",
            ErrorCode::Store => "Re-import the context snapshot",
        };
        let mut structured = StructuredError::new(self.code(), self.to_string(), recovery);
        if let Self::NotFound { entity, id } = self {
            structured = structured
                .with_context("entity", *entity)
                .with_context("id", id.clone());
        }
        structured
    }
}

impl From<serde_json::Error> for RoundtableError {
    fn from(err: serde_json::Error) -> Self {
        Self::store(format!("JSON: {err}"))
    }
}

/// Serializable error payload for transport surfaces.
///
/// ```json
/// {
///   "code": "NOT_FOUND",
///   "message": "session not found: 4f1c...",
///   "recovery_action": "Create a new session or submit a new task",
///   "context": { "entity": "session", "id": "4f1c..." }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: ErrorCode,
    pub message: String,
    pub recovery_action: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl StructuredError {
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        recovery_action: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            recovery_action: recovery_action.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            RoundtableError::config("bad").code().as_str(),
            "CONFIG_ERROR"
        );
        assert_eq!(
            RoundtableError::not_found("session", "s-1").code().as_str(),
            "NOT_FOUND"
        );
        assert_eq!(
            RoundtableError::Timeout {
                elapsed: Duration::from_millis(5)
            }
            .code(),
            ErrorCode::Timeout
        );
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::InvalidState.http_status(), 409);
        assert_eq!(ErrorCode::Capacity.http_status(), 503);
        assert_eq!(ErrorCode::Config.http_status(), 400);
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
        assert_eq!(ErrorCode::BrainUnavailable.http_status(), 502);
        assert_eq!(ErrorCode::Store.http_status(), 500);
    }

    #[test]
    fn test_message_distinct_from_code() {
        let err = RoundtableError::invalid_state("step", "completed");
        assert_eq!(err.to_string(), "Invalid state: cannot step while completed");
        assert_eq!(err.code(), ErrorCode::InvalidState);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_structured_error_carries_context() {
        let structured = RoundtableError::not_found("task", "t-9").to_structured();
        assert_eq!(structured.code, ErrorCode::NotFound);
        assert_eq!(structured.http_status(), 404);
        assert_eq!(structured.context["id"], "t-9");

        let json = serde_json::to_value(&structured).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
    }
}
