//! Task state machine: status, transition table and transition log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::TaskStatus;

/// A status transition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Error for invalid status transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} → {to} (allowed: {allowed:?})")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub allowed: &'static [TaskStatus],
}

/// Current status plus the full transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    status: TaskStatus,
    transitions: Vec<TransitionRecord>,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            transitions: Vec::new(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        self.status.valid_transitions().contains(&to)
    }

    /// Move to `to`, recording why. Rejects anything outside the table.
    pub fn transition(&mut self, to: TaskStatus, reason: &str) -> Result<(), TransitionError> {
        if !self.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
                allowed: self.status.valid_transitions(),
            });
        }

        self.transitions.push(TransitionRecord {
            from: self.status,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.status = to;
        Ok(())
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}
