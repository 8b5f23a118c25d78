//! Team declaration: roster, selection policy and per-team limits.
//!
//! Teams are plain serde data so they can be declared in TOML:
//!
//! ```toml
//! name = "review"
//! execution_mode = "step_through"
//! breakpoints = ["handoff"]
//!
//! [[agents]]
//! id = "coder"
//! role = "implementer"
//! brain = "local"
//!
//! [[agents]]
//! id = "reviewer"
//! role = "reviewer"
//! brain = "local"
//!
//! [policy]
//! kind = "custom"
//! [[policy.rules]]
//! pattern = "FAILED"
//! source = "tool_result"
//! target = "coder"
//! ```

use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::{AgentId, BreakpointKind, ExecutionMode, HUMAN_SPEAKER, USER_SPEAKER};
use crate::agents::Collaborators;
use crate::config::OrchestratorDefaults;
use crate::error::{Result, RoundtableError};

fn default_true() -> bool {
    true
}

/// One roster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub role: String,
    /// Name of the Brain implementation in the collaborator registry.
    pub brain: String,
    /// Roles marked non-terminating cannot end the conversation.
    #[serde(default = "default_true")]
    pub can_terminate: bool,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, role: impl Into<String>, brain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            brain: brain.into(),
            can_terminate: true,
        }
    }

    pub fn non_terminating(mut self) -> Self {
        self.can_terminate = false;
        self
    }
}

/// What a custom rule is matched against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    /// Turn content or tool result.
    #[default]
    Any,
    Content,
    ToolResult,
}

/// `pattern` on the last turn selects `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRule {
    pub pattern: String,
    /// Treat `pattern` as a regex instead of a plain substring.
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub source: RuleSource,
    /// Only applies when the last turn was spoken by this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<AgentId>,
    pub target: AgentId,
}

impl SelectionRule {
    pub fn contains(pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            regex: false,
            source: RuleSource::Any,
            after: None,
            target: target.into(),
        }
    }

    pub fn matches_regex(pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            regex: true,
            ..Self::contains(pattern, target)
        }
    }

    pub fn on(mut self, source: RuleSource) -> Self {
        self.source = source;
        self
    }

    pub fn after(mut self, speaker: impl Into<String>) -> Self {
        self.after = Some(speaker.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    Random {
        #[serde(default)]
        seed: Option<u64>,
    },
    Custom {
        rules: Vec<SelectionRule>,
    },
    /// Delegated to the `SpeakerChooser` collaborator.
    Auto,
}

impl SelectionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random { .. } => "random",
            Self::Custom { .. } => "custom",
            Self::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub policy: SelectionPolicy,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub breakpoints: Vec<BreakpointKind>,
    // Unset limits fall back to `OrchestratorDefaults`.
    #[serde(default)]
    pub sentinel: Option<String>,
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub consecutive_cap: Option<u32>,
    #[serde(default)]
    pub history_window: Option<usize>,
    #[serde(default)]
    pub turn_timeout_ms: Option<u64>,
}

/// Limits resolved against the orchestrator defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamSettings {
    pub sentinel: String,
    pub max_rounds: u32,
    pub consecutive_cap: u32,
    pub history_window: usize,
    pub turn_timeout: Duration,
    pub brain_retries: u32,
    pub retry_backoff: Duration,
}

impl TeamConfig {
    pub fn new(name: impl Into<String>, agents: Vec<AgentSpec>) -> Self {
        Self {
            name: name.into(),
            agents,
            policy: SelectionPolicy::default(),
            execution_mode: ExecutionMode::default(),
            breakpoints: Vec::new(),
            sentinel: None,
            max_rounds: None,
            consecutive_cap: None,
            history_window: None,
            turn_timeout_ms: None,
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| RoundtableError::config(format!("team config: {e}")))
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_breakpoints(mut self, kinds: Vec<BreakpointKind>) -> Self {
        self.breakpoints = kinds;
        self
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = Some(sentinel.into());
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    pub fn with_consecutive_cap(mut self, cap: u32) -> Self {
        self.consecutive_cap = Some(cap);
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = Some(window);
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn agent(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn settings(&self, defaults: &OrchestratorDefaults) -> TeamSettings {
        TeamSettings {
            sentinel: self
                .sentinel
                .clone()
                .unwrap_or_else(|| defaults.sentinel.clone()),
            max_rounds: self.max_rounds.unwrap_or(defaults.max_rounds),
            consecutive_cap: self.consecutive_cap.unwrap_or(defaults.consecutive_cap),
            history_window: self.history_window.unwrap_or(defaults.history_window),
            turn_timeout: self
                .turn_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| defaults.turn_timeout()),
            brain_retries: defaults.brain_retries,
            retry_backoff: defaults.retry_backoff(),
        }
    }

    /// Check that the team can be resolved against the collaborators.
    pub fn validate(&self, collaborators: &Collaborators) -> Result<()> {
        if self.agents.is_empty() {
            return Err(RoundtableError::config(format!(
                "team '{}' has no agents",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(RoundtableError::config("agent id must not be empty"));
            }
            if agent.id == USER_SPEAKER || agent.id == HUMAN_SPEAKER {
                return Err(RoundtableError::config(format!(
                    "agent id '{}' is reserved",
                    agent.id
                )));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(RoundtableError::config(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
            if !collaborators.has_brain(&agent.brain) {
                return Err(RoundtableError::config(format!(
                    "agent '{}' references unknown brain '{}'",
                    agent.id, agent.brain
                )));
            }
        }

        match &self.policy {
            SelectionPolicy::Custom { rules } => {
                for rule in rules {
                    if !seen.contains(rule.target.as_str()) {
                        return Err(RoundtableError::config(format!(
                            "rule target '{}' is not on the roster",
                            rule.target
                        )));
                    }
                    if rule.regex {
                        Regex::new(&rule.pattern).map_err(|e| {
                            RoundtableError::config(format!("rule pattern '{}': {e}", rule.pattern))
                        })?;
                    }
                }
            }
            SelectionPolicy::Auto if collaborators.chooser().is_none() => {
                return Err(RoundtableError::config(
                    "auto selection requires a speaker chooser",
                ));
            }
            _ => {}
        }

        if matches!(self.sentinel.as_deref(), Some("")) {
            return Err(RoundtableError::config("sentinel must not be empty"));
        }
        if self.max_rounds == Some(0) {
            return Err(RoundtableError::config("max_rounds must be at least 1"));
        }
        if self.consecutive_cap == Some(0) {
            return Err(RoundtableError::config("consecutive_cap must be at least 1"));
        }
        if self.history_window == Some(0) {
            return Err(RoundtableError::config("history_window must be at least 1"));
        }
        Ok(())
    }
}
