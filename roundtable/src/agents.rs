//! Collaborator contracts consumed by the orchestrator.
//!
//! The language model call, tool implementations and semantic memory live
//! outside this crate. They are reached through the narrow traits below so
//! the turn loop stays deterministic and fake-able in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::orchestrator::team::AgentSpec;
use crate::orchestrator::types::{TaskId, ToolCall, Turn};

// ── Brain ───────────────────────────────────────────────────────────────────

/// Everything a Brain sees when asked to produce a turn.
#[derive(Debug, Clone)]
pub struct ThinkRequest {
    pub task_id: TaskId,
    pub agent: AgentSpec,
    /// Window-bounded visible history, oldest first.
    pub history: Vec<Turn>,
    /// Memory hits for the latest turn, best first.
    pub recalled: Vec<MemoryItem>,
    /// Extra instruction appended by the caller (used by constrained prompts).
    pub instruction: Option<String>,
}

/// A candidate turn produced by a Brain, before termination checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

impl Candidate {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_call: None,
        }
    }

    pub fn with_tool_call(mut self, name: impl Into<String>, args: Value) -> Self {
        self.tool_call = Some(ToolCall {
            name: name.into(),
            args,
        });
        self
    }
}

/// Failure reported by a Brain call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BrainError {
    pub message: String,
    /// Transient failures are retried within the turn's retry budget.
    pub retryable: bool,
}

impl BrainError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Produces a candidate turn for one agent. Stateless per call.
#[async_trait]
pub trait Brain: Send + Sync {
    async fn think(&self, request: &ThinkRequest) -> std::result::Result<Candidate, BrainError>;
}

// ── Speaker choice (auto policy) ────────────────────────────────────────────

/// Picks the next speaker for the `auto` selection policy.
///
/// `strict` is set on the single retry after an out-of-roster answer.
#[async_trait]
pub trait SpeakerChooser: Send + Sync {
    async fn choose(
        &self,
        history: &[Turn],
        roster: &[AgentSpec],
        strict: bool,
    ) -> std::result::Result<String, BrainError>;
}

/// [`SpeakerChooser`] that asks a Brain with a prompt constrained to a roster
/// identifier.
pub struct BrainChooser {
    brain: Arc<dyn Brain>,
    moderator: AgentSpec,
}

impl BrainChooser {
    pub fn new(brain: Arc<dyn Brain>) -> Self {
        Self {
            brain,
            moderator: AgentSpec::new("moderator", "moderator", "moderator"),
        }
    }

    fn instruction(roster: &[AgentSpec], strict: bool) -> String {
        let ids: Vec<&str> = roster.iter().map(|a| a.id.as_str()).collect();
        let mut prompt = format!(
            "Choose who speaks next. Reply with exactly one of: {}.",
            ids.join(", ")
        );
        if strict {
            prompt.push_str(" Output the identifier only, with no punctuation or explanation.");
        }
        prompt
    }
}

#[async_trait]
impl SpeakerChooser for BrainChooser {
    async fn choose(
        &self,
        history: &[Turn],
        roster: &[AgentSpec],
        strict: bool,
    ) -> std::result::Result<String, BrainError> {
        let request = ThinkRequest {
            task_id: String::new(),
            agent: self.moderator.clone(),
            history: history.to_vec(),
            recalled: Vec::new(),
            instruction: Some(Self::instruction(roster, strict)),
        };
        let candidate = self.brain.think(&request).await?;
        Ok(candidate
            .content
            .trim()
            .trim_matches(|c: char| c == '.' || c == '"' || c == '\'')
            .to_string())
    }
}

// ── Tools ───────────────────────────────────────────────────────────────────

/// Executes tool calls requested by a turn.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Failures should be reported as `RoundtableError::Tool`.
    async fn invoke(&self, tool_name: &str, args: &Value) -> Result<Value>;
}

// ── Memory ──────────────────────────────────────────────────────────────────

/// Scope a memory item belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryScope {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl MemoryScope {
    pub fn task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: None,
        }
    }

    pub fn agent(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: Some(agent_id.into()),
        }
    }

    /// A task-wide query scope covers every agent's items in that task.
    fn covers(&self, item: &MemoryScope) -> bool {
        self.task_id == item.task_id
            && self
                .agent_id
                .as_ref()
                .map_or(true, |agent| item.agent_id.as_ref() == Some(agent))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub scope: MemoryScope,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Relevance assigned by `search`; zero when stored.
    #[serde(default)]
    pub score: f32,
}

impl MemoryItem {
    pub fn new(scope: MemoryScope, content: impl Into<String>) -> Self {
        Self {
            scope,
            content: content.into(),
            created_at: Utc::now(),
            score: 0.0,
        }
    }
}

/// Semantic store used by agents.
#[async_trait]
pub trait Memory: Send + Sync {
    async fn store(&self, item: MemoryItem) -> Result<()>;

    /// Ranked results, best first.
    async fn search(&self, scope: &MemoryScope, query: &str, limit: usize)
        -> Result<Vec<MemoryItem>>;
}

/// Store an item, logging and swallowing failures.
pub async fn remember(memory: &dyn Memory, item: MemoryItem) {
    if let Err(e) = memory.store(item).await {
        warn!(error = %e, "Memory store failed; continuing without it");
    }
}

/// Search memory, degrading any failure to an empty result.
pub async fn recall(
    memory: &dyn Memory,
    scope: &MemoryScope,
    query: &str,
    limit: usize,
) -> Vec<MemoryItem> {
    match memory.search(scope, query, limit).await {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, task_id = %scope.task_id, "Memory search failed; using no recall");
            Vec::new()
        }
    }
}

/// Keyword-ranked in-process memory. One instance per session.
#[derive(Default)]
pub struct InMemoryMemory {
    items: Mutex<Vec<MemoryItem>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn terms(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .map(str::to_lowercase)
            .collect()
    }
}

#[async_trait]
impl Memory for InMemoryMemory {
    async fn store(&self, item: MemoryItem) -> Result<()> {
        self.items.lock().push(item);
        Ok(())
    }

    async fn search(
        &self,
        scope: &MemoryScope,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let terms = Self::terms(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let items = self.items.lock();
        let mut hits: Vec<MemoryItem> = items
            .iter()
            .filter(|item| scope.covers(&item.scope))
            .filter_map(|item| {
                let haystack = item.content.to_lowercase();
                let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (matched > 0).then(|| MemoryItem {
                    score: matched as f32 / terms.len() as f32,
                    ..item.clone()
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Builds the Memory instance owned by a new session.
pub type MemoryFactory = Arc<dyn Fn(&str) -> Arc<dyn Memory> + Send + Sync>;

// ── Registry ────────────────────────────────────────────────────────────────

/// External collaborators shared by every session.
///
/// Brains, the chooser and the tool registry are stateless per call and may
/// be shared. Memory is produced per session by the factory.
#[derive(Clone)]
pub struct Collaborators {
    brains: HashMap<String, Arc<dyn Brain>>,
    chooser: Option<Arc<dyn SpeakerChooser>>,
    tools: Option<Arc<dyn ToolRegistry>>,
    memory_factory: MemoryFactory,
}

impl Collaborators {
    pub fn new() -> Self {
        Self {
            brains: HashMap::new(),
            chooser: None,
            tools: None,
            memory_factory: Arc::new(|_: &str| Arc::new(InMemoryMemory::new()) as Arc<dyn Memory>),
        }
    }

    pub fn with_brain(mut self, name: impl Into<String>, brain: Arc<dyn Brain>) -> Self {
        self.brains.insert(name.into(), brain);
        self
    }

    pub fn with_chooser(mut self, chooser: Arc<dyn SpeakerChooser>) -> Self {
        self.chooser = Some(chooser);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_memory_factory(mut self, factory: MemoryFactory) -> Self {
        self.memory_factory = factory;
        self
    }

    pub fn brain(&self, name: &str) -> Option<Arc<dyn Brain>> {
        self.brains.get(name).cloned()
    }

    pub fn has_brain(&self, name: &str) -> bool {
        self.brains.contains_key(name)
    }

    pub fn chooser(&self) -> Option<Arc<dyn SpeakerChooser>> {
        self.chooser.clone()
    }

    pub fn tools(&self) -> Option<Arc<dyn ToolRegistry>> {
        self.tools.clone()
    }

    pub fn memory_for(&self, session_id: &str) -> Arc<dyn Memory> {
        (self.memory_factory)(session_id)
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoundtableError;

    struct FixedBrain(&'static str);

    #[async_trait]
    impl Brain for FixedBrain {
        async fn think(
            &self,
            request: &ThinkRequest,
        ) -> std::result::Result<Candidate, BrainError> {
            assert!(request.instruction.is_some());
            Ok(Candidate::text(self.0))
        }
    }

    struct BrokenMemory;

    #[async_trait]
    impl Memory for BrokenMemory {
        async fn store(&self, _item: MemoryItem) -> Result<()> {
            Err(RoundtableError::store("disk full"))
        }

        async fn search(
            &self,
            _scope: &MemoryScope,
            _query: &str,
            _limit: usize,
        ) -> Result<Vec<MemoryItem>> {
            Err(RoundtableError::store("index offline"))
        }
    }

    #[tokio::test]
    async fn test_in_memory_search_ranks_and_scopes() {
        let memory = InMemoryMemory::new();
        memory
            .store(MemoryItem::new(
                MemoryScope::agent("t-1", "alice"),
                "pricing model draft",
            ))
            .await
            .unwrap();
        memory
            .store(MemoryItem::new(
                MemoryScope::agent("t-1", "bob"),
                "pricing model and launch plan",
            ))
            .await
            .unwrap();
        memory
            .store(MemoryItem::new(
                MemoryScope::task("t-2"),
                "pricing model elsewhere",
            ))
            .await
            .unwrap();

        let hits = memory
            .search(&MemoryScope::task("t-1"), "launch pricing", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].scope.agent_id.as_deref(), Some("bob"));
        assert!(hits[0].score > hits[1].score);

        let alice_only = memory
            .search(&MemoryScope::agent("t-1", "alice"), "pricing", 10)
            .await
            .unwrap();
        assert_eq!(alice_only.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_failures_degrade_to_empty() {
        let memory = BrokenMemory;
        remember(
            &memory,
            MemoryItem::new(MemoryScope::task("t-1"), "anything"),
        )
        .await;
        let hits = recall(&memory, &MemoryScope::task("t-1"), "anything", 5).await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_brain_chooser_cleans_answer() {
        let chooser = BrainChooser::new(Arc::new(FixedBrain(" \"critic\". ")));
        let roster = vec![
            AgentSpec::new("writer", "writer", "fake"),
            AgentSpec::new("critic", "critic", "fake"),
        ];
        let picked = chooser.choose(&[], &roster, true).await.unwrap();
        assert_eq!(picked, "critic");
    }

    #[test]
    fn test_strict_instruction_is_tighter() {
        let roster = vec![AgentSpec::new("a", "a", "fake")];
        let loose = BrainChooser::instruction(&roster, false);
        let strict = BrainChooser::instruction(&roster, true);
        assert!(strict.starts_with(&loose));
        assert!(strict.len() > loose.len());
    }

    #[test]
    fn test_collaborators_memory_is_per_session() {
        let collaborators = Collaborators::new();
        let a = collaborators.memory_for("s-a");
        let b = collaborators.memory_for("s-b");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
