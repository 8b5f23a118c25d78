//! Orchestrator: drives the turn loop for every task of one session.
//!
//! A turn runs in three phases. The first and last run under the task's
//! state lock and never suspend; the middle phase awaits the collaborators
//! (speaker chooser, Brain, tool registry) with the lock released:
//!
//! 1. validate status, apply the loop-head termination check, snapshot history
//! 2. select the speaker, recall memory, call the Brain, fold tool output
//! 3. strip the sentinel, commit the turn, then complete, pause or continue
//!
//! A per-task turn gate admits one in-flight turn at a time. Pause state is
//! only consulted at turn boundaries, so a turn always commits atomically.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::selector::{Proposal, Selection, SpeakerSelector};
use super::state::{TaskState, TransitionRecord};
use super::team::{AgentSpec, TeamConfig, TeamSettings};
use super::termination::TerminationDetector;
use super::types::*;
use crate::agents::{
    recall, remember, Brain, Candidate, Collaborators, Memory, MemoryItem, MemoryScope,
    ThinkRequest,
};
use crate::config::OrchestratorDefaults;
use crate::error::{ErrorCode, Result, RoundtableError};
use crate::events::types::{
    BREAKPOINTS_UPDATED, SPEAKER_FORCED, SPEAKER_OVERRIDDEN, TASK_ARCHIVED, TASK_CANCELLED,
    TASK_COMPLETED,
    TASK_FAILED, TASK_PAUSED, TASK_RESUMED, TASK_SUBMITTED, TOOL_INVOKED, TURN_COMMITTED,
    TURN_INJECTED,
};
use crate::events::{Event, SharedEventBus};

/// Memory hits passed to each Brain call.
const RECALL_LIMIT: usize = 5;

pub type SharedOrchestrator = Arc<Orchestrator>;

/// Monotonic counters reported through session info.
#[derive(Debug, Default)]
pub struct OrchestratorStats {
    tasks_submitted: AtomicU64,
    turns_committed: AtomicU64,
}

impl OrchestratorStats {
    pub fn tasks_submitted(&self) -> u64 {
        self.tasks_submitted.load(Ordering::Relaxed)
    }

    pub fn turns_committed(&self) -> u64 {
        self.turns_committed.load(Ordering::Relaxed)
    }
}

struct Task {
    machine: TaskState,
    turns: Vec<Turn>,
    current_speaker: Option<AgentId>,
    round_count: u32,
    breakpoints: Vec<Breakpoint>,
    execution_mode: ExecutionMode,
    pause_cause: Option<PauseCause>,
    pending_override: Option<AgentId>,
    completion: Option<CompletionReason>,
    failure: Option<TaskFailure>,
    last_error: Option<String>,
    selector: SpeakerSelector,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Task {
    fn status(&self) -> TaskStatus {
        self.machine.status()
    }

    fn next_sequence(&self) -> u64 {
        self.turns.len() as u64
    }

    fn breakpoint_enabled(&self, kind: BreakpointKind) -> bool {
        self.breakpoints.iter().any(|b| b.kind == kind && b.enabled)
    }

    fn move_to(&mut self, to: TaskStatus, reason: &str) -> Result<()> {
        self.machine
            .transition(to, reason)
            .map_err(|e| RoundtableError::invalid_state(format!("move to {to}"), e.from))?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Immutable per-task configuration plus the mutable task behind a lock.
struct TaskEntry {
    id: TaskId,
    team: TeamConfig,
    settings: TeamSettings,
    brains: HashMap<AgentId, Arc<dyn Brain>>,
    detector: TerminationDetector,
    state: Mutex<Task>,
    turn_gate: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

/// Snapshot taken in phase 1.
struct TurnPlan {
    history: Vec<Turn>,
    window: Vec<Turn>,
    last_speaker: Option<AgentId>,
    pending_override: Option<AgentId>,
}

struct Produced {
    agent: AgentSpec,
    forced: bool,
    overridden: bool,
    candidate: Candidate,
    tool_result: Option<ToolResult>,
}

enum TurnOutcome {
    Produced(Produced),
    Failed(RoundtableError),
    TimedOut,
    Abandoned,
}

pub struct Orchestrator {
    session_id: String,
    defaults: OrchestratorDefaults,
    collaborators: Collaborators,
    memory: Arc<dyn Memory>,
    bus: SharedEventBus,
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
    stats: OrchestratorStats,
}

impl Orchestrator {
    pub fn new(
        session_id: impl Into<String>,
        defaults: OrchestratorDefaults,
        collaborators: Collaborators,
        bus: SharedEventBus,
    ) -> Self {
        let session_id = session_id.into();
        let memory = collaborators.memory_for(&session_id);
        Self {
            session_id,
            defaults,
            collaborators,
            memory,
            bus,
            tasks: RwLock::new(HashMap::new()),
            stats: OrchestratorStats::default(),
        }
    }

    pub fn shared(self) -> SharedOrchestrator {
        Arc::new(self)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stats(&self) -> &OrchestratorStats {
        &self.stats
    }

    pub fn memory(&self) -> Arc<dyn Memory> {
        Arc::clone(&self.memory)
    }

    // ── Submission ─────────────────────────────────────────────────────────

    /// Register a task for `team`, opening with `initial_message`.
    pub fn submit(&self, team: TeamConfig, initial_message: impl Into<String>) -> Result<TaskId> {
        team.validate(&self.collaborators)?;
        let settings = team.settings(&self.defaults);
        let selector = SpeakerSelector::new(&team.policy, settings.consecutive_cap)?;

        let mut brains = HashMap::new();
        for agent in &team.agents {
            let brain = self.collaborators.brain(&agent.brain).ok_or_else(|| {
                RoundtableError::config(format!("unknown brain '{}'", agent.brain))
            })?;
            brains.insert(agent.id.clone(), brain);
        }

        let task_id = format!("task-{}", Uuid::new_v4());
        let kinds: BTreeSet<BreakpointKind> = team.breakpoints.iter().copied().collect();
        let now = Utc::now();
        let task = Task {
            machine: TaskState::new(),
            turns: vec![Turn::new(0, USER_SPEAKER, initial_message)],
            current_speaker: None,
            round_count: 0,
            breakpoints: kinds
                .into_iter()
                .map(|kind| Breakpoint {
                    kind,
                    task_id: task_id.clone(),
                    enabled: true,
                })
                .collect(),
            execution_mode: team.execution_mode,
            pause_cause: None,
            pending_override: None,
            completion: None,
            failure: None,
            last_error: None,
            selector,
            created_at: now,
            updated_at: now,
        };

        let payload = json!({
            "team": team.name,
            "policy": team.policy.name(),
            "agents": team.agents.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
            "execution_mode": team.execution_mode,
            "max_rounds": settings.max_rounds,
        });
        let entry = Arc::new(TaskEntry {
            id: task_id.clone(),
            detector: TerminationDetector::new(settings.sentinel.clone()),
            team,
            settings,
            brains,
            state: Mutex::new(task),
            turn_gate: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        });

        self.tasks.write().insert(task_id.clone(), entry);
        self.stats.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %self.session_id, task_id = %task_id, "Task submitted");
        self.bus.emit(self.event(&task_id, TASK_SUBMITTED, payload));
        self.evict_finished();
        Ok(task_id)
    }

    // ── Turn loop ──────────────────────────────────────────────────────────

    /// Advance exactly one turn.
    pub async fn step(&self, task_id: &str) -> Result<Turn> {
        let entry = self.entry(task_id)?;
        let _gate = entry
            .turn_gate
            .try_lock()
            .map_err(|_| RoundtableError::invalid_state("step", "a turn is in flight"))?;

        let mut events = Vec::new();
        let plan = {
            let mut task = entry.state.lock();
            self.begin_turn(&entry, &mut task, &mut events)
        };
        self.publish(events);
        let plan = plan?;

        let outcome = tokio::select! {
            biased;
            _ = entry.cancel.cancelled() => TurnOutcome::Abandoned,
            res = tokio::time::timeout(entry.settings.turn_timeout, self.produce(&entry, &plan)) => {
                match res {
                    Ok(Ok(produced)) => TurnOutcome::Produced(produced),
                    Ok(Err(err)) => TurnOutcome::Failed(err),
                    Err(_) => TurnOutcome::TimedOut,
                }
            }
        };

        let mut events = Vec::new();
        let committed = {
            let mut task = entry.state.lock();
            self.finish_turn(&entry, &mut task, &plan, outcome, &mut events)
        };
        self.publish(events);

        if let Ok(turn) = &committed {
            self.stats.turns_committed.fetch_add(1, Ordering::Relaxed);
            remember(
                self.memory.as_ref(),
                MemoryItem::new(MemoryScope::agent(task_id, &turn.speaker), &turn.content),
            )
            .await;
        }
        committed
    }

    /// Step until the task pauses or reaches a terminal status.
    pub async fn run(&self, task_id: &str) -> Result<TaskSnapshot> {
        loop {
            let status = self.status(task_id)?;
            if !matches!(status, TaskStatus::Pending | TaskStatus::Running) {
                break;
            }
            self.step(task_id).await?;
        }
        self.inspect(task_id)
    }

    fn begin_turn(
        &self,
        entry: &TaskEntry,
        task: &mut Task,
        events: &mut Vec<Event>,
    ) -> Result<TurnPlan> {
        match task.status() {
            TaskStatus::Pending => task.move_to(TaskStatus::Running, "first turn requested")?,
            TaskStatus::Running => {}
            TaskStatus::Paused => match task.pause_cause {
                Some(cause) if cause.allows_step() => self.resume(entry, task, "step", events)?,
                cause => {
                    let state = cause.map_or_else(|| "paused".to_string(), |c| format!("paused ({c})"));
                    return Err(RoundtableError::invalid_state("step", state));
                }
            },
            status => return Err(RoundtableError::invalid_state("step", status)),
        }

        // loop head: a committed terminal turn or an exhausted budget ends the task
        if task.turns.last().map_or(false, |t| t.terminal) {
            self.complete(entry, task, CompletionReason::Sentinel, events);
            return Err(RoundtableError::invalid_state("step", TaskStatus::Completed));
        }
        if task.round_count >= entry.settings.max_rounds {
            self.complete(entry, task, CompletionReason::MaxRounds, events);
            return Err(RoundtableError::invalid_state("step", TaskStatus::Completed));
        }

        let window_start = task.turns.len().saturating_sub(entry.settings.history_window);
        Ok(TurnPlan {
            history: task.turns.clone(),
            window: task.turns[window_start..].to_vec(),
            last_speaker: task.current_speaker.clone(),
            pending_override: task.pending_override.take(),
        })
    }

    async fn produce(&self, entry: &TaskEntry, plan: &TurnPlan) -> Result<Produced> {
        let (selection, overridden) = match &plan.pending_override {
            Some(id) => (
                Selection {
                    speaker: id.clone(),
                    forced: false,
                },
                true,
            ),
            None => (self.select_speaker(entry, plan).await?, false),
        };

        let agent = entry
            .team
            .agent(&selection.speaker)
            .cloned()
            .ok_or_else(|| {
                RoundtableError::selection(format!("'{}' is not on the roster", selection.speaker))
            })?;
        let brain = entry.brains.get(&agent.id).cloned().ok_or_else(|| {
            RoundtableError::selection(format!("no brain bound to '{}'", agent.id))
        })?;

        let query = plan.history.last().map(|t| t.content.as_str()).unwrap_or("");
        let recalled = recall(
            self.memory.as_ref(),
            &MemoryScope::task(entry.id.clone()),
            query,
            RECALL_LIMIT,
        )
        .await;

        let request = ThinkRequest {
            task_id: entry.id.clone(),
            agent: agent.clone(),
            history: plan.window.clone(),
            recalled,
            instruction: None,
        };
        let candidate = self.think(entry, brain.as_ref(), &request).await?;

        let tool_result = match &candidate.tool_call {
            Some(call) => Some(self.invoke_tool(entry, &agent.id, call).await),
            None => None,
        };

        Ok(Produced {
            agent,
            forced: selection.forced,
            overridden,
            candidate,
            tool_result,
        })
    }

    async fn select_speaker(&self, entry: &TaskEntry, plan: &TurnPlan) -> Result<Selection> {
        let roster = &entry.team.agents;
        let propose = || {
            let mut task = entry.state.lock();
            task.selector
                .propose(&plan.history, roster, plan.last_speaker.as_deref())
        };

        let proposed = match propose() {
            Proposal::Speaker(id) => id,
            Proposal::Delegate => self.choose(entry, plan).await?,
            Proposal::NoEligible => match propose() {
                Proposal::Speaker(id) => id,
                _ => {
                    return Err(RoundtableError::selection(format!(
                        "no eligible speaker for task {}",
                        entry.id
                    )))
                }
            },
        };

        let selection = {
            let task = entry.state.lock();
            task.selector.guard(&proposed, &plan.history, roster)
        };
        Ok(selection)
    }

    /// Ask the chooser; one stricter retry after an out-of-roster answer.
    async fn choose(&self, entry: &TaskEntry, plan: &TurnPlan) -> Result<AgentId> {
        let chooser = self
            .collaborators
            .chooser()
            .ok_or_else(|| RoundtableError::selection("no speaker chooser configured"))?;

        let mut last_answer = String::new();
        for strict in [false, true] {
            match chooser.choose(&plan.window, &entry.team.agents, strict).await {
                Ok(answer) if entry.team.agent(&answer).is_some() => return Ok(answer),
                Ok(answer) => {
                    warn!(task_id = %entry.id, answer = %answer, strict, "Chooser answered outside the roster");
                    last_answer = answer;
                }
                Err(e) => {
                    warn!(task_id = %entry.id, error = %e, strict, "Chooser call failed");
                    last_answer = e.to_string();
                }
            }
        }
        Err(RoundtableError::selection(format!(
            "chooser did not name a roster member (last answer: {last_answer})"
        )))
    }

    /// Brain call with the retry budget and linear backoff.
    async fn think(
        &self,
        entry: &TaskEntry,
        brain: &dyn Brain,
        request: &ThinkRequest,
    ) -> Result<Candidate> {
        let attempts = entry.settings.brain_retries + 1;
        let mut message = String::new();
        for attempt in 1..=attempts {
            match brain.think(request).await {
                Ok(candidate) => return Ok(candidate),
                Err(e) => {
                    warn!(
                        task_id = %entry.id,
                        agent = %request.agent.id,
                        attempt,
                        retryable = e.retryable,
                        error = %e,
                        "Brain call failed"
                    );
                    message = e.message;
                    if !e.retryable {
                        return Err(RoundtableError::BrainUnavailable {
                            attempts: attempt,
                            message,
                        });
                    }
                    if attempt < attempts {
                        tokio::time::sleep(entry.settings.retry_backoff * attempt).await;
                    }
                }
            }
        }
        Err(RoundtableError::BrainUnavailable { attempts, message })
    }

    async fn invoke_tool(&self, entry: &TaskEntry, agent_id: &str, call: &ToolCall) -> ToolResult {
        let result = match self.collaborators.tools() {
            Some(tools) => match tools.invoke(&call.name, &call.args).await {
                Ok(output) => ToolResult::ok(output),
                Err(e) => {
                    warn!(task_id = %entry.id, tool = %call.name, error = %e, "Tool call failed");
                    ToolResult::failed(e.to_string())
                }
            },
            None => ToolResult::failed(
                RoundtableError::tool(&call.name, "no tool registry configured").to_string(),
            ),
        };
        self.bus.emit(self.event(
            &entry.id,
            TOOL_INVOKED,
            json!({ "tool": call.name, "agent": agent_id, "success": result.success }),
        ));
        result
    }

    fn finish_turn(
        &self,
        entry: &TaskEntry,
        task: &mut Task,
        plan: &TurnPlan,
        outcome: TurnOutcome,
        events: &mut Vec<Event>,
    ) -> Result<Turn> {
        let running = task.status() == TaskStatus::Running;
        match outcome {
            TurnOutcome::Abandoned => {
                debug!(task_id = %entry.id, "In-flight turn abandoned");
                Err(RoundtableError::invalid_state("step", task.status()))
            }
            TurnOutcome::TimedOut => {
                let err = RoundtableError::Timeout {
                    elapsed: entry.settings.turn_timeout,
                };
                if running {
                    self.fail(entry, task, FailureReason::Timeout, &err, events);
                }
                Err(err)
            }
            TurnOutcome::Failed(err) => {
                if !running {
                    return Err(err);
                }
                task.last_error = Some(err.to_string());
                if task.breakpoint_enabled(BreakpointKind::Error) {
                    warn!(task_id = %entry.id, error = %err, "Turn failed; pausing on error breakpoint");
                    // an override is spent only by a committed turn
                    if task.pending_override.is_none() {
                        task.pending_override = plan.pending_override.clone();
                    }
                    self.pause(entry, task, PauseCause::Error, events);
                } else {
                    let reason = match err.code() {
                        ErrorCode::Selection => FailureReason::Selection,
                        _ => FailureReason::BrainUnavailable,
                    };
                    self.fail(entry, task, reason, &err, events);
                }
                Err(err)
            }
            TurnOutcome::Produced(produced) => {
                let check = entry
                    .detector
                    .evaluate(&produced.candidate.content, &produced.agent);
                let previous = task.current_speaker.clone();

                let mut turn = Turn::new(task.next_sequence(), &produced.agent.id, check.content);
                turn.terminal = check.terminal;
                turn.tool_call = produced.candidate.tool_call;
                turn.tool_result = produced.tool_result;
                if produced.overridden {
                    turn.metadata = json!({ "overridden": true });
                }

                if produced.forced {
                    events.push(self.event(
                        &entry.id,
                        SPEAKER_FORCED,
                        json!({ "speaker": turn.speaker, "cap": entry.settings.consecutive_cap }),
                    ));
                }

                task.turns.push(turn.clone());
                task.round_count += 1;
                task.current_speaker = Some(turn.speaker.clone());
                task.updated_at = Utc::now();
                debug!(
                    task_id = %entry.id,
                    round = task.round_count,
                    speaker = %turn.speaker,
                    terminal = turn.terminal,
                    "Turn committed"
                );
                events.push(self.event(
                    &entry.id,
                    TURN_COMMITTED,
                    json!({
                        "sequence": turn.sequence,
                        "speaker": turn.speaker,
                        "round": task.round_count,
                        "terminal": turn.terminal,
                        "tool": turn.tool_call.as_ref().map(|c| c.name.as_str()),
                    }),
                ));

                if !running {
                    return Ok(turn);
                }

                if turn.terminal {
                    self.complete(entry, task, CompletionReason::Sentinel, events);
                } else if task.round_count >= entry.settings.max_rounds {
                    self.complete(entry, task, CompletionReason::MaxRounds, events);
                } else if let Some(kind) = breakpoint_hit(task, previous.as_deref(), &turn) {
                    self.pause(entry, task, PauseCause::Breakpoint(kind), events);
                } else if task.execution_mode == ExecutionMode::StepThrough {
                    self.pause(entry, task, PauseCause::StepThrough, events);
                }
                Ok(turn)
            }
        }
    }

    // ── Step-through controls ──────────────────────────────────────────────

    /// Append an operator message without invoking an agent. Resumes a
    /// paused task.
    pub fn inject(
        &self,
        task_id: &str,
        message: impl Into<String>,
        options: InjectOptions,
    ) -> Result<Turn> {
        let entry = self.entry(task_id)?;
        let mut events = Vec::new();
        let turn = {
            let mut task = entry.state.lock();
            let status = task.status();
            if !matches!(status, TaskStatus::Running | TaskStatus::Paused) {
                return Err(RoundtableError::invalid_state("inject", status));
            }

            let speaker = options
                .speaker
                .unwrap_or_else(|| HUMAN_SPEAKER.to_string());
            let mut turn = Turn::injected(task.next_sequence(), speaker, message);
            turn.metadata = options.metadata;
            task.turns.push(turn.clone());
            task.updated_at = Utc::now();
            events.push(self.event(
                task_id,
                TURN_INJECTED,
                json!({ "sequence": turn.sequence, "speaker": turn.speaker }),
            ));

            if status == TaskStatus::Paused {
                self.resume(&entry, &mut task, "inject", &mut events)?;
            }
            turn
        };
        info!(task_id = %task_id, sequence = turn.sequence, "Message injected");
        self.publish(events);
        Ok(turn)
    }

    /// Resume a paused task.
    pub fn continue_task(&self, task_id: &str) -> Result<()> {
        let entry = self.entry(task_id)?;
        let mut events = Vec::new();
        {
            let mut task = entry.state.lock();
            let status = task.status();
            if status != TaskStatus::Paused {
                return Err(RoundtableError::invalid_state("continue", status));
            }
            self.resume(&entry, &mut task, "continue", &mut events)?;
        }
        self.publish(events);
        Ok(())
    }

    /// Replace the breakpoint set. Applies from the next evaluated turn.
    pub fn set_breakpoints(&self, task_id: &str, kinds: &[BreakpointKind]) -> Result<Vec<Breakpoint>> {
        let entry = self.entry(task_id)?;
        let wanted: BTreeSet<BreakpointKind> = kinds.iter().copied().collect();
        let next: Vec<Breakpoint> = wanted
            .into_iter()
            .map(|kind| Breakpoint {
                kind,
                task_id: task_id.to_string(),
                enabled: true,
            })
            .collect();

        let changed = {
            let mut task = entry.state.lock();
            if task.status().is_terminal() {
                return Err(RoundtableError::invalid_state("set breakpoints", task.status()));
            }
            let changed = task.breakpoints != next;
            task.breakpoints = next.clone();
            changed
        };
        if changed {
            self.bus.emit(self.event(
                task_id,
                BREAKPOINTS_UPDATED,
                json!({ "kinds": next.iter().map(|b| b.kind).collect::<Vec<_>>() }),
            ));
        }
        Ok(next)
    }

    /// Enable or disable one configured breakpoint. Returns false when the
    /// kind is not in the set.
    pub fn set_breakpoint_enabled(
        &self,
        task_id: &str,
        kind: BreakpointKind,
        enabled: bool,
    ) -> Result<bool> {
        let entry = self.entry(task_id)?;
        let changed = {
            let mut task = entry.state.lock();
            match task.breakpoints.iter_mut().find(|b| b.kind == kind) {
                Some(bp) if bp.enabled != enabled => {
                    bp.enabled = enabled;
                    Some(true)
                }
                Some(_) => Some(false),
                None => None,
            }
        };
        match changed {
            Some(true) => {
                self.bus.emit(self.event(
                    task_id,
                    BREAKPOINTS_UPDATED,
                    json!({ "kind": kind, "enabled": enabled }),
                ));
                Ok(true)
            }
            Some(false) => Ok(true),
            None => Ok(false),
        }
    }

    /// Force the next selection once. Only valid while paused.
    pub fn override_speaker(&self, task_id: &str, agent_id: &str) -> Result<()> {
        let entry = self.entry(task_id)?;
        {
            let mut task = entry.state.lock();
            if task.status() != TaskStatus::Paused {
                return Err(RoundtableError::invalid_state("override speaker", task.status()));
            }
            if entry.team.agent(agent_id).is_none() {
                return Err(RoundtableError::selection(format!(
                    "'{agent_id}' is not on the roster"
                )));
            }
            task.pending_override = Some(agent_id.to_string());
        }
        info!(task_id = %task_id, speaker = %agent_id, "Next speaker overridden");
        self.bus.emit(self.event(
            task_id,
            SPEAKER_OVERRIDDEN,
            json!({ "speaker": agent_id }),
        ));
        Ok(())
    }

    /// Cancel a task. `CancelMode::Abandon` also aborts an in-flight turn.
    /// Cancelling twice is a no-op.
    pub fn cancel(&self, task_id: &str, mode: CancelMode) -> Result<()> {
        let entry = self.entry(task_id)?;
        {
            let mut task = entry.state.lock();
            match task.status() {
                TaskStatus::Cancelled => return Ok(()),
                status if status.is_terminal() => {
                    return Err(RoundtableError::invalid_state("cancel", status))
                }
                _ => {}
            }
            task.move_to(TaskStatus::Cancelled, "cancelled by caller")?;
            task.pause_cause = None;
            task.pending_override = None;
        }
        if mode == CancelMode::Abandon {
            entry.cancel.cancel();
        }
        info!(session_id = %self.session_id, task_id = %task_id, ?mode, "Task cancelled");
        self.bus
            .emit(self.event(task_id, TASK_CANCELLED, json!({ "mode": mode })));
        Ok(())
    }

    /// Abandon every unfinished task. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<TaskId> = self.tasks.read().keys().cloned().collect();
        ids.iter()
            .filter(|id| {
                self.status(id)
                    .map(|status| !status.is_terminal())
                    .unwrap_or(false)
            })
            .filter(|id| self.cancel(id, CancelMode::Abandon).is_ok())
            .count()
    }

    // ── Read side ──────────────────────────────────────────────────────────

    pub fn status(&self, task_id: &str) -> Result<TaskStatus> {
        Ok(self.entry(task_id)?.state.lock().status())
    }

    pub fn inspect(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.inspect_last(task_id, self.defaults.snapshot_turns)
    }

    /// Snapshot including the last `n` turns.
    pub fn inspect_last(&self, task_id: &str, n: usize) -> Result<TaskSnapshot> {
        let entry = self.entry(task_id)?;
        let task = entry.state.lock();
        let start = task.turns.len().saturating_sub(n);
        Ok(TaskSnapshot {
            task_id: entry.id.clone(),
            session_id: self.session_id.clone(),
            team: entry.team.name.clone(),
            status: task.status(),
            execution_mode: task.execution_mode,
            current_speaker: task.current_speaker.clone(),
            round_count: task.round_count,
            max_rounds: entry.settings.max_rounds,
            breakpoints: task.breakpoints.clone(),
            pause_cause: task.pause_cause,
            pending_override: task.pending_override.clone(),
            completion: task.completion,
            failure: task.failure.clone(),
            last_error: task.last_error.clone(),
            total_turns: task.turns.len(),
            last_turns: task.turns[start..].to_vec(),
            transitions: task.machine.transitions().to_vec(),
            created_at: task.created_at,
            updated_at: task.updated_at,
        })
    }

    pub fn transcript(&self, task_id: &str) -> Result<Vec<Turn>> {
        Ok(self.entry(task_id)?.state.lock().turns.clone())
    }

    pub fn transitions(&self, task_id: &str) -> Result<Vec<TransitionRecord>> {
        Ok(self.entry(task_id)?.state.lock().machine.transitions().to_vec())
    }

    /// Summaries of every task, oldest first.
    pub fn tasks(&self) -> Vec<TaskSummary> {
        let entries: Vec<Arc<TaskEntry>> = self.tasks.read().values().cloned().collect();
        let mut summaries: Vec<TaskSummary> = entries
            .iter()
            .map(|entry| {
                let task = entry.state.lock();
                TaskSummary {
                    task_id: entry.id.clone(),
                    team: entry.team.name.clone(),
                    status: task.status(),
                    round_count: task.round_count,
                    current_speaker: task.current_speaker.clone(),
                    created_at: task.created_at,
                }
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    // ── Retention ──────────────────────────────────────────────────────────

    /// Drop a finished task, returning its final snapshot with the full
    /// transcript. Unfinished tasks must be cancelled first.
    pub fn forget(&self, task_id: &str) -> Result<TaskSnapshot> {
        let snapshot = self.inspect_last(task_id, usize::MAX)?;
        if !snapshot.status.is_terminal() {
            return Err(RoundtableError::invalid_state("forget", snapshot.status));
        }
        if self.tasks.write().remove(task_id).is_none() {
            return Err(RoundtableError::not_found("task", task_id));
        }
        info!(session_id = %self.session_id, task_id = %task_id, status = %snapshot.status, "Task archived");
        self.bus.emit(self.event(
            task_id,
            TASK_ARCHIVED,
            json!({ "status": snapshot.status, "reason": "forgotten" }),
        ));
        Ok(snapshot)
    }

    /// Keep at most `retained_tasks` finished tasks, oldest evicted first.
    fn evict_finished(&self) {
        let entries: Vec<Arc<TaskEntry>> = self.tasks.read().values().cloned().collect();
        let mut finished: Vec<(DateTime<Utc>, TaskId, TaskStatus)> = entries
            .iter()
            .filter_map(|entry| {
                let task = entry.state.lock();
                let status = task.status();
                status
                    .is_terminal()
                    .then(|| (task.updated_at, entry.id.clone(), status))
            })
            .collect();
        let excess = finished.len().saturating_sub(self.defaults.retained_tasks);
        if excess == 0 {
            return;
        }
        finished.sort_by_key(|(updated_at, _, _)| *updated_at);

        let mut evicted = Vec::with_capacity(excess);
        {
            let mut tasks = self.tasks.write();
            for (_, id, status) in finished.into_iter().take(excess) {
                if tasks.remove(&id).is_some() {
                    evicted.push((id, status));
                }
            }
        }
        debug!(session_id = %self.session_id, evicted = evicted.len(), "Finished tasks evicted");
        for (id, status) in evicted {
            self.bus.emit(self.event(
                &id,
                TASK_ARCHIVED,
                json!({ "status": status, "reason": "retention" }),
            ));
        }
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn entry(&self, task_id: &str) -> Result<Arc<TaskEntry>> {
        self.tasks
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| RoundtableError::not_found("task", task_id))
    }

    fn event(&self, task_id: &str, event_type: &str, payload: Value) -> Event {
        Event::new(event_type, payload)
            .for_session(self.session_id.clone())
            .for_task(task_id)
    }

    fn publish(&self, events: Vec<Event>) {
        for event in events {
            self.bus.emit(event);
        }
    }

    fn resume(
        &self,
        entry: &TaskEntry,
        task: &mut Task,
        reason: &str,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        task.move_to(TaskStatus::Running, reason)?;
        task.pause_cause = None;
        debug!(task_id = %entry.id, reason, "Task resumed");
        events.push(self.event(&entry.id, TASK_RESUMED, json!({ "reason": reason })));
        Ok(())
    }

    fn pause(&self, entry: &TaskEntry, task: &mut Task, cause: PauseCause, events: &mut Vec<Event>) {
        if let Err(e) = task.move_to(TaskStatus::Paused, &cause.to_string()) {
            warn!(task_id = %entry.id, error = %e, "Pause rejected");
            return;
        }
        task.pause_cause = Some(cause);
        info!(task_id = %entry.id, round = task.round_count, cause = %cause, "Task paused");
        events.push(self.event(
            &entry.id,
            TASK_PAUSED,
            json!({ "cause": cause, "round": task.round_count }),
        ));
    }

    fn complete(
        &self,
        entry: &TaskEntry,
        task: &mut Task,
        reason: CompletionReason,
        events: &mut Vec<Event>,
    ) {
        if let Err(e) = task.move_to(TaskStatus::Completed, reason.as_str()) {
            warn!(task_id = %entry.id, error = %e, "Completion rejected");
            return;
        }
        task.completion = Some(reason);
        info!(
            session_id = %self.session_id,
            task_id = %entry.id,
            rounds = task.round_count,
            reason = reason.as_str(),
            "Task completed"
        );
        events.push(self.event(
            &entry.id,
            TASK_COMPLETED,
            json!({ "reason": reason, "rounds": task.round_count }),
        ));
    }

    fn fail(
        &self,
        entry: &TaskEntry,
        task: &mut Task,
        reason: FailureReason,
        err: &RoundtableError,
        events: &mut Vec<Event>,
    ) {
        if let Err(e) = task.move_to(TaskStatus::Failed, reason.as_str()) {
            warn!(task_id = %entry.id, error = %e, "Failure transition rejected");
            return;
        }
        task.failure = Some(TaskFailure {
            reason,
            message: err.to_string(),
        });
        warn!(
            session_id = %self.session_id,
            task_id = %entry.id,
            reason = reason.as_str(),
            error = %err,
            "Task failed"
        );
        events.push(self.event(
            &entry.id,
            TASK_FAILED,
            json!({ "reason": reason, "code": err.code().as_str(), "message": err.to_string() }),
        ));
    }
}

/// Handoff is measured against the previous agent speaker; the first agent
/// turn of a task is never a handoff.
fn breakpoint_hit(task: &Task, previous: Option<&str>, turn: &Turn) -> Option<BreakpointKind> {
    let handoff = previous.map_or(false, |prev| prev != turn.speaker);
    if handoff && task.breakpoint_enabled(BreakpointKind::Handoff) {
        return Some(BreakpointKind::Handoff);
    }
    if turn.tool_call.is_some() && task.breakpoint_enabled(BreakpointKind::ToolCall) {
        return Some(BreakpointKind::ToolCall);
    }
    None
}
