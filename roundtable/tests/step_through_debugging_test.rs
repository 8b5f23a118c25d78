//! Step-through debugging end to end: a human operator pausing, steering and
//! resuming a conversation through the public orchestrator API.
//!
//! Tests verify:
//! - A TOML-declared team pauses after every turn and on handoff
//! - Rule-based selection routes a failing tool result back to its author
//! - Injection and speaker override steer a paused task
//! - The error breakpoint pauses instead of failing
//! - Timeouts and abandonment end the task in the right status

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use roundtable::events::types::{
    SPEAKER_OVERRIDDEN, TASK_CANCELLED, TASK_FAILED, TASK_PAUSED, TOOL_INVOKED,
};
use roundtable::{
    AgentSpec, Brain, BrainError, BreakpointKind, CancelMode, Candidate, Collaborators,
    CompletionReason, ErrorCode, EventBus, FailureReason, InjectOptions, Orchestrator,
    OrchestratorDefaults, PauseCause, RoundtableError, SharedEventBus, TaskStatus, TeamConfig,
    ThinkRequest, ToolRegistry,
};
use serde_json::{json, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("roundtable=debug")
        .with_test_writer()
        .try_init();
}

/// Per-agent reply queues.
#[derive(Default)]
struct ScriptedBrain {
    replies: Mutex<HashMap<String, VecDeque<Candidate>>>,
}

impl ScriptedBrain {
    fn reply(self, agent: &str, candidate: Candidate) -> Self {
        self.replies
            .lock()
            .entry(agent.to_string())
            .or_default()
            .push_back(candidate);
        self
    }
}

#[async_trait]
impl Brain for ScriptedBrain {
    async fn think(&self, request: &ThinkRequest) -> Result<Candidate, BrainError> {
        self.replies
            .lock()
            .get_mut(&request.agent.id)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| BrainError::fatal(format!("no reply left for {}", request.agent.id)))
    }
}

/// Fails its first call, then answers normally.
#[derive(Default)]
struct FlakyBrain {
    tripped: AtomicBool,
}

#[async_trait]
impl Brain for FlakyBrain {
    async fn think(&self, request: &ThinkRequest) -> Result<Candidate, BrainError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(BrainError::fatal("model endpoint refused the request"));
        }
        Ok(Candidate::text(format!("{} reporting", request.agent.id)))
    }
}

struct HangingBrain;

#[async_trait]
impl Brain for HangingBrain {
    async fn think(&self, _request: &ThinkRequest) -> Result<Candidate, BrainError> {
        std::future::pending().await
    }
}

/// Canned test runner output keyed by tool name.
struct FakeTools;

#[async_trait]
impl ToolRegistry for FakeTools {
    async fn invoke(&self, tool_name: &str, args: &Value) -> roundtable::Result<Value> {
        match tool_name {
            "cargo_test" => Ok(json!(format!(
                "FAILED: 2 tests in {}",
                args["pkg"].as_str().unwrap_or("?")
            ))),
            other => Err(RoundtableError::tool(other, "unknown tool")),
        }
    }
}

fn orchestrator(collaborators: Collaborators) -> (Orchestrator, SharedEventBus) {
    let bus = EventBus::new().shared();
    let orch = Orchestrator::new(
        "s-debug",
        OrchestratorDefaults {
            retry_backoff_ms: 1,
            ..OrchestratorDefaults::default()
        },
        collaborators,
        bus.clone(),
    );
    (orch, bus)
}

const REVIEW_TEAM: &str = r#"
name = "review"
execution_mode = "step_through"
breakpoints = ["handoff"]

[[agents]]
id = "coder"
role = "implementer"
brain = "scripted"

[[agents]]
id = "reviewer"
role = "reviewer"
brain = "scripted"

[policy]
kind = "custom"
[[policy.rules]]
pattern = "FAILED"
source = "tool_result"
target = "coder"
"#;

// ── Step-through session ───────────────────────────────────────────

#[tokio::test]
async fn test_operator_steers_review_to_completion() -> anyhow::Result<()> {
    init_tracing();
    let brain = ScriptedBrain::default()
        .reply(
            "coder",
            Candidate::text("running the suite").with_tool_call("cargo_test", json!({"pkg": "core"})),
        )
        .reply("coder", Candidate::text("patched the off-by-one"))
        .reply("coder", Candidate::text("anything else?"))
        .reply("reviewer", Candidate::text("looking at the diff"))
        .reply("reviewer", Candidate::text("LGTM. TERMINATE"));
    let (orch, bus) = orchestrator(
        Collaborators::new()
            .with_brain("scripted", Arc::new(brain))
            .with_tools(Arc::new(FakeTools)),
    );
    let team = TeamConfig::from_toml_str(REVIEW_TEAM)?;
    let task = orch.submit(team, "fix the failing parser test")?;

    // first turn: coder runs the tests, step-through pauses
    let turn = orch.step(&task).await?;
    assert_eq!(turn.speaker, "coder");
    assert!(turn.tool_text().unwrap_or_default().contains("FAILED"));
    let snap = orch.inspect(&task)?;
    assert_eq!(snap.status, TaskStatus::Paused);
    assert_eq!(snap.pause_cause, Some(PauseCause::StepThrough));

    // the failing tool result routes the floor back to the coder
    let turn = orch.step(&task).await?;
    assert_eq!(turn.speaker, "coder");
    assert_eq!(turn.content, "patched the off-by-one");

    // round-robin hands over to the reviewer, which trips the handoff breakpoint
    let turn = orch.step(&task).await?;
    assert_eq!(turn.speaker, "reviewer");
    let snap = orch.inspect(&task)?;
    assert_eq!(
        snap.pause_cause,
        Some(PauseCause::Breakpoint(BreakpointKind::Handoff))
    );

    // a breakpoint pause must be released explicitly
    let err = orch.step(&task).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    let note = orch.inject(&task, "looks fine so far", InjectOptions::default())?;
    assert!(note.injected);
    assert_eq!(orch.status(&task)?, TaskStatus::Running);

    let turn = orch.step(&task).await?;
    assert_eq!(turn.speaker, "coder");
    assert_eq!(orch.status(&task)?, TaskStatus::Paused);

    // hand the floor straight back to the reviewer
    orch.override_speaker(&task, "reviewer")?;
    orch.continue_task(&task)?;
    let turn = orch.step(&task).await?;
    assert_eq!(turn.speaker, "reviewer");
    assert!(turn.terminal);
    assert_eq!(turn.content, "LGTM.");
    assert_eq!(turn.metadata["overridden"], true);

    let snap = orch.inspect(&task)?;
    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(snap.completion, Some(CompletionReason::Sentinel));
    assert_eq!(snap.round_count, 5);
    assert_eq!(bus.history(Some(TOOL_INVOKED)).len(), 1);
    assert_eq!(bus.history(Some(SPEAKER_OVERRIDDEN)).len(), 1);
    assert_eq!(bus.history(Some(TASK_PAUSED)).len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_override_requires_pause_and_roster_member() -> anyhow::Result<()> {
    let (orch, _) = orchestrator(
        Collaborators::new().with_brain("flaky", Arc::new(FlakyBrain::default())),
    );
    let team = TeamConfig::new(
        "pair",
        vec![
            AgentSpec::new("a", "member", "flaky"),
            AgentSpec::new("b", "member", "flaky"),
        ],
    );
    let task = orch.submit(team, "start")?;

    let err = orch.override_speaker(&task, "a").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    let err = orch.continue_task(&task).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    let err = orch.override_speaker("task-missing", "a").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    Ok(())
}

// ── Error handling ─────────────────────────────────────────────────

#[tokio::test]
async fn test_error_breakpoint_pauses_then_recovers() -> anyhow::Result<()> {
    init_tracing();
    let (orch, bus) = orchestrator(
        Collaborators::new().with_brain("flaky", Arc::new(FlakyBrain::default())),
    );
    let team = TeamConfig::new(
        "pair",
        vec![
            AgentSpec::new("flaky", "member", "flaky"),
            AgentSpec::new("steady", "member", "flaky"),
        ],
    )
    .with_breakpoints(vec![BreakpointKind::Error])
    .with_max_rounds(3);
    let task = orch.submit(team, "start")?;

    let err = orch.step(&task).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BrainUnavailable);
    let snap = orch.inspect(&task)?;
    assert_eq!(snap.status, TaskStatus::Paused);
    assert_eq!(snap.pause_cause, Some(PauseCause::Error));
    assert_eq!(snap.round_count, 0);
    assert!(snap.last_error.is_some());
    assert!(bus.history(Some(TASK_FAILED)).is_empty());

    orch.override_speaker(&task, "steady")?;
    orch.continue_task(&task)?;
    let snap = orch.run(&task).await?;
    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(snap.completion, Some(CompletionReason::MaxRounds));
    let speakers: Vec<_> = orch
        .transcript(&task)?
        .into_iter()
        .skip(1)
        .map(|t| t.speaker)
        .collect();
    assert_eq!(speakers, ["steady", "flaky", "steady"]);
    Ok(())
}

#[tokio::test]
async fn test_brain_failure_without_breakpoint_fails_task() {
    let (orch, bus) = orchestrator(
        Collaborators::new().with_brain("flaky", Arc::new(FlakyBrain::default())),
    );
    let team = TeamConfig::new("solo", vec![AgentSpec::new("flaky", "member", "flaky")]);
    let task = orch.submit(team, "start").unwrap();

    let err = orch.run(&task).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BrainUnavailable);

    let snap = orch.inspect(&task).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert_eq!(
        snap.failure.map(|f| f.reason),
        Some(FailureReason::BrainUnavailable)
    );
    assert_eq!(bus.history(Some(TASK_FAILED)).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_turn_timeout_fails_task() {
    let (orch, bus) =
        orchestrator(Collaborators::new().with_brain("hang", Arc::new(HangingBrain)));
    let team = TeamConfig::new("stuck", vec![AgentSpec::new("sleeper", "member", "hang")])
        .with_turn_timeout(Duration::from_secs(5));
    let task = orch.submit(team, "wake up").unwrap();

    let err = orch.step(&task).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    let snap = orch.inspect(&task).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert_eq!(snap.failure.map(|f| f.reason), Some(FailureReason::Timeout));
    assert_eq!(snap.total_turns, 1);
    assert_eq!(bus.history(Some(TASK_FAILED)).len(), 1);
}

// ── Cancellation ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_abandon_interrupts_in_flight_turn() {
    let (orch, bus) =
        orchestrator(Collaborators::new().with_brain("hang", Arc::new(HangingBrain)));
    let orch = orch.shared();
    let team = TeamConfig::new("stuck", vec![AgentSpec::new("sleeper", "member", "hang")])
        .with_turn_timeout(Duration::from_secs(600));
    let task = orch.submit(team, "wake up").unwrap();

    let in_flight = {
        let orch = Arc::clone(&orch);
        let task = task.clone();
        tokio::spawn(async move { orch.step(&task).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = orch.step(&task).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    orch.cancel(&task, CancelMode::Abandon).unwrap();
    let err = in_flight.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    assert_eq!(orch.status(&task).unwrap(), TaskStatus::Cancelled);
    assert_eq!(orch.inspect(&task).unwrap().total_turns, 1);
    orch.cancel(&task, CancelMode::Abandon).unwrap();
    assert_eq!(bus.history(Some(TASK_CANCELLED)).len(), 1);
}
