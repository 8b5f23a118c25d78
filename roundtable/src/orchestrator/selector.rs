//! Speaker selection policies and the livelock guard.
//!
//! Selection is a pure function of (history, roster, last speaker) apart from
//! the seeded RNG used by the random policy. The `auto` policy is not decided
//! here: [`SpeakerSelector::propose`] returns [`Proposal::Delegate`] and the
//! orchestrator consults its `SpeakerChooser`, then runs the result through
//! [`SpeakerSelector::guard`] like any other proposal.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use tracing::debug;

use super::team::{AgentSpec, RuleSource, SelectionPolicy, SelectionRule};
use super::types::{AgentId, Turn};
use crate::error::{Result, RoundtableError};

/// Outcome of running a policy before the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    Speaker(AgentId),
    /// Policy is `auto`; ask the chooser.
    Delegate,
    NoEligible,
}

/// Final choice after the livelock guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub speaker: AgentId,
    /// The guard replaced the proposed speaker.
    pub forced: bool,
}

enum Matcher {
    Substring(String),
    Pattern(Regex),
}

impl Matcher {
    fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Substring(needle) => text.contains(needle.as_str()),
            Self::Pattern(re) => re.is_match(text),
        }
    }
}

struct CompiledRule {
    matcher: Matcher,
    source: RuleSource,
    after: Option<AgentId>,
    target: AgentId,
}

impl CompiledRule {
    fn compile(rule: &SelectionRule) -> Result<Self> {
        let matcher = if rule.regex {
            Matcher::Pattern(Regex::new(&rule.pattern).map_err(|e| {
                RoundtableError::config(format!("rule pattern '{}': {e}", rule.pattern))
            })?)
        } else {
            Matcher::Substring(rule.pattern.clone())
        };
        Ok(Self {
            matcher,
            source: rule.source,
            after: rule.after.clone(),
            target: rule.target.clone(),
        })
    }

    fn applies_to(&self, turn: &Turn) -> bool {
        if let Some(after) = &self.after {
            if &turn.speaker != after {
                return false;
            }
        }
        let on_content = || self.matcher.is_match(&turn.content);
        let on_tool = || {
            turn.tool_text()
                .map_or(false, |text| self.matcher.is_match(&text))
        };
        match self.source {
            RuleSource::Content => on_content(),
            RuleSource::ToolResult => on_tool(),
            RuleSource::Any => on_content() || on_tool(),
        }
    }
}

enum Strategy {
    RoundRobin,
    Random,
    Custom(Vec<CompiledRule>),
    Auto,
}

pub struct SpeakerSelector {
    strategy: Strategy,
    policy_name: &'static str,
    consecutive_cap: u32,
    rng: StdRng,
}

impl SpeakerSelector {
    pub fn new(policy: &SelectionPolicy, consecutive_cap: u32) -> Result<Self> {
        let mut rng = StdRng::from_entropy();
        let strategy = match policy {
            SelectionPolicy::RoundRobin => Strategy::RoundRobin,
            SelectionPolicy::Random { seed } => {
                if let Some(seed) = seed {
                    rng = StdRng::seed_from_u64(*seed);
                }
                Strategy::Random
            }
            SelectionPolicy::Custom { rules } => Strategy::Custom(
                rules
                    .iter()
                    .map(CompiledRule::compile)
                    .collect::<Result<Vec<_>>>()?,
            ),
            SelectionPolicy::Auto => Strategy::Auto,
        };
        Ok(Self {
            strategy,
            policy_name: policy.name(),
            consecutive_cap: consecutive_cap.max(1),
            rng,
        })
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy_name
    }

    pub fn consecutive_cap(&self) -> u32 {
        self.consecutive_cap
    }

    /// Run the configured policy.
    pub fn propose(
        &mut self,
        history: &[Turn],
        roster: &[AgentSpec],
        last_speaker: Option<&str>,
    ) -> Proposal {
        if roster.is_empty() {
            return Proposal::NoEligible;
        }
        let picked = match &self.strategy {
            Strategy::RoundRobin => round_robin(roster, last_speaker),
            Strategy::Random => {
                let candidates: Vec<&AgentSpec> = if roster.len() == 1 {
                    roster.iter().collect()
                } else {
                    roster
                        .iter()
                        .filter(|a| Some(a.id.as_str()) != last_speaker)
                        .collect()
                };
                candidates.choose(&mut self.rng).map(|a| a.id.clone())
            }
            Strategy::Custom(rules) => {
                let matched = history.last().and_then(|turn| {
                    rules
                        .iter()
                        .find(|rule| {
                            rule.applies_to(turn) && roster.iter().any(|a| a.id == rule.target)
                        })
                        .map(|rule| rule.target.clone())
                });
                matched.or_else(|| round_robin(roster, last_speaker))
            }
            Strategy::Auto => return Proposal::Delegate,
        };
        picked.map_or(Proposal::NoEligible, Proposal::Speaker)
    }

    /// Force rotation when `proposed` already holds the floor for the cap.
    pub fn guard(&self, proposed: &str, history: &[Turn], roster: &[AgentSpec]) -> Selection {
        let run = consecutive_run(history, proposed);
        if run < self.consecutive_cap {
            return Selection {
                speaker: proposed.to_string(),
                forced: false,
            };
        }

        match next_distinct(roster, proposed) {
            Some(next) => {
                debug!(proposed, forced = %next, run, "Livelock guard rotated speaker");
                Selection {
                    speaker: next,
                    forced: true,
                }
            }
            None => Selection {
                speaker: proposed.to_string(),
                forced: false,
            },
        }
    }

    /// Propose and guard in one call for policies that decide locally.
    pub fn select(
        &mut self,
        history: &[Turn],
        roster: &[AgentSpec],
        last_speaker: Option<&str>,
    ) -> Result<Selection> {
        match self.propose(history, roster, last_speaker) {
            Proposal::Speaker(id) => Ok(self.guard(&id, history, roster)),
            Proposal::Delegate => Err(RoundtableError::selection(
                "auto policy needs a speaker chooser",
            )),
            Proposal::NoEligible => Err(RoundtableError::selection("no eligible speaker")),
        }
    }
}

fn round_robin(roster: &[AgentSpec], last_speaker: Option<&str>) -> Option<AgentId> {
    let next = last_speaker
        .and_then(|last| roster.iter().position(|a| a.id == last))
        .map_or(0, |i| (i + 1) % roster.len());
    roster.get(next).map(|a| a.id.clone())
}

fn next_distinct(roster: &[AgentSpec], current: &str) -> Option<AgentId> {
    let start = roster.iter().position(|a| a.id == current)?;
    (1..roster.len())
        .map(|offset| &roster[(start + offset) % roster.len()])
        .find(|a| a.id != current)
        .map(|a| a.id.clone())
}

/// Trailing agent turns by `speaker`. Injected turns are skipped.
fn consecutive_run(history: &[Turn], speaker: &str) -> u32 {
    history
        .iter()
        .rev()
        .filter(|t| !t.injected)
        .take_while(|t| t.speaker == speaker)
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::ToolResult;
    use serde_json::json;

    fn roster(ids: &[&str]) -> Vec<AgentSpec> {
        ids.iter().map(|id| AgentSpec::new(*id, *id, "fake")).collect()
    }

    fn turns(speakers: &[&str]) -> Vec<Turn> {
        speakers
            .iter()
            .enumerate()
            .map(|(i, s)| Turn::new(i as u64, *s, format!("turn {i}")))
            .collect()
    }

    #[test]
    fn test_round_robin_visits_everyone_once() {
        let roster = roster(&["a", "b", "c"]);
        let mut selector = SpeakerSelector::new(&SelectionPolicy::RoundRobin, 3).unwrap();
        let mut history = turns(&["user"]);
        let mut last: Option<String> = None;
        let mut spoken = Vec::new();
        for _ in 0..3 {
            let pick = selector
                .select(&history, &roster, last.as_deref())
                .unwrap();
            history.push(Turn::new(history.len() as u64, &pick.speaker, "x"));
            spoken.push(pick.speaker.clone());
            last = Some(pick.speaker);
        }
        assert_eq!(spoken, vec!["a", "b", "c"]);
        assert_eq!(round_robin(&roster, Some("c")).as_deref(), Some("a"));
        assert_eq!(round_robin(&roster, Some("stranger")).as_deref(), Some("a"));
    }

    #[test]
    fn test_random_excludes_previous_speaker() {
        let roster = roster(&["a", "b", "c"]);
        let mut selector =
            SpeakerSelector::new(&SelectionPolicy::Random { seed: Some(7) }, 3).unwrap();
        for _ in 0..50 {
            match selector.propose(&[], &roster, Some("b")) {
                Proposal::Speaker(id) => assert_ne!(id, "b"),
                other => panic!("unexpected {other:?}"),
            }
        }

        let solo = roster_of_one();
        assert_eq!(
            selector.propose(&[], &solo, Some("only")),
            Proposal::Speaker("only".into())
        );
    }

    fn roster_of_one() -> Vec<AgentSpec> {
        roster(&["only"])
    }

    #[test]
    fn test_random_is_reproducible_with_seed() {
        let roster = roster(&["a", "b", "c", "d"]);
        let policy = SelectionPolicy::Random { seed: Some(42) };
        let mut first = SpeakerSelector::new(&policy, 3).unwrap();
        let mut second = SpeakerSelector::new(&policy, 3).unwrap();
        for _ in 0..10 {
            assert_eq!(
                first.propose(&[], &roster, None),
                second.propose(&[], &roster, None)
            );
        }
    }

    #[test]
    fn test_custom_first_match_wins_then_falls_back() {
        let roster = roster(&["coder", "reviewer", "tester"]);
        let policy = SelectionPolicy::Custom {
            rules: vec![
                SelectionRule::contains("FAILED", "coder").on(RuleSource::ToolResult),
                SelectionRule::matches_regex(r"(?i)please test", "tester"),
                SelectionRule::contains("test", "reviewer"),
            ],
        };
        let mut selector = SpeakerSelector::new(&policy, 3).unwrap();

        let mut turn = Turn::new(1, "reviewer", "Please test this");
        assert_eq!(
            selector.propose(&[turn.clone()], &roster, Some("reviewer")),
            Proposal::Speaker("tester".into())
        );

        turn.tool_result = Some(ToolResult::ok(json!("2 FAILED")));
        assert_eq!(
            selector.propose(&[turn], &roster, Some("reviewer")),
            Proposal::Speaker("coder".into())
        );

        let unmatched = Turn::new(2, "coder", "done");
        assert_eq!(
            selector.propose(&[unmatched], &roster, Some("coder")),
            Proposal::Speaker("reviewer".into())
        );
    }

    #[test]
    fn test_custom_rule_after_restricts_speaker() {
        let roster = roster(&["a", "b"]);
        let policy = SelectionPolicy::Custom {
            rules: vec![SelectionRule::contains("ok", "a").after("b")],
        };
        let mut selector = SpeakerSelector::new(&policy, 3).unwrap();
        let from_a = Turn::new(1, "a", "ok");
        // rule skipped, round-robin after a
        assert_eq!(
            selector.propose(&[from_a], &roster, Some("a")),
            Proposal::Speaker("b".into())
        );
    }

    #[test]
    fn test_livelock_guard_forces_rotation_at_cap() {
        let roster = roster(&["writer", "critic", "editor"]);
        let policy = SelectionPolicy::Custom {
            rules: vec![SelectionRule::contains("", "writer")],
        };
        let mut selector = SpeakerSelector::new(&policy, 3).unwrap();

        let history = turns(&["user", "writer", "writer"]);
        let pick = selector.select(&history, &roster, Some("writer")).unwrap();
        assert_eq!(pick.speaker, "writer");
        assert!(!pick.forced);

        let history = turns(&["user", "writer", "writer", "writer"]);
        let pick = selector.select(&history, &roster, Some("writer")).unwrap();
        assert_eq!(pick.speaker, "critic");
        assert!(pick.forced);
    }

    #[test]
    fn test_injected_turns_do_not_reset_run() {
        let roster = roster(&["a", "b"]);
        let selector = SpeakerSelector::new(&SelectionPolicy::RoundRobin, 2).unwrap();
        let mut history = turns(&["a", "a"]);
        history.push(Turn::injected(2, "human", "keep going"));
        assert!(selector.guard("a", &history, &roster).forced);
    }

    #[test]
    fn test_guard_keeps_sole_agent() {
        let roster = roster(&["only"]);
        let selector = SpeakerSelector::new(&SelectionPolicy::RoundRobin, 1).unwrap();
        let pick = selector.guard("only", &turns(&["only", "only"]), &roster);
        assert_eq!(pick.speaker, "only");
        assert!(!pick.forced);
    }

    #[test]
    fn test_auto_delegates_and_empty_roster_has_no_speaker() {
        let mut selector = SpeakerSelector::new(&SelectionPolicy::Auto, 3).unwrap();
        assert_eq!(
            selector.propose(&[], &roster(&["a"]), None),
            Proposal::Delegate
        );
        let err = selector.select(&[], &[], None).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Selection);
    }
}
