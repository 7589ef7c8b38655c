//! Supervisor evaluation: does the session leave its current stage?
//!
//! The evaluator assembles the supervisor payload, calls the backend, and
//! parses the free-text reply into a verdict. Parsing is deliberately
//! strict about advancing and lenient about everything else: only an
//! explicit `"decision": "advance"` counts; malformed, empty, ambiguous,
//! or failed responses all resolve to `stay`. Skipping a protocol step is
//! the failure mode to guard against, staying put is always safe.

use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::backend::ModelBackend;
use crate::prompt::PromptAssembler;
use crate::session::{AgentRole, SessionState};
use crate::stage::StageSequence;

static DECISION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""decision"\s*:\s*"(stay|advance)""#).unwrap());

static REASON_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""reason"\s*:\s*"([^"]+)""#).unwrap());

/// The supervisor's gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Advance,
    Stay,
}

/// Outcome of one supervisor evaluation. Transient; not persisted beyond
/// the turn that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorDecision {
    pub verdict: Verdict,
    pub reason: String,
    /// Stage the decision was evaluated against. The state machine rejects
    /// the decision if the session has moved on since.
    pub stage_id: String,
}

impl SupervisorDecision {
    fn stay(stage_id: &str, reason: &str) -> Self {
        Self {
            verdict: Verdict::Stay,
            reason: reason.to_string(),
            stage_id: stage_id.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RawDecision {
    decision: String,
    #[serde(default)]
    reason: String,
}

/// Parse a supervisor reply into a decision. Extracts the outermost JSON
/// object first; falls back to field-level regex extraction; resolves
/// anything unrecognized to `stay`.
pub fn parse_decision(response: &str, stage_id: &str) -> SupervisorDecision {
    let response = response.trim();
    if response.is_empty() {
        return SupervisorDecision::stay(stage_id, "empty supervisor response");
    }

    if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        if start < end {
            if let Ok(raw) = serde_json::from_str::<RawDecision>(&response[start..=end]) {
                let verdict = match raw.decision.as_str() {
                    "advance" => Verdict::Advance,
                    _ => Verdict::Stay,
                };
                return SupervisorDecision {
                    verdict,
                    reason: raw.reason,
                    stage_id: stage_id.to_string(),
                };
            }
        }
    }

    // JSON extraction failed; try field-level recovery before giving up.
    if let Some(cap) = DECISION_REGEX.captures(response) {
        let verdict = match &cap[1] {
            "advance" => Verdict::Advance,
            _ => Verdict::Stay,
        };
        let reason = REASON_REGEX
            .captures(response)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        return SupervisorDecision {
            verdict,
            reason,
            stage_id: stage_id.to_string(),
        };
    }

    SupervisorDecision::stay(stage_id, "unparsable supervisor response")
}

/// Invokes the supervisor agent and turns its reply into a decision.
pub struct SupervisorEvaluator {
    backend: Arc<dyn ModelBackend>,
    assembler: Arc<PromptAssembler>,
}

impl SupervisorEvaluator {
    pub fn new(backend: Arc<dyn ModelBackend>, assembler: Arc<PromptAssembler>) -> Self {
        Self { backend, assembler }
    }

    /// Evaluate whether the session's current stage is complete. Never
    /// fails the turn: backend errors and unparsable replies degrade to
    /// `stay`. The terminal stage short-circuits without a backend call.
    pub async fn evaluate(
        &self,
        session: &mut SessionState,
        stages: &StageSequence,
        user_text: &str,
    ) -> SupervisorDecision {
        let stage_id = session.stage_id.clone();

        if stages.is_terminal(&stage_id) {
            debug!(stage = %stage_id, "terminal stage, supervisor short-circuits to stay");
            return SupervisorDecision::stay(&stage_id, "terminal stage");
        }

        let Some(stage) = stages.get(&stage_id) else {
            warn!(stage = %stage_id, "session references unknown stage, staying");
            return SupervisorDecision::stay(&stage_id, "unknown stage");
        };

        let (payload, marks) =
            self.assembler
                .assemble(AgentRole::Supervisor, session, stage, user_text);

        match self.backend.send(&payload).await {
            Ok(response) => {
                marks.commit(session, AgentRole::Supervisor);
                let decision = parse_decision(&response, &stage_id);
                debug!(stage = %stage_id, verdict = ?decision.verdict, "supervisor decision");
                decision
            }
            Err(err) => {
                // Marks dropped: a failed send must not record the prompts
                // as transmitted.
                warn!(stage = %stage_id, error = %err, "supervisor call failed, staying");
                SupervisorDecision::stay(&stage_id, &format!("supervisor call failed: {err}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FailingBackend, FailureMode, ScriptedBackend};
    use crate::memory::{BackendCapabilities, MemoryStrategy};
    use crate::prompt::StaticPromptSource;

    fn retaining() -> BackendCapabilities {
        BackendCapabilities {
            retains_context: true,
            stage_prompt_reliable: true,
        }
    }

    fn assembler() -> Arc<PromptAssembler> {
        Arc::new(PromptAssembler::new(Arc::new(StaticPromptSource)))
    }

    fn session_at(stage_id: &str) -> SessionState {
        let mut session = SessionState::new("s-test", "opening", MemoryStrategy::FullRetention);
        session.stage_id = stage_id.to_string();
        session
    }

    #[test]
    fn parse_explicit_advance() {
        let decision =
            parse_decision(r#"{"decision": "advance", "reason": "goal named"}"#, "opening");
        assert_eq!(decision.verdict, Verdict::Advance);
        assert_eq!(decision.reason, "goal named");
        assert_eq!(decision.stage_id, "opening");
    }

    #[test]
    fn parse_explicit_stay() {
        let decision = parse_decision(r#"{"decision": "stay", "reason": "not yet"}"#, "opening");
        assert_eq!(decision.verdict, Verdict::Stay);
    }

    #[test]
    fn parse_json_embedded_in_prose() {
        let text = r#"Here is my assessment.
            {"decision": "advance", "reason": "criteria met"}
            Let me know if you need more."#;
        let decision = parse_decision(text, "opening");
        assert_eq!(decision.verdict, Verdict::Advance);
    }

    #[test]
    fn parse_malformed_json_recovers_fields_via_regex() {
        // Trailing comma breaks serde_json, regex fallback still finds the
        // decision field.
        let text = r#"{"decision": "advance", "reason": "done",}"#;
        let decision = parse_decision(text, "opening");
        assert_eq!(decision.verdict, Verdict::Advance);
        assert_eq!(decision.reason, "done");
    }

    #[test]
    fn parse_unrecognized_text_stays() {
        let decision = parse_decision("The client seems ready to move on.", "opening");
        assert_eq!(decision.verdict, Verdict::Stay);
    }

    #[test]
    fn parse_plain_yes_is_not_an_advance_signal() {
        assert_eq!(parse_decision("yes", "opening").verdict, Verdict::Stay);
        assert_eq!(parse_decision("advance", "opening").verdict, Verdict::Stay);
    }

    #[test]
    fn parse_empty_response_stays() {
        let decision = parse_decision("   ", "opening");
        assert_eq!(decision.verdict, Verdict::Stay);
        assert!(decision.reason.contains("empty"));
    }

    #[test]
    fn parse_unknown_decision_value_stays() {
        let decision = parse_decision(r#"{"decision": "maybe", "reason": "?"}"#, "opening");
        assert_eq!(decision.verdict, Verdict::Stay);
    }

    #[tokio::test]
    async fn terminal_stage_short_circuits_without_backend_call() {
        let backend = Arc::new(ScriptedBackend::new(
            retaining(),
            vec![r#"{"decision": "advance"}"#.into()],
        ));
        let evaluator = SupervisorEvaluator::new(backend.clone(), assembler());
        let mut session = session_at("summary");

        let decision = evaluator
            .evaluate(&mut session, &StageSequence::default_protocol(), "hello")
            .await;

        assert_eq!(decision.verdict, Verdict::Stay);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn backend_failure_degrades_to_stay() {
        let backend = Arc::new(FailingBackend::new(retaining(), FailureMode::Timeout));
        let evaluator = SupervisorEvaluator::new(backend, assembler());
        let mut session = session_at("opening");

        let decision = evaluator
            .evaluate(&mut session, &StageSequence::default_protocol(), "hello")
            .await;

        assert_eq!(decision.verdict, Verdict::Stay);
        assert!(decision.reason.contains("supervisor call failed"));
        // Failed send must not mark the ledger.
        assert!(session.ledger(AgentRole::Supervisor).needs_system_prompt());
    }

    #[tokio::test]
    async fn successful_call_commits_ledger_marks() {
        let backend = Arc::new(ScriptedBackend::with_fallback(
            retaining(),
            vec![],
            r#"{"decision": "stay", "reason": "more work"}"#,
        ));
        let evaluator = SupervisorEvaluator::new(backend.clone(), assembler());
        let mut session = session_at("opening");
        let stages = StageSequence::default_protocol();

        evaluator.evaluate(&mut session, &stages, "first").await;
        assert!(!session.ledger(AgentRole::Supervisor).needs_system_prompt());

        // Second turn: system and stage prompts are not re-sent.
        evaluator.evaluate(&mut session, &stages, "second").await;
        let sent = backend.sent();
        assert!(sent[0].contains("## SYSTEM"));
        assert!(!sent[1].contains("## SYSTEM"));
        assert!(!sent[1].contains("## STAGE GUIDANCE"));
    }

    #[tokio::test]
    async fn decision_is_tagged_with_evaluated_stage() {
        let backend = Arc::new(ScriptedBackend::new(
            retaining(),
            vec![r#"{"decision": "advance"}"#.into()],
        ));
        let evaluator = SupervisorEvaluator::new(backend, assembler());
        let mut session = session_at("resources");

        let decision = evaluator
            .evaluate(&mut session, &StageSequence::default_protocol(), "hello")
            .await;

        assert_eq!(decision.stage_id, "resources");
        assert_eq!(decision.verdict, Verdict::Advance);
    }
}
