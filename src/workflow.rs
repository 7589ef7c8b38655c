//! Top-level turn orchestration.
//!
//! `Orchestrator::process_turn` runs the fixed per-turn sequence:
//! safety screening, supervisor evaluation, stage transition, responder
//! generation, history append, save. Crisis detection is step one by
//! construction — no stage, backend, or cost optimization can run before
//! it — and every failure is converted into a failed `WorkflowResult` at
//! this boundary rather than escaping to the caller.
//!
//! A session's turn processing holds that session's lock for the whole
//! turn; turns on the same session serialize, different sessions run
//! independently.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::ModelBackend;
use crate::errors::WorkflowError;
use crate::memory::select_strategy;
use crate::prompt::{PromptAssembler, PromptSource};
use crate::responder::Responder;
use crate::safety::SafetyInterceptor;
use crate::session::{Role, SessionState, SessionStore};
use crate::stage::StageSequence;
use crate::supervisor::{SupervisorDecision, SupervisorEvaluator, Verdict};

/// Supervisor verdict as carried in the produced result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionSummary {
    pub verdict: String,
    pub reason: String,
}

impl From<&SupervisorDecision> for DecisionSummary {
    fn from(decision: &SupervisorDecision) -> Self {
        Self {
            verdict: match decision.verdict {
                Verdict::Advance => "advance".to_string(),
                Verdict::Stay => "stay".to_string(),
            },
            reason: decision.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&WorkflowError> for ErrorInfo {
    fn from(err: &WorkflowError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// The orchestrator's output for one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub reply: String,
    /// Stage id after any transition applied this turn.
    pub stage: String,
    /// Whether the safety interceptor replaced normal processing.
    pub crisis: bool,
    pub decision: Option<DecisionSummary>,
    pub error: Option<ErrorInfo>,
}

impl WorkflowResult {
    fn reply_ok(reply: String, stage: &str, decision: Option<DecisionSummary>) -> Self {
        Self {
            success: true,
            reply,
            stage: stage.to_string(),
            crisis: false,
            decision,
            error: None,
        }
    }

    fn crisis(reply: &str, stage: &str) -> Self {
        Self {
            success: true,
            reply: reply.to_string(),
            stage: stage.to_string(),
            crisis: true,
            decision: None,
            error: None,
        }
    }

    fn failed(stage: &str, decision: Option<DecisionSummary>, err: WorkflowError) -> Self {
        Self {
            success: false,
            reply: String::new(),
            stage: stage.to_string(),
            crisis: false,
            decision,
            error: Some(ErrorInfo::from(&err)),
        }
    }
}

/// Coordinates one therapeutic conversation workflow per session.
pub struct Orchestrator {
    stages: StageSequence,
    interceptor: Arc<dyn SafetyInterceptor>,
    store: Arc<dyn SessionStore>,
    supervisor_backend: Arc<dyn ModelBackend>,
    responder_backend: Arc<dyn ModelBackend>,
    supervisor: SupervisorEvaluator,
    responder: Responder,
    /// One mutex per session id; held for the duration of a turn.
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        stages: StageSequence,
        interceptor: Arc<dyn SafetyInterceptor>,
        store: Arc<dyn SessionStore>,
        supervisor_backend: Arc<dyn ModelBackend>,
        responder_backend: Arc<dyn ModelBackend>,
        prompt_source: Arc<dyn PromptSource>,
    ) -> Self {
        let assembler = Arc::new(PromptAssembler::new(prompt_source));
        let supervisor = SupervisorEvaluator::new(supervisor_backend.clone(), assembler.clone());
        let responder = Responder::new(responder_backend.clone(), assembler);
        Self {
            stages,
            interceptor,
            store,
            supervisor_backend,
            responder_backend,
            supervisor,
            responder,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn stages(&self) -> &StageSequence {
        &self.stages
    }

    /// Create and persist a fresh session at the first stage. Strategy
    /// tiers are selected here, once, from each backend's declared
    /// capabilities.
    pub async fn start_session(&self) -> Result<SessionState, WorkflowError> {
        self.create_session(&Uuid::new_v4().to_string()).await
    }

    pub async fn create_session(&self, session_id: &str) -> Result<SessionState, WorkflowError> {
        let responder_strategy = select_strategy(self.responder_backend.capabilities());
        let supervisor_strategy = select_strategy(self.supervisor_backend.capabilities());
        let state = SessionState::with_strategies(
            session_id,
            &self.stages.first().id,
            responder_strategy,
            supervisor_strategy,
        );
        self.store.save(&state).await.map_err(WorkflowError::Store)?;
        info!(
            session = session_id,
            responder_strategy = ?responder_strategy,
            supervisor_strategy = ?supervisor_strategy,
            "session started"
        );
        Ok(state)
    }

    /// Process one user turn. Never panics and never returns `Err`-like
    /// surprises: every outcome is a `WorkflowResult`.
    pub async fn process_turn(&self, session_id: &str, user_text: &str) -> WorkflowResult {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = match self.load_session(session_id).await {
            Ok(session) => session,
            Err(err) => return WorkflowResult::failed("", None, err),
        };

        // Step 1: safety screening. Runs before any model call, and an
        // interceptor failure resolves to crisis, never to all-clear.
        let assessment = match self.interceptor.assess(user_text) {
            Ok(assessment) => assessment,
            Err(err) => {
                let err = WorkflowError::SafetyInterceptFailure(err.to_string());
                error!(session = session_id, error = %err, "failing safe to crisis");
                crate::safety::SafetyAssessment {
                    crisis: true,
                    matched_keywords: Vec::new(),
                }
            }
        };

        if assessment.crisis {
            warn!(
                session = session_id,
                matched = ?assessment.matched_keywords,
                "crisis detected, intervention replaces normal processing"
            );
            return self.finish_crisis_turn(&mut session, user_text).await;
        }

        // Step 2: supervisor evaluation against the current stage.
        let decision = self
            .supervisor
            .evaluate(&mut session, &self.stages, user_text)
            .await;
        let decision_summary = DecisionSummary::from(&decision);

        // Step 3: apply the transition. Stale or otherwise rejected
        // decisions are discarded, not applied.
        let mut transition_notice = None;
        if decision.verdict == Verdict::Advance {
            match self.stages.advance(&session.stage_id, &decision.stage_id) {
                Ok(next) => {
                    info!(
                        session = session_id,
                        from = %session.stage_id,
                        to = %next.id,
                        "stage advanced"
                    );
                    session.stage_id = next.id.clone();
                    transition_notice = Some(format!(
                        "Moved to stage {}: {}",
                        next.order, next.label
                    ));
                }
                Err(err) => {
                    warn!(session = session_id, error = %err, "discarding advance decision");
                }
            }
        }

        // Step 4: responder reply for the resolved (post-transition) stage.
        let resolved_stage = match self.stages.get(&session.stage_id) {
            Some(stage) => stage.clone(),
            None => {
                let err = WorkflowError::UnknownStage {
                    stage_id: session.stage_id.clone(),
                };
                return WorkflowResult::failed(&session.stage_id, Some(decision_summary), err);
            }
        };

        let reply = match self
            .responder
            .respond(&mut session, &resolved_stage, user_text)
            .await
        {
            Ok(reply) => reply,
            Err(backend_err) => {
                // The turn fails, but an already-applied stage transition
                // is not rolled back; persist it before reporting.
                let err = WorkflowError::ResponderFailure {
                    source: backend_err,
                };
                error!(session = session_id, error = %err, "turn failed");
                if let Err(save_err) = self.store.save(&session).await {
                    error!(session = session_id, error = %save_err, "save after failure also failed");
                }
                return WorkflowResult::failed(&session.stage_id, Some(decision_summary), err);
            }
        };

        // Step 5: append the exchange and persist.
        session.append_turn(Role::User, user_text);
        session.append_turn(
            Role::SupervisorInternal,
            &format!(
                "[{}] {}",
                decision_summary.verdict,
                if decision.reason.is_empty() {
                    "no rationale given"
                } else {
                    &decision.reason
                }
            ),
        );
        if let Some(notice) = &transition_notice {
            session.append_turn(Role::System, notice);
        }
        session.append_turn(Role::Responder, &reply);

        if let Err(err) = self.store.save(&session).await {
            return WorkflowResult::failed(
                &session.stage_id,
                Some(decision_summary),
                WorkflowError::Store(err),
            );
        }

        WorkflowResult::reply_ok(reply, &session.stage_id, Some(decision_summary))
    }

    async fn finish_crisis_turn(
        &self,
        session: &mut SessionState,
        user_text: &str,
    ) -> WorkflowResult {
        let intervention = self.interceptor.intervention_message().to_string();
        session.append_turn(Role::User, user_text);
        session.append_turn(Role::Responder, &intervention);

        if let Err(err) = self.store.save(session).await {
            return WorkflowResult::failed(&session.stage_id, None, WorkflowError::Store(err));
        }
        WorkflowResult::crisis(&intervention, &session.stage_id)
    }

    async fn load_session(&self, session_id: &str) -> Result<SessionState, WorkflowError> {
        match self.store.load(session_id).await {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(WorkflowError::SessionNotFound {
                session_id: session_id.to_string(),
            }),
            Err(err) => Err(WorkflowError::Store(err)),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.session_locks.lock().expect("session lock map poisoned");
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
