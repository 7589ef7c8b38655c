//! Prompt assembly for agent calls.
//!
//! The assembler composes the literal payload for one backend call, asking
//! the role's memory ledger which context sections (system prompt, stage
//! prompt, transcript) must go out under the active strategy tier. It never
//! touches the ledger itself: it returns a `PendingMarks` receipt that the
//! caller commits only after the send succeeded. A failed send therefore
//! never leaves the ledger believing context was transmitted — that would
//! under-context the backend for the rest of the session.

use std::sync::Arc;

use crate::memory::MemoryStrategy;
use crate::session::{AgentRole, SessionState};
use crate::stage::Stage;

/// Supplier of prompt text. Implemented by the external prompt-authoring
/// subsystem; `StaticPromptSource` below is the built-in default.
pub trait PromptSource: Send + Sync {
    fn system_prompt(&self, role: AgentRole) -> String;
    fn stage_prompt(&self, stage_id: &str, role: AgentRole) -> String;
}

/// Compiled-in prompts for the default protocol. Enough to drive the CLI
/// and tests without an authoring subsystem.
pub struct StaticPromptSource;

impl PromptSource for StaticPromptSource {
    fn system_prompt(&self, role: AgentRole) -> String {
        match role {
            AgentRole::Supervisor => "You are the supervising agent of a solution-focused \
                therapy session. Judge whether the current stage's completion criteria are \
                satisfied. Reply with a JSON object: {\"decision\": \"stay\" or \"advance\", \
                \"reason\": \"...\"}. When uncertain, choose \"stay\"."
                .to_string(),
            AgentRole::Responder => "You are a solution-focused therapist. Respond warmly and \
                briefly (1-3 sentences), end with a question, and never give medical advice."
                .to_string(),
        }
    }

    fn stage_prompt(&self, stage_id: &str, role: AgentRole) -> String {
        format!(
            "Current stage: {stage_id}. Work according to the guidance for this stage of the \
             protocol (role: {}).",
            role.as_str()
        )
    }
}

/// The literal content for one agent call. Sections are optional because
/// the ledger may have already delivered them.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub system_prompt: Option<String>,
    pub stage_prompt: Option<String>,
    /// Formatted transcript, present only under `NoRetention`.
    pub history: Option<String>,
    pub user_text: String,
}

impl Payload {
    /// Render the payload as the single text blob handed to the backend.
    pub fn render(&self) -> String {
        let mut sections = Vec::new();
        if let Some(system) = &self.system_prompt {
            sections.push(format!("## SYSTEM\n{system}"));
        }
        if let Some(stage) = &self.stage_prompt {
            sections.push(format!("## STAGE GUIDANCE\n{stage}"));
        }
        if let Some(history) = &self.history {
            sections.push(format!("## CONVERSATION SO FAR\n{history}"));
        }
        sections.push(format!("## USER MESSAGE\n{}", self.user_text));
        sections.join("\n\n")
    }
}

/// Ledger updates deferred until the caller confirms a successful send.
/// Dropping it without committing is the rollback path.
#[derive(Debug, Default)]
#[must_use = "commit after a confirmed send, or drop to roll back"]
pub struct PendingMarks {
    system_prompt: bool,
    stage_prompt: Option<String>,
}

impl PendingMarks {
    pub fn commit(self, session: &mut SessionState, role: AgentRole) {
        let ledger = session.ledger_mut(role);
        if self.system_prompt {
            ledger.mark_system_prompt_sent();
        }
        if let Some(stage_id) = self.stage_prompt {
            ledger.mark_stage_prompt_sent(&stage_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.system_prompt && self.stage_prompt.is_none()
    }
}

/// Composes payloads from the prompt source, the session's ledger state,
/// and the active stage.
pub struct PromptAssembler {
    source: Arc<dyn PromptSource>,
    /// Most recent turns included under `NoRetention`.
    max_history_turns: usize,
}

impl PromptAssembler {
    pub fn new(source: Arc<dyn PromptSource>) -> Self {
        Self {
            source,
            max_history_turns: 20,
        }
    }

    pub fn with_history_limit(source: Arc<dyn PromptSource>, max_history_turns: usize) -> Self {
        Self {
            source,
            max_history_turns,
        }
    }

    /// Assemble the payload for one agent call. Pure with respect to the
    /// session: ledger changes come back as `PendingMarks`.
    pub fn assemble(
        &self,
        role: AgentRole,
        session: &SessionState,
        stage: &Stage,
        user_text: &str,
    ) -> (Payload, PendingMarks) {
        let ledger = session.ledger(role);
        let mut marks = PendingMarks::default();

        let system_prompt = if ledger.needs_system_prompt() {
            marks.system_prompt = true;
            Some(self.source.system_prompt(role))
        } else {
            None
        };

        let stage_prompt = if ledger.needs_stage_prompt(&stage.id) {
            marks.stage_prompt = Some(stage.id.clone());
            Some(self.source.stage_prompt(&stage.id, role))
        } else {
            None
        };

        let history = match ledger.strategy {
            MemoryStrategy::NoRetention => Some(self.format_history(session)),
            MemoryStrategy::FullRetention | MemoryStrategy::PartialRetention => None,
        };

        let payload = Payload {
            system_prompt,
            stage_prompt,
            history,
            user_text: user_text.to_string(),
        };
        (payload, marks)
    }

    fn format_history(&self, session: &SessionState) -> String {
        let turns: Vec<_> = session.agent_history().collect();
        if turns.is_empty() {
            return "Start of conversation.".to_string();
        }
        let start = turns.len().saturating_sub(self.max_history_turns);
        turns[start..]
            .iter()
            .map(|t| {
                let label = match t.role {
                    crate::session::Role::User => "User",
                    _ => "Responder",
                };
                format!("{label}: {}", t.text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
