//! Responder: generates the user-facing reply for the resolved stage.
//!
//! Always called against the post-transition stage, so the reply matches
//! whichever stage the session occupies after the supervisor's verdict has
//! been applied. A backend failure here fails the whole turn — there is no
//! canned text that would be safer than an explicit error.

use std::sync::Arc;
use tracing::debug;

use crate::backend::ModelBackend;
use crate::errors::BackendError;
use crate::prompt::PromptAssembler;
use crate::session::{AgentRole, SessionState};
use crate::stage::Stage;

pub struct Responder {
    backend: Arc<dyn ModelBackend>,
    assembler: Arc<PromptAssembler>,
}

impl Responder {
    pub fn new(backend: Arc<dyn ModelBackend>, assembler: Arc<PromptAssembler>) -> Self {
        Self { backend, assembler }
    }

    /// Generate the reply for `stage`. Ledger marks commit only on a
    /// successful send.
    pub async fn respond(
        &self,
        session: &mut SessionState,
        stage: &Stage,
        user_text: &str,
    ) -> Result<String, BackendError> {
        let (payload, marks) =
            self.assembler
                .assemble(AgentRole::Responder, session, stage, user_text);

        let reply = self.backend.send(&payload).await?;
        marks.commit(session, AgentRole::Responder);
        debug!(stage = %stage.id, chars = reply.len(), "responder reply generated");
        Ok(reply)
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

    #[tokio::test]
    async fn reply_comes_from_backend() {
        let backend = Arc::new(ScriptedBackend::new(
            retaining(),
            vec!["What would a better week look like?".into()],
        ));
        let responder = Responder::new(backend, assembler());
        let mut session = SessionState::new("s", "opening", MemoryStrategy::FullRetention);
        let stage = Stage::new("opening", 1, "Opening");

        let reply = responder.respond(&mut session, &stage, "hello").await.unwrap();
        assert_eq!(reply, "What would a better week look like?");
        assert!(!session.ledger(AgentRole::Responder).needs_system_prompt());
    }

    #[tokio::test]
    async fn failure_propagates_and_leaves_ledger_unmarked() {
        let backend = Arc::new(FailingBackend::new(retaining(), FailureMode::Unavailable));
        let responder = Responder::new(backend, assembler());
        let mut session = SessionState::new("s", "opening", MemoryStrategy::FullRetention);
        let stage = Stage::new("opening", 1, "Opening");

        let err = responder
            .respond(&mut session, &stage, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(session.ledger(AgentRole::Responder).needs_system_prompt());
        assert!(session.ledger(AgentRole::Responder).needs_stage_prompt("opening"));
    }

    #[tokio::test]
    async fn payload_targets_the_given_stage() {
        let backend = Arc::new(ScriptedBackend::with_fallback(retaining(), vec![], "ok"));
        let responder = Responder::new(backend.clone(), assembler());
        let mut session = SessionState::new("s", "opening", MemoryStrategy::FullRetention);
        // Session already advanced: reply must be generated for resources.
        session.stage_id = "resources".to_string();
        let stage = Stage::new("resources", 2, "Resources");

        responder.respond(&mut session, &stage, "hello").await.unwrap();
        let sent = backend.sent();
        assert!(sent[0].contains("resources"));
    }
}
