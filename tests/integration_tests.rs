//! End-to-end workflow tests against the public crate API: whole sessions
//! driven through the orchestrator with scripted backends and an
//! inspectable store.

use std::sync::Arc;

use stageward::backend::{FailingBackend, FailureMode, ModelBackend, ScriptedBackend};
use stageward::memory::{BackendCapabilities, MemoryStrategy};
use stageward::prompt::StaticPromptSource;
use stageward::safety::SafetyScreener;
use stageward::session::{AgentRole, InMemorySessionStore, Role, SessionStore};
use stageward::stage::StageSequence;
use stageward::workflow::Orchestrator;

fn retaining() -> BackendCapabilities {
    BackendCapabilities {
        retains_context: true,
        stage_prompt_reliable: true,
    }
}

fn stateless() -> BackendCapabilities {
    BackendCapabilities {
        retains_context: false,
        stage_prompt_reliable: false,
    }
}

fn advance(reason: &str) -> String {
    format!(r#"{{"decision": "advance", "reason": "{reason}"}}"#)
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<InMemorySessionStore>,
    supervisor: Arc<ScriptedBackend>,
    responder: Arc<ScriptedBackend>,
}

fn harness(supervisor: Arc<ScriptedBackend>, responder: Arc<ScriptedBackend>) -> Harness {
    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = Orchestrator::new(
        StageSequence::default_protocol(),
        Arc::new(SafetyScreener::with_defaults()),
        store.clone(),
        supervisor.clone(),
        responder.clone(),
        Arc::new(StaticPromptSource),
    );
    Harness {
        orchestrator,
        store,
        supervisor,
        responder,
    }
}

fn scripted(capabilities: BackendCapabilities, fallback: &str) -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::with_fallback(
        capabilities,
        vec![],
        fallback,
    ))
}

#[tokio::test]
async fn full_session_walks_every_stage_to_terminal() {
    // Supervisor advances on every turn; the protocol has five stages, so
    // four advances reach the terminal stage and further turns stay put.
    let supervisor = Arc::new(ScriptedBackend::with_fallback(
        retaining(),
        vec![
            advance("goal is named"),
            advance("resources listed"),
            advance("scale anchored"),
            advance("step chosen"),
        ],
        r#"{"decision": "stay", "reason": "wrap up"}"#,
    ));
    let responder = scripted(retaining(), "a warm reply");
    let h = harness(supervisor.clone(), responder);
    let session = h.orchestrator.start_session().await.unwrap();

    let mut visited = vec![session.stage_id.clone()];
    for i in 0..6 {
        let result = h
            .orchestrator
            .process_turn(&session.session_id, &format!("turn {i}"))
            .await;
        assert!(result.success);
        if result.stage != *visited.last().unwrap() {
            visited.push(result.stage.clone());
        }
    }

    assert_eq!(
        visited,
        vec!["opening", "resources", "scaling", "small_steps", "summary"]
    );

    // At the terminal stage the supervisor is never consulted again.
    assert_eq!(supervisor.call_count(), 4);

    let stored = h.store.load(&session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.stage_id, "summary");
    // One system transition notice per advance.
    let notices = stored
        .turns()
        .iter()
        .filter(|t| t.role == Role::System)
        .count();
    assert_eq!(notices, 4);
}

#[tokio::test]
async fn stage_order_never_decreases_across_a_session() {
    let supervisor = Arc::new(ScriptedBackend::with_fallback(
        retaining(),
        vec![
            r#"{"decision": "stay", "reason": "not yet"}"#.into(),
            advance("ready"),
            r#"{"decision": "stay", "reason": "settling in"}"#.into(),
            advance("ready again"),
        ],
        r#"{"decision": "stay", "reason": "default"}"#,
    ));
    let responder = scripted(retaining(), "ok");
    let h = harness(supervisor, responder);
    let session = h.orchestrator.start_session().await.unwrap();

    let stages = StageSequence::default_protocol();
    let mut last_order = 0;
    for i in 0..5 {
        let result = h
            .orchestrator
            .process_turn(&session.session_id, &format!("turn {i}"))
            .await;
        assert!(result.success);
        let order = stages.get(&result.stage).unwrap().order;
        assert!(order >= last_order, "stage went backwards at turn {i}");
        last_order = order;
    }
}

#[tokio::test]
async fn crisis_mid_session_freezes_stage_and_skips_agents() {
    let supervisor = Arc::new(ScriptedBackend::with_fallback(
        retaining(),
        vec![advance("moving on")],
        r#"{"decision": "stay", "reason": "hold"}"#,
    ));
    let responder = scripted(retaining(), "a reply");
    let h = harness(supervisor.clone(), responder.clone());
    let session = h.orchestrator.start_session().await.unwrap();

    // One normal turn that advances to the second stage.
    let result = h.orchestrator.process_turn(&session.session_id, "hi").await;
    assert_eq!(result.stage, "resources");
    let calls_before = (supervisor.call_count(), responder.call_count());

    // Crisis turn: intervention replaces everything, stage untouched.
    let result = h
        .orchestrator
        .process_turn(&session.session_id, "I want to end my life")
        .await;
    assert!(result.success);
    assert!(result.crisis);
    assert!(result.reply.contains("116 123"));
    assert_eq!(result.stage, "resources");
    assert_eq!(supervisor.call_count(), calls_before.0);
    assert_eq!(responder.call_count(), calls_before.1);

    // The session continues normally afterwards, from the same stage.
    let result = h
        .orchestrator
        .process_turn(&session.session_id, "I am safe now")
        .await;
    assert!(result.success);
    assert!(!result.crisis);
    assert_eq!(result.stage, "resources");

    let stored = h.store.load(&session.session_id).await.unwrap().unwrap();
    assert!(
        stored
            .turns()
            .iter()
            .any(|t| t.role == Role::Responder && t.text.contains("116 123"))
    );
}

#[tokio::test]
async fn stateless_responder_receives_transcript_every_turn() {
    let supervisor = scripted(retaining(), r#"{"decision": "stay", "reason": "hold"}"#);
    let responder = scripted(stateless(), "noted");
    let h = harness(supervisor.clone(), responder.clone());
    let session = h.orchestrator.start_session().await.unwrap();

    let stored = h.store.load(&session.session_id).await.unwrap().unwrap();
    assert_eq!(
        stored.ledger(AgentRole::Responder).strategy,
        MemoryStrategy::NoRetention
    );
    assert_eq!(
        stored.ledger(AgentRole::Supervisor).strategy,
        MemoryStrategy::FullRetention
    );

    h.orchestrator
        .process_turn(&session.session_id, "first message")
        .await;
    h.orchestrator
        .process_turn(&session.session_id, "second message")
        .await;

    let sent = responder.sent();
    assert_eq!(sent.len(), 2);
    // Stateless tier: system prompt, stage guidance, and transcript go out
    // on every call.
    for payload in &sent {
        assert!(payload.contains("## SYSTEM"));
        assert!(payload.contains("## STAGE GUIDANCE"));
        assert!(payload.contains("## CONVERSATION SO FAR"));
    }
    assert!(sent[0].contains("Start of conversation."));
    assert!(sent[1].contains("User: first message"));
    assert!(sent[1].contains("second message"));

    // Retaining supervisor got its system prompt exactly once.
    let supervisor_sent = supervisor.sent();
    assert!(supervisor_sent[0].contains("## SYSTEM"));
    assert!(!supervisor_sent[1].contains("## SYSTEM"));
}

#[tokio::test]
async fn retaining_backend_gets_stage_prompt_at_most_once_per_stage() {
    let supervisor = Arc::new(ScriptedBackend::with_fallback(
        retaining(),
        vec![advance("ready")],
        r#"{"decision": "stay", "reason": "hold"}"#,
    ));
    let responder = scripted(retaining(), "ok");
    let h = harness(supervisor, responder.clone());
    let session = h.orchestrator.start_session().await.unwrap();

    // Turn 1 advances opening -> resources; turns 2 and 3 stay.
    for text in ["one", "two", "three"] {
        assert!(h.orchestrator.process_turn(&session.session_id, text).await.success);
    }

    let sent = responder.sent();
    assert_eq!(sent.len(), 3);
    let stage_prompts = sent
        .iter()
        .filter(|p| p.contains("## STAGE GUIDANCE"))
        .count();
    // Once for the stage entered on turn 1, never again for turns 2-3.
    assert_eq!(stage_prompts, 1);
    assert!(sent[0].contains("Current stage: resources"));
}

#[tokio::test]
async fn supervisor_outage_degrades_to_stay() {
    let supervisor: Arc<dyn ModelBackend> =
        Arc::new(FailingBackend::new(retaining(), FailureMode::Unavailable));
    let responder = scripted(retaining(), "still here");
    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = Orchestrator::new(
        StageSequence::default_protocol(),
        Arc::new(SafetyScreener::with_defaults()),
        store.clone(),
        supervisor,
        responder.clone(),
        Arc::new(StaticPromptSource),
    );
    let session = orchestrator.start_session().await.unwrap();

    let result = orchestrator.process_turn(&session.session_id, "hello").await;
    // The turn succeeds: a supervisor failure means "stay", not an error.
    assert!(result.success);
    assert_eq!(result.reply, "still here");
    assert_eq!(result.stage, "opening");
    assert_eq!(result.decision.unwrap().verdict, "stay");
}

#[tokio::test]
async fn responder_outage_fails_turn_without_losing_the_session() {
    let supervisor = scripted(retaining(), r#"{"decision": "stay", "reason": "hold"}"#);
    let responder: Arc<dyn ModelBackend> =
        Arc::new(FailingBackend::new(retaining(), FailureMode::Unavailable));
    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = Orchestrator::new(
        StageSequence::default_protocol(),
        Arc::new(SafetyScreener::with_defaults()),
        store.clone(),
        supervisor,
        responder,
        Arc::new(StaticPromptSource),
    );
    let session = orchestrator.start_session().await.unwrap();

    let result = orchestrator.process_turn(&session.session_id, "hello").await;
    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, "ResponderFailure");

    // The session itself survives and later turns can succeed against it.
    let stored = store.load(&session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.stage_id, "opening");
    assert!(stored.turns().is_empty());
}

#[tokio::test]
async fn garbled_supervisor_output_never_advances() {
    let supervisor = Arc::new(ScriptedBackend::with_fallback(
        retaining(),
        vec![
            "I think we should move on to the next topic!".into(),
            r#"{"decision": "proceed", "reason": "wrong vocabulary"}"#.into(),
            String::new(),
        ],
        r#"{"decision": "stay"}"#,
    ));
    let responder = scripted(retaining(), "ok");
    let h = harness(supervisor, responder);
    let session = h.orchestrator.start_session().await.unwrap();

    for i in 0..3 {
        let result = h
            .orchestrator
            .process_turn(&session.session_id, &format!("turn {i}"))
            .await;
        assert!(result.success);
        assert_eq!(result.stage, "opening", "garbled output advanced at turn {i}");
        assert_eq!(result.decision.unwrap().verdict, "stay");
    }
}

#[tokio::test]
async fn sessions_are_isolated_from_each_other() {
    let supervisor = Arc::new(ScriptedBackend::with_fallback(
        retaining(),
        vec![advance("ready")],
        r#"{"decision": "stay", "reason": "hold"}"#,
    ));
    let responder = scripted(retaining(), "ok");
    let h = harness(supervisor, responder);

    let a = h.orchestrator.start_session().await.unwrap();
    let b = h.orchestrator.start_session().await.unwrap();

    // Session A consumes the single advance; session B must stay unaffected.
    let result_a = h.orchestrator.process_turn(&a.session_id, "hello").await;
    assert_eq!(result_a.stage, "resources");

    let result_b = h.orchestrator.process_turn(&b.session_id, "hello").await;
    assert_eq!(result_b.stage, "opening");

    let stored_b = h.store.load(&b.session_id).await.unwrap().unwrap();
    assert_eq!(stored_b.stage_id, "opening");
    assert_eq!(stored_b.turns().len(), 3);
}
