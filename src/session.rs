//! Session state: conversation history, stage position, and memory ledgers.
//!
//! `SessionState` is the unit of ownership for one therapeutic
//! conversation. Turns are append-only with monotonically increasing
//! sequence numbers; the store trait at the bottom is the persistence seam
//! (JSON file per session, or in-memory for tests and the CLI).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::memory::{MemoryLedger, MemoryStrategy};

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    User,
    Responder,
    /// Supervisor reasoning kept in the transcript for audit, never shown
    /// to the user and never fed back to the agents.
    SupervisorInternal,
    /// Orchestrator-generated notices such as stage-transition messages.
    System,
}

/// The two agent roles that own a memory ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRole {
    Responder,
    Supervisor,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Responder => "responder",
            AgentRole::Supervisor => "supervisor",
        }
    }
}

/// One exchange in the conversation. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

/// State for one therapeutic conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub stage_id: String,
    turns: Vec<ConversationTurn>,
    responder_ledger: MemoryLedger,
    supervisor_ledger: MemoryLedger,
}

impl SessionState {
    /// Create a fresh session at the given initial stage, with both agent
    /// roles on the same strategy tier.
    pub fn new(session_id: &str, initial_stage_id: &str, strategy: MemoryStrategy) -> Self {
        Self::with_strategies(session_id, initial_stage_id, strategy, strategy)
    }

    /// Create a fresh session with a tier per agent role. The tiers are
    /// selected once from each backend's declared capabilities and stay
    /// fixed for the life of the session.
    pub fn with_strategies(
        session_id: &str,
        initial_stage_id: &str,
        responder_strategy: MemoryStrategy,
        supervisor_strategy: MemoryStrategy,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            stage_id: initial_stage_id.to_string(),
            turns: Vec::new(),
            responder_ledger: MemoryLedger::new(responder_strategy),
            supervisor_ledger: MemoryLedger::new(supervisor_strategy),
        }
    }

    /// Append a turn, assigning the next sequence number.
    pub fn append_turn(&mut self, role: Role, text: &str) -> &ConversationTurn {
        let seq = self.turns.last().map(|t| t.seq + 1).unwrap_or(0);
        self.turns.push(ConversationTurn {
            role,
            text: text.to_string(),
            seq,
            timestamp: Utc::now(),
        });
        self.turns.last().expect("just pushed")
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// History as seen by the agents: user and responder turns only.
    /// System notices and supervisor-internal records stay out of model
    /// payloads, as the original transcript handling did.
    pub fn agent_history(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns
            .iter()
            .filter(|t| matches!(t.role, Role::User | Role::Responder))
    }

    pub fn ledger(&self, role: AgentRole) -> &MemoryLedger {
        match role {
            AgentRole::Responder => &self.responder_ledger,
            AgentRole::Supervisor => &self.supervisor_ledger,
        }
    }

    pub fn ledger_mut(&mut self, role: AgentRole) -> &mut MemoryLedger {
        match role {
            AgentRole::Responder => &mut self.responder_ledger,
            AgentRole::Supervisor => &mut self.supervisor_ledger,
        }
    }
}

/// Persistence seam for sessions. Load once at turn start, save on every
/// exit path.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>>;
    async fn save(&self, state: &SessionState) -> Result<()>;
}

/// In-memory store for tests and single-process CLI use.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow::anyhow!("session map lock poisoned"))?;
        Ok(sessions.get(session_id).cloned())
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow::anyhow!("session map lock poisoned"))?;
        sessions.insert(state.session_id.clone(), state.clone());
        Ok(())
    }
}

/// One JSON file per session under a sessions directory.
pub struct JsonFileSessionStore {
    dir: PathBuf,
}

impl JsonFileSessionStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create sessions directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session file {}", path.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse session file {}", path.display()))?;
        Ok(Some(state))
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        let path = self.path_for(&state.session_id);
        let content = serde_json::to_string_pretty(state).context("Failed to encode session")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write session file {}", path.display()))?;
        Ok(())
    }
}
