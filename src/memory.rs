//! Context-delivery strategy selection and per-role transmission bookkeeping.
//!
//! A backend that retains conversation context gets its prompts once; a
//! backend that retains nothing gets everything on every call. The tier is
//! picked once per session from declared capabilities and cached in the
//! ledger — it never changes mid-session, even if capability reporting is
//! noisy, so token accounting stays stable.

use serde::{Deserialize, Serialize};

/// The three context-delivery tiers, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryStrategy {
    /// System prompt and each newly-entered stage prompt are transmitted
    /// exactly once; only the incremental user message goes out per turn.
    FullRetention,
    /// System prompt once per session; stage prompt re-sent every turn.
    PartialRetention,
    /// System prompt, stage prompt, and recent history in every payload.
    NoRetention,
}

/// Capabilities a backend declares at runtime. The selector branches on
/// these, never on vendor identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    /// Retains conversation context across calls within a session.
    pub retains_context: bool,
    /// Stage prompts set mid-conversation survive reliably. Backends known
    /// to retain turns but drop injected instructions leave this false,
    /// which downgrades them to `PartialRetention`.
    pub stage_prompt_reliable: bool,
}

/// Deterministic tier selection from declared capabilities.
pub fn select_strategy(capabilities: BackendCapabilities) -> MemoryStrategy {
    match (
        capabilities.retains_context,
        capabilities.stage_prompt_reliable,
    ) {
        (true, true) => MemoryStrategy::FullRetention,
        (true, false) => MemoryStrategy::PartialRetention,
        (false, _) => MemoryStrategy::NoRetention,
    }
}

/// Per-(session, agent-role) record of what has already been delivered to
/// the backend. Lives inside `SessionState` and persists with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLedger {
    pub strategy: MemoryStrategy,
    system_prompt_sent: bool,
    /// Stage id whose stage-prompt was last transmitted, if any. Kept as
    /// an id rather than a flag so re-entry into a previously visited
    /// stage would re-transmit only when the tier demands it.
    last_stage_prompt: Option<String>,
}

impl MemoryLedger {
    pub fn new(strategy: MemoryStrategy) -> Self {
        Self {
            strategy,
            system_prompt_sent: false,
            last_stage_prompt: None,
        }
    }

    /// Whether the next payload must carry the system prompt.
    pub fn needs_system_prompt(&self) -> bool {
        match self.strategy {
            MemoryStrategy::FullRetention | MemoryStrategy::PartialRetention => {
                !self.system_prompt_sent
            }
            MemoryStrategy::NoRetention => true,
        }
    }

    /// Whether the next payload must carry the stage prompt for `stage_id`.
    pub fn needs_stage_prompt(&self, stage_id: &str) -> bool {
        match self.strategy {
            MemoryStrategy::FullRetention => self.last_stage_prompt.as_deref() != Some(stage_id),
            MemoryStrategy::PartialRetention | MemoryStrategy::NoRetention => true,
        }
    }

    /// Record a confirmed system-prompt transmission. Only meaningful for
    /// the tiers that transmit it once; idempotent either way.
    pub fn mark_system_prompt_sent(&mut self) {
        self.system_prompt_sent = true;
    }

    /// Record a confirmed stage-prompt transmission.
    pub fn mark_stage_prompt_sent(&mut self, stage_id: &str) {
        self.last_stage_prompt = Some(stage_id.to_string());
    }

    pub fn system_prompt_sent(&self) -> bool {
        self.system_prompt_sent
    }

    pub fn last_stage_prompt(&self) -> Option<&str> {
        self.last_stage_prompt.as_deref()
    }
}
