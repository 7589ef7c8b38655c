//! Model backend contract and built-in doubles.
//!
//! The orchestration core talks to every vendor through `ModelBackend` and
//! branches only on declared capability, never on identity. The doubles
//! here back the CLI demo mode and the integration tests; a real vendor
//! adapter implements the same trait out of tree.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::errors::BackendError;
use crate::memory::BackendCapabilities;
use crate::prompt::Payload;

/// A model backend. `send` is the single blocking-I/O-bound call per
/// agent invocation.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Capabilities discovered/declared at runtime.
    fn capabilities(&self) -> BackendCapabilities;

    /// Whether the backend retains conversation context across calls.
    fn declares_retention(&self) -> bool {
        self.capabilities().retains_context
    }

    /// Send one payload, returning the model's text reply.
    async fn send(&self, payload: &Payload) -> Result<String, BackendError>;

    /// Drop any server-side conversation state. No-op for stateless
    /// backends.
    async fn reset_context(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Replays a fixed script of replies and records every payload it was
/// sent. Used by the CLI demo and throughout the tests.
pub struct ScriptedBackend {
    capabilities: BackendCapabilities,
    replies: Mutex<VecDeque<String>>,
    /// Reply used once the script runs out.
    fallback_reply: String,
    sent: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(capabilities: BackendCapabilities, replies: Vec<String>) -> Self {
        Self {
            capabilities,
            replies: Mutex::new(replies.into()),
            fallback_reply: String::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(
        capabilities: BackendCapabilities,
        replies: Vec<String>,
        fallback_reply: &str,
    ) -> Self {
        Self {
            fallback_reply: fallback_reply.to_string(),
            ..Self::new(capabilities, replies)
        }
    }

    /// Rendered payloads of every call made so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn send(&self, payload: &Payload) -> Result<String, BackendError> {
        self.sent.lock().expect("sent lock").push(payload.render());
        let next = self.replies.lock().expect("replies lock").pop_front();
        Ok(next.unwrap_or_else(|| self.fallback_reply.clone()))
    }
}

/// How a `FailingBackend` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Unavailable,
    Timeout,
}

/// Always fails. Capabilities are still reported so strategy selection
/// happens before the first doomed call, as with a real flaky backend.
pub struct FailingBackend {
    capabilities: BackendCapabilities,
    mode: FailureMode,
}

impl FailingBackend {
    pub fn new(capabilities: BackendCapabilities, mode: FailureMode) -> Self {
        Self { capabilities, mode }
    }
}

#[async_trait]
impl ModelBackend for FailingBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn send(&self, _payload: &Payload) -> Result<String, BackendError> {
        match self.mode {
            FailureMode::Unavailable => {
                Err(BackendError::Unavailable("simulated outage".to_string()))
            }
            FailureMode::Timeout => Err(BackendError::Timeout { timeout_ms: 30_000 }),
        }
    }
}
