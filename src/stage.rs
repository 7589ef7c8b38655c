//! Stage definition and JSON loading for the therapy protocol.
//!
//! This module provides:
//! - `Stage` struct representing a single protocol stage
//! - `StageSequence` owning the ordered, non-cyclic stage list
//! - Loading functions for JSON-based stage configuration
//! - The default five-stage SFBT protocol as a fallback
//!
//! The sequence is the state machine of the workflow: the first stage is
//! the initial state, the last stage is terminal, and the only transition
//! is `advance` to the next ordinal. Skip-ahead and backward moves do not
//! exist.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::TransitionError;

/// A single stage of the therapeutic protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    /// Stable identifier (e.g., "opening")
    pub id: String,
    /// Ordinal position within the protocol, starting at 1
    pub order: u32,
    /// Human-readable label shown in transition announcements
    pub label: String,
    /// Advisory minimum number of turns before advancement is expected
    #[serde(default)]
    pub min_turns: Option<u32>,
    /// Advisory maximum number of turns the stage is expected to last
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Completion criteria descriptions, consumed verbatim by the
    /// supervisor model. Never machine-evaluated here.
    #[serde(default)]
    pub completion_criteria: Vec<String>,
}

impl Stage {
    pub fn new(id: &str, order: u32, label: &str) -> Self {
        Self {
            id: id.to_string(),
            order,
            label: label.to_string(),
            min_turns: None,
            max_turns: None,
            completion_criteria: Vec::new(),
        }
    }

    pub fn with_criteria(id: &str, order: u32, label: &str, criteria: &[&str]) -> Self {
        Self {
            completion_criteria: criteria.iter().map(|c| c.to_string()).collect(),
            ..Self::new(id, order, label)
        }
    }
}

/// File format for a stages configuration file.
#[derive(Debug, Serialize, Deserialize)]
pub struct StagesFile {
    pub stages: Vec<Stage>,
}

/// The ordered stage sequence. Validated on construction: orders are
/// strictly consecutive from 1 and ids are unique.
#[derive(Debug, Clone)]
pub struct StageSequence {
    stages: Vec<Stage>,
}

impl StageSequence {
    /// Build a sequence from explicit stages, validating the ordering.
    pub fn new(mut stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            anyhow::bail!("stage sequence cannot be empty");
        }
        stages.sort_by_key(|s| s.order);
        for (idx, stage) in stages.iter().enumerate() {
            let expected = idx as u32 + 1;
            if stage.order != expected {
                anyhow::bail!(
                    "stage '{}' has order {}, expected {} (orders must be consecutive from 1)",
                    stage.id,
                    stage.order,
                    expected
                );
            }
        }
        let mut ids: Vec<&str> = stages.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != stages.len() {
            anyhow::bail!("stage ids must be unique");
        }
        Ok(Self { stages })
    }

    /// Load a sequence from a stages JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stages file at {}", path.display()))?;
        let file: StagesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse stages file at {}", path.display()))?;
        Self::new(file.stages)
    }

    /// The built-in SFBT protocol used when no stages file is provided.
    pub fn default_protocol() -> Self {
        let stages = vec![
            Stage::with_criteria(
                "opening",
                1,
                "Opening and goal formulation",
                &[
                    "Client has described what brings them here",
                    "A preferred future or session goal has been named",
                ],
            ),
            Stage::with_criteria(
                "resources",
                2,
                "Resources and exceptions",
                &[
                    "At least one personal resource or past success has been identified",
                    "An exception to the problem has been explored",
                ],
            ),
            Stage::with_criteria(
                "scaling",
                3,
                "Scaling questions",
                &[
                    "Client has placed themselves on the scale",
                    "What makes the current number possible has been discussed",
                ],
            ),
            Stage::with_criteria(
                "small_steps",
                4,
                "Small steps",
                &["A concrete, achievable next step has been agreed"],
            ),
            Stage::with_criteria(
                "summary",
                5,
                "Summary and closing",
                &["Session has been summarised and feedback given"],
            ),
        ];
        Self::new(stages).expect("default protocol is valid")
    }

    /// First stage of the protocol; the initial state of every session.
    pub fn first(&self) -> &Stage {
        &self.stages[0]
    }

    /// Last stage of the protocol; terminal, never evaluated for advance.
    pub fn last(&self) -> &Stage {
        &self.stages[self.stages.len() - 1]
    }

    pub fn get(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn is_terminal(&self, stage_id: &str) -> bool {
        self.last().id == stage_id
    }

    pub fn all(&self) -> &[Stage] {
        &self.stages
    }

    /// Apply the single transition rule: advance from the session's current
    /// stage to the next ordinal, but only when the advancing decision was
    /// evaluated against that same stage. A decision computed against an
    /// already-superseded stage is rejected as stale rather than applied.
    pub fn advance(
        &self,
        current_stage_id: &str,
        decided_for_stage_id: &str,
    ) -> std::result::Result<&Stage, TransitionError> {
        if decided_for_stage_id != current_stage_id {
            return Err(TransitionError::StaleDecision {
                decided_for: decided_for_stage_id.to_string(),
                current: current_stage_id.to_string(),
            });
        }
        let current = self
            .get(current_stage_id)
            .ok_or_else(|| TransitionError::UnknownStage {
                stage_id: current_stage_id.to_string(),
            })?;
        if self.is_terminal(current_stage_id) {
            return Err(TransitionError::AtTerminal {
                stage_id: current_stage_id.to_string(),
            });
        }
        // Orders are validated consecutive, so next-in-order always exists
        // for a non-terminal stage.
        Ok(self
            .stages
            .iter()
            .find(|s| s.order == current.order + 1)
            .expect("non-terminal stage has a successor"))
    }
}
