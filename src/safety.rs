//! Crisis screening over user input.
//!
//! Keyword/pattern detection compiled once at construction, matched against
//! normalized text. No network, no model calls — the screener must stay
//! fast and always available because it runs before everything else on
//! every turn. Any match, however ambiguous, resolves to crisis: the
//! screener fails safe, not open.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default self-harm indicators. English and Polish, matching the
/// populations the protocol was written for.
const SELF_HARM_KEYWORDS: &[&str] = &[
    "suicide",
    "kill myself",
    "end my life",
    "end it all",
    "don't want to live",
    "want to die",
    "hurt myself",
    "harm myself",
    "cut myself",
    "samobójstwo",
    "zabić się",
    "skończyć z życiem",
    "nie chcę żyć",
    "chcę umrzeć",
    "skrzywdzić się",
];

/// Default harm-to-others indicators.
const HARM_OTHERS_KEYWORDS: &[&str] = &[
    "kill someone",
    "hurt someone",
    "zabić kogoś",
    "skrzywdzić kogoś",
];

const INTERVENTION_MESSAGE: &str = "**IMMEDIATE SUPPORT NEEDED**\n\n\
I hear that you are going through a very difficult moment. Your safety matters most.\n\n\
**URGENT CONTACTS:**\n\
- Crisis helpline: 116 123 (free, 24/7)\n\
- Emergency services: 112\n\
- Nearest emergency department\n\n\
You are not alone. If you are thinking about harming yourself, please contact one of \
the numbers above right now or go to the nearest hospital.\n\n\
Can you tell me whether you are in a safe place right now?";

/// Outcome of crisis screening for one user message.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyAssessment {
    pub crisis: bool,
    /// Keywords that triggered the assessment, for audit logging.
    pub matched_keywords: Vec<String>,
}

impl SafetyAssessment {
    pub fn clear() -> Self {
        Self {
            crisis: false,
            matched_keywords: Vec::new(),
        }
    }
}

/// Overridable screening configuration. Shape matches the safety config
/// JSON file; all fields fall back to the built-in defaults when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_self_harm")]
    pub self_harm_keywords: Vec<String>,
    #[serde(default = "default_harm_others")]
    pub harm_others_keywords: Vec<String>,
    #[serde(default = "default_intervention")]
    pub intervention_message: String,
}

fn default_self_harm() -> Vec<String> {
    SELF_HARM_KEYWORDS.iter().map(|s| s.to_string()).collect()
}

fn default_harm_others() -> Vec<String> {
    HARM_OTHERS_KEYWORDS.iter().map(|s| s.to_string()).collect()
}

fn default_intervention() -> String {
    INTERVENTION_MESSAGE.to_string()
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            self_harm_keywords: default_self_harm(),
            harm_others_keywords: default_harm_others(),
            intervention_message: default_intervention(),
        }
    }
}

impl SafetyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read safety config at {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse safety config at {}", path.display()))
    }
}

/// The interception seam the orchestrator calls before anything else on
/// every turn. `SafetyScreener` is the built-in implementation; an
/// implementation that can fail gets failed safe by the orchestrator
/// (errors are treated as crisis, never as all-clear).
pub trait SafetyInterceptor: Send + Sync {
    fn assess(&self, user_text: &str) -> Result<SafetyAssessment>;
    fn intervention_message(&self) -> &str;
}

/// Crisis screener with patterns compiled once.
pub struct SafetyScreener {
    patterns: Vec<(Regex, String)>,
    intervention_message: String,
}

impl SafetyScreener {
    pub fn new(config: SafetyConfig) -> Result<Self> {
        let mut patterns = Vec::new();
        for keyword in config
            .self_harm_keywords
            .iter()
            .chain(config.harm_others_keywords.iter())
        {
            // Word-bounded, case-insensitive match on the literal keyword.
            let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword));
            let re = Regex::new(&pattern)
                .with_context(|| format!("Invalid safety keyword pattern: {keyword}"))?;
            patterns.push((re, keyword.clone()));
        }
        if patterns.is_empty() {
            anyhow::bail!("safety config contains no keywords, refusing to screen nothing");
        }
        Ok(Self {
            patterns,
            intervention_message: config.intervention_message,
        })
    }

    pub fn with_defaults() -> Self {
        Self::new(SafetyConfig::default()).expect("default safety config is valid")
    }

    /// Screen one user message. Pure function of the input text.
    pub fn assess(&self, user_text: &str) -> SafetyAssessment {
        let normalized = user_text.trim().to_lowercase();
        if normalized.is_empty() {
            return SafetyAssessment::clear();
        }

        let mut matched = Vec::new();
        for (re, keyword) in &self.patterns {
            if re.is_match(&normalized) {
                matched.push(keyword.clone());
            }
        }

        SafetyAssessment {
            crisis: !matched.is_empty(),
            matched_keywords: matched,
        }
    }

    /// The fixed payload returned in place of normal processing.
    pub fn intervention_message(&self) -> &str {
        &self.intervention_message
    }
}

impl SafetyInterceptor for SafetyScreener {
    fn assess(&self, user_text: &str) -> Result<SafetyAssessment> {
        Ok(SafetyScreener::assess(self, user_text))
    }

    fn intervention_message(&self) -> &str {
        SafetyScreener::intervention_message(self)
    }
}
