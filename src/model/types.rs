//! Conversation prompts and sampled completions.
//!
//! These are the values that flow between the sampler, the reward evaluator
//! and the objective. Prompts are read-only once loaded; completions live for a
//! single training step.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Conversation turns
// ---------------------------------------------------------------------------

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse a role label, accepting the `human` / `gpt` aliases used by
    /// LLaVA-style conversation records.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "system" => Some(Self::System),
            "user" | "human" => Some(Self::User),
            "assistant" | "gpt" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// An ordered conversation ending in a turn that awaits the policy's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    /// Stable identifier (from the data record, or generated).
    pub id: String,
    /// Conversation so far.
    pub turns: Vec<Turn>,
    /// Reference answer stripped from the source record, if it had one.
    #[serde(default)]
    pub reference: Option<String>,
}

impl Prompt {
    pub fn new(id: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            id: id.into(),
            turns,
            reference: None,
        }
    }

    /// A single-turn user prompt with a generated id.
    pub fn from_user_text(text: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), vec![Turn::user(text)])
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// True when the last turn is not an assistant turn.
    pub fn awaits_completion(&self) -> bool {
        self.turns
            .last()
            .map(|t| t.role != Role::Assistant)
            .unwrap_or(false)
    }

    /// Text of the last user turn, or the empty string.
    pub fn last_user_text(&self) -> &str {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
            .unwrap_or("")
    }

    /// Flatten the conversation into `role: content` lines.
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("{}: {}", t.role.as_str(), t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Why generation of a completion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The policy emitted a stop condition.
    Stop,
    /// Generation hit the maximum completion length.
    Length,
}

/// A completion sampled from the policy for one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Decoded text.
    pub text: String,
    /// Generated token ids.
    pub token_ids: Vec<u32>,
    /// Per-token log-probabilities under the policy at sampling time.
    pub token_log_probs: Vec<f64>,
    pub finish_reason: FinishReason,
    /// Number of leading tokens that count toward the loss when the
    /// completion was cut at the length limit.
    #[serde(default)]
    pub truncated_at: Option<usize>,
}

impl Completion {
    pub fn new(
        text: impl Into<String>,
        token_ids: Vec<u32>,
        token_log_probs: Vec<f64>,
        finish_reason: FinishReason,
    ) -> Self {
        Self {
            text: text.into(),
            token_ids,
            token_log_probs,
            finish_reason,
            truncated_at: None,
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.token_log_probs.len()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated_at.is_some()
    }

    /// Tokens that may contribute to the loss reduction.
    pub fn valid_len(&self) -> usize {
        match self.truncated_at {
            Some(point) => point.min(self.num_tokens()),
            None => self.num_tokens(),
        }
    }

    /// Mark the completion as truncated after `limit` tokens.
    pub fn truncate_at(&mut self, limit: usize) {
        self.truncated_at = Some(limit.min(self.num_tokens()));
        self.finish_reason = FinishReason::Length;
    }

    /// log P(completion | prompt) over the valid tokens, accumulated in log space.
    pub fn sequence_log_prob(&self) -> f64 {
        self.token_log_probs[..self.valid_len()].iter().sum()
    }
}
