//! Per-step training records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a step made no parameter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NonFiniteLoss,
    LossAboveBound,
    NonFiniteGradient,
    GradientAboveBound,
    /// Every group was invalid or the batch had no valid tokens.
    NoLearningSignal,
}

impl SkipReason {
    /// Whether this skip counts toward the consecutive-skip limit.
    pub fn counts_toward_divergence(&self) -> bool {
        !matches!(self, Self::NoLearningSignal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonFiniteLoss => "non_finite_loss",
            Self::LossAboveBound => "loss_above_bound",
            Self::NonFiniteGradient => "non_finite_gradient",
            Self::GradientAboveBound => "gradient_above_bound",
            Self::NoLearningSignal => "no_learning_signal",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write-once summary of a training step, handed to every observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step index after this step (1-based).
    pub step: u64,
    pub prompt_ids: Vec<String>,
    /// Rewards per group, in prompt order.
    pub rewards: Vec<Vec<f64>>,
    /// Advantages per group; empty for groups dropped this step.
    pub advantages: Vec<Vec<f64>>,
    pub reward_mean: f64,
    pub reward_std: f64,
    pub loss: f64,
    pub policy_loss: f64,
    pub kl: f64,
    /// Gradient norm of the last optimizer pass, if one was computed.
    pub grad_norm: Option<f64>,
    pub mean_ratio: f64,
    pub clip_fraction: f64,
    pub valid_tokens: usize,
    pub truncated_completions: usize,
    pub sentinel_rewards: usize,
    /// Groups dropped for non-finite rewards.
    pub invalid_groups: usize,
    /// Groups whose rewards were all identical.
    pub zero_variance_groups: usize,
    pub skipped: Option<SkipReason>,
    pub consecutive_skips: usize,
    pub reference_refreshed: bool,
    pub checkpointed: bool,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    pub fn was_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}
