//! Reward evaluation.
//!
//! Every reward strategy implements [`RewardModel`]. The training loop never
//! calls a model directly; it goes through [`RewardEvaluator`], which keeps
//! groups complete:
//!
//! - a failing evaluation is replaced by the configured minimum reward
//!   (the sentinel) and logged;
//! - a non-finite score is reported so the controller can drop the group.
//!
//! Included strategies:
//! - [`rules`] -- exact match, keyword and length rules, combined by weight.
//! - [`remote`] -- a separate scoring model behind an HTTP endpoint.

pub mod remote;
pub mod rules;

use anyhow::Result;
use futures::future::join_all;
use tracing::warn;

use crate::model::{Completion, Prompt};

pub use remote::RemoteReward;
pub use rules::{RuleReward, WeightedRule, WeightedSum};

/// Scores a (prompt, completion) pair.
#[allow(async_fn_in_trait)]
pub trait RewardModel: Send + Sync {
    async fn score(&self, prompt: &Prompt, completion: &Completion) -> Result<f64>;
}

// ---------------------------------------------------------------------------
// AnyReward: enum dispatch wrapper for runtime reward selection
// ---------------------------------------------------------------------------

/// Runtime selection between reward strategies without `dyn` (which is
/// incompatible with async trait methods).
pub enum AnyReward {
    Rules(WeightedSum),
    Remote(RemoteReward),
}

impl RewardModel for AnyReward {
    async fn score(&self, prompt: &Prompt, completion: &Completion) -> Result<f64> {
        match self {
            Self::Rules(r) => r.score(prompt, completion).await,
            Self::Remote(r) => r.score(prompt, completion).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// What happened when scoring one completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RewardOutcome {
    Scored(f64),
    /// Evaluation failed; the sentinel minimum reward stands in.
    Sentinel(f64),
    /// The model returned NaN or an infinity.
    NonFinite(f64),
}

impl RewardOutcome {
    pub fn value(&self) -> f64 {
        match self {
            Self::Scored(r) | Self::Sentinel(r) | Self::NonFinite(r) => *r,
        }
    }
}

/// Rewards for one group, in completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRewards {
    pub rewards: Vec<f64>,
    /// How many rewards are sentinel substitutes.
    pub sentinels: usize,
    /// How many scores were non-finite.
    pub non_finite: usize,
}

impl GroupRewards {
    fn from_outcomes(outcomes: &[RewardOutcome]) -> Self {
        let mut sentinels = 0;
        let mut non_finite = 0;
        for outcome in outcomes {
            match outcome {
                RewardOutcome::Sentinel(_) => sentinels += 1,
                RewardOutcome::NonFinite(_) => non_finite += 1,
                RewardOutcome::Scored(_) => {}
            }
        }
        Self {
            rewards: outcomes.iter().map(RewardOutcome::value).collect(),
            sentinels,
            non_finite,
        }
    }

    /// A group with any non-finite reward carries no usable signal this step.
    pub fn is_valid(&self) -> bool {
        self.non_finite == 0
    }
}

/// Wraps a [`RewardModel`] with sentinel substitution.
pub struct RewardEvaluator<R> {
    model: R,
    min_reward: f64,
}

impl<R: RewardModel> RewardEvaluator<R> {
    pub fn new(model: R, min_reward: f64) -> Self {
        Self { model, min_reward }
    }

    /// Score one completion. Never fails.
    pub async fn evaluate(&self, prompt: &Prompt, completion: &Completion) -> RewardOutcome {
        match self.model.score(prompt, completion).await {
            Ok(reward) if reward.is_finite() => RewardOutcome::Scored(reward),
            Ok(reward) => {
                warn!(prompt = %prompt.id, reward, "Reward model returned a non-finite value");
                RewardOutcome::NonFinite(reward)
            }
            Err(e) => {
                warn!(
                    prompt = %prompt.id,
                    error = %e,
                    sentinel = self.min_reward,
                    "Reward evaluation failed, substituting sentinel"
                );
                RewardOutcome::Sentinel(self.min_reward)
            }
        }
    }

    /// Score every completion of a group concurrently.
    pub async fn evaluate_group(&self, prompt: &Prompt, completions: &[Completion]) -> GroupRewards {
        let outcomes = join_all(completions.iter().map(|c| self.evaluate(prompt, c))).await;
        GroupRewards::from_outcomes(&outcomes)
    }

    /// Score a whole batch; returns once every completion has a reward.
    pub async fn evaluate_batch(
        &self,
        prompts: &[Prompt],
        groups: &[Vec<Completion>],
    ) -> Vec<GroupRewards> {
        join_all(
            prompts
                .iter()
                .zip(groups)
                .map(|(prompt, group)| self.evaluate_group(prompt, group)),
        )
        .await
    }
}
