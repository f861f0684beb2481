//! Group Relative Policy Optimization (GRPO) objective.
//!
//! For every valid token t of every completion i in the batch:
//!
//!   r_t    = exp(log pi_theta(t) - log pi_old(t))
//!   surr_t = min(r_t * A_i, clip(r_t, 1-eps, 1+eps) * A_i)
//!   kl_t   = exp(ref_t - cur_t) - (ref_t - cur_t) - 1
//!
//!   loss = -mean_t(surr_t) + beta * mean_t(kl_t)
//!
//! where the means run over every valid token in the batch. `kl_t` is the
//! non-negative k3 estimator of D_KL(pi_theta || pi_ref).
//!
//! Besides the scalar loss the objective emits d(loss)/d(log pi_theta(t)) per
//! token, which is all a backend needs to back-propagate the update.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RlConfig;

use super::advantage::{clip_ratio, compute_importance_ratio};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Everything the objective needs for one completion.
#[derive(Debug, Clone, Copy)]
pub struct ObjectiveSample<'a> {
    /// Per-token log-probs recorded at sampling time (pi_old).
    pub sampling_log_probs: &'a [f64],
    /// Per-token log-probs under the live parameters (pi_theta).
    pub current_log_probs: &'a [f64],
    /// Per-token log-probs under the frozen reference (pi_ref).
    pub reference_log_probs: &'a [f64],
    /// Group-relative advantage of the completion.
    pub advantage: f64,
    /// Leading tokens that take part in the reduction.
    pub valid_len: usize,
    /// Whether the completion was cut at the length limit.
    pub truncated: bool,
}

/// The result of evaluating the objective over a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyLoss {
    /// Total loss = policy_loss + beta * kl.
    pub loss: f64,
    /// Negated mean clipped surrogate.
    pub policy_loss: f64,
    /// Mean per-token KL estimate against the reference policy.
    pub kl: f64,
    /// Mean importance ratio over valid tokens.
    pub mean_ratio: f64,
    /// Fraction of valid tokens whose ratio was clipped.
    pub clip_fraction: f64,
    /// Number of tokens in the reduction.
    pub valid_tokens: usize,
    /// Per-sample, per-token d(loss)/d(log pi_theta); zero outside the reduction.
    #[serde(skip)]
    pub token_weights: Vec<Vec<f64>>,
}

impl PolicyLoss {
    /// Nothing contributed to the loss.
    pub fn is_empty(&self) -> bool {
        self.valid_tokens == 0
    }
}

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

/// The clipped, KL-regularized GRPO objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrpoObjective {
    pub clip_epsilon: f64,
    pub kl_coeff: f64,
    pub mask_truncated_completions: bool,
}

impl GrpoObjective {
    pub fn new(config: &RlConfig) -> Self {
        Self {
            clip_epsilon: config.clip_epsilon,
            kl_coeff: config.kl_coeff,
            mask_truncated_completions: config.mask_truncated_completions,
        }
    }

    /// Evaluate the loss over a batch of completions.
    ///
    /// A batch with no valid tokens yields a zero loss with `valid_tokens == 0`.
    /// Non-finite inputs propagate into the loss; the caller's divergence
    /// guard decides what to do with them.
    ///
    /// # Errors
    ///
    /// Returns an error if a sample's log-prob sequences are shorter than its
    /// valid length.
    pub fn compute(&self, samples: &[ObjectiveSample<'_>]) -> Result<PolicyLoss> {
        for (i, s) in samples.iter().enumerate() {
            let shortest = s
                .sampling_log_probs
                .len()
                .min(s.current_log_probs.len())
                .min(s.reference_log_probs.len());
            if shortest < s.valid_len {
                bail!(
                    "sample {i}: valid length {} exceeds log-prob lengths \
                     (sampling {}, current {}, reference {})",
                    s.valid_len,
                    s.sampling_log_probs.len(),
                    s.current_log_probs.len(),
                    s.reference_log_probs.len()
                );
            }
        }

        let included = |s: &ObjectiveSample<'_>| !(self.mask_truncated_completions && s.truncated);
        let n_tokens: usize = samples
            .iter()
            .filter(|&s| included(s))
            .map(|s| s.valid_len)
            .sum();

        let mut token_weights: Vec<Vec<f64>> = samples
            .iter()
            .map(|s| vec![0.0; s.current_log_probs.len()])
            .collect();

        if n_tokens == 0 {
            return Ok(PolicyLoss {
                loss: 0.0,
                policy_loss: 0.0,
                kl: 0.0,
                mean_ratio: 1.0,
                clip_fraction: 0.0,
                valid_tokens: 0,
                token_weights,
            });
        }

        let n = n_tokens as f64;
        let epsilon = self.clip_epsilon;
        let beta = self.kl_coeff;

        let mut total_surrogate = 0.0;
        let mut total_kl = 0.0;
        let mut total_ratio = 0.0;
        let mut num_clipped = 0usize;

        for (sample, weights) in samples.iter().zip(token_weights.iter_mut()) {
            if !included(sample) {
                continue;
            }
            let advantage = sample.advantage;

            for t in 0..sample.valid_len {
                let current = sample.current_log_probs[t];
                let reference = sample.reference_log_probs[t];

                let ratio = compute_importance_ratio(current, sample.sampling_log_probs[t]);
                total_ratio += ratio;

                let clipped = clip_ratio(ratio, epsilon);
                if (clipped - ratio).abs() > 1e-10 {
                    num_clipped += 1;
                }

                // Pessimistic bound; the gradient flows only through the
                // unclipped branch.
                let unclipped_obj = ratio * advantage;
                let clipped_obj = clipped * advantage;
                let (surrogate, d_surrogate) = if unclipped_obj <= clipped_obj {
                    (unclipped_obj, unclipped_obj)
                } else {
                    (clipped_obj, 0.0)
                };
                total_surrogate += surrogate;

                let log_ratio_ref = reference - current;
                let kl = log_ratio_ref.exp() - log_ratio_ref - 1.0;
                total_kl += kl;
                let d_kl = 1.0 - log_ratio_ref.exp();

                weights[t] = (-d_surrogate + beta * d_kl) / n;
            }
        }

        let policy_loss = -total_surrogate / n;
        let kl = total_kl / n;
        let loss = policy_loss + beta * kl;
        let mean_ratio = total_ratio / n;
        let clip_fraction = num_clipped as f64 / n;

        debug!(
            loss,
            policy_loss,
            kl,
            mean_ratio,
            clip_fraction,
            valid_tokens = n_tokens,
            "GRPO objective computed over {} completions",
            samples.len()
        );

        Ok(PolicyLoss {
            loss,
            policy_loss,
            kl,
            mean_ratio,
            clip_fraction,
            valid_tokens: n_tokens,
            token_weights,
        })
    }
}
