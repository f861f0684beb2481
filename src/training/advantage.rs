//! GRPO advantage estimation utilities.
//!
//! Implements group-relative advantage normalization:
//!
//!   A_i = (R_i - mean({R_j}_{j=1}^G)) / (std({R_j}_{j=1}^G) + eps)
//!
//! along with the importance ratio and PPO-style clipping used by the
//! objective. Each group is normalized on its own; no statistics cross groups.

/// Mean and population standard deviation of a set of values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GroupStats {
    pub mean: f64,
    pub std: f64,
}

impl GroupStats {
    /// Population statistics (divide by N: the group is the whole population).
    /// Empty input yields zeros.
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: variance.sqrt(),
        }
    }
}

/// Whether a group carries no relative signal: every reward is identical.
pub fn is_degenerate_group(rewards: &[f64]) -> bool {
    match rewards.first() {
        Some(first) => rewards.iter().all(|r| r == first),
        None => true,
    }
}

/// Compute group-relative advantages for a group of G rewards.
///
/// # Edge cases
///
/// - If `rewards` is empty, returns an empty vector.
/// - If every reward is identical (std exactly 0), every advantage is exactly
///   0.0: no completion is preferred over another.
pub fn compute_group_advantages(rewards: &[f64], epsilon: f64) -> Vec<f64> {
    if is_degenerate_group(rewards) {
        return vec![0.0; rewards.len()];
    }

    let stats = GroupStats::of(rewards);
    if stats.std == 0.0 {
        return vec![0.0; rewards.len()];
    }

    rewards
        .iter()
        .map(|r| (r - stats.mean) / (stats.std + epsilon))
        .collect()
}

/// Per-token ratio pi_theta / pi_sampling, recovered from the log-probs.
///
/// Sequences are never scored by multiplying raw probabilities; only the
/// difference of the two log values is exponentiated.
pub fn compute_importance_ratio(current_lp: f64, sampling_lp: f64) -> f64 {
    let log_ratio = current_lp - sampling_lp;
    log_ratio.exp()
}

/// Bound a ratio to the trust region `1 ± epsilon`.
pub fn clip_ratio(ratio: f64, epsilon: f64) -> f64 {
    let (lo, hi) = (1.0 - epsilon, 1.0 + epsilon);
    ratio.clamp(lo, hi)
}
