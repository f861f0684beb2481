//! Group sampling.
//!
//! [`GroupSampler`] asks the policy for exactly `G` completions per prompt and
//! normalizes truncation: anything longer than the completion limit is cut at
//! the limit, and a completion the policy stopped for length is flagged.
//! Truncated completions are kept, never discarded.

use anyhow::{bail, Context, Result};
use futures::future::try_join_all;
use tracing::debug;

use crate::config::DecodingConfig;
use crate::model::{Completion, FinishReason, PolicyModel, Prompt};

/// Produces fixed-size groups of completions from a policy.
#[derive(Debug, Clone)]
pub struct GroupSampler {
    group_size: usize,
    decoding: DecodingConfig,
}

impl GroupSampler {
    pub fn new(group_size: usize, decoding: DecodingConfig) -> Self {
        Self {
            group_size,
            decoding,
        }
    }

    /// Sample one group of `G` completions for `prompt`.
    ///
    /// # Errors
    ///
    /// Fails if the policy fails or returns a group of the wrong size.
    pub async fn sample_group<P: PolicyModel>(
        &self,
        policy: &P,
        prompt: &Prompt,
    ) -> Result<Vec<Completion>> {
        let mut group = policy
            .sample(prompt, self.group_size, &self.decoding)
            .await
            .with_context(|| format!("sampling failed for prompt {}", prompt.id))?;

        if group.len() != self.group_size {
            bail!(
                "policy returned {} completions for prompt {}, expected {}",
                group.len(),
                prompt.id,
                self.group_size
            );
        }

        let max_len = self.decoding.max_completion_length;
        let mut truncated = 0usize;
        for completion in &mut group {
            if completion.num_tokens() > max_len {
                completion.truncate_at(max_len);
            } else if completion.finish_reason == FinishReason::Length && !completion.is_truncated() {
                completion.truncate_at(completion.num_tokens());
            }
            if completion.is_truncated() {
                truncated += 1;
            }
        }

        debug!(
            prompt = %prompt.id,
            group_size = group.len(),
            truncated,
            "Sampled group"
        );
        Ok(group)
    }

    /// Sample a group for every prompt concurrently; groups come back in
    /// prompt order.
    pub async fn sample_batch<P: PolicyModel>(
        &self,
        policy: &P,
        prompts: &[Prompt],
    ) -> Result<Vec<Vec<Completion>>> {
        try_join_all(prompts.iter().map(|p| self.sample_group(policy, p))).await
    }
}
