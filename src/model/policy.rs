//! The policy capability the training loop drives.
//!
//! Any backend (an in-process model, a remote policy server, ...) implements
//! [`PolicyModel`] so the update controller can sample from it, score
//! completions under live or frozen parameters, and update it uniformly.

use anyhow::Result;

use crate::config::DecodingConfig;

use super::types::{Completion, Prompt};

/// Which parameters a log-probability query is evaluated under.
#[derive(Debug)]
pub enum PolicyView<'a, S> {
    /// The live, trainable parameters.
    Current,
    /// A frozen snapshot, e.g. the reference policy.
    Frozen(&'a S),
}

impl<S> Clone for PolicyView<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for PolicyView<'_, S> {}

/// One completion's contribution to the policy gradient.
///
/// `token_weights[t]` is d(loss)/d(log pi_theta(token_t)); a backend
/// back-propagates `sum_t token_weights[t] * grad log pi_theta(token_t)`.
#[derive(Debug, Clone, Copy)]
pub struct GradientTerm<'a> {
    pub prompt: &'a Prompt,
    pub completion: &'a Completion,
    pub token_weights: &'a [f64],
}

/// The capability set the update controller needs from a policy.
///
/// Gradient application is split into `backward` (accumulate, report the
/// gradient norm) and `apply_gradient` (optimizer step) so the controller can
/// inspect the norm and call `discard_gradient` instead of committing.
#[allow(async_fn_in_trait)]
pub trait PolicyModel: Send + Sync {
    /// An immutable copy of the trainable parameters.
    type Snapshot: Clone + Send + Sync;

    /// Sample `group_size` independent completions for `prompt`.
    async fn sample(
        &self,
        prompt: &Prompt,
        group_size: usize,
        decoding: &DecodingConfig,
    ) -> Result<Vec<Completion>>;

    /// Per-token log-probabilities of `completion` given `prompt`.
    async fn log_probabilities(
        &self,
        prompt: &Prompt,
        completion: &Completion,
        view: PolicyView<'_, Self::Snapshot>,
    ) -> Result<Vec<f64>>;

    /// Accumulate gradients for the given terms and return the global L2 norm.
    async fn backward(&mut self, terms: &[GradientTerm<'_>]) -> Result<f64>;

    /// Apply the accumulated gradient with one optimizer step.
    async fn apply_gradient(&mut self) -> Result<()>;

    /// Drop any accumulated gradient without touching the parameters.
    async fn discard_gradient(&mut self) -> Result<()>;

    /// Capture the current parameters.
    async fn snapshot(&self) -> Result<Self::Snapshot>;

    /// Replace the current parameters with `snapshot`.
    async fn restore(&mut self, snapshot: Self::Snapshot) -> Result<()>;

    /// Free a snapshot the caller no longer needs.
    ///
    /// Backends whose snapshots are plain values drop them here; backends
    /// that pin weights elsewhere unpin them.
    async fn release(&mut self, snapshot: Self::Snapshot) -> Result<()> {
        drop(snapshot);
        Ok(())
    }
}
