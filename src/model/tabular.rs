//! In-process bigram softmax policy.
//!
//! [`TabularPolicy`] keeps one row of logits per context token (plus a start
//! row) and samples completions token by token. It implements the full
//! [`PolicyModel`] capability with exact log-probabilities and analytic
//! gradients, which makes it the backend for `--mock` runs and for exercising
//! the training loop in tests without a model server.
//!
//! Log-probabilities are always reported under the raw policy distribution
//! `softmax(logits)`; temperature, top-k, top-p and repetition penalty only
//! shape which token is drawn.

use std::cmp::Reverse;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DecodingConfig;

use super::policy::{GradientTerm, PolicyModel, PolicyView};
use super::types::{Completion, FinishReason, Prompt};

/// The end-of-sequence token, always vocabulary id 0.
pub const EOS_TOKEN: &str = "<eos>";
const EOS_ID: usize = 0;

// ---------------------------------------------------------------------------
// Parameters and snapshots
// ---------------------------------------------------------------------------

/// Bigram logits, row-major `(vocab_size + 1) x vocab_size`.
///
/// Row `c < vocab_size` holds the next-token logits after token `c`; the last
/// row is the start-of-completion context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabularParams {
    pub vocab_size: usize,
    pub logits: Vec<f64>,
}

impl TabularParams {
    pub fn zeros(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            logits: vec![0.0; (vocab_size + 1) * vocab_size],
        }
    }

    fn row(&self, context: usize) -> &[f64] {
        let v = self.vocab_size;
        &self.logits[context * v..(context + 1) * v]
    }

    fn context(&self, prev: Option<u32>) -> usize {
        prev.map(|p| p as usize).unwrap_or(self.vocab_size)
    }
}

/// A frozen, cheaply clonable copy of the parameters.
///
/// Snapshots share their buffer with the policy until the next optimizer
/// step, which always allocates fresh parameters instead of writing in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TabularParams", into = "TabularParams")]
pub struct TabularSnapshot {
    params: Arc<TabularParams>,
}

impl TabularSnapshot {
    pub fn params(&self) -> &TabularParams {
        &self.params
    }
}

impl From<TabularParams> for TabularSnapshot {
    fn from(params: TabularParams) -> Self {
        Self {
            params: Arc::new(params),
        }
    }
}

impl From<TabularSnapshot> for TabularParams {
    fn from(snapshot: TabularSnapshot) -> Self {
        Arc::unwrap_or_clone(snapshot.params)
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// A bigram language policy trained with plain SGD.
pub struct TabularPolicy {
    vocab: Vec<String>,
    params: Arc<TabularParams>,
    pending: Option<Vec<f64>>,
    learning_rate: f64,
    rng: Mutex<StdRng>,
}

impl TabularPolicy {
    /// Create a uniform policy over `vocab` (plus [`EOS_TOKEN`] at id 0).
    pub fn new(vocab: Vec<String>, learning_rate: f64, seed: u64) -> Result<Self> {
        let mut tokens = vec![EOS_TOKEN.to_string()];
        for token in vocab {
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
        if tokens.len() < 2 {
            bail!("tabular policy needs at least one token besides {EOS_TOKEN}");
        }
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            bail!("learning rate must be positive, got {learning_rate}");
        }

        let params = TabularParams::zeros(tokens.len());
        Ok(Self {
            vocab: tokens,
            params: Arc::new(params),
            pending: None,
            learning_rate,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    pub fn vocab(&self) -> &[String] {
        &self.vocab
    }

    pub fn params(&self) -> &TabularParams {
        &self.params
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.vocab.iter().position(|t| t == token).map(|i| i as u32)
    }

    /// Join the tokens of `ids` with spaces, dropping end-of-sequence.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&id| id as usize != EOS_ID)
            .filter_map(|&id| self.vocab.get(id as usize))
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Overwrite one logit. Existing snapshots are left untouched.
    pub fn set_logit(&mut self, context: Option<u32>, token: u32, value: f64) {
        let params = Arc::make_mut(&mut self.params);
        let v = params.vocab_size;
        let row = params.context(context);
        params.logits[row * v + token as usize] = value;
    }

    /// Probability of `token` following `context` under the current parameters.
    pub fn probability(&self, context: Option<u32>, token: u32) -> f64 {
        let row = self.params.row(self.params.context(context));
        softmax(row)[token as usize]
    }

    fn sample_one(
        &self,
        params: &TabularParams,
        rng: &mut StdRng,
        decoding: &DecodingConfig,
    ) -> Completion {
        let mut ids: Vec<u32> = Vec::new();
        let mut log_probs = Vec::new();
        let mut finish_reason = FinishReason::Length;
        let mut prev = None;

        for _ in 0..decoding.max_completion_length {
            let row = params.row(params.context(prev));
            let raw = log_softmax(row);
            let probs = decoding_distribution(row, &ids, decoding);
            let token = draw(&probs, rng);

            ids.push(token as u32);
            log_probs.push(raw[token]);

            if token == EOS_ID {
                finish_reason = FinishReason::Stop;
                break;
            }
            prev = Some(token as u32);
        }

        Completion::new(self.decode(&ids), ids, log_probs, finish_reason)
    }
}

impl PolicyModel for TabularPolicy {
    type Snapshot = TabularSnapshot;

    async fn sample(
        &self,
        prompt: &Prompt,
        group_size: usize,
        decoding: &DecodingConfig,
    ) -> Result<Vec<Completion>> {
        // One independent stream per completion.
        let seeds: Vec<u64> = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| anyhow!("tabular policy rng lock poisoned"))?;
            (0..group_size).map(|_| rng.gen()).collect()
        };

        let params = Arc::clone(&self.params);
        let completions: Vec<Completion> = seeds
            .into_iter()
            .map(|seed| {
                let mut rng = StdRng::seed_from_u64(seed);
                self.sample_one(&params, &mut rng, decoding)
            })
            .collect();

        debug!(prompt = %prompt.id, group_size, "sampled tabular group");
        Ok(completions)
    }

    async fn log_probabilities(
        &self,
        _prompt: &Prompt,
        completion: &Completion,
        view: PolicyView<'_, TabularSnapshot>,
    ) -> Result<Vec<f64>> {
        let params: &TabularParams = match view {
            PolicyView::Current => self.params.as_ref(),
            PolicyView::Frozen(snapshot) => snapshot.params.as_ref(),
        };

        let mut prev = None;
        let mut out = Vec::with_capacity(completion.token_ids.len());
        for &id in &completion.token_ids {
            if id as usize >= params.vocab_size {
                bail!(
                    "token id {id} outside vocabulary of size {}",
                    params.vocab_size
                );
            }
            let row = params.row(params.context(prev));
            out.push(log_softmax(row)[id as usize]);
            prev = Some(id);
        }
        Ok(out)
    }

    async fn backward(&mut self, terms: &[GradientTerm<'_>]) -> Result<f64> {
        let params = &self.params;
        let v = params.vocab_size;
        let mut grad = vec![0.0; params.logits.len()];

        for term in terms {
            let mut prev = None;
            for (&id, &weight) in term.completion.token_ids.iter().zip(term.token_weights) {
                if id as usize >= v {
                    bail!("token id {id} outside vocabulary of size {v}");
                }
                let context = params.context(prev);
                let probs = softmax(params.row(context));
                // d log p(id) / d logit_j = 1[j == id] - p_j
                for (j, p) in probs.iter().enumerate() {
                    let indicator = if j == id as usize { 1.0 } else { 0.0 };
                    grad[context * v + j] += weight * (indicator - p);
                }
                prev = Some(id);
            }
        }

        let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        self.pending = Some(grad);
        Ok(norm)
    }

    async fn apply_gradient(&mut self) -> Result<()> {
        let grad = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("no accumulated gradient to apply"))?;

        let lr = self.learning_rate;
        let logits = self
            .params
            .logits
            .iter()
            .zip(&grad)
            .map(|(w, g)| w - lr * g)
            .collect();

        self.params = Arc::new(TabularParams {
            vocab_size: self.params.vocab_size,
            logits,
        });
        Ok(())
    }

    async fn discard_gradient(&mut self) -> Result<()> {
        self.pending = None;
        Ok(())
    }

    async fn snapshot(&self) -> Result<TabularSnapshot> {
        Ok(TabularSnapshot {
            params: Arc::clone(&self.params),
        })
    }

    async fn restore(&mut self, snapshot: TabularSnapshot) -> Result<()> {
        if snapshot.params.vocab_size != self.vocab.len() {
            bail!(
                "snapshot vocabulary size {} does not match policy vocabulary size {}",
                snapshot.params.vocab_size,
                self.vocab.len()
            );
        }
        self.params = snapshot.params;
        self.pending = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Numerics
// ---------------------------------------------------------------------------

fn log_softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let lse = max + logits.iter().map(|l| (l - max).exp()).sum::<f64>().ln();
    logits.iter().map(|l| l - lse).collect()
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    log_softmax(logits).into_iter().map(f64::exp).collect()
}

/// The distribution tokens are actually drawn from.
fn decoding_distribution(row: &[f64], generated: &[u32], decoding: &DecodingConfig) -> Vec<f64> {
    let mut logits = row.to_vec();

    if decoding.repetition_penalty != 1.0 {
        let mut seen = vec![false; logits.len()];
        for &id in generated {
            seen[id as usize] = true;
        }
        for (logit, _) in logits.iter_mut().zip(&seen).filter(|(_, s)| **s) {
            *logit = if *logit > 0.0 {
                *logit / decoding.repetition_penalty
            } else {
                *logit * decoding.repetition_penalty
            };
        }
    }

    for logit in &mut logits {
        *logit /= decoding.temperature;
    }
    let mut probs = softmax(&logits);

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by_key(|&i| Reverse(OrderedFloat(probs[i])));

    let mut keep = order.len();
    if decoding.top_k > 0 {
        keep = keep.min(decoding.top_k);
    }
    if decoding.top_p < 1.0 {
        let mut cumulative = 0.0;
        for (rank, &i) in order[..keep].iter().enumerate() {
            cumulative += probs[i];
            if cumulative >= decoding.top_p {
                keep = rank + 1;
                break;
            }
        }
    }
    for &i in &order[keep..] {
        probs[i] = 0.0;
    }

    let total: f64 = probs.iter().sum();
    probs.iter_mut().for_each(|p| *p /= total);
    probs
}

fn draw(probs: &[f64], rng: &mut StdRng) -> usize {
    let u: f64 = rng.gen();
    let mut cumulative = 0.0;
    let mut last_nonzero = 0;
    for (i, p) in probs.iter().enumerate() {
        if *p > 0.0 {
            last_nonzero = i;
        }
        cumulative += p;
        if u < cumulative {
            return i;
        }
    }
    last_nonzero
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vec<String> {
        vec!["yes".into(), "no".into(), "maybe".into()]
    }

    fn decoding(max_len: usize) -> DecodingConfig {
        DecodingConfig {
            max_completion_length: max_len,
            ..DecodingConfig::default()
        }
    }

    #[test]
    fn test_new_places_eos_first() {
        let policy = TabularPolicy::new(vocab(), 0.1, 7).unwrap();
        assert_eq!(policy.vocab()[0], EOS_TOKEN);
        assert_eq!(policy.vocab().len(), 4);
        assert_eq!(policy.token_id("maybe"), Some(3));
        assert_eq!(policy.decode(&[1, 2, 0]), "yes no");
    }

    #[test]
    fn test_new_rejects_empty_vocab() {
        assert!(TabularPolicy::new(Vec::new(), 0.1, 0).is_err());
        assert!(TabularPolicy::new(vocab(), 0.0, 0).is_err());
    }

    #[tokio::test]
    async fn test_sample_group_shape() {
        let policy = TabularPolicy::new(vocab(), 0.1, 7).unwrap();
        let prompt = Prompt::from_user_text("say yes");
        let group = policy.sample(&prompt, 6, &decoding(5)).await.unwrap();

        assert_eq!(group.len(), 6);
        for c in &group {
            assert!(c.num_tokens() >= 1 && c.num_tokens() <= 5);
            assert_eq!(c.token_ids.len(), c.token_log_probs.len());
            if c.finish_reason == FinishReason::Stop {
                assert_eq!(*c.token_ids.last().unwrap(), 0);
            } else {
                assert_eq!(c.num_tokens(), 5);
            }
        }
    }

    #[tokio::test]
    async fn test_sampling_log_probs_match_current_view() {
        let mut policy = TabularPolicy::new(vocab(), 0.1, 11).unwrap();
        policy.set_logit(None, 1, 2.0);
        let prompt = Prompt::from_user_text("q");
        let group = policy.sample(&prompt, 4, &decoding(8)).await.unwrap();

        for c in &group {
            let lps = policy
                .log_probabilities(&prompt, c, PolicyView::Current)
                .await
                .unwrap();
            assert_eq!(lps.len(), c.token_log_probs.len());
            for (a, b) in lps.iter().zip(&c.token_log_probs) {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    #[tokio::test]
    async fn test_top_k_one_is_greedy() {
        let mut policy = TabularPolicy::new(vocab(), 0.1, 3).unwrap();
        policy.set_logit(None, 2, 3.0);
        let config = DecodingConfig {
            top_k: 1,
            max_completion_length: 1,
            ..DecodingConfig::default()
        };
        let prompt = Prompt::from_user_text("q");
        let group = policy.sample(&prompt, 8, &config).await.unwrap();
        assert!(group.iter().all(|c| c.token_ids == vec![2]));
    }

    #[tokio::test]
    async fn test_suppressed_eos_hits_length_limit() {
        let mut policy = TabularPolicy::new(vocab(), 0.1, 5).unwrap();
        for ctx in [None, Some(1), Some(2), Some(3)] {
            policy.set_logit(ctx, 0, -1e3);
        }
        let prompt = Prompt::from_user_text("q");
        let group = policy.sample(&prompt, 3, &decoding(4)).await.unwrap();
        for c in &group {
            assert_eq!(c.finish_reason, FinishReason::Length);
            assert_eq!(c.num_tokens(), 4);
        }
    }

    #[test]
    fn test_decoding_distribution_top_p() {
        let row = vec![0.0, (4.0f64).ln(), (3.0f64).ln(), (2.0f64).ln()];
        // probs = [0.1, 0.4, 0.3, 0.2]
        let config = DecodingConfig {
            top_p: 0.65,
            ..DecodingConfig::default()
        };
        let probs = decoding_distribution(&row, &[], &config);
        assert!(probs[0].abs() < 1e-12);
        assert!(probs[3].abs() < 1e-12);
        assert!((probs[1] - 4.0 / 7.0).abs() < 1e-9);
        assert!((probs[2] - 3.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_repetition_penalty_lowers_seen_tokens() {
        let row = vec![0.0, 1.0, 1.0];
        let config = DecodingConfig {
            repetition_penalty: 2.0,
            ..DecodingConfig::default()
        };
        let probs = decoding_distribution(&row, &[1], &config);
        assert!(probs[1] < probs[2]);
    }

    #[tokio::test]
    async fn test_gradient_step_raises_favoured_token() {
        let mut policy = TabularPolicy::new(vocab(), 0.5, 1).unwrap();
        let prompt = Prompt::from_user_text("q");
        let completion = Completion::new("yes", vec![1], vec![-(4.0f64).ln()], FinishReason::Length);
        let before = policy.probability(None, 1);

        // Negative d(loss)/d(logp) means increasing logp lowers the loss.
        let weights = [-1.0];
        let terms = [GradientTerm {
            prompt: &prompt,
            completion: &completion,
            token_weights: &weights,
        }];
        let norm = policy.backward(&terms).await.unwrap();
        assert!(norm > 0.0);
        policy.apply_gradient().await.unwrap();

        assert!(policy.probability(None, 1) > before);
    }

    #[tokio::test]
    async fn test_snapshot_is_frozen() {
        let mut policy = TabularPolicy::new(vocab(), 0.5, 1).unwrap();
        let prompt = Prompt::from_user_text("q");
        let completion = Completion::new("no", vec![2, 0], vec![-1.0, -1.0], FinishReason::Stop);
        let snapshot = policy.snapshot().await.unwrap();
        let frozen_before = policy
            .log_probabilities(&prompt, &completion, PolicyView::Frozen(&snapshot))
            .await
            .unwrap();

        let weights = [-1.0, -1.0];
        let terms = [GradientTerm {
            prompt: &prompt,
            completion: &completion,
            token_weights: &weights,
        }];
        policy.backward(&terms).await.unwrap();
        policy.apply_gradient().await.unwrap();

        let frozen_after = policy
            .log_probabilities(&prompt, &completion, PolicyView::Frozen(&snapshot))
            .await
            .unwrap();
        let current = policy
            .log_probabilities(&prompt, &completion, PolicyView::Current)
            .await
            .unwrap();
        assert_eq!(frozen_before, frozen_after);
        assert!(current[0] > frozen_after[0]);
        assert_ne!(&snapshot, &policy.snapshot().await.unwrap());
    }

    #[tokio::test]
    async fn test_discarded_gradient_cannot_be_applied() {
        let mut policy = TabularPolicy::new(vocab(), 0.5, 1).unwrap();
        let prompt = Prompt::from_user_text("q");
        let completion = Completion::new("yes", vec![1], vec![-1.0], FinishReason::Length);
        let weights = [1.0];
        let terms = [GradientTerm {
            prompt: &prompt,
            completion: &completion,
            token_weights: &weights,
        }];
        policy.backward(&terms).await.unwrap();
        policy.discard_gradient().await.unwrap();
        assert!(policy.apply_gradient().await.is_err());
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_snapshot() {
        let mut policy = TabularPolicy::new(vocab(), 0.5, 1).unwrap();
        let foreign = TabularSnapshot::from(TabularParams::zeros(9));
        assert!(policy.restore(foreign).await.is_err());
    }

    #[tokio::test]
    async fn test_out_of_vocab_token_is_an_error() {
        let policy = TabularPolicy::new(vocab(), 0.5, 1).unwrap();
        let prompt = Prompt::from_user_text("q");
        let completion = Completion::new("?", vec![42], vec![-1.0], FinishReason::Stop);
        assert!(policy
            .log_probabilities(&prompt, &completion, PolicyView::Current)
            .await
            .is_err());
    }
}
