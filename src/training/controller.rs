//! The GRPO update controller.
//!
//! One controller owns the policy, the frozen reference snapshot, the reward
//! evaluator and the sinks, and runs strictly sequential steps:
//!
//! ```text
//! IDLE -> SAMPLING -> SCORING -> UPDATING -> (CHECKPOINT) -> IDLE
//!   any state --fatal--> STOPPED
//! ```
//!
//! 1. **Sampling** -- one group of G completions per prompt, concurrently.
//! 2. **Scoring** -- every completion scored concurrently, then group-relative
//!    advantages per group. Groups with a non-finite reward are dropped.
//! 3. **Updating** -- reference log-probs once, then `updates_per_batch`
//!    passes of objective, backward and optimizer step. The divergence guard
//!    skips the optimizer step when the loss or gradient norm is non-finite or
//!    above the bound; too many consecutive skips stop training.
//! 4. **Checkpoint** -- persist the current snapshot and refresh the reference
//!    on their cadences.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TrainerConfig;
use crate::data::PromptSource;
use crate::error::{TrainerError, TrainerResult};
use crate::model::{Completion, GradientTerm, PolicyModel, PolicyView, Prompt};
use crate::reward::{GroupRewards, RewardEvaluator, RewardModel};

use super::advantage::{compute_group_advantages, is_degenerate_group, GroupStats};
use super::checkpoint::CheckpointSink;
use super::objective::{GrpoObjective, ObjectiveSample, PolicyLoss};
use super::observe::StepObserver;
use super::record::{SkipReason, StepRecord};
use super::sampler::GroupSampler;

// ---------------------------------------------------------------------------
// State and stop signal
// ---------------------------------------------------------------------------

/// Where the controller is in its step cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Sampling,
    Scoring,
    Updating,
    Checkpoint,
    /// Terminal.
    Stopped,
}

/// Shared cancellation flag, honored at the next step boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of [`UpdateController::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Steps executed by this call.
    pub steps_run: u64,
    /// Step counter when the run ended.
    pub final_step: u64,
    pub skipped_steps: u64,
    /// Completed passes over the prompt source.
    pub epochs: u64,
    pub last_loss: Option<f64>,
    /// The run ended on a stop request rather than the step target.
    pub stopped: bool,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// One completion that takes part in the update.
struct Entry<'a> {
    prompt: &'a Prompt,
    completion: &'a Completion,
    advantage: f64,
}

/// What the update phase produced.
#[derive(Default)]
struct UpdateOutcome {
    loss: Option<PolicyLoss>,
    grad_norm: Option<f64>,
    skipped: Option<SkipReason>,
}

/// Drives GRPO training of a [`PolicyModel`].
pub struct UpdateController<P: PolicyModel, R, C, O> {
    config: TrainerConfig,
    policy: P,
    reference: P::Snapshot,
    rewards: RewardEvaluator<R>,
    sampler: GroupSampler,
    objective: GrpoObjective,
    checkpoints: C,
    observer: O,
    state: ControllerState,
    step: u64,
    consecutive_skips: usize,
    stop: StopHandle,
}

impl<P, R, C, O> UpdateController<P, R, C, O>
where
    P: PolicyModel,
    R: RewardModel,
    C: CheckpointSink<P::Snapshot>,
    O: StepObserver,
{
    /// Validate `config` and capture the current policy as the reference.
    pub async fn new(
        config: TrainerConfig,
        policy: P,
        reward: R,
        checkpoints: C,
        observer: O,
    ) -> TrainerResult<Self> {
        config.validate()?;
        let reference = policy.snapshot().await?;

        let rewards = RewardEvaluator::new(reward, config.reward.min_reward);
        let sampler = GroupSampler::new(config.rl.group_size, config.decoding.clone());
        let objective = GrpoObjective::new(&config.rl);

        Ok(Self {
            config,
            policy,
            reference,
            rewards,
            sampler,
            objective,
            checkpoints,
            observer,
            state: ControllerState::Idle,
            step: 0,
            consecutive_skips: 0,
            stop: StopHandle::new(),
        })
    }

    /// Continue counting from `step`, e.g. after restoring a checkpoint.
    pub fn with_start_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn into_policy(self) -> P {
        self.policy
    }

    pub fn reference(&self) -> &P::Snapshot {
        &self.reference
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn checkpoints(&self) -> &C {
        &self.checkpoints
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn consecutive_skips(&self) -> usize {
        self.consecutive_skips
    }

    /// Replace the reference with a fresh snapshot of the current policy.
    pub async fn refresh_reference(&mut self) -> TrainerResult<()> {
        let fresh = self.policy.snapshot().await?;
        let previous = std::mem::replace(&mut self.reference, fresh);
        self.release_snapshot(previous).await;
        info!(step = self.step, "Reference policy refreshed");
        Ok(())
    }

    /// Run one full training step on `prompts`.
    ///
    /// Any error leaves the controller [`ControllerState::Stopped`] with no
    /// pending gradient.
    pub async fn train_step(&mut self, prompts: &[Prompt]) -> TrainerResult<StepRecord> {
        if self.state == ControllerState::Stopped {
            return Err(TrainerError::Stopped { step: self.step });
        }

        match self.execute_step(prompts).await {
            Ok(record) => {
                self.state = ControllerState::Idle;
                Ok(record)
            }
            Err(e) => {
                self.state = ControllerState::Stopped;
                if let Err(discard) = self.policy.discard_gradient().await {
                    warn!(error = %discard, "Failed to discard pending gradient");
                }
                Err(e)
            }
        }
    }

    /// Train until `rl.training_steps` is reached or a stop is requested.
    ///
    /// The source is restarted whenever a pass is exhausted.
    pub async fn run<D: PromptSource>(&mut self, data: &mut D) -> TrainerResult<TrainingSummary> {
        let target = self.config.rl.training_steps;
        let batch_size = self.config.rl.batch_size;

        info!(
            start_step = self.step,
            target,
            batch_size,
            group_size = self.config.rl.group_size,
            kl_coeff = self.config.rl.kl_coeff,
            clip_epsilon = self.config.rl.clip_epsilon,
            prompts = ?data.len_hint(),
            "Starting GRPO training"
        );

        let mut summary = TrainingSummary {
            steps_run: 0,
            final_step: self.step,
            skipped_steps: 0,
            epochs: 0,
            last_loss: None,
            stopped: false,
        };

        while self.step < target {
            if self.stop.is_stop_requested() {
                info!(step = self.step, "Stop requested, ending training");
                self.state = ControllerState::Stopped;
                summary.stopped = true;
                break;
            }

            let batch = match data.next_batch(batch_size)? {
                Some(batch) if !batch.is_empty() => batch,
                _ => {
                    summary.epochs += 1;
                    debug!(epoch = summary.epochs, "Prompt source exhausted, restarting");
                    data.restart()?;
                    match data.next_batch(batch_size)? {
                        Some(batch) if !batch.is_empty() => batch,
                        _ => return Err(anyhow!("prompt source yielded no prompts").into()),
                    }
                }
            };

            let record = self.train_step(&batch).await?;
            summary.steps_run += 1;
            if record.was_skipped() {
                summary.skipped_steps += 1;
            } else {
                summary.last_loss = Some(record.loss);
            }
        }

        summary.final_step = self.step;
        info!(
            steps_run = summary.steps_run,
            final_step = summary.final_step,
            skipped = summary.skipped_steps,
            epochs = summary.epochs,
            "GRPO training finished"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Step phases
    // ------------------------------------------------------------------

    async fn execute_step(&mut self, prompts: &[Prompt]) -> TrainerResult<StepRecord> {
        if prompts.is_empty() {
            return Err(anyhow!("cannot run a training step on an empty batch").into());
        }

        // Sampling.
        self.state = ControllerState::Sampling;
        let groups = self.sampler.sample_batch(&self.policy, prompts).await?;
        let truncated_completions = groups
            .iter()
            .flatten()
            .filter(|c| c.is_truncated())
            .count();

        // Scoring.
        self.state = ControllerState::Scoring;
        let scored = self.rewards.evaluate_batch(prompts, &groups).await;
        let advantages = self.group_advantages(prompts, &scored);

        // Updating.
        self.state = ControllerState::Updating;
        let entries: Vec<Entry<'_>> = prompts
            .iter()
            .zip(&groups)
            .zip(&scored)
            .zip(&advantages)
            .filter(|(((_, _), rewards), _)| rewards.is_valid())
            .flat_map(|(((prompt, group), _), advs)| {
                group.iter().zip(advs).map(move |(completion, &advantage)| Entry {
                    prompt,
                    completion,
                    advantage,
                })
            })
            .collect();

        let outcome = if entries.is_empty() {
            warn!(step = self.step + 1, "No valid groups this step");
            UpdateOutcome {
                skipped: Some(SkipReason::NoLearningSignal),
                ..UpdateOutcome::default()
            }
        } else {
            self.update(&entries).await?
        };

        self.step += 1;
        match outcome.skipped {
            None => self.consecutive_skips = 0,
            Some(reason) if reason.counts_toward_divergence() => self.consecutive_skips += 1,
            Some(_) => {}
        }

        let limit = self.config.schedule.max_consecutive_skips;
        let diverged = self.consecutive_skips >= limit;

        // Checkpoint and reference refresh.
        let mut checkpointed = false;
        let mut reference_refreshed = false;
        if !diverged {
            self.state = ControllerState::Checkpoint;
            let sched = &self.config.schedule;
            let checkpoint_due = on_cadence(self.step, sched.checkpoint_interval);
            let refresh_due = on_cadence(self.step, sched.reference_refresh_interval);

            if checkpoint_due {
                // Not released: a persisted snapshot may only be a handle to
                // weights the backend keeps.
                let snapshot = self.policy.snapshot().await?;
                self.checkpoints.persist(self.step, &snapshot).await?;
                checkpointed = true;
            }
            if refresh_due {
                self.refresh_reference().await?;
                reference_refreshed = true;
            }
        }

        let record = self.build_record(
            prompts,
            &scored,
            advantages,
            &outcome,
            truncated_completions,
            checkpointed,
            reference_refreshed,
        );
        if let Err(e) = self.observer.record(&record) {
            warn!(step = record.step, error = %e, "Step observer failed");
        }

        if diverged {
            return Err(TrainerError::Divergence {
                step: self.step,
                consecutive_skips: self.consecutive_skips,
                limit,
            });
        }
        Ok(record)
    }

    /// Per-group advantages; empty for groups dropped this step.
    fn group_advantages(&self, prompts: &[Prompt], scored: &[GroupRewards]) -> Vec<Vec<f64>> {
        let epsilon = self.config.rl.advantage_epsilon;
        prompts
            .iter()
            .zip(scored)
            .map(|(prompt, rewards)| {
                if !rewards.is_valid() {
                    warn!(
                        prompt = %prompt.id,
                        non_finite = rewards.non_finite,
                        "Dropping group with non-finite rewards"
                    );
                    return Vec::new();
                }
                let advs = compute_group_advantages(&rewards.rewards, epsilon);
                debug!(
                    prompt = %prompt.id,
                    rewards = ?rewards.rewards,
                    advantages = ?advs,
                    sentinels = rewards.sentinels,
                    "Group advantages"
                );
                advs
            })
            .collect()
    }

    /// Reference log-probs once, then `updates_per_batch` optimizer passes.
    ///
    /// When a pass is skipped or fails after an earlier pass committed, the
    /// policy is restored to its state before the first pass.
    async fn update(&mut self, entries: &[Entry<'_>]) -> TrainerResult<UpdateOutcome> {
        let reference_lps = {
            let policy = &self.policy;
            let reference = &self.reference;
            try_join_all(entries.iter().map(|e| {
                policy.log_probabilities(e.prompt, e.completion, PolicyView::Frozen(reference))
            }))
            .await?
        };

        let passes = self.config.rl.updates_per_batch;
        let mut applied = 0usize;
        if passes <= 1 {
            return self
                .run_passes(entries, &reference_lps, passes, &mut applied)
                .await;
        }

        let restore_point = self.policy.snapshot().await?;
        let result = self
            .run_passes(entries, &reference_lps, passes, &mut applied)
            .await;
        let rollback = applied > 0
            && match &result {
                Ok(outcome) => outcome.skipped.is_some(),
                Err(_) => true,
            };

        if rollback {
            match self.policy.restore(restore_point.clone()).await {
                Ok(()) => debug!(applied, "Rolled back partial update"),
                Err(e) if result.is_err() => {
                    warn!(applied, error = %e, "Failed to roll back partial update");
                }
                Err(e) => {
                    self.release_snapshot(restore_point).await;
                    return Err(e.into());
                }
            }
        }
        self.release_snapshot(restore_point).await;
        result
    }

    /// Objective, guards and optimizer step for each pass. `applied` counts
    /// the committed passes even when a later one errors.
    async fn run_passes(
        &mut self,
        entries: &[Entry<'_>],
        reference_lps: &[Vec<f64>],
        passes: usize,
        applied: &mut usize,
    ) -> TrainerResult<UpdateOutcome> {
        let mut outcome = UpdateOutcome::default();

        for pass in 0..passes {
            let current_lps = {
                let policy = &self.policy;
                try_join_all(entries.iter().map(|e| {
                    policy.log_probabilities(e.prompt, e.completion, PolicyView::Current)
                }))
                .await?
            };

            let samples: Vec<ObjectiveSample<'_>> = entries
                .iter()
                .zip(&current_lps)
                .zip(reference_lps)
                .map(|((e, current), reference)| ObjectiveSample {
                    sampling_log_probs: &e.completion.token_log_probs,
                    current_log_probs: current,
                    reference_log_probs: reference,
                    advantage: e.advantage,
                    valid_len: e.completion.valid_len(),
                    truncated: e.completion.is_truncated(),
                })
                .collect();
            let loss = self.objective.compute(&samples)?;

            if loss.is_empty() {
                outcome.skipped = Some(SkipReason::NoLearningSignal);
                outcome.loss = Some(loss);
                break;
            }
            if let Some(reason) = self.loss_guard(loss.loss) {
                warn!(
                    step = self.step + 1,
                    pass,
                    loss = loss.loss,
                    reason = %reason,
                    "Skipping optimizer step"
                );
                outcome.skipped = Some(reason);
                outcome.loss = Some(loss);
                break;
            }

            let terms: Vec<GradientTerm<'_>> = entries
                .iter()
                .zip(&loss.token_weights)
                .map(|(e, weights)| GradientTerm {
                    prompt: e.prompt,
                    completion: e.completion,
                    token_weights: weights,
                })
                .collect();
            let grad_norm = self.policy.backward(&terms).await?;
            outcome.grad_norm = Some(grad_norm);

            if let Some(reason) = self.gradient_guard(grad_norm) {
                self.policy.discard_gradient().await?;
                warn!(
                    step = self.step + 1,
                    pass,
                    grad_norm,
                    reason = %reason,
                    "Skipping optimizer step"
                );
                outcome.skipped = Some(reason);
                outcome.loss = Some(loss);
                break;
            }

            self.policy.apply_gradient().await?;
            *applied += 1;
            debug!(
                step = self.step + 1,
                pass,
                loss = loss.loss,
                grad_norm,
                "Optimizer step applied"
            );
            outcome.loss = Some(loss);
        }

        Ok(outcome)
    }

    /// Hand a snapshot the controller no longer holds back to the policy.
    async fn release_snapshot(&mut self, snapshot: P::Snapshot) {
        if let Err(e) = self.policy.release(snapshot).await {
            warn!(step = self.step, error = %e, "Failed to release policy snapshot");
        }
    }

    fn loss_guard(&self, loss: f64) -> Option<SkipReason> {
        if !loss.is_finite() {
            Some(SkipReason::NonFiniteLoss)
        } else if loss.abs() > self.config.schedule.divergence_bound {
            Some(SkipReason::LossAboveBound)
        } else {
            None
        }
    }

    fn gradient_guard(&self, grad_norm: f64) -> Option<SkipReason> {
        if !grad_norm.is_finite() {
            Some(SkipReason::NonFiniteGradient)
        } else if grad_norm > self.config.schedule.divergence_bound {
            Some(SkipReason::GradientAboveBound)
        } else {
            None
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &self,
        prompts: &[Prompt],
        scored: &[GroupRewards],
        advantages: Vec<Vec<f64>>,
        outcome: &UpdateOutcome,
        truncated_completions: usize,
        checkpointed: bool,
        reference_refreshed: bool,
    ) -> StepRecord {
        let valid_rewards: Vec<f64> = scored
            .iter()
            .filter(|g| g.is_valid())
            .flat_map(|g| g.rewards.iter().copied())
            .collect();
        let reward_stats = GroupStats::of(&valid_rewards);
        let zero_variance_groups = scored
            .iter()
            .filter(|g| g.is_valid() && is_degenerate_group(&g.rewards))
            .count();

        let (loss, policy_loss, kl, mean_ratio, clip_fraction, valid_tokens) = match &outcome.loss {
            Some(l) => (
                l.loss,
                l.policy_loss,
                l.kl,
                l.mean_ratio,
                l.clip_fraction,
                l.valid_tokens,
            ),
            None => (0.0, 0.0, 0.0, 1.0, 0.0, 0),
        };

        StepRecord {
            step: self.step,
            prompt_ids: prompts.iter().map(|p| p.id.clone()).collect(),
            rewards: scored.iter().map(|g| g.rewards.clone()).collect(),
            advantages,
            reward_mean: reward_stats.mean,
            reward_std: reward_stats.std,
            loss,
            policy_loss,
            kl,
            grad_norm: outcome.grad_norm,
            mean_ratio,
            clip_fraction,
            valid_tokens,
            truncated_completions,
            sentinel_rewards: scored.iter().map(|g| g.sentinels).sum(),
            invalid_groups: scored.iter().filter(|g| !g.is_valid()).count(),
            zero_variance_groups,
            skipped: outcome.skipped,
            consecutive_skips: self.consecutive_skips,
            reference_refreshed,
            checkpointed,
            timestamp: chrono::Utc::now(),
        }
    }
}

fn on_cadence(step: u64, interval: u64) -> bool {
    interval > 0 && step > 0 && step % interval == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use anyhow::{bail, Result};

    use crate::config::DecodingConfig;
    use crate::data::InMemorySource;
    use crate::model::{FinishReason, TabularPolicy, Turn};
    use crate::reward::{RuleReward, WeightedRule, WeightedSum};
    use crate::training::checkpoint::NullCheckpointSink;
    use crate::training::observe::MemoryObserver;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    /// Alternates "yes"/"no" completions; the snapshot is a version counter
    /// bumped by every applied update.
    struct ScriptedPolicy {
        version: u64,
        /// Added to the sampling log-probs under the current view.
        current_shift: f64,
        /// Gradient norms reported by successive `backward` calls.
        grad_norms: Vec<f64>,
        backward_calls: usize,
        pending: bool,
        applied: usize,
        discarded: usize,
        /// Current-view log-prob queries succeed this many times, then fail.
        current_budget: Option<usize>,
        current_calls: AtomicUsize,
        snapshots_taken: AtomicUsize,
        released: Vec<u64>,
    }

    impl ScriptedPolicy {
        fn new() -> Self {
            Self {
                version: 0,
                current_shift: 0.0,
                grad_norms: vec![1.0],
                backward_calls: 0,
                pending: false,
                applied: 0,
                discarded: 0,
                current_budget: None,
                current_calls: AtomicUsize::new(0),
                snapshots_taken: AtomicUsize::new(0),
                released: Vec::new(),
            }
        }
    }

    impl PolicyModel for ScriptedPolicy {
        type Snapshot = u64;

        async fn sample(
            &self,
            _prompt: &Prompt,
            group_size: usize,
            _decoding: &DecodingConfig,
        ) -> Result<Vec<Completion>> {
            Ok((0..group_size)
                .map(|i| {
                    let text = if i % 2 == 0 { "yes" } else { "no" };
                    Completion::new(text, vec![1, 2], vec![-0.5, -0.7], FinishReason::Stop)
                })
                .collect())
        }

        async fn log_probabilities(
            &self,
            _prompt: &Prompt,
            completion: &Completion,
            view: PolicyView<'_, u64>,
        ) -> Result<Vec<f64>> {
            let shift = match view {
                PolicyView::Current => {
                    let calls = self.current_calls.fetch_add(1, Ordering::SeqCst);
                    if self.current_budget.is_some_and(|budget| calls >= budget) {
                        bail!("policy server unreachable");
                    }
                    self.current_shift
                }
                PolicyView::Frozen(_) => 0.0,
            };
            Ok(completion.token_log_probs.iter().map(|lp| lp + shift).collect())
        }

        async fn backward(&mut self, _terms: &[GradientTerm<'_>]) -> Result<f64> {
            let idx = self.backward_calls.min(self.grad_norms.len() - 1);
            self.backward_calls += 1;
            self.pending = true;
            Ok(self.grad_norms[idx])
        }

        async fn apply_gradient(&mut self) -> Result<()> {
            if !self.pending {
                bail!("no pending gradient");
            }
            self.pending = false;
            self.version += 1;
            self.applied += 1;
            Ok(())
        }

        async fn discard_gradient(&mut self) -> Result<()> {
            if self.pending {
                self.discarded += 1;
            }
            self.pending = false;
            Ok(())
        }

        async fn snapshot(&self) -> Result<u64> {
            self.snapshots_taken.fetch_add(1, Ordering::SeqCst);
            Ok(self.version)
        }

        async fn restore(&mut self, snapshot: u64) -> Result<()> {
            self.version = snapshot;
            Ok(())
        }

        async fn release(&mut self, snapshot: u64) -> Result<()> {
            self.released.push(snapshot);
            Ok(())
        }
    }

    enum TestReward {
        /// 1.0 when the completion says "yes".
        Keyword,
        Constant(f64),
        /// NaN for the named prompt, keyword scoring otherwise.
        NanFor(&'static str),
    }

    impl RewardModel for TestReward {
        async fn score(&self, prompt: &Prompt, completion: &Completion) -> Result<f64> {
            let keyword = if completion.text.contains("yes") { 1.0 } else { 0.0 };
            match self {
                Self::Keyword => Ok(keyword),
                Self::Constant(v) => Ok(*v),
                Self::NanFor(id) if prompt.id == *id => Ok(f64::NAN),
                Self::NanFor(_) => Ok(keyword),
            }
        }
    }

    /// Remembers which steps were persisted.
    #[derive(Default)]
    struct RecordingSink {
        steps: Vec<(u64, u64)>,
    }

    impl CheckpointSink<u64> for RecordingSink {
        async fn persist(&mut self, step: u64, snapshot: &u64) -> Result<()> {
            self.steps.push((step, *snapshot));
            Ok(())
        }
    }

    fn config() -> TrainerConfig {
        let mut config = TrainerConfig::default();
        config.rl.group_size = 4;
        config.rl.batch_size = 2;
        config.schedule.checkpoint_interval = 0;
        config.schedule.max_consecutive_skips = 3;
        config
    }

    fn prompts() -> Vec<Prompt> {
        vec![
            Prompt::new("a", vec![Turn::user("say yes")]),
            Prompt::new("b", vec![Turn::user("say yes again")]),
        ]
    }

    async fn controller(
        config: TrainerConfig,
        policy: ScriptedPolicy,
        reward: TestReward,
    ) -> UpdateController<ScriptedPolicy, TestReward, NullCheckpointSink, MemoryObserver> {
        UpdateController::new(
            config,
            policy,
            reward,
            NullCheckpointSink,
            MemoryObserver::default(),
        )
        .await
        .unwrap()
    }

    // ------------------------------------------------------------------
    // Single steps
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut bad = config();
        bad.rl.group_size = 1;
        let result = UpdateController::new(
            bad,
            ScriptedPolicy::new(),
            TestReward::Keyword,
            NullCheckpointSink,
            MemoryObserver::default(),
        )
        .await;
        assert!(matches!(result, Err(TrainerError::Config(_))));
    }

    #[tokio::test]
    async fn test_step_updates_and_records() {
        let mut ctl = controller(config(), ScriptedPolicy::new(), TestReward::Keyword).await;
        let record = ctl.train_step(&prompts()).await.unwrap();

        assert_eq!(record.step, 1);
        assert_eq!(record.skipped, None);
        assert_eq!(record.prompt_ids, vec!["a", "b"]);
        assert_eq!(record.rewards[0], vec![1.0, 0.0, 1.0, 0.0]);
        // mean 0.5, std 0.5
        let expected = 0.5 / (0.5 + 1e-4);
        for (a, sign) in record.advantages[0].iter().zip([1.0, -1.0, 1.0, -1.0]) {
            assert!((a - sign * expected).abs() < 1e-9);
        }
        assert_eq!(record.valid_tokens, 16);
        assert_eq!(record.grad_norm, Some(1.0));
        assert_eq!(ctl.policy().applied, 1);
        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_eq!(ctl.observer().records.len(), 1);
    }

    #[tokio::test]
    async fn test_equal_rewards_give_zero_surrogate() {
        let mut ctl = controller(config(), ScriptedPolicy::new(), TestReward::Constant(5.0)).await;
        let record = ctl.train_step(&prompts()).await.unwrap();

        assert_eq!(record.zero_variance_groups, 2);
        assert!(record.advantages.iter().flatten().all(|a| *a == 0.0));
        assert_eq!(record.policy_loss, 0.0);
        assert_eq!(record.loss, 0.0);
        assert!(record.skipped.is_none());
    }

    #[tokio::test]
    async fn test_nan_loss_leaves_snapshot_identical() {
        let mut policy = ScriptedPolicy::new();
        policy.current_shift = f64::NAN;
        let mut ctl = controller(config(), policy, TestReward::Keyword).await;

        let before = ctl.policy().snapshot().await.unwrap();
        let record = ctl.train_step(&prompts()).await.unwrap();
        let after = ctl.policy().snapshot().await.unwrap();

        assert_eq!(record.skipped, Some(SkipReason::NonFiniteLoss));
        assert_eq!(before, after);
        assert_eq!(ctl.policy().applied, 0);
        assert_eq!(ctl.consecutive_skips(), 1);
        assert_eq!(ctl.step(), 1);
    }

    #[tokio::test]
    async fn test_gradient_above_bound_is_discarded() {
        let mut policy = ScriptedPolicy::new();
        policy.grad_norms = vec![1e9];
        let mut ctl = controller(config(), policy, TestReward::Keyword).await;
        let record = ctl.train_step(&prompts()).await.unwrap();

        assert_eq!(record.skipped, Some(SkipReason::GradientAboveBound));
        assert_eq!(record.grad_norm, Some(1e9));
        assert_eq!(ctl.policy().discarded, 1);
        assert_eq!(ctl.policy().version, 0);
    }

    #[tokio::test]
    async fn test_divergence_is_fatal_at_limit() {
        let mut policy = ScriptedPolicy::new();
        policy.current_shift = f64::NAN;
        let mut ctl = controller(config(), policy, TestReward::Keyword).await;

        for _ in 0..2 {
            let record = ctl.train_step(&prompts()).await.unwrap();
            assert!(record.was_skipped());
        }
        let err = ctl.train_step(&prompts()).await.unwrap_err();
        assert!(err.is_divergence());
        assert_eq!(ctl.state(), ControllerState::Stopped);
        assert_eq!(ctl.observer().records.len(), 3);
        assert_eq!(ctl.policy().version, 0);

        let err = ctl.train_step(&prompts()).await.unwrap_err();
        assert!(matches!(err, TrainerError::Stopped { step: 3 }));
    }

    #[tokio::test]
    async fn test_successful_step_resets_skip_counter() {
        let mut policy = ScriptedPolicy::new();
        policy.current_shift = f64::NAN;
        let mut ctl = controller(config(), policy, TestReward::Keyword).await;

        ctl.train_step(&prompts()).await.unwrap();
        ctl.train_step(&prompts()).await.unwrap();
        assert_eq!(ctl.consecutive_skips(), 2);

        ctl.policy_mut().current_shift = 0.0;
        ctl.train_step(&prompts()).await.unwrap();
        assert_eq!(ctl.consecutive_skips(), 0);
    }

    #[tokio::test]
    async fn test_non_finite_reward_drops_only_that_group() {
        let mut ctl = controller(config(), ScriptedPolicy::new(), TestReward::NanFor("b")).await;
        let record = ctl.train_step(&prompts()).await.unwrap();

        assert_eq!(record.invalid_groups, 1);
        assert_eq!(record.advantages[0].len(), 4);
        assert!(record.advantages[1].is_empty());
        assert_eq!(record.valid_tokens, 8);
        assert!(record.skipped.is_none());
    }

    #[tokio::test]
    async fn test_all_groups_invalid_is_not_divergence() {
        let mut ctl = controller(config(), ScriptedPolicy::new(), TestReward::Constant(f64::NAN)).await;
        for _ in 0..4 {
            let record = ctl.train_step(&prompts()).await.unwrap();
            assert_eq!(record.skipped, Some(SkipReason::NoLearningSignal));
        }
        assert_eq!(ctl.consecutive_skips(), 0);
        assert_eq!(ctl.policy().version, 0);
    }

    #[tokio::test]
    async fn test_partial_multi_pass_update_is_rolled_back() {
        let mut policy = ScriptedPolicy::new();
        policy.grad_norms = vec![1.0, f64::INFINITY];
        let mut cfg = config();
        cfg.rl.updates_per_batch = 2;
        let mut ctl = controller(cfg, policy, TestReward::Keyword).await;

        let record = ctl.train_step(&prompts()).await.unwrap();
        assert_eq!(record.skipped, Some(SkipReason::NonFiniteGradient));
        assert_eq!(ctl.policy().applied, 1);
        assert_eq!(ctl.policy().version, 0);
    }

    #[tokio::test]
    async fn test_failure_after_committed_pass_is_rolled_back() {
        let mut policy = ScriptedPolicy::new();
        // Two prompts of four completions: the first pass makes 8 queries.
        policy.current_budget = Some(8);
        let mut cfg = config();
        cfg.rl.updates_per_batch = 2;
        let mut ctl = controller(cfg, policy, TestReward::Keyword).await;

        let err = ctl.train_step(&prompts()).await.unwrap_err();
        assert!(err.to_string().contains("unreachable"));
        assert_eq!(ctl.state(), ControllerState::Stopped);
        assert_eq!(ctl.step(), 0);
        assert_eq!(ctl.policy().applied, 1);
        assert_eq!(ctl.policy().version, 0);
        assert!(ctl.observer().records.is_empty());
    }

    #[tokio::test]
    async fn test_superseded_snapshots_are_released() {
        let mut cfg = config();
        cfg.rl.updates_per_batch = 2;
        cfg.schedule.reference_refresh_interval = 1;
        let mut ctl = controller(cfg, ScriptedPolicy::new(), TestReward::Keyword).await;

        for _ in 0..3 {
            ctl.train_step(&prompts()).await.unwrap();
        }
        let policy = ctl.policy();
        let taken = policy.snapshots_taken.load(Ordering::SeqCst);
        // Initial reference, then a restore point and a refresh per step.
        assert_eq!(taken, 7);
        // Only the live reference is still held.
        assert_eq!(policy.released.len(), taken - 1);
        assert!(!policy.released.contains(ctl.reference()));
    }

    // ------------------------------------------------------------------
    // Cadences
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_reference_refresh_equals_current_before_refresh() {
        let mut cfg = config();
        cfg.schedule.reference_refresh_interval = 2;
        let mut ctl = controller(cfg, ScriptedPolicy::new(), TestReward::Keyword).await;

        let first = ctl.train_step(&prompts()).await.unwrap();
        assert!(!first.reference_refreshed);
        assert_eq!(*ctl.reference(), 0);

        let second = ctl.train_step(&prompts()).await.unwrap();
        assert!(second.reference_refreshed);
        let current = ctl.policy().snapshot().await.unwrap();
        assert_eq!(*ctl.reference(), current);
        assert_eq!(current, 2);
    }

    #[tokio::test]
    async fn test_refreshed_reference_scores_like_current_policy() {
        let vocab = vec!["yes".to_string(), "no".to_string()];
        let policy = TabularPolicy::new(vocab, 0.5, 11).unwrap();
        let yes = policy.token_id("yes").unwrap();
        let no = policy.token_id("no").unwrap();

        let mut cfg = TrainerConfig::default();
        cfg.rl.group_size = 4;
        cfg.rl.batch_size = 2;
        cfg.decoding.max_completion_length = 4;
        cfg.schedule.checkpoint_interval = 0;
        cfg.schedule.reference_refresh_interval = 2;
        let reward = WeightedSum::new(vec![WeightedRule {
            weight: 1.0,
            rule: RuleReward::contains("yes"),
        }]);
        let mut ctl = UpdateController::new(
            cfg,
            policy,
            reward,
            NullCheckpointSink,
            MemoryObserver::default(),
        )
        .await
        .unwrap();

        let prompt = Prompt::from_user_text("agree?");
        let completion = Completion::new("yes no", vec![yes, no], vec![-1.0, -1.0], FinishReason::Stop);
        let original = ctl
            .policy()
            .log_probabilities(&prompt, &completion, PolicyView::Frozen(ctl.reference()))
            .await
            .unwrap();

        // Move the live policy away from the reference taken at construction.
        ctl.policy_mut().set_logit(None, yes, 3.0);

        let first = ctl.train_step(&prompts()).await.unwrap();
        assert!(!first.reference_refreshed);
        let second = ctl.train_step(&prompts()).await.unwrap();
        assert!(second.reference_refreshed);

        let current = ctl
            .policy()
            .log_probabilities(&prompt, &completion, PolicyView::Current)
            .await
            .unwrap();
        let reference = ctl
            .policy()
            .log_probabilities(&prompt, &completion, PolicyView::Frozen(ctl.reference()))
            .await
            .unwrap();
        assert_eq!(reference, current);
        assert_ne!(reference, original);

        // A direct refresh after further drift picks up the new parameters.
        ctl.policy_mut().set_logit(Some(yes), no, -2.0);
        let drifted = ctl
            .policy()
            .log_probabilities(&prompt, &completion, PolicyView::Current)
            .await
            .unwrap();
        assert_ne!(drifted, reference);
        ctl.refresh_reference().await.unwrap();
        let refreshed = ctl
            .policy()
            .log_probabilities(&prompt, &completion, PolicyView::Frozen(ctl.reference()))
            .await
            .unwrap();
        assert_eq!(refreshed, drifted);
    }

    #[tokio::test]
    async fn test_checkpoint_cadence() {
        let mut cfg = config();
        cfg.schedule.checkpoint_interval = 2;
        let mut ctl = UpdateController::new(
            cfg,
            ScriptedPolicy::new(),
            TestReward::Keyword,
            RecordingSink::default(),
            MemoryObserver::default(),
        )
        .await
        .unwrap();

        for _ in 0..4 {
            ctl.train_step(&prompts()).await.unwrap();
        }
        assert_eq!(ctl.checkpoints().steps, vec![(2, 2), (4, 4)]);
        let flags: Vec<bool> = ctl.observer().records.iter().map(|r| r.checkpointed).collect();
        assert_eq!(flags, vec![false, true, false, true]);
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_restarts_source_until_target() {
        let mut cfg = config();
        cfg.rl.training_steps = 5;
        let mut ctl = controller(cfg, ScriptedPolicy::new(), TestReward::Keyword)
            .await
            .with_start_step(1);
        let mut data = InMemorySource::new(prompts());

        let summary = ctl.run(&mut data).await.unwrap();
        assert_eq!(summary.steps_run, 4);
        assert_eq!(summary.final_step, 5);
        assert_eq!(summary.epochs, 3);
        assert!(!summary.stopped);
    }

    #[tokio::test]
    async fn test_stop_request_honored_at_boundary() {
        let mut ctl = controller(config(), ScriptedPolicy::new(), TestReward::Keyword).await;
        ctl.stop_handle().request_stop();

        let summary = ctl.run(&mut InMemorySource::new(prompts())).await.unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.steps_run, 0);
        assert_eq!(ctl.state(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn test_empty_source_is_an_error() {
        let mut ctl = controller(config(), ScriptedPolicy::new(), TestReward::Keyword).await;
        let err = ctl.run(&mut InMemorySource::new(Vec::new())).await.unwrap_err();
        assert!(err.to_string().contains("no prompts"));
    }

    #[tokio::test]
    async fn test_tabular_policy_learns_keyword() {
        let vocab = vec!["yes".to_string(), "no".to_string()];
        let policy = TabularPolicy::new(vocab, 0.5, 7).unwrap();
        let yes = policy.token_id("yes").unwrap();
        let before = policy.probability(None, yes);

        let mut cfg = TrainerConfig::default();
        cfg.rl.group_size = 8;
        cfg.rl.batch_size = 2;
        cfg.rl.learning_rate = 0.5;
        cfg.rl.training_steps = 30;
        cfg.decoding.max_completion_length = 6;
        cfg.schedule.checkpoint_interval = 0;

        let reward = WeightedSum::new(vec![WeightedRule {
            weight: 1.0,
            rule: RuleReward::contains("yes"),
        }]);
        let mut ctl = UpdateController::new(
            cfg,
            policy,
            reward,
            NullCheckpointSink,
            MemoryObserver::default(),
        )
        .await
        .unwrap();

        let mut data = InMemorySource::new(vec![
            Prompt::from_user_text("agree?"),
            Prompt::from_user_text("confirm?"),
            Prompt::from_user_text("ok?"),
        ]);
        let summary = ctl.run(&mut data).await.unwrap();
        assert_eq!(summary.final_step, 30);

        assert!(ctl
            .observer()
            .records
            .iter()
            .all(|r| r.advantages.iter().all(|g| g.iter().sum::<f64>().abs() < 1e-9)));
        let policy = ctl.into_policy();
        let after = policy.probability(None, yes);
        assert!(after > before, "p(yes) went from {before} to {after}");
    }
}
