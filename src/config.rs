use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reward::rules::{RuleReward, WeightedRule};

/// Complete configuration for a GRPO fine-tuning run.
///
/// Every section has documented defaults, so a config file only needs the
/// fields it wants to override. Call [`TrainerConfig::validate`] (or load via
/// [`TrainerConfig::from_file`]) before handing the config to the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub rl: RlConfig,
    pub decoding: DecodingConfig,
    pub schedule: ScheduleConfig,
    pub reward: RewardConfig,
    pub model: ModelConfig,
}

/// Optimization hyper-parameters (GRPO).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RlConfig {
    /// Learning rate handed to the policy optimizer (default: 1e-6).
    pub learning_rate: f64,
    /// Prompts per training step (default: 64).
    pub batch_size: usize,
    /// Group size G: completions sampled per prompt (default: 8, must be >= 2).
    pub group_size: usize,
    /// KL divergence coefficient beta (default: 0.01).
    pub kl_coeff: f64,
    /// PPO clipping epsilon (default: 0.2).
    pub clip_epsilon: f64,
    /// Added to the group standard deviation before dividing (default: 1e-4).
    pub advantage_epsilon: f64,
    /// Optimizer passes over each sampled batch (default: 1).
    pub updates_per_batch: usize,
    /// Total training steps (default: 1000).
    pub training_steps: u64,
    /// Drop truncated completions from the loss entirely (default: false).
    pub mask_truncated_completions: bool,
}

/// Stochastic decoding parameters passed to the policy when sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodingConfig {
    /// Softmax temperature (default: 1.0).
    pub temperature: f64,
    /// Nucleus sampling threshold (default: 1.0, disabled).
    pub top_p: f64,
    /// Top-k sampling threshold (default: 0, disabled).
    pub top_k: usize,
    /// Repetition penalty (default: 1.0, disabled).
    pub repetition_penalty: f64,
    /// Maximum completion length in tokens (default: 1024).
    pub max_completion_length: usize,
    /// Maximum prompt length in tokens (default: 6000).
    pub max_prompt_length: usize,
}

/// Cadences and guards for the update controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Persist the current policy every N steps (default: 100, 0 disables).
    pub checkpoint_interval: u64,
    /// Replace the reference policy with the current one every N steps
    /// (default: 0, never refreshed).
    pub reference_refresh_interval: u64,
    /// Loss or gradient-norm magnitude above which an update is skipped
    /// (default: 1e4).
    pub divergence_bound: f64,
    /// Consecutive skipped updates that stop training (default: 5).
    pub max_consecutive_skips: usize,
    /// Directory for checkpoints (default: "checkpoints").
    pub checkpoint_dir: PathBuf,
    /// Keep only the most recent N checkpoints (default: None, keep all).
    pub keep_last_checkpoints: Option<usize>,
}

/// Reward evaluation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Sentinel reward substituted when evaluation fails (default: 0.0).
    pub min_reward: f64,
    /// Base URL of a remote scoring model; empty selects the rule set.
    pub api_base: String,
    /// API key for the remote scoring model.
    pub api_key: String,
    /// Weighted rule-based rewards, summed (default: exact match, weight 1).
    pub rules: Vec<WeightedRule>,
}

/// Policy model server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL for the policy server.
    pub policy_api_base: String,
    /// Model identifier for the policy (e.g., "Qwen/Qwen2.5-7B-Instruct").
    pub policy_model_id: String,
    /// API key for the policy server.
    pub policy_api_key: String,
    /// Seed for the in-process tabular policy.
    pub seed: u64,
}

impl Default for RlConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-6,
            batch_size: 64,
            group_size: 8,
            kl_coeff: 0.01,
            clip_epsilon: 0.2,
            advantage_epsilon: 1e-4,
            updates_per_batch: 1,
            training_steps: 1000,
            mask_truncated_completions: false,
        }
    }
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            max_completion_length: 1024,
            max_prompt_length: 6000,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 100,
            reference_refresh_interval: 0,
            divergence_bound: 1e4,
            max_consecutive_skips: 5,
            checkpoint_dir: PathBuf::from("checkpoints"),
            keep_last_checkpoints: None,
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            min_reward: 0.0,
            api_base: String::new(),
            api_key: String::new(),
            rules: vec![WeightedRule {
                weight: 1.0,
                rule: RuleReward::ExactMatch,
            }],
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            policy_api_base: "http://localhost:8000/v1".into(),
            policy_model_id: "Qwen/Qwen2.5-7B-Instruct".into(),
            policy_api_key: String::new(),
            seed: 42,
        }
    }
}

impl TrainerConfig {
    /// Read a JSON config file and validate it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Reject out-of-range values before any training starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rl;
        if rl.group_size < 2 {
            return Err(ConfigError::out_of_range(
                "rl.group_size",
                format!("must be at least 2, got {}", rl.group_size),
            ));
        }
        if rl.batch_size == 0 {
            return Err(ConfigError::out_of_range("rl.batch_size", "must be at least 1"));
        }
        if rl.updates_per_batch == 0 {
            return Err(ConfigError::out_of_range(
                "rl.updates_per_batch",
                "must be at least 1",
            ));
        }
        positive("rl.learning_rate", rl.learning_rate)?;
        if !(rl.clip_epsilon > 0.0 && rl.clip_epsilon < 1.0) {
            return Err(ConfigError::out_of_range(
                "rl.clip_epsilon",
                format!("must lie in (0, 1), got {}", rl.clip_epsilon),
            ));
        }
        non_negative("rl.kl_coeff", rl.kl_coeff)?;
        non_negative("rl.advantage_epsilon", rl.advantage_epsilon)?;

        let dec = &self.decoding;
        positive("decoding.temperature", dec.temperature)?;
        if !(dec.top_p > 0.0 && dec.top_p <= 1.0) {
            return Err(ConfigError::out_of_range(
                "decoding.top_p",
                format!("must lie in (0, 1], got {}", dec.top_p),
            ));
        }
        positive("decoding.repetition_penalty", dec.repetition_penalty)?;
        if dec.max_completion_length == 0 {
            return Err(ConfigError::out_of_range(
                "decoding.max_completion_length",
                "must be at least 1",
            ));
        }
        if dec.max_prompt_length == 0 {
            return Err(ConfigError::out_of_range(
                "decoding.max_prompt_length",
                "must be at least 1",
            ));
        }

        let sched = &self.schedule;
        positive("schedule.divergence_bound", sched.divergence_bound)?;
        if sched.max_consecutive_skips == 0 {
            return Err(ConfigError::out_of_range(
                "schedule.max_consecutive_skips",
                "must be at least 1",
            ));
        }
        if sched.keep_last_checkpoints == Some(0) {
            return Err(ConfigError::out_of_range(
                "schedule.keep_last_checkpoints",
                "must be at least 1 when set",
            ));
        }

        if !self.reward.min_reward.is_finite() {
            return Err(ConfigError::out_of_range(
                "reward.min_reward",
                format!("must be finite, got {}", self.reward.min_reward),
            ));
        }
        for rule in &self.reward.rules {
            if !rule.weight.is_finite() {
                return Err(ConfigError::out_of_range(
                    "reward.rules.weight",
                    format!("must be finite, got {}", rule.weight),
                ));
            }
        }

        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(
            field,
            format!("must be a positive finite number, got {value}"),
        ))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(
            field,
            format!("must be a non-negative finite number, got {value}"),
        ))
    }
}
