//! Error types surfaced by the training core.
//!
//! Capability seams (policy, reward, data, checkpoint) speak `anyhow::Result`;
//! the controller folds those into [`TrainerError::Capability`] and adds the
//! failure modes it defines itself.

/// A configuration value outside its legal range.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    OutOfRange {
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn out_of_range(field: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that halt the training loop.
#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    /// The configuration was rejected at construction time.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Too many consecutive updates were skipped by the divergence guard.
    #[error(
        "training diverged at step {step}: {consecutive_skips} consecutive updates skipped (limit {limit})"
    )]
    Divergence {
        step: u64,
        consecutive_skips: usize,
        limit: usize,
    },

    /// The controller already reached its terminal state.
    #[error("training loop is stopped (last step {step})")]
    Stopped { step: u64 },

    /// A policy, reward, data or checkpoint capability failed.
    #[error(transparent)]
    Capability(#[from] anyhow::Error),
}

impl TrainerError {
    /// Whether this error came from the divergence guard.
    pub fn is_divergence(&self) -> bool {
        matches!(self, Self::Divergence { .. })
    }
}

/// Result alias for controller operations.
pub type TrainerResult<T> = std::result::Result<T, TrainerError>;
