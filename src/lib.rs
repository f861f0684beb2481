//! Shoal: group-relative policy optimization for language policies
//!
//! Samples groups of completions per prompt, scores them, normalizes rewards
//! within each group and updates the policy with a clipped objective held
//! close to a frozen reference policy.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod reward;
pub mod training;

pub use error::{ConfigError, TrainerError, TrainerResult};
