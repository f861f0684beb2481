//! Policy model abstractions.
//!
//! This module provides:
//! - [`types`] -- prompts, conversation turns and sampled completions.
//! - [`policy::PolicyModel`] -- the capability set the training loop drives.
//! - [`api::RemotePolicy`] -- a client for a remote policy server.
//! - [`tabular::TabularPolicy`] -- an in-process bigram policy for mock runs
//!   and tests.

pub mod api;
pub mod policy;
pub mod tabular;
pub mod types;

pub use api::{RemotePolicy, RemoteSnapshot};
pub use policy::{GradientTerm, PolicyModel, PolicyView};
pub use tabular::{TabularPolicy, TabularSnapshot};
pub use types::{Completion, FinishReason, Prompt, Role, Turn};
