//! GRPO training for `shoal`.
//!
//! Leaves first: group sampling, advantage estimation and the clipped,
//! KL-regularized objective are pure building blocks; the update controller
//! composes them into the training loop with its checkpoint and observability
//! sinks.

pub mod advantage;
pub mod checkpoint;
pub mod controller;
pub mod objective;
pub mod observe;
pub mod record;
pub mod sampler;

pub use advantage::{clip_ratio, compute_group_advantages, compute_importance_ratio, GroupStats};
pub use checkpoint::{Checkpoint, CheckpointSink, JsonCheckpointSink, NullCheckpointSink};
pub use controller::{ControllerState, StopHandle, TrainingSummary, UpdateController};
pub use objective::{GrpoObjective, ObjectiveSample, PolicyLoss};
pub use observe::{JsonlObserver, MemoryObserver, StepObserver, TracingObserver};
pub use record::{SkipReason, StepRecord};
pub use sampler::GroupSampler;
