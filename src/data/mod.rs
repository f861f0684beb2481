//! Prompt data sources.
//!
//! The training loop pulls prompts through [`PromptSource`], a lazy and
//! restartable sequence of batches. Batching order and shuffling are the
//! source's concern.

pub mod conversation;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::model::Prompt;

pub use conversation::ConversationDataset;

/// A lazy, restartable sequence of prompts.
pub trait PromptSource {
    /// The next batch of up to `batch_size` prompts, or `None` once the
    /// current pass is exhausted.
    fn next_batch(&mut self, batch_size: usize) -> Result<Option<Vec<Prompt>>>;

    /// Start a new pass over the data.
    fn restart(&mut self) -> Result<()>;

    /// Total number of prompts, when known.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Prompts held in memory, optionally reshuffled on every pass.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    prompts: Vec<Prompt>,
    order: Vec<usize>,
    cursor: usize,
    rng: Option<StdRng>,
}

impl InMemorySource {
    pub fn new(prompts: Vec<Prompt>) -> Self {
        let order = (0..prompts.len()).collect();
        Self {
            prompts,
            order,
            cursor: 0,
            rng: None,
        }
    }

    /// Shuffle the order at the start of every pass, seeded for reproducibility.
    pub fn shuffled(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self.rng = Some(rng);
        self
    }

    pub fn prompts(&self) -> &[Prompt] {
        &self.prompts
    }
}

impl PromptSource for InMemorySource {
    fn next_batch(&mut self, batch_size: usize) -> Result<Option<Vec<Prompt>>> {
        if self.cursor >= self.order.len() || batch_size == 0 {
            return Ok(None);
        }
        let end = (self.cursor + batch_size).min(self.order.len());
        let batch = self.order[self.cursor..end]
            .iter()
            .map(|&i| self.prompts[i].clone())
            .collect();
        self.cursor = end;
        Ok(Some(batch))
    }

    fn restart(&mut self) -> Result<()> {
        self.cursor = 0;
        if let Some(rng) = self.rng.as_mut() {
            self.order.shuffle(rng);
        }
        Ok(())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.prompts.len())
    }
}
