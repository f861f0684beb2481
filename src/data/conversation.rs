//! Conversation-formatted prompt records.
//!
//! Accepts a JSON array or JSON Lines file of records shaped like
//!
//! ```json
//! { "id": "q-17", "conversations": [
//!     { "from": "human", "value": "What is 2+2?" },
//!     { "from": "gpt", "value": "4" }
//! ] }
//! ```
//!
//! `human`/`gpt` map to user/assistant (`role`/`content` keys are accepted
//! too). A trailing assistant turn becomes the prompt's reference answer.
//! Records that do not end awaiting an assistant reply are skipped.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::model::{Prompt, Role, Turn};

use super::{InMemorySource, PromptSource};

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    id: Option<serde_json::Value>,
    conversations: Vec<RawTurn>,
}

#[derive(Debug, Deserialize)]
struct RawTurn {
    #[serde(alias = "role")]
    from: String,
    #[serde(alias = "content")]
    value: String,
}

/// Prompts parsed from a conversation dataset file.
#[derive(Debug, Clone)]
pub struct ConversationDataset {
    source: InMemorySource,
    skipped: usize,
}

impl ConversationDataset {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset from {}", path.display()))?;
        let dataset = Self::from_json_str(&text)
            .with_context(|| format!("Failed to parse dataset from {}", path.display()))?;
        info!(
            path = %path.display(),
            prompts = dataset.len(),
            skipped = dataset.skipped,
            "Loaded conversation dataset"
        );
        Ok(dataset)
    }

    /// Parse either a JSON array of records or one record per line.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let records: Vec<RawRecord> = if text.trim_start().starts_with('[') {
            serde_json::from_str(text).context("invalid JSON array of records")?
        } else {
            text.lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(n, line)| {
                    serde_json::from_str(line)
                        .with_context(|| format!("invalid record on line {}", n + 1))
                })
                .collect::<Result<_>>()?
        };

        let total = records.len();
        let prompts: Vec<Prompt> = records
            .into_iter()
            .enumerate()
            .filter_map(|(i, record)| record_to_prompt(i, record))
            .collect();
        let skipped = total - prompts.len();
        if skipped > 0 {
            warn!(skipped, total, "Skipped records that do not await a completion");
        }

        Ok(Self {
            source: InMemorySource::new(prompts),
            skipped,
        })
    }

    pub fn shuffled(mut self, seed: u64) -> Self {
        self.source = self.source.shuffled(seed);
        self
    }

    pub fn len(&self) -> usize {
        self.source.prompts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped while loading.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn prompts(&self) -> &[Prompt] {
        self.source.prompts()
    }
}

impl PromptSource for ConversationDataset {
    fn next_batch(&mut self, batch_size: usize) -> Result<Option<Vec<Prompt>>> {
        self.source.next_batch(batch_size)
    }

    fn restart(&mut self) -> Result<()> {
        debug!("Restarting conversation dataset");
        self.source.restart()
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.len())
    }
}

fn record_to_prompt(index: usize, record: RawRecord) -> Option<Prompt> {
    let id = match record.id {
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => format!("record-{index}"),
    };

    let mut turns = Vec::with_capacity(record.conversations.len());
    for raw in record.conversations {
        let Some(role) = Role::from_str_loose(&raw.from) else {
            debug!(record = %id, role = %raw.from, "Unknown role, skipping record");
            return None;
        };
        turns.push(Turn {
            role,
            content: raw.value,
        });
    }

    let reference = match turns.last() {
        Some(t) if t.role == Role::Assistant => turns.pop().map(|t| t.content),
        _ => None,
    };

    let prompt = Prompt {
        id,
        turns,
        reference,
    };
    if prompt.awaits_completion() {
        Some(prompt)
    } else {
        None
    }
}
