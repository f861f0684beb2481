//! Checkpoint persistence.
//!
//! The controller hands the current snapshot to a [`CheckpointSink`] on the
//! checkpoint cadence. [`JsonCheckpointSink`] writes `checkpoint-{step}.json`
//! files and can find the latest one again to resume a run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const PREFIX: &str = "checkpoint-";
const EXTENSION: &str = "json";

/// Destination for policy snapshots.
#[allow(async_fn_in_trait)]
pub trait CheckpointSink<S>: Send {
    async fn persist(&mut self, step: u64, snapshot: &S) -> Result<()>;
}

/// A persisted snapshot with its step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    pub step: u64,
    pub saved_at: DateTime<Utc>,
    pub snapshot: S,
}

#[derive(Serialize)]
struct CheckpointRef<'a, S> {
    step: u64,
    saved_at: DateTime<Utc>,
    snapshot: &'a S,
}

/// Discards every snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCheckpointSink;

impl<S: Sync> CheckpointSink<S> for NullCheckpointSink {
    async fn persist(&mut self, step: u64, _snapshot: &S) -> Result<()> {
        debug!(step, "Checkpoint discarded");
        Ok(())
    }
}

/// Writes snapshots as JSON files in a directory.
///
/// The file holds whatever the snapshot serializes to. For a remote policy
/// that is only the server-side id, not the weights.
#[derive(Debug, Clone)]
pub struct JsonCheckpointSink {
    dir: PathBuf,
    keep_last: Option<usize>,
}

impl JsonCheckpointSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep_last: None,
        }
    }

    /// Delete older checkpoints so that at most `n` remain.
    pub fn keep_last(mut self, n: Option<usize>) -> Self {
        self.keep_last = n;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{step}.{EXTENSION}"))
    }

    /// Checkpoints on disk as `(step, path)`, oldest first. A missing
    /// directory has none.
    pub fn list(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", self.dir.display()))
            }
        };

        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if let Some(step) = parse_step(&path) {
                found.push((step, path));
            }
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    /// Load the checkpoint with the highest step, if any.
    pub fn latest<S: DeserializeOwned>(&self) -> Result<Option<Checkpoint<S>>> {
        let Some((_, path)) = self.list()?.pop() else {
            return Ok(None);
        };
        Self::load(&path).map(Some)
    }

    pub fn load<S: DeserializeOwned>(path: &Path) -> Result<Checkpoint<S>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse checkpoint {}", path.display()))
    }

    fn prune(&self) -> Result<()> {
        let Some(keep) = self.keep_last else {
            return Ok(());
        };
        let all = self.list()?;
        let excess = all.len().saturating_sub(keep);
        for (step, path) in all.into_iter().take(excess) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(step, path = %path.display(), "Pruned checkpoint"),
                Err(e) => warn!(error = %e, path = %path.display(), "Failed to prune checkpoint"),
            }
        }
        Ok(())
    }
}

impl<S: Serialize + Sync> CheckpointSink<S> for JsonCheckpointSink {
    async fn persist(&mut self, step: u64, snapshot: &S) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let body = serde_json::to_vec(&CheckpointRef {
            step,
            saved_at: Utc::now(),
            snapshot,
        })
        .context("Failed to serialize checkpoint")?;

        // Write then rename so a crash never leaves a half-written checkpoint.
        let path = self.path_for(step);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move checkpoint into {}", path.display()))?;

        info!(step, path = %path.display(), bytes = body.len(), "Checkpoint saved");
        self.prune()
    }
}

fn parse_step(path: &Path) -> Option<u64> {
    if path.extension()? != EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(PREFIX)?
        .parse()
        .ok()
}
