//! Observability sinks for step records.
//!
//! Observers receive every [`StepRecord`] in order. Failures are reported to
//! the controller, which logs them and keeps training.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::record::StepRecord;

/// Append-only consumer of step records.
pub trait StepObserver: Send {
    fn record(&mut self, record: &StepRecord) -> Result<()>;
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StepObserver for TracingObserver {
    fn record(&mut self, r: &StepRecord) -> Result<()> {
        match r.skipped {
            None => info!(
                step = r.step,
                loss = r.loss,
                kl = r.kl,
                grad_norm = r.grad_norm.unwrap_or(f64::NAN),
                reward_mean = r.reward_mean,
                reward_std = r.reward_std,
                clip_frac = r.clip_fraction,
                truncated = r.truncated_completions,
                sentinels = r.sentinel_rewards,
                "Training step completed"
            ),
            Some(reason) => warn!(
                step = r.step,
                reason = %reason,
                loss = r.loss,
                grad_norm = r.grad_norm.unwrap_or(f64::NAN),
                consecutive_skips = r.consecutive_skips,
                "Training step skipped"
            ),
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlObserver {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlObserver {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StepObserver for JsonlObserver {
    fn record(&mut self, record: &StepRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .context("Failed to serialize step record")?;
        self.writer.write_all(b"\n")?;
        self.writer
            .flush()
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryObserver {
    pub records: Vec<StepRecord>,
}

impl StepObserver for MemoryObserver {
    fn record(&mut self, record: &StepRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

impl<T: StepObserver + ?Sized> StepObserver for Box<T> {
    fn record(&mut self, record: &StepRecord) -> Result<()> {
        (**self).record(record)
    }
}

impl<A: StepObserver, B: StepObserver> StepObserver for (A, B) {
    fn record(&mut self, record: &StepRecord) -> Result<()> {
        let first = self.0.record(record);
        let second = self.1.record(record);
        first.and(second)
    }
}

impl<T: StepObserver> StepObserver for Option<T> {
    fn record(&mut self, record: &StepRecord) -> Result<()> {
        match self {
            Some(observer) => observer.record(record),
            None => Ok(()),
        }
    }
}
