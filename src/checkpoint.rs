//! Durable run state.
//!
//! Every component that mutates the [`RunState`] hands it to a [`Checkpoint`]
//! before starting the next unit of work, so the in-memory document and the
//! file on disk are never more than one backtest apart.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::model::RunState;

/// Write-through sink for the run state.
pub trait Checkpoint {
    fn persist(&mut self, state: &RunState) -> Result<()>;
}

/// JSON checkpoint file keyed by run tag.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the checkpoint once at startup. Absence means a fresh run.
    pub fn load_or_new(&self, strategy: &str) -> Result<RunState> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        if !self.path.exists() {
            info!(path = %self.path.display(), "no checkpoint found, starting a fresh run");
            return Ok(RunState::new(strategy));
        }

        let raw = fs::read_to_string(&self.path)?;
        let state: RunState = serde_json::from_str(&raw)?;
        if state.strategy != strategy {
            return Err(PipelineError::InvalidConfiguration(format!(
                "checkpoint {} belongs to strategy {}, not {}",
                self.path.display(),
                state.strategy,
                strategy
            )));
        }
        info!(
            path = %self.path.display(),
            partitions = state.partitions.len(),
            "resuming from checkpoint"
        );
        Ok(state)
    }

    /// Replaces the checkpoint with the full document.
    pub fn save(&self, state: &RunState) -> Result<()> {
        let body = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Checkpoint for CheckpointStore {
    fn persist(&mut self, state: &RunState) -> Result<()> {
        self.save(state)?;
        debug!(path = %self.path.display(), "checkpoint written");
        Ok(())
    }
}
