//! End-of-epoch checkpointing.
//!
//! A record is written after each completed epoch and supersedes nothing:
//! every epoch gets its own file, and resuming picks whichever epoch the
//! caller asks for. Write failures are surfaced to the caller but must not
//! corrupt the in-memory training state.

use crate::optimizer::Adam;
use delta_core::{DeltaError, Result};
use delta_propagate::Network;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything needed to resume training at `epoch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Number of completed epochs (the epoch to resume *from*).
    pub epoch: usize,
    pub running_loss: f32,
    pub model: Network,
    pub optimizer: Adam,
}

/// Destination for checkpoint records.
pub trait CheckpointSink {
    fn save(&self, record: &CheckpointRecord) -> Result<()>;
}

/// Directory of `checkpoint_epoch_{n}.json` files.
#[derive(Debug, Clone)]
pub struct DirSink {
    dir: PathBuf,
}

impl DirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| DeltaError::Checkpoint(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("checkpoint_epoch_{}.json", epoch))
    }

    pub fn load(dir: impl AsRef<Path>, epoch: usize) -> Result<CheckpointRecord> {
        let path = dir
            .as_ref()
            .join(format!("checkpoint_epoch_{}.json", epoch));
        let data = std::fs::read_to_string(&path)
            .map_err(|e| DeltaError::Checkpoint(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| DeltaError::Checkpoint(format!("parse {}: {}", path.display(), e)))
    }
}

impl CheckpointSink for DirSink {
    fn save(&self, record: &CheckpointRecord) -> Result<()> {
        let path = self.path_for(record.epoch);
        let data = serde_json::to_string(record)
            .map_err(|e| DeltaError::Checkpoint(format!("serialise: {}", e)))?;
        std::fs::write(&path, data)
            .map_err(|e| DeltaError::Checkpoint(format!("write {}: {}", path.display(), e)))
    }
}
