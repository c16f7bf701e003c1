//! Model checkpoints with rotation and integrity checks.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use emitfit_core::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::{Network, StateDict};
use crate::persistence;

/// On-disk checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub run_id: Uuid,
    pub epoch: usize,
    pub saved_at: DateTime<Utc>,
    /// Hex SHA-256 of the serialized state dict.
    pub digest: String,
    pub state: StateDict,
}

fn digest(state: &StateDict) -> Result<String> {
    let bytes = serde_json::to_vec(state)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Writes checkpoints to `<stem>_<k>.<ext>` next to the configured output
/// path. A rotation moves on to the next free index so earlier files are
/// kept.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    base: PathBuf,
    index: usize,
    run_id: Uuid,
    saved_once: bool,
}

impl ModelCheckpoint {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let mut checkpoint = Self {
            base: base.into(),
            index: 0,
            run_id: Uuid::new_v4(),
            saved_once: false,
        };
        checkpoint.index = checkpoint.next_free(0);
        checkpoint
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Path of the `index`-th rotation.
    pub fn path_for(&self, index: usize) -> PathBuf {
        let stem = self
            .base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".into());
        let name = match self.base.extension() {
            Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
            None => format!("{stem}_{index}"),
        };
        self.base.with_file_name(name)
    }

    /// File the next non-rotating save goes to.
    pub fn current_path(&self) -> PathBuf {
        self.path_for(self.index)
    }

    fn next_free(&self, from: usize) -> usize {
        (from..)
            .find(|&i| !self.path_for(i).exists())
            .unwrap_or(from)
    }

    /// Saves `network`. With `rotate`, a file that was already written by
    /// this run is left alone and the next free index is used instead.
    pub fn save<N: Network + ?Sized>(
        &mut self,
        network: &N,
        epoch: usize,
        rotate: bool,
    ) -> Result<PathBuf> {
        if rotate && self.saved_once {
            self.index = self.next_free(self.index + 1);
            tracing::info!(index = self.index, "rotating checkpoint file");
        }
        let state = network.state_dict();
        let file = CheckpointFile {
            run_id: self.run_id,
            epoch,
            saved_at: Utc::now(),
            digest: digest(&state)?,
            state,
        };
        let path = self.current_path();
        persistence::atomic_write_json(&path, &file)?;
        self.saved_once = true;
        tracing::debug!(path = %path.display(), epoch, "checkpoint saved");
        Ok(path)
    }

    /// Restores `network` from `path`. Without a path the network keeps its
    /// random initialisation and `None` is returned.
    pub fn load<N: Network + ?Sized>(
        path: Option<&Path>,
        network: &mut N,
    ) -> Result<Option<CheckpointFile>> {
        let Some(path) = path else {
            tracing::info!("no initial model given, using random initialisation");
            return Ok(None);
        };
        let file: CheckpointFile = persistence::load_json(path)?.ok_or_else(|| {
            CheckpointError::NotFound {
                path: path.to_path_buf(),
            }
        })?;
        if digest(&file.state)? != file.digest {
            return Err(CheckpointError::DigestMismatch {
                path: path.to_path_buf(),
            }
            .into());
        }
        network.load_state_dict(&file.state)?;
        tracing::info!(path = %path.display(), epoch = file.epoch, "model initialised from checkpoint");
        Ok(Some(file))
    }
}

/// Wall-clock timer deciding when a checkpoint should rotate.
#[derive(Debug, Clone)]
pub struct RotationTimer {
    interval: Duration,
    last: Instant,
}

impl RotationTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// `true` once per elapsed interval; the timer restarts when it fires.
    pub fn due(&mut self) -> bool {
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}
