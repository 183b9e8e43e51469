//! Checkpoint store
//!
//! One checkpoint per completed epoch, laid out as
//!
//! ```text
//! <root>/<run_id>/epoch_0007/
//!     model.safetensors      network weights
//!     optimizer.safetensors  Adam moment buffers
//!     meta.json              epoch, loss history, optimizer scalars
//! ```
//!
//! A checkpoint directory is written under a staging name and renamed into
//! place, so a reader never sees a half-written checkpoint. Existing
//! checkpoints are never overwritten.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::training::network::named_vars;
use crate::training::optimizers::OptimizerStateDict;
use crate::training::phase::Phase;

const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const META_FILE: &str = "meta.json";
const FORMAT_VERSION: u32 = 1;

/// Address of one checkpoint: run id plus completed epoch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId {
    /// Run the checkpoint belongs to
    pub run_id: String,
    /// Epoch the checkpoint completed
    pub epoch: usize,
}

impl CheckpointId {
    /// Create an id
    pub fn new(run_id: impl Into<String>, epoch: usize) -> Self {
        Self {
            run_id: run_id.into(),
            epoch,
        }
    }

    fn dir_name(&self) -> String {
        format!("epoch_{:04}", self.epoch)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/epoch_{}", self.run_id, self.epoch)
    }
}

/// Operator-facing checkpoint reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointRef {
    /// `<run_id>/epoch_<n>`
    Exact(CheckpointId),
    /// `<run_id>/latest`
    Latest {
        /// Run to search
        run_id: String,
    },
}

impl FromStr for CheckpointRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let not_found = || Error::ResumeNotFound { id: s.to_string() };

        let (run_id, tail) = s.trim_end_matches('/').rsplit_once('/').ok_or_else(not_found)?;
        if run_id.is_empty() {
            return Err(not_found());
        }

        if tail == "latest" {
            return Ok(CheckpointRef::Latest {
                run_id: run_id.to_string(),
            });
        }

        let epoch = tail
            .strip_prefix("epoch_")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(not_found)?;
        Ok(CheckpointRef::Exact(CheckpointId::new(run_id, epoch)))
    }
}

/// Scalar state stored next to the tensors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// On-disk format version
    pub format_version: u32,
    /// Run id
    pub run_id: String,
    /// Completed epoch
    pub epoch: usize,
    /// Phase the epoch ran in; informational, resume re-derives the phase
    pub phase: Phase,
    /// Mean training loss of the epoch
    pub train_loss: f64,
    /// Mean validation loss of the epoch
    pub val_loss: f64,
    /// Learning rate used during the epoch
    pub learning_rate: f64,
    /// Validation loss of every completed epoch, oldest first
    pub loss_history: Vec<f64>,
    /// Training loss of every completed epoch, oldest first
    #[serde(default)]
    pub train_loss_history: Vec<f64>,
    /// Optimizer scalars (type, step count, hyperparameters)
    pub optimizer: OptimizerStateDict,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl CheckpointMetadata {
    /// Metadata for a checkpoint written now
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        epoch: usize,
        phase: Phase,
        train_loss: f64,
        val_loss: f64,
        learning_rate: f64,
        loss_history: Vec<f64>,
        train_loss_history: Vec<f64>,
        optimizer: OptimizerStateDict,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            run_id: run_id.into(),
            epoch,
            phase,
            train_loss,
            val_loss,
            learning_rate,
            loss_history,
            train_loss_history,
            optimizer,
            created_at: Utc::now(),
        }
    }

    /// Id of the checkpoint this metadata describes
    pub fn id(&self) -> CheckpointId {
        CheckpointId::new(self.run_id.clone(), self.epoch)
    }
}

/// A loaded checkpoint
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Scalar state
    pub metadata: CheckpointMetadata,
    /// Network weights by variable name
    pub weights: HashMap<String, Tensor>,
    /// Optimizer scalars and moment buffers
    pub optimizer: OptimizerStateDict,
}

impl Checkpoint {
    /// Completed epoch
    pub fn epoch(&self) -> usize {
        self.metadata.epoch
    }

    /// Validation loss history
    pub fn loss_history(&self) -> &[f64] {
        &self.metadata.loss_history
    }
}

/// Outcome of copying snapshot tensors into a network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightTransferReport {
    /// Parameters overwritten from the snapshot
    pub loaded: Vec<String>,
    /// Parameters skipped because the shapes differ
    pub mismatched: Vec<String>,
    /// Parameters the snapshot does not contain
    pub missing: Vec<String>,
    /// Snapshot tensors with no matching parameter
    pub unused: Vec<String>,
}

impl WeightTransferReport {
    /// Whether every network parameter was restored
    pub fn is_complete(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

/// Copy every same-named, same-shaped tensor of `weights` into `var_map`
///
/// Shape mismatches are logged and skipped, absent parameters keep their
/// current values.
pub fn restore_weights(var_map: &VarMap, weights: &HashMap<String, Tensor>) -> Result<WeightTransferReport> {
    let mut report = WeightTransferReport::default();

    let vars = named_vars(var_map)?;
    for (name, var) in &vars {
        let Some(tensor) = weights.get(name) else {
            report.missing.push(name.clone());
            continue;
        };

        let expected = var.as_tensor().dims().to_vec();
        let found = tensor.dims().to_vec();
        if expected != found {
            let mismatch = Error::ShapeMismatch {
                name: name.clone(),
                expected,
                found,
            };
            warn!("{}; keeping current value", mismatch);
            report.mismatched.push(name.clone());
            continue;
        }

        let tensor = tensor
            .to_dtype(var.as_tensor().dtype())?
            .to_device(var.as_tensor().device())?;
        var.set(&tensor)?;
        report.loaded.push(name.clone());
    }

    let known: std::collections::HashSet<&str> = vars.iter().map(|(name, _)| name.as_str()).collect();
    report.unused = weights
        .keys()
        .filter(|name| !known.contains(name.as_str()))
        .cloned()
        .collect();
    report.unused.sort();

    debug!(
        "Weight transfer: {} loaded, {} mismatched, {} missing, {} unused",
        report.loaded.len(),
        report.mismatched.len(),
        report.missing.len(),
        report.unused.len()
    );
    Ok(report)
}

/// Load a weights file and transfer it into `var_map`
pub fn load_weights_file(var_map: &VarMap, path: impl AsRef<Path>, device: &Device) -> Result<WeightTransferReport> {
    let weights = candle_core::safetensors::load(path.as_ref(), device)?;
    restore_weights(var_map, &weights)
}

/// Filesystem-backed checkpoint store
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    device: Device,
}

impl CheckpointStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>, device: Device) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, device })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a checkpoint lives in
    pub fn checkpoint_dir(&self, id: &CheckpointId) -> PathBuf {
        self.root.join(&id.run_id).join(id.dir_name())
    }

    /// Persist a snapshot; fails with [`Error::CheckpointExists`] rather than overwrite
    pub fn save(
        &self,
        var_map: &VarMap,
        optimizer: &OptimizerStateDict,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointId> {
        let id = metadata.id();
        let final_dir = self.checkpoint_dir(&id);
        if final_dir.exists() {
            return Err(Error::CheckpointExists { path: final_dir });
        }

        let run_dir = self.root.join(&id.run_id);
        std::fs::create_dir_all(&run_dir)?;
        let staging = run_dir.join(format!(".{}.partial-{}", id.dir_name(), std::process::id()));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir(&staging)?;

        let written = Self::write_files(&staging, var_map, optimizer, metadata);
        if let Err(e) = written {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        if final_dir.exists() {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(Error::CheckpointExists { path: final_dir });
        }
        if let Err(e) = std::fs::rename(&staging, &final_dir) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        info!("Saved checkpoint {} to {}", id, final_dir.display());
        Ok(id)
    }

    fn write_files(
        dir: &Path,
        var_map: &VarMap,
        optimizer: &OptimizerStateDict,
        metadata: &CheckpointMetadata,
    ) -> Result<()> {
        var_map.save(dir.join(MODEL_FILE))?;
        optimizer.save_buffers(dir.join(OPTIMIZER_FILE))?;
        let meta = serde_json::to_string_pretty(metadata)?;
        std::fs::write(dir.join(META_FILE), meta)?;
        Ok(())
    }

    /// Load a checkpoint, failing with [`Error::ResumeNotFound`] if it is absent
    pub fn load(&self, id: &CheckpointId) -> Result<Checkpoint> {
        let dir = self.checkpoint_dir(id);
        let meta_path = dir.join(META_FILE);
        if !meta_path.is_file() {
            return Err(Error::ResumeNotFound { id: id.to_string() });
        }

        let metadata: CheckpointMetadata = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
        if metadata.format_version != FORMAT_VERSION {
            return Err(Error::internal(format!(
                "checkpoint {} has format version {}, expected {}",
                id, metadata.format_version, FORMAT_VERSION
            )));
        }

        let weights = candle_core::safetensors::load(dir.join(MODEL_FILE), &self.device)?;
        let mut optimizer = metadata.optimizer.clone();
        optimizer.load_buffers(dir.join(OPTIMIZER_FILE), &self.device)?;

        debug!("Loaded checkpoint {} ({} tensors)", id, weights.len());
        Ok(Checkpoint {
            metadata,
            weights,
            optimizer,
        })
    }

    /// Resolve an operator-supplied reference to a concrete id
    pub fn resolve(&self, reference: &str) -> Result<CheckpointId> {
        match reference.parse::<CheckpointRef>()? {
            CheckpointRef::Exact(id) => {
                if self.checkpoint_dir(&id).join(META_FILE).is_file() {
                    Ok(id)
                } else {
                    Err(Error::ResumeNotFound {
                        id: reference.to_string(),
                    })
                }
            }
            CheckpointRef::Latest { run_id } => self.latest(&run_id)?.ok_or_else(|| Error::ResumeNotFound {
                id: reference.to_string(),
            }),
        }
    }

    /// Completed checkpoints of a run, oldest first
    pub fn list(&self, run_id: &str) -> Result<Vec<CheckpointId>> {
        let run_dir = self.root.join(run_id);
        if !run_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&run_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(epoch) = name
                .to_str()
                .and_then(|n| n.strip_prefix("epoch_"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            if entry.path().join(META_FILE).is_file() {
                ids.push(CheckpointId::new(run_id, epoch));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Most recent checkpoint of a run
    pub fn latest(&self, run_id: &str) -> Result<Option<CheckpointId>> {
        Ok(self.list(run_id)?.pop())
    }
}
