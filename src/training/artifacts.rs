//! Run artifacts: loss history and weight snapshots
//!
//! Artifacts go to `<log_dir>/<run_id>/`:
//! - `loss_history.json` and `loss_history.csv`, rewritten after every epoch
//! - `Epoch{n}-Total_Loss{t}-Val_Loss{v}.safetensors` per epoch (1-based `n`)
//! - `final.safetensors` once the run finishes

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::Result;

/// Loss history file names
pub const LOSS_HISTORY_JSON: &str = "loss_history.json";
/// CSV twin of [`LOSS_HISTORY_JSON`]
pub const LOSS_HISTORY_CSV: &str = "loss_history.csv";
/// Final weights file name
pub const FINAL_WEIGHTS: &str = "final.safetensors";

/// One row of the loss history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    /// Epoch index
    pub epoch: usize,
    /// Mean training loss
    pub train_loss: f64,
    /// Mean validation loss
    pub val_loss: f64,
}

/// Writes the artifacts of one run
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    /// Create `<log_dir>/<run_id>/`
    pub fn new(log_dir: impl AsRef<Path>, run_id: &str) -> Result<Self> {
        let dir = log_dir.as_ref().join(run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Artifact directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rewrite the JSON and CSV loss history
    pub fn write_loss_history(&self, records: &[LossRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        std::fs::write(self.dir.join(LOSS_HISTORY_JSON), json)?;

        let mut csv = String::from("epoch,train_loss,val_loss\n");
        for record in records {
            let _ = writeln!(csv, "{},{},{}", record.epoch, record.train_loss, record.val_loss);
        }
        std::fs::write(self.dir.join(LOSS_HISTORY_CSV), csv)?;

        debug!("Wrote loss history ({} epochs) to {}", records.len(), self.dir.display());
        Ok(())
    }

    /// Save the weights after `epoch` under a name carrying both losses
    pub fn save_epoch_weights(
        &self,
        var_map: &VarMap,
        epoch: usize,
        train_loss: f64,
        val_loss: f64,
    ) -> Result<PathBuf> {
        let path = self.dir.join(epoch_weights_name(epoch, train_loss, val_loss));
        var_map.save(&path)?;
        info!("Saved weights to {}", path.display());
        Ok(path)
    }

    /// Save the final weights; failures are logged, never returned
    pub fn save_final_weights(&self, var_map: &VarMap) -> Option<PathBuf> {
        let path = self.dir.join(FINAL_WEIGHTS);
        match var_map.save(&path) {
            Ok(()) => {
                info!("Saved final weights to {}", path.display());
                Some(path)
            }
            Err(e) => {
                error!("Failed to save final weights to {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// File name of a per-epoch weight snapshot
pub fn epoch_weights_name(epoch: usize, train_loss: f64, val_loss: f64) -> String {
    format!(
        "Epoch{}-Total_Loss{:.4}-Val_Loss{:.4}.safetensors",
        epoch + 1,
        train_loss,
        val_loss
    )
}

/// Read a `loss_history.json` file
pub fn read_loss_history(path: impl AsRef<Path>) -> Result<Vec<LossRecord>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&content)?)
}
