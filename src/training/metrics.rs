//! Per-epoch loss bookkeeping

use serde::{Deserialize, Serialize};

use crate::training::phase::Phase;

/// Running arithmetic mean over the batches that actually ran
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    /// Empty mean
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one observation
    pub fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Current mean, 0.0 when nothing was observed
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Number of observations
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Summary of one completed epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Epoch index
    pub epoch: usize,
    /// Phase the epoch ran in
    pub phase: Phase,
    /// Mean training loss
    pub train_loss: f64,
    /// Mean validation loss
    pub val_loss: f64,
    /// Learning rate used throughout the epoch
    pub learning_rate: f64,
    /// Training batches that contributed to the mean
    pub train_batches: usize,
    /// Validation batches that contributed to the mean
    pub val_batches: usize,
    /// Batches with no positive match
    pub degenerate_batches: usize,
    /// Training batches whose optimizer step was skipped
    pub skipped_steps: usize,
    /// Wall time of the epoch in seconds
    pub duration_secs: f64,
}
