//! Staged training infrastructure
//!
//! # Main Components
//!
//! - **Phases**: breakpoint table and per-phase trainability policies
//! - **Trainer**: the phase scheduler that owns the run state
//! - **Epoch runner**: one training pass, one validation pass, one checkpoint
//! - **Loss aggregation**: positive-count normalization over three scales
//! - **Checkpoints**: per-epoch snapshots with resume support
//! - **Optimizers**: Adam/AdamW and per-epoch learning rate schedules
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use stagetrain::training::{LossAggregator, StagedTrainer};
//!
//! let aggregator = LossAggregator::new(Box::new(scale_loss), config.loss.degenerate_policy);
//! let mut trainer = StagedTrainer::new(config, &mut network, aggregator, train, val, device)?;
//! let result = trainer.run()?;
//! ```

pub mod artifacts;
pub mod checkpoint;
pub mod data;
pub mod epoch;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod optimizers;
pub mod phase;
pub mod progress;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

pub use artifacts::{read_loss_history, ArtifactWriter, LossRecord};
pub use checkpoint::{
    load_weights_file, restore_weights, Checkpoint, CheckpointId, CheckpointMetadata, CheckpointRef,
    CheckpointStore, WeightTransferReport,
};
pub use data::{
    discover_samples, split_train_val, BatchSource, DetectionBatch, InMemoryBatchSource,
    SampleDirBatchSource,
};
pub use epoch::{EpochOutcome, EpochRunner, PassStats};
pub use loss::{normalized_total, AggregatedLoss, BatchLossResult, LossAggregator, ScaleLoss};
pub use metrics::{EpochMetrics, RunningMean};
pub use network::{DetectionNetwork, NUM_SCALES};
pub use optimizers::{create_optimizer, create_scheduler, Optimizer, OptimizerStateDict, Scheduler};
pub use phase::{Phase, PhaseSchedule, TrainableParameterSet};
pub use trainer::{EpochRecord, StagedTrainer, TrainingEvent, TrainingResult, TrainingState};
