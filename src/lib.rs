//! stagetrain - staged fine-tuning for three-scale object detectors
//!
//! A run moves through three phases with their own learning rate and a
//! freshly built optimizer each:
//!
//! 1. **Freeze**: only the detection heads train.
//! 2. **Partial unfreeze**: everything except the backbone trains.
//! 3. **Full unfreeze**: the whole network trains.
//!
//! Every epoch ends with a checkpoint, and a run can resume from any of them
//! into the phase the current breakpoints assign to the next epoch.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod training;

// Re-exports
pub use config::{DegenerateBatchPolicy, RunConfig};
pub use error::{Error, Result};
pub use models::{TinyDetector, YoloScaleLoss};
pub use training::{
    CheckpointStore, DetectionNetwork, LossAggregator, Phase, PhaseSchedule, ScaleLoss, StagedTrainer,
    TrainingEvent, TrainingResult,
};
