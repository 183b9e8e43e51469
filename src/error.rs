//! Error types for stagetrain

use std::path::PathBuf;

use thiserror::Error;

use crate::training::phase::Phase;

/// Main error type for staged training runs
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A trainability policy names a parameter group the network does not have
    #[error("Configuration error: parameter group '{group}' referenced by the {phase} policy does not exist in the network")]
    UnknownParameterGroup {
        /// Offending group name
        group: String,
        /// Phase whose policy references it
        phase: Phase,
    },

    /// Requested checkpoint does not exist
    #[error("Checkpoint not found: {id}")]
    ResumeNotFound {
        /// Checkpoint identifier as given by the operator
        id: String,
    },

    /// A checkpoint for this run and epoch was already written
    #[error("Checkpoint already exists at {}", path.display())]
    CheckpointExists {
        /// Existing checkpoint directory
        path: PathBuf,
    },

    /// Restored tensor disagrees with the network parameter of the same name
    #[error("Shape mismatch for '{name}': network has {expected:?}, snapshot has {found:?}")]
    ShapeMismatch {
        /// Parameter name
        name: String,
        /// Shape of the live parameter
        expected: Vec<usize>,
        /// Shape found in the snapshot
        found: Vec<usize>,
    },

    /// NaN or infinite loss
    #[error("Numeric instability in {phase} phase at epoch {epoch}, batch {batch}: loss = {value}")]
    NumericInstability {
        /// Active phase
        phase: Phase,
        /// Epoch index
        epoch: usize,
        /// Batch index within the pass
        batch: usize,
        /// Offending loss value
        value: f64,
    },

    /// Shutdown requested between batches
    #[error("Training interrupted at epoch {epoch} before batch {batch}")]
    Interrupted {
        /// Epoch index
        epoch: usize,
        /// Index of the batch that was not started
        batch: usize,
    },

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for stagetrain operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
