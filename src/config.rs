//! Run configuration for staged training
//!
//! Everything an operator can tune lives here. The defaults reproduce the
//! classic YOLO transfer schedule: 15 frozen epochs, 15 epochs with the
//! backbone still frozen, then 10 fully unfrozen epochs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::training::phase::{Phase, PhaseSchedule};

/// Main configuration for a staged training run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Run identity, resume target and device
    pub run: RunSettings,
    /// Phase breakpoints and learning rates
    pub phases: PhaseConfig,
    /// Named parameter groups referenced by trainability policies
    pub groups: ParameterGroupConfig,
    /// Optimizer hyperparameters shared by every phase
    pub optimizer: OptimizerConfig,
    /// Learning-rate decay policy built for every phase
    pub scheduler: SchedulerConfig,
    /// Dataset location and batching
    pub data: DataConfig,
    /// Detector shape parameters
    pub model: ModelConfig,
    /// Loss aggregation settings
    pub loss: LossConfig,
    /// Checkpoint and artifact locations
    pub checkpointing: CheckpointingConfig,
    /// Logging and progress output
    pub logging: LoggingConfig,
}

impl RunConfig {
    /// Load configuration from a JSON or YAML file (chosen by extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Self = if is_json(path) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON or YAML file (chosen by extension)
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    ///
    /// Group names are checked against the network separately, once the
    /// network exists (see [`ParameterGroupConfig::validate_against`]).
    pub fn validate(&self) -> Result<()> {
        PhaseSchedule::from_config(&self.phases)?;

        for phase in Phase::ALL {
            let lr = self.phases.learning_rate(phase);
            if !(lr.is_finite() && lr > 0.0) {
                return Err(Error::config(format!(
                    "learning rate for the {} phase must be positive, got {}",
                    phase, lr
                )));
            }
        }

        if self.data.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }

        if !(0.0..1.0).contains(&self.data.val_split) {
            return Err(Error::config(format!(
                "Validation split must be in [0.0, 1.0), got {}",
                self.data.val_split
            )));
        }

        if !(0.0..1.0).contains(&self.optimizer.beta1) || !(0.0..1.0).contains(&self.optimizer.beta2) {
            return Err(Error::config("Adam betas must be in [0.0, 1.0)"));
        }

        if self.optimizer.epsilon <= 0.0 {
            return Err(Error::config("Optimizer epsilon must be positive"));
        }

        if self.optimizer.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }

        match self.scheduler {
            SchedulerConfig::Step { step_size, gamma } => {
                if step_size == 0 {
                    return Err(Error::config("Step scheduler step_size must be greater than 0"));
                }
                if !(gamma > 0.0 && gamma <= 1.0) {
                    return Err(Error::config("Step scheduler gamma must be in (0.0, 1.0]"));
                }
            }
            SchedulerConfig::Cosine { t_max, eta_min } => {
                if t_max == 0 {
                    return Err(Error::config("Cosine scheduler t_max must be greater than 0"));
                }
                if eta_min < 0.0 {
                    return Err(Error::config("Cosine scheduler eta_min must be non-negative"));
                }
            }
        }

        if self.groups.heads.is_empty() {
            return Err(Error::config("At least one detection-head group is required"));
        }

        if self.groups.heads.iter().any(|head| *head == self.groups.backbone) {
            return Err(Error::config(format!(
                "group '{}' cannot be both the backbone and a detection head",
                self.groups.backbone
            )));
        }

        self.model.validate()?;

        Ok(())
    }

    /// Phase breakpoint table
    pub fn schedule(&self) -> Result<PhaseSchedule> {
        PhaseSchedule::from_config(&self.phases)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("json")
}

/// Run identity and placement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Run identifier; a `%m%d-%H%M%S` timestamp is used when unset
    pub run_id: Option<String>,
    /// Checkpoint to resume from (`<run_id>/epoch_<n>` or `<run_id>/latest`)
    pub resume: Option<String>,
    /// Seed for the train/validation split and per-epoch shuffles
    pub seed: u64,
    /// Device to train on
    pub device: DeviceType,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            run_id: None,
            resume: None,
            seed: 10101,
            device: DeviceType::Cpu,
        }
    }
}

/// Device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// CPU device
    Cpu,
    /// CUDA GPU, falling back to CPU when unavailable
    Cuda,
    /// Metal (Apple Silicon)
    Metal,
}

impl DeviceType {
    /// Create the candle device
    pub fn to_device(self) -> Result<Device> {
        match self {
            DeviceType::Cpu => Ok(Device::Cpu),
            DeviceType::Cuda => {
                let device = Device::cuda_if_available(0)?;
                if device.is_cpu() {
                    warn!("CUDA requested but not available, training on CPU");
                }
                Ok(device)
            }
            DeviceType::Metal => Ok(Device::new_metal(0)?),
        }
    }
}

/// Phase breakpoints and per-phase base learning rates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// End of the freeze phase (`F`)
    pub freeze_end: usize,
    /// End of the partial-unfreeze phase (`P`)
    pub partial_end: usize,
    /// End of the full-unfreeze phase and of the run (`U`)
    pub unfreeze_end: usize,
    /// Base learning rate while only the heads train
    pub freeze_lr: f64,
    /// Base learning rate while everything but the backbone trains
    pub partial_lr: f64,
    /// Base learning rate once the backbone is unfrozen
    pub unfreeze_lr: f64,
}

impl PhaseConfig {
    /// Base learning rate of a phase
    pub fn learning_rate(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Freeze => self.freeze_lr,
            Phase::PartialUnfreeze => self.partial_lr,
            Phase::FullUnfreeze => self.unfreeze_lr,
        }
    }
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            freeze_end: 15,
            partial_end: 30,
            unfreeze_end: 40,
            freeze_lr: 1e-3,
            partial_lr: 1e-4,
            unfreeze_lr: 1e-6,
        }
    }
}

/// Named parameter groups
///
/// A group is the first dotted segment of a variable name, so
/// `yolo_head1.pred.weight` belongs to `yolo_head1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterGroupConfig {
    /// Group frozen until the last phase
    pub backbone: String,
    /// Groups trained from the first phase on
    pub heads: Vec<String>,
}

impl ParameterGroupConfig {
    /// Check that every group a policy references exists in the network
    pub fn validate_against(&self, network_groups: &BTreeSet<String>) -> Result<()> {
        for head in &self.heads {
            if !network_groups.contains(head) {
                return Err(Error::UnknownParameterGroup {
                    group: head.clone(),
                    phase: Phase::Freeze,
                });
            }
        }

        if !network_groups.contains(&self.backbone) {
            return Err(Error::UnknownParameterGroup {
                group: self.backbone.clone(),
                phase: Phase::PartialUnfreeze,
            });
        }

        Ok(())
    }
}

impl Default for ParameterGroupConfig {
    fn default() -> Self {
        Self {
            backbone: "backbone".to_string(),
            heads: vec![
                "yolo_head1".to_string(),
                "yolo_head2".to_string(),
                "yolo_head3".to_string(),
            ],
        }
    }
}

/// Optimizer types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    /// Adam with L2 penalty folded into the gradient
    Adam,
    /// Adam with decoupled weight decay
    AdamW,
}

/// Optimizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Optimizer type
    pub optimizer_type: OptimizerType,
    /// Beta1 parameter
    pub beta1: f64,
    /// Beta2 parameter
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub epsilon: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::Adam,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Learning-rate decay policy, stepped once per epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    /// Multiply by `gamma` every `step_size` epochs
    Step {
        /// Epochs between decays
        step_size: usize,
        /// Multiplicative factor
        gamma: f64,
    },
    /// Cosine annealing with period `2 * t_max` and floor `eta_min`
    Cosine {
        /// Half period in epochs
        t_max: usize,
        /// Minimum learning rate
        eta_min: f64,
    },
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::Step {
            step_size: 1,
            gamma: 0.92,
        }
    }
}

/// Dataset location and batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory of `*.safetensors` samples (`image` and `boxes` tensors)
    pub dataset_dir: PathBuf,
    /// Fraction of samples held out for validation
    pub val_split: f64,
    /// Batch size
    pub batch_size: usize,
    /// Shuffle training batches every epoch
    pub shuffle_train: bool,
    /// Shuffle validation batches every epoch
    pub shuffle_val: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("data/train"),
            val_split: 0.2,
            batch_size: 8,
            shuffle_train: true,
            shuffle_val: true,
        }
    }
}

/// Detector shape parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of object classes
    pub num_classes: usize,
    /// Network input size `(height, width)`; both must be multiples of 32
    pub input_size: (usize, usize),
    /// Nine anchors in input pixels, smallest first
    pub anchors: Vec<[f32; 2]>,
    /// Channel width of the first backbone stage
    pub base_channels: usize,
    /// Dropout applied in the neck while training
    pub dropout: f32,
    /// Optional weights to initialize from (partial transfer)
    pub pretrained: Option<PathBuf>,
}

impl ModelConfig {
    /// Validate detector shape parameters
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::config("num_classes must be greater than 0"));
        }
        let (h, w) = self.input_size;
        if h == 0 || w == 0 || h % 32 != 0 || w % 32 != 0 {
            return Err(Error::config(format!(
                "input size must be a non-zero multiple of 32, got {}x{}",
                h, w
            )));
        }
        if self.anchors.len() != 9 {
            return Err(Error::config(format!(
                "exactly 9 anchors are required (3 per scale), got {}",
                self.anchors.len()
            )));
        }
        if self.anchors.iter().any(|[aw, ah]| *aw <= 0.0 || *ah <= 0.0) {
            return Err(Error::config("anchor sizes must be positive"));
        }
        if self.base_channels == 0 {
            return Err(Error::config("base_channels must be greater than 0"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config("dropout must be in [0.0, 1.0)"));
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 20,
            input_size: (416, 416),
            anchors: vec![
                [12.0, 16.0],
                [19.0, 36.0],
                [40.0, 28.0],
                [36.0, 75.0],
                [76.0, 55.0],
                [72.0, 146.0],
                [142.0, 110.0],
                [192.0, 243.0],
                [459.0, 401.0],
            ],
            base_channels: 16,
            dropout: 0.1,
            pretrained: None,
        }
    }
}

/// What to do with a batch that has no positive anchor matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegenerateBatchPolicy {
    /// Normalize by `max(1, positives)`
    #[default]
    FloorAtOne,
    /// Skip the optimizer step and leave the batch out of the running mean
    SkipStep,
}

/// Loss aggregation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Zero-positive batch handling
    pub degenerate_policy: DegenerateBatchPolicy,
}

/// Checkpoint and artifact locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointingConfig {
    /// Root directory for per-epoch checkpoints
    pub checkpoint_dir: PathBuf,
    /// Root directory for weight snapshots and the loss history
    pub log_dir: PathBuf,
    /// Write `Epoch{n}-Total_Loss..-Val_Loss...safetensors` after every epoch
    pub save_epoch_weights: bool,
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            log_dir: PathBuf::from("logs"),
            save_epoch_weights: true,
        }
    }
}

/// Logging and progress output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Draw progress bars for each pass
    pub progress: bool,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            progress: true,
            json: false,
        }
    }
}
