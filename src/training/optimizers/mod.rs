//! Optimizers and learning rate schedulers
//!
//! Every phase builds a fresh optimizer bound to its trainable parameters and
//! a fresh schedule at the phase's base learning rate.

pub mod adam;
pub mod schedulers;

pub use adam::AdamOptimizer;
pub use schedulers::{CosineScheduler, StepScheduler};

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::{OptimizerConfig, OptimizerType, SchedulerConfig};
use crate::error::Result;

/// Trait for optimizers
///
/// There is no `zero_grad`: candle hands out a fresh [`GradStore`] on every
/// backward pass, so nothing accumulates between steps.
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Perform optimization step
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Get optimizer state for checkpointing
    fn state_dict(&self) -> Result<OptimizerStateDict>;

    /// Load optimizer state from a checkpoint, returning how many parameters
    /// had their buffers restored
    fn load_state_dict(&mut self, state: &OptimizerStateDict) -> Result<usize>;

    /// Number of parameters this optimizer updates
    fn parameter_count(&self) -> usize;

    /// Get current step count
    fn step_count(&self) -> usize;
}

/// Trait for learning rate schedulers, stepped once per epoch
pub trait Scheduler {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Step the scheduler
    fn step(&mut self);

    /// Get current learning rate
    fn get_lr(&self) -> f64;

    /// Number of completed steps
    fn step_count(&self) -> usize;

    /// Advance `steps` times without touching an optimizer
    fn fast_forward(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Reset scheduler to initial state
    fn reset(&mut self);
}

/// Optimizer state for checkpointing
///
/// Scalars go to the checkpoint's metadata, tensors to its own safetensors
/// file so they restore bit for bit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerStateDict {
    /// Optimizer type
    pub optimizer_type: String,

    /// Current step count
    pub step_count: usize,

    /// Current learning rate
    pub learning_rate: f64,

    /// Hyperparameters
    pub hyperparameters: BTreeMap<String, f64>,

    /// Moment buffers, `m.<param>` and `v.<param>`
    #[serde(skip)]
    pub buffers: HashMap<String, Tensor>,
}

impl OptimizerStateDict {
    /// Write the moment buffers to a safetensors file
    pub fn save_buffers(&self, path: impl AsRef<Path>) -> Result<()> {
        candle_core::safetensors::save(&self.buffers, path.as_ref())?;
        Ok(())
    }

    /// Read moment buffers written by [`Self::save_buffers`]
    pub fn load_buffers(&mut self, path: impl AsRef<Path>, device: &Device) -> Result<()> {
        self.buffers = candle_core::safetensors::load(path.as_ref(), device)?;
        Ok(())
    }
}

/// Create optimizer from configuration
pub fn create_optimizer(
    config: &OptimizerConfig,
    params: Vec<(String, Var)>,
    learning_rate: f64,
) -> Box<dyn Optimizer + Send> {
    let decoupled = match config.optimizer_type {
        OptimizerType::Adam => false,
        OptimizerType::AdamW => true,
    };

    Box::new(AdamOptimizer::new(
        params,
        learning_rate,
        config.beta1,
        config.beta2,
        config.epsilon,
        config.weight_decay,
        decoupled,
    ))
}

/// Create scheduler from configuration
pub fn create_scheduler(config: &SchedulerConfig, base_lr: f64) -> Box<dyn Scheduler + Send> {
    match *config {
        SchedulerConfig::Step { step_size, gamma } => {
            Box::new(StepScheduler::new(base_lr, step_size, gamma))
        }
        SchedulerConfig::Cosine { t_max, eta_min } => {
            Box::new(CosineScheduler::new(base_lr, t_max, eta_min))
        }
    }
}
