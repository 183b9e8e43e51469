//! Adam / AdamW optimizer
//!
//! Moment buffers are keyed by parameter name so they can be written to and
//! read back from a checkpoint without depending on variable identity.

use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use tracing::debug;

use super::{Optimizer, OptimizerStateDict};
use crate::error::Result;

/// Adam optimizer, optionally with decoupled weight decay (AdamW)
pub struct AdamOptimizer {
    /// Parameters updated by this optimizer, by name
    params: Vec<(String, Var)>,

    /// Learning rate
    learning_rate: f64,

    /// Beta1 parameter (momentum)
    beta1: f64,

    /// Beta2 parameter (RMSprop)
    beta2: f64,

    /// Epsilon for numerical stability
    epsilon: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Apply weight decay to the weights instead of the gradient
    decoupled: bool,

    /// Current step count
    step_count: usize,

    /// First moment estimates
    momentum: HashMap<String, Tensor>,

    /// Second moment estimates
    variance: HashMap<String, Tensor>,
}

impl AdamOptimizer {
    /// Create an optimizer bound to `params`
    pub fn new(
        params: Vec<(String, Var)>,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
        decoupled: bool,
    ) -> Self {
        Self {
            params,
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            decoupled,
            step_count: 0,
            momentum: HashMap::new(),
            variance: HashMap::new(),
        }
    }

    /// Names of the parameters this optimizer updates
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(name, _)| name.as_str())
    }

    fn hyperparameters(&self) -> BTreeMap<String, f64> {
        let mut hyperparameters = BTreeMap::new();
        hyperparameters.insert("beta1".to_string(), self.beta1);
        hyperparameters.insert("beta2".to_string(), self.beta2);
        hyperparameters.insert("epsilon".to_string(), self.epsilon);
        hyperparameters.insert("weight_decay".to_string(), self.weight_decay);
        hyperparameters
    }
}

impl Optimizer for AdamOptimizer {
    fn name(&self) -> &str {
        if self.decoupled {
            "adamw"
        } else {
            "adam"
        }
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;

        let t = self.step_count as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        for (name, var) in self.params.iter() {
            let theta = var.as_tensor();
            let Some(grad) = gradients.get(theta) else {
                continue;
            };

            // Coupled decay folds the L2 penalty into the gradient
            let grad = if !self.decoupled && self.weight_decay > 0.0 {
                (grad + (theta * self.weight_decay)?)?
            } else {
                grad.clone()
            };

            // m_t = β₁ * m_{t-1} + (1 - β₁) * g_t
            let m = match self.momentum.get(name) {
                Some(prev) => ((prev * self.beta1)? + (&grad * (1.0 - self.beta1))?)?,
                None => (&grad * (1.0 - self.beta1))?,
            };

            // v_t = β₂ * v_{t-1} + (1 - β₂) * g_t²
            let grad_squared = grad.sqr()?;
            let v = match self.variance.get(name) {
                Some(prev) => ((prev * self.beta2)? + (&grad_squared * (1.0 - self.beta2))?)?,
                None => (&grad_squared * (1.0 - self.beta2))?,
            };
            let m = m.detach();
            let v = v.detach();

            let m_hat = (&m / bias_correction1)?;
            let v_hat = (&v / bias_correction2)?;
            let update = (m_hat / (v_hat.sqrt()? + self.epsilon)?)?;

            // θ_t = θ_{t-1} - α * (m̂_t / (√v̂_t + ε) + λ * θ_{t-1})
            let mut next = (theta - (update * self.learning_rate)?)?;
            if self.decoupled && self.weight_decay > 0.0 {
                next = (next - (theta * (self.learning_rate * self.weight_decay))?)?;
            }
            var.set(&next)?;

            self.momentum.insert(name.clone(), m);
            self.variance.insert(name.clone(), v);
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state_dict(&self) -> Result<OptimizerStateDict> {
        let mut buffers = HashMap::with_capacity(self.momentum.len() * 2);
        for (name, tensor) in &self.momentum {
            buffers.insert(format!("m.{}", name), tensor.clone());
        }
        for (name, tensor) in &self.variance {
            buffers.insert(format!("v.{}", name), tensor.clone());
        }

        Ok(OptimizerStateDict {
            optimizer_type: self.name().to_string(),
            step_count: self.step_count,
            learning_rate: self.learning_rate,
            hyperparameters: self.hyperparameters(),
            buffers,
        })
    }

    fn load_state_dict(&mut self, state: &OptimizerStateDict) -> Result<usize> {
        let mut restored = 0;
        for (name, var) in self.params.iter() {
            let shape = var.as_tensor().dims();
            let m = state.buffers.get(&format!("m.{}", name));
            let v = state.buffers.get(&format!("v.{}", name));
            match (m, v) {
                (Some(m), Some(v)) if m.dims() == shape && v.dims() == shape => {
                    let device = var.as_tensor().device();
                    self.momentum.insert(name.clone(), m.to_device(device)?);
                    self.variance.insert(name.clone(), v.to_device(device)?);
                    restored += 1;
                }
                (Some(_), Some(_)) => {
                    debug!("Dropping moment buffers for {}: shape changed", name);
                }
                _ => {}
            }
        }

        // Bias correction must match the moments; fresh moments start at step 0
        if restored > 0 {
            self.step_count = state.step_count;
        }
        Ok(restored)
    }

    fn parameter_count(&self) -> usize {
        self.params.len()
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}
