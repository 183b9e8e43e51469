//! Per-epoch learning rate schedules
//!
//! Both schedules are pure functions of the number of completed steps, which
//! lets a resumed run fast-forward to the exact rate a cold run would have.

use super::Scheduler;

/// Step decay: `base * gamma^floor(t / step_size)`
pub struct StepScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Steps between decays
    step_size: usize,

    /// Multiplicative decay factor
    gamma: f64,

    /// Current step
    current_step: usize,
}

impl StepScheduler {
    /// Create a new step scheduler
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            current_step: 0,
        }
    }
}

impl Scheduler for StepScheduler {
    fn name(&self) -> &str {
        "step"
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn get_lr(&self) -> f64 {
        let decays = (self.current_step / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    fn step_count(&self) -> usize {
        self.current_step
    }

    fn reset(&mut self) {
        self.current_step = 0;
    }
}

/// Cosine annealing without restarts: the rate oscillates with period
/// `2 * t_max` between `base_lr` and `eta_min`
pub struct CosineScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Minimum learning rate
    eta_min: f64,

    /// Half period
    t_max: usize,

    /// Current step
    current_step: usize,
}

impl CosineScheduler {
    /// Create a new cosine scheduler
    pub fn new(base_lr: f64, t_max: usize, eta_min: f64) -> Self {
        Self {
            base_lr,
            eta_min,
            t_max: t_max.max(1),
            current_step: 0,
        }
    }
}

impl Scheduler for CosineScheduler {
    fn name(&self) -> &str {
        "cosine"
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn get_lr(&self) -> f64 {
        let progress = self.current_step as f64 / self.t_max as f64;
        let cosine_factor = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.eta_min + (self.base_lr - self.eta_min) * cosine_factor
    }

    fn step_count(&self) -> usize {
        self.current_step
    }

    fn reset(&mut self) {
        self.current_step = 0;
    }
}
