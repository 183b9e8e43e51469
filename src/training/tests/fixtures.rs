//! Test fixtures: a toy detector, canned per-scale losses and run configs

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarMap};

use crate::config::{DegenerateBatchPolicy, RunConfig};
use crate::error::{Error, Result};
use crate::training::data::{DetectionBatch, InMemoryBatchSource};
use crate::training::loss::{LossAggregator, ScaleLoss};
use crate::training::network::{named_vars, DetectionNetwork, NUM_SCALES};
use crate::training::optimizers::{create_optimizer, create_scheduler};
use crate::training::phase::{Phase, TrainableParameterSet};
use crate::training::trainer::TrainingState;

/// Groups exposed by [`ToyNetwork`]
pub const TOY_GROUPS: [&str; 5] = ["backbone", "neck", "yolo_head1", "yolo_head2", "yolo_head3"];

const HEADS: [&str; NUM_SCALES] = ["yolo_head1.w", "yolo_head2.w", "yolo_head3.w"];

/// Linear stand-in for a detector
///
/// `[B, 2]` inputs go through `backbone.w` and `neck.w` (both `[2, 2]`), then
/// each head maps to a `[B, 1]` output.
pub struct ToyNetwork {
    var_map: VarMap,
    training: bool,
}

impl ToyNetwork {
    /// Every weight set to `value`
    pub fn new(device: &Device, value: f64) -> Result<Self> {
        let var_map = VarMap::new();
        var_map.get((2, 2), "backbone.w", Init::Const(value), DType::F32, device)?;
        var_map.get((2, 2), "neck.w", Init::Const(value), DType::F32, device)?;
        for head in HEADS {
            var_map.get((2, 1), head, Init::Const(value), DType::F32, device)?;
        }
        Ok(Self {
            var_map,
            training: true,
        })
    }

    fn param(&self, name: &str) -> Result<Tensor> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| Error::internal("variable map lock poisoned"))?;
        data.get(name)
            .map(|var| var.as_tensor().clone())
            .ok_or_else(|| Error::internal(format!("no variable {}", name)))
    }

    /// Variable by name
    pub fn var(&self, name: &str) -> Result<Var> {
        named_vars(&self.var_map)?
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, var)| var)
            .ok_or_else(|| Error::internal(format!("no variable {}", name)))
    }

    /// Flattened copy of every weight, keyed by variable name
    pub fn snapshot(&self) -> Result<BTreeMap<String, Vec<f32>>> {
        let mut values = BTreeMap::new();
        for (name, var) in named_vars(&self.var_map)? {
            values.insert(name, var.as_tensor().flatten_all()?.to_vec1::<f32>()?);
        }
        Ok(values)
    }
}

impl DetectionNetwork for ToyNetwork {
    fn forward(&self, images: &Tensor) -> Result<[Tensor; NUM_SCALES]> {
        let hidden = images.matmul(&self.param("backbone.w")?)?;
        let hidden = hidden.matmul(&self.param("neck.w")?)?;
        Ok([
            hidden.matmul(&self.param(HEADS[0])?)?,
            hidden.matmul(&self.param(HEADS[1])?)?,
            hidden.matmul(&self.param(HEADS[2])?)?,
        ])
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// `sum(output²)` with a fixed positive count per scale
pub struct SquaredOutputLoss {
    /// Positive count reported for every scale
    pub positives: usize,
}

impl ScaleLoss for SquaredOutputLoss {
    fn compute(&self, _scale: usize, output: &Tensor, _targets: &[Tensor]) -> Result<(Tensor, usize)> {
        Ok((output.sqr()?.sum_all()?, self.positives))
    }
}

/// Canned loss values and counts, independent of the output
pub struct FixedScaleLoss {
    /// Loss per scale
    pub losses: [f32; NUM_SCALES],
    /// Positive count per scale
    pub counts: [usize; NUM_SCALES],
}

impl ScaleLoss for FixedScaleLoss {
    fn compute(&self, scale: usize, output: &Tensor, _targets: &[Tensor]) -> Result<(Tensor, usize)> {
        let loss = Tensor::new(self.losses[scale], output.device())?;
        Ok((loss, self.counts[scale]))
    }
}

/// Always NaN
pub struct NanLoss;

impl ScaleLoss for NanLoss {
    fn compute(&self, _scale: usize, output: &Tensor, _targets: &[Tensor]) -> Result<(Tensor, usize)> {
        Ok(((output.sum_all()? * f64::NAN)?, 1))
    }
}

/// Aggregator with the floor-at-one policy
pub fn aggregator(loss: impl ScaleLoss + Send + Sync + 'static) -> LossAggregator {
    LossAggregator::new(Box::new(loss), DegenerateBatchPolicy::FloorAtOne)
}

/// `count` batches of `batch_size` all-ones inputs with no boxes
pub fn toy_batches(count: usize, batch_size: usize, device: &Device) -> Result<Vec<DetectionBatch>> {
    (0..count)
        .map(|_| -> Result<DetectionBatch> {
            let targets = (0..batch_size)
                .map(|_| Tensor::zeros((0, 5), DType::F32, device))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(DetectionBatch {
                images: Tensor::ones((batch_size, 2), DType::F32, device)?,
                targets,
            })
        })
        .collect()
}

/// In-memory source of [`toy_batches`]
pub fn toy_source(count: usize, device: &Device) -> Result<InMemoryBatchSource> {
    Ok(InMemoryBatchSource::new(toy_batches(count, 2, device)?))
}

/// Small run writing into `dir` with breakpoints `(f, p, u)`
pub fn toy_config(dir: &Path, (f, p, u): (usize, usize, usize), run_id: &str) -> RunConfig {
    let mut config = RunConfig::default();
    config.run.run_id = Some(run_id.to_string());
    config.phases.freeze_end = f;
    config.phases.partial_end = p;
    config.phases.unfreeze_end = u;
    config.phases.freeze_lr = 0.1;
    config.phases.partial_lr = 0.05;
    config.phases.unfreeze_lr = 0.01;
    config.checkpointing.checkpoint_dir = dir.join("checkpoints");
    config.checkpointing.log_dir = dir.join("logs");
    config.logging.progress = false;
    config
}

/// Fresh state for `phase` at `epoch`, bound to that phase's trainable groups
pub fn state_for<N: DetectionNetwork>(network: &N, config: &RunConfig, phase: Phase, epoch: usize) -> Result<TrainingState> {
    let groups = network.parameter_groups()?;
    let names = groups.keys().cloned().collect();
    let trainable = TrainableParameterSet::for_phase(phase, &config.groups, &names)?;
    let params = groups
        .into_iter()
        .filter(|(group, _)| trainable.is_trainable(group))
        .flat_map(|(_, vars)| vars)
        .collect();

    let lr = config.phases.learning_rate(phase);
    Ok(TrainingState {
        epoch,
        loss_history: Vec::new(),
        train_loss_history: Vec::new(),
        phase,
        optimizer: create_optimizer(&config.optimizer, params, lr),
        scheduler: create_scheduler(&config.scheduler, lr),
        trainable,
    })
}
