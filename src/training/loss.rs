//! Positive-count normalized loss aggregation
//!
//! Each scale reports a summed loss and the number of anchors that matched a
//! ground-truth box. The batch loss is the sum of the three losses divided
//! by the total number of positives, floored at one.

use candle_core::Tensor;

use crate::config::DegenerateBatchPolicy;
use crate::error::Result;
use crate::training::network::NUM_SCALES;

/// Per-scale detection loss
pub trait ScaleLoss {
    /// Loss of one scale's raw output against the batch targets
    ///
    /// `scale` is 0 for the coarsest (stride 32) output. `targets` holds one
    /// `[n, 5]` tensor per image with normalized `(cx, cy, w, h, class)` rows.
    /// Returns the summed loss as a scalar tensor and the positive count.
    fn compute(&self, scale: usize, output: &Tensor, targets: &[Tensor]) -> Result<(Tensor, usize)>;
}

/// Raw per-scale results of one batch
#[derive(Debug, Clone)]
pub struct BatchLossResult {
    /// Scalar loss per scale
    pub per_scale_losses: [Tensor; NUM_SCALES],
    /// Matched anchors per scale
    pub per_scale_positive_counts: [usize; NUM_SCALES],
}

impl BatchLossResult {
    /// Total positive count over all scales
    pub fn total_positives(&self) -> usize {
        self.per_scale_positive_counts.iter().sum()
    }

    /// Per-scale losses as plain numbers
    pub fn loss_values(&self) -> Result<[f64; NUM_SCALES]> {
        let mut values = [0.0; NUM_SCALES];
        for (value, loss) in values.iter_mut().zip(self.per_scale_losses.iter()) {
            *value = loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        }
        Ok(values)
    }
}

/// Normalized batch loss
#[derive(Debug, Clone)]
pub struct AggregatedLoss {
    /// Scalar loss tensor, still attached to the graph
    pub total: Tensor,
    /// Total positive count
    pub positives: usize,
    /// No scale produced a positive match
    pub degenerate: bool,
    /// The degenerate-batch policy asks for this step to be skipped
    pub skip_step: bool,
}

/// Combines the three per-scale losses of a batch into one scalar
pub struct LossAggregator {
    scale_loss: Box<dyn ScaleLoss + Send + Sync>,
    policy: DegenerateBatchPolicy,
}

impl LossAggregator {
    /// Create an aggregator around a per-scale loss
    pub fn new(scale_loss: Box<dyn ScaleLoss + Send + Sync>, policy: DegenerateBatchPolicy) -> Self {
        Self { scale_loss, policy }
    }

    /// Zero-positive handling in effect
    pub fn policy(&self) -> DegenerateBatchPolicy {
        self.policy
    }

    /// Run the per-scale loss on every output
    pub fn evaluate(&self, outputs: &[Tensor; NUM_SCALES], targets: &[Tensor]) -> Result<BatchLossResult> {
        let mut counts = [0usize; NUM_SCALES];
        let mut scale_loss = |scale: usize| -> Result<Tensor> {
            let (loss, count) = self.scale_loss.compute(scale, &outputs[scale], targets)?;
            counts[scale] = count;
            Ok(loss)
        };
        let per_scale_losses = [scale_loss(0)?, scale_loss(1)?, scale_loss(2)?];

        Ok(BatchLossResult {
            per_scale_losses,
            per_scale_positive_counts: counts,
        })
    }

    /// `sum(loss_i) / max(1, sum(count_i))`
    pub fn aggregate(&self, result: &BatchLossResult) -> Result<AggregatedLoss> {
        let [l0, l1, l2] = &result.per_scale_losses;
        let sum = ((l0 + l1)? + l2)?;

        let positives = result.total_positives();
        let degenerate = positives == 0;
        let total = (sum / normalizer(positives))?;

        Ok(AggregatedLoss {
            total,
            positives,
            degenerate,
            skip_step: degenerate && self.policy == DegenerateBatchPolicy::SkipStep,
        })
    }

    /// Evaluate and aggregate in one call
    pub fn compute(&self, outputs: &[Tensor; NUM_SCALES], targets: &[Tensor]) -> Result<AggregatedLoss> {
        let result = self.evaluate(outputs, targets)?;
        self.aggregate(&result)
    }
}

/// Scalar form of the aggregation for already-detached values
pub fn normalized_total(losses: [f64; NUM_SCALES], counts: [usize; NUM_SCALES]) -> f64 {
    losses.iter().sum::<f64>() / normalizer(counts.iter().sum())
}

fn normalizer(positives: usize) -> f64 {
    positives.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalized_total() {
        assert_relative_eq!(normalized_total([3.0, 1.0, 2.0], [2, 1, 1]), 1.5);
        assert_relative_eq!(normalized_total([3.0, 1.0, 2.0], [0, 0, 0]), 6.0);
        assert_relative_eq!(normalized_total([0.0, 0.0, 0.0], [0, 0, 0]), 0.0);
    }
}
