//! One epoch: a training pass, a validation pass and a checkpoint
//!
//! An epoch either completes fully or contributes nothing. The loss history
//! entry and the checkpoint are only produced once both passes finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::training::checkpoint::{CheckpointId, CheckpointMetadata, CheckpointStore};
use crate::training::data::BatchSource;
use crate::training::loss::LossAggregator;
use crate::training::metrics::{EpochMetrics, RunningMean};
use crate::training::network::DetectionNetwork;
use crate::training::optimizers::Optimizer;
use crate::training::phase::Phase;
use crate::training::progress::PassProgress;
use crate::training::trainer::{TrainingEvent, TrainingState};

/// Which pass a batch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Forward, backward and optimizer step
    Train,
    /// Forward only
    Validate,
}

/// Counters of one pass
#[derive(Debug, Clone, Copy, Default)]
pub struct PassStats {
    /// Mean over the batches that counted
    pub mean: RunningMean,
    /// Batches with no positive match
    pub degenerate: usize,
    /// Batches left out under the skip-step policy
    pub skipped: usize,
}

/// Result of a completed epoch
#[derive(Debug, Clone)]
pub struct EpochOutcome {
    /// Loss summary
    pub metrics: EpochMetrics,
    /// Checkpoint written at the end of the epoch
    pub checkpoint: CheckpointId,
}

/// Runs the passes of an epoch
pub struct EpochRunner {
    aggregator: LossAggregator,
    total_epochs: usize,
    shutdown: Arc<AtomicBool>,
    progress: bool,
    events: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

impl EpochRunner {
    /// Create a runner; `total_epochs` is only used for display
    pub fn new(aggregator: LossAggregator, total_epochs: usize) -> Self {
        Self {
            aggregator,
            total_epochs,
            shutdown: Arc::new(AtomicBool::new(false)),
            progress: false,
            events: None,
        }
    }

    /// Flag checked between batches
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Draw progress bars
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Send events to a monitor
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub(crate) fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn check_shutdown(&self, epoch: usize, batch: usize) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Interrupted { epoch, batch });
        }
        Ok(())
    }

    /// Run the training pass: one optimizer step per batch
    pub fn train_pass<N: DetectionNetwork + ?Sized>(
        &self,
        network: &mut N,
        optimizer: &mut dyn Optimizer,
        source: &dyn BatchSource,
        epoch: usize,
        phase: Phase,
    ) -> Result<PassStats> {
        network.set_training(true);
        self.run_pass(network, Some(optimizer), source, epoch, phase)
    }

    /// Run the validation pass: forward only, the optimizer is never touched
    pub fn validate_pass<N: DetectionNetwork + ?Sized>(
        &self,
        network: &mut N,
        source: &dyn BatchSource,
        epoch: usize,
        phase: Phase,
    ) -> Result<PassStats> {
        network.set_training(false);
        self.run_pass(network, None, source, epoch, phase)
    }

    fn run_pass<N: DetectionNetwork + ?Sized>(
        &self,
        network: &N,
        mut optimizer: Option<&mut dyn Optimizer>,
        source: &dyn BatchSource,
        epoch: usize,
        phase: Phase,
    ) -> Result<PassStats> {
        let pass = if optimizer.is_some() { Pass::Train } else { Pass::Validate };
        let declared = source.len();
        let label = match pass {
            Pass::Train => format!("Epoch {}/{}", epoch + 1, self.total_epochs),
            Pass::Validate => format!("Val {}/{}", epoch + 1, self.total_epochs),
        };
        let progress = PassProgress::new(&label, declared, self.progress);

        let mut stats = PassStats::default();
        let mut batches = source.batches(epoch)?.take(declared);
        let mut batch_idx = 0;
        loop {
            self.check_shutdown(epoch, batch_idx)?;
            let Some(batch) = batches.next() else {
                break;
            };
            let batch = batch?;

            let outputs = network.forward(&batch.images)?;
            let loss = self.aggregator.compute(&outputs, &batch.targets)?;
            let value = loss.total.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
            if !value.is_finite() {
                return Err(Error::NumericInstability {
                    phase,
                    epoch,
                    batch: batch_idx,
                    value,
                });
            }

            if loss.degenerate {
                stats.degenerate += 1;
                warn!(
                    "Epoch {} batch {} ({:?}): no positive anchor matches, policy {:?}",
                    epoch,
                    batch_idx,
                    pass,
                    self.aggregator.policy()
                );
                self.send_event(TrainingEvent::DegenerateBatch {
                    epoch,
                    batch: batch_idx,
                    skipped: loss.skip_step,
                });
            }

            if loss.skip_step {
                stats.skipped += 1;
            } else {
                if let Some(optimizer) = optimizer.as_deref_mut() {
                    let grads = loss.total.backward()?;
                    optimizer.step(&grads)?;
                }
                stats.mean.push(value);
            }

            let lr = optimizer.as_deref().map(|o| o.learning_rate());
            progress.advance(stats.mean.mean(), lr);
            batch_idx += 1;
        }
        progress.finish();

        if batch_idx < declared {
            debug!(
                "{:?} pass of epoch {} ran {} of {} declared batches",
                pass, epoch, batch_idx, declared
            );
        }

        Ok(stats)
    }

    /// Run one full epoch and checkpoint it
    ///
    /// On success the validation mean is appended to the loss history and
    /// `state.epoch` advances past `epoch`. On failure the state is left as
    /// it was before the epoch, apart from weights already updated.
    pub fn run_epoch<N: DetectionNetwork + ?Sized>(
        &self,
        network: &mut N,
        state: &mut TrainingState,
        train_source: &dyn BatchSource,
        val_source: &dyn BatchSource,
        store: &CheckpointStore,
        run_id: &str,
    ) -> Result<EpochOutcome> {
        let start = Instant::now();
        let epoch = state.epoch;
        let phase = state.phase;
        let learning_rate = state.optimizer.learning_rate();

        let train = self.train_pass(network, &mut *state.optimizer, train_source, epoch, phase)?;

        debug!("Epoch {}: validation pass", epoch);
        let val = self.validate_pass(network, val_source, epoch, phase)?;
        if val.mean.count() == 0 {
            warn!("Epoch {}: no validation batches ran, reporting 0.0", epoch);
        }

        let train_loss = train.mean.mean();
        let val_loss = val.mean.mean();

        let mut loss_history = state.loss_history.clone();
        loss_history.push(val_loss);
        let mut train_loss_history = state.train_loss_history.clone();
        train_loss_history.push(train_loss);

        let optimizer_state = state.optimizer.state_dict()?;
        let metadata = CheckpointMetadata::new(
            run_id,
            epoch,
            phase,
            train_loss,
            val_loss,
            learning_rate,
            loss_history.clone(),
            train_loss_history.clone(),
            optimizer_state.clone(),
        );
        let checkpoint = store.save(network.var_map(), &optimizer_state, &metadata)?;

        state.loss_history = loss_history;
        state.train_loss_history = train_loss_history;
        state.epoch = epoch + 1;

        info!(
            "Epoch {}/{} [{}] - Train Loss: {:.4} || Val Loss: {:.4}",
            epoch + 1,
            self.total_epochs,
            phase,
            train_loss,
            val_loss
        );
        self.send_event(TrainingEvent::CheckpointSaved {
            id: checkpoint.clone(),
        });

        Ok(EpochOutcome {
            metrics: EpochMetrics {
                epoch,
                phase,
                train_loss,
                val_loss,
                learning_rate,
                train_batches: train.mean.count(),
                val_batches: val.mean.count(),
                degenerate_batches: train.degenerate + val.degenerate,
                skipped_steps: train.skipped,
                duration_secs: start.elapsed().as_secs_f64(),
            },
            checkpoint,
        })
    }
}
