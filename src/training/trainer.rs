//! Staged trainer
//!
//! Drives a run through the freeze, partial-unfreeze and full-unfreeze
//! phases. Entering a phase recomputes trainability from scratch, throws the
//! previous optimizer away and builds a new optimizer and schedule at the
//! phase's base learning rate. Within a phase the epoch runner is invoked
//! once per epoch and the schedule is stepped after every epoch.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{Device, Var};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::training::artifacts::{ArtifactWriter, LossRecord};
use crate::training::checkpoint::{load_weights_file, restore_weights, Checkpoint, CheckpointId, CheckpointStore};
use crate::training::data::BatchSource;
use crate::training::epoch::{EpochRunner, PassStats};
use crate::training::loss::LossAggregator;
use crate::training::metrics::EpochMetrics;
use crate::training::network::DetectionNetwork;
use crate::training::optimizers::{create_optimizer, create_scheduler, Optimizer, Scheduler};
use crate::training::phase::{Phase, PhaseSchedule, TrainableParameterSet};

/// Mutable state of a run, owned by the trainer
///
/// Replaced piecewise at phase transitions and advanced at epoch boundaries.
pub struct TrainingState {
    /// Next epoch to run
    pub epoch: usize,
    /// Validation loss per completed epoch
    pub loss_history: Vec<f64>,
    /// Training loss per completed epoch
    pub train_loss_history: Vec<f64>,
    /// Active phase
    pub phase: Phase,
    /// Optimizer of the active phase
    pub optimizer: Box<dyn Optimizer + Send>,
    /// Learning-rate schedule of the active phase
    pub scheduler: Box<dyn Scheduler + Send>,
    /// Trainability of the active phase
    pub trainable: TrainableParameterSet,
}

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    /// A phase became active
    PhaseEntered {
        /// Phase entered
        phase: Phase,
        /// First epoch run in it
        start_epoch: usize,
        /// Exclusive end of the phase
        end_epoch: usize,
        /// Base learning rate
        learning_rate: f64,
        /// Groups the new optimizer updates
        trainable_groups: Vec<String>,
    },
    /// A phase had no epochs left to run
    PhaseSkipped {
        /// Phase skipped
        phase: Phase,
    },
    /// An epoch finished and was checkpointed
    EpochCompleted {
        /// Loss summary of the epoch
        metrics: EpochMetrics,
    },
    /// A checkpoint was written
    CheckpointSaved {
        /// Id of the new checkpoint
        id: CheckpointId,
    },
    /// A batch had no positive anchor match
    DegenerateBatch {
        /// Epoch index
        epoch: usize,
        /// Batch index within the pass
        batch: usize,
        /// Whether the optimizer step was skipped
        skipped: bool,
    },
    /// The run finished
    TrainingCompleted {
        /// Epochs run by this invocation
        epochs_run: usize,
    },
}

/// Per-epoch record of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Loss summary
    pub metrics: EpochMetrics,
    /// Groups that were trainable during the epoch
    pub trainable_groups: Vec<String>,
    /// Checkpoint written for the epoch
    pub checkpoint: CheckpointId,
}

/// Training result information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Run id checkpoints and artifacts were written under
    pub run_id: String,
    /// First epoch this invocation ran
    pub start_epoch: usize,
    /// Epochs run by this invocation
    pub epochs: Vec<EpochRecord>,
    /// Validation loss of every completed epoch of the run
    pub loss_history: Vec<f64>,
    /// Final weights, if they could be written
    pub final_weights: Option<PathBuf>,
    /// Wall time in seconds
    pub duration_secs: f64,
}

/// Staged freeze/unfreeze trainer
pub struct StagedTrainer<'a, N: DetectionNetwork + ?Sized> {
    config: RunConfig,
    schedule: PhaseSchedule,
    network: &'a mut N,
    train_source: Box<dyn BatchSource + 'a>,
    val_source: Box<dyn BatchSource + 'a>,
    runner: EpochRunner,
    store: CheckpointStore,
    device: Device,
    run_id: String,
}

impl<'a, N: DetectionNetwork + ?Sized> StagedTrainer<'a, N> {
    /// Create a trainer; every configuration problem surfaces here
    pub fn new(
        config: RunConfig,
        network: &'a mut N,
        aggregator: LossAggregator,
        train_source: Box<dyn BatchSource + 'a>,
        val_source: Box<dyn BatchSource + 'a>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let schedule = config.schedule()?;

        let network_groups = network.group_names()?;
        config.groups.validate_against(&network_groups)?;
        for phase in Phase::ALL {
            TrainableParameterSet::for_phase(phase, &config.groups, &network_groups)?;
        }

        let run_id = resolve_run_id(&config);
        let store = CheckpointStore::new(&config.checkpointing.checkpoint_dir, device.clone())?;
        let runner = EpochRunner::new(aggregator, schedule.total_epochs())
            .with_progress(config.logging.progress);

        debug!(
            "Trainer for run {} with groups {:?}",
            run_id, network_groups
        );

        Ok(Self {
            config,
            schedule,
            network,
            train_source,
            val_source,
            runner,
            store,
            device,
            run_id,
        })
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.runner = self.runner.with_events(tx);
        self
    }

    /// Flag that requests a stop at the next batch boundary
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.runner = self.runner.with_shutdown(shutdown);
        self
    }

    /// Run id checkpoints are written under
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Phase breakpoints
    pub fn schedule(&self) -> &PhaseSchedule {
        &self.schedule
    }

    /// Run every remaining epoch of every phase
    pub fn run(&mut self) -> Result<TrainingResult> {
        let started = Instant::now();

        let resume_id = match self.config.run.resume.as_deref() {
            Some(reference) => Some(self.store.resolve(reference)?),
            None => None,
        };
        let start_epoch = resume_id.as_ref().map(|id| id.epoch + 1).unwrap_or(0);
        self.check_run_is_free(start_epoch)?;

        let restored = match resume_id {
            Some(id) => Some(self.load_resume_point(&id)?),
            None => {
                self.load_pretrained()?;
                None
            }
        };

        let (mut loss_history, mut train_loss_history) = match &restored {
            Some(checkpoint) => (
                checkpoint.metadata.loss_history.clone(),
                checkpoint.metadata.train_loss_history.clone(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        let artifacts = ArtifactWriter::new(&self.config.checkpointing.log_dir, &self.run_id)?;
        info!(
            "Run {}: epochs {}..{} (F={}, P={}, U={})",
            self.run_id,
            start_epoch,
            self.schedule.total_epochs(),
            self.schedule.range(Phase::Freeze).end,
            self.schedule.range(Phase::PartialUnfreeze).end,
            self.schedule.total_epochs()
        );

        let mut records = Vec::new();
        let mut restored = restored;
        for phase in Phase::ALL {
            let remaining = self.schedule.remaining(phase, start_epoch);
            if remaining.is_empty() {
                info!("Skipping {} phase: no epochs left to run", phase);
                self.runner.send_event(TrainingEvent::PhaseSkipped { phase });
                continue;
            }

            let mut state = self.enter_phase(phase, remaining.start, loss_history, train_loss_history)?;
            if let Some(checkpoint) = restored.take() {
                self.resume_into(&mut state, &checkpoint)?;
            }

            for _ in remaining {
                let outcome = self.runner.run_epoch(
                    &mut *self.network,
                    &mut state,
                    self.train_source.as_ref(),
                    self.val_source.as_ref(),
                    &self.store,
                    &self.run_id,
                )?;

                self.write_epoch_artifacts(&artifacts, &state, &outcome.metrics)?;

                state.scheduler.step();
                let next_lr = state.scheduler.get_lr();
                state.optimizer.set_learning_rate(next_lr);
                debug!("Learning rate for next epoch: {:.2e}", next_lr);

                self.runner.send_event(TrainingEvent::EpochCompleted {
                    metrics: outcome.metrics.clone(),
                });
                records.push(EpochRecord {
                    metrics: outcome.metrics,
                    trainable_groups: state.trainable.trainable_groups(),
                    checkpoint: outcome.checkpoint,
                });
            }

            loss_history = state.loss_history;
            train_loss_history = state.train_loss_history;
        }

        if records.is_empty() {
            info!("Nothing to run: training already reached epoch {}", start_epoch);
        }

        let final_weights = artifacts.save_final_weights(self.network.var_map());
        self.runner.send_event(TrainingEvent::TrainingCompleted {
            epochs_run: records.len(),
        });

        let duration_secs = started.elapsed().as_secs_f64();
        info!("Training completed in {:.1}s ({} epochs)", duration_secs, records.len());

        Ok(TrainingResult {
            run_id: self.run_id.clone(),
            start_epoch,
            epochs: records,
            loss_history,
            final_weights,
            duration_secs,
        })
    }

    /// Evaluate the current weights on the validation source
    pub fn evaluate(&mut self) -> Result<PassStats> {
        if let Some(reference) = self.config.run.resume.clone() {
            let id = self.store.resolve(&reference)?;
            self.load_resume_point(&id)?;
        } else {
            self.load_pretrained()?;
        }
        self.runner
            .validate_pass(&mut *self.network, self.val_source.as_ref(), 0, Phase::FullUnfreeze)
    }

    /// Build the state of a freshly entered phase
    fn enter_phase(
        &mut self,
        phase: Phase,
        start_epoch: usize,
        loss_history: Vec<f64>,
        train_loss_history: Vec<f64>,
    ) -> Result<TrainingState> {
        let groups = self.network.parameter_groups()?;
        let network_groups = groups.keys().cloned().collect();
        let trainable = TrainableParameterSet::for_phase(phase, &self.config.groups, &network_groups)?;

        let params: Vec<(String, Var)> = groups
            .into_iter()
            .filter(|(group, _)| trainable.is_trainable(group))
            .flat_map(|(_, vars)| vars)
            .collect();

        let base_lr = self.config.phases.learning_rate(phase);
        let optimizer = create_optimizer(&self.config.optimizer, params, base_lr);
        let scheduler = create_scheduler(&self.config.scheduler, base_lr);

        let range = self.schedule.range(phase);
        info!(
            "Entering {} phase: epochs {}..{}, lr {:.1e}, {} parameters in {:?}",
            phase,
            start_epoch,
            range.end,
            base_lr,
            optimizer.parameter_count(),
            trainable.trainable_groups()
        );
        self.runner.send_event(TrainingEvent::PhaseEntered {
            phase,
            start_epoch,
            end_epoch: range.end,
            learning_rate: base_lr,
            trainable_groups: trainable.trainable_groups(),
        });

        Ok(TrainingState {
            epoch: start_epoch,
            loss_history,
            train_loss_history,
            phase,
            optimizer,
            scheduler,
            trainable,
        })
    }

    /// Align a freshly entered phase with a checkpoint taken inside it
    fn resume_into(&self, state: &mut TrainingState, checkpoint: &Checkpoint) -> Result<()> {
        let phase_start = self.schedule.range(state.phase).start;
        let elapsed = state.epoch - phase_start;
        state.scheduler.fast_forward(elapsed);
        state.optimizer.set_learning_rate(state.scheduler.get_lr());

        let checkpoint_phase = self.schedule.phase_for_epoch(checkpoint.epoch());
        if checkpoint.metadata.phase != checkpoint_phase.unwrap_or(checkpoint.metadata.phase) {
            warn!(
                "Checkpoint {} was labelled {}, the current breakpoints place epoch {} in {:?}",
                checkpoint.metadata.id(),
                checkpoint.metadata.phase,
                checkpoint.epoch(),
                checkpoint_phase
            );
        }

        if checkpoint_phase == Some(state.phase) {
            let restored = state.optimizer.load_state_dict(&checkpoint.optimizer)?;
            info!(
                "Resumed {} phase at epoch {}: restored optimizer buffers for {}/{} parameters, lr {:.2e}",
                state.phase,
                state.epoch,
                restored,
                state.optimizer.parameter_count(),
                state.optimizer.learning_rate()
            );
        } else {
            info!(
                "Resumed at the start of the {} phase (epoch {}) with a fresh optimizer",
                state.phase, state.epoch
            );
        }
        Ok(())
    }

    /// Fail before touching the network if an epoch this run would save already exists
    fn check_run_is_free(&self, start_epoch: usize) -> Result<()> {
        let end = self.schedule.total_epochs();
        match self
            .store
            .list(&self.run_id)?
            .into_iter()
            .find(|id| (start_epoch..end).contains(&id.epoch))
        {
            Some(existing) => Err(Error::CheckpointExists {
                path: self.store.checkpoint_dir(&existing),
            }),
            None => Ok(()),
        }
    }

    fn load_resume_point(&mut self, id: &CheckpointId) -> Result<Checkpoint> {
        let checkpoint = self.store.load(id)?;
        let report = restore_weights(self.network.var_map(), &checkpoint.weights)?;
        if !report.is_complete() {
            warn!(
                "Checkpoint {} did not cover the network: {} mismatched, {} missing",
                id,
                report.mismatched.len(),
                report.missing.len()
            );
        }
        info!("Loaded checkpoint {} (completed epoch {})", id, checkpoint.epoch());
        Ok(checkpoint)
    }

    fn load_pretrained(&mut self) -> Result<()> {
        let Some(path) = self.config.model.pretrained.clone() else {
            return Ok(());
        };
        info!("Loading weights from {}", path.display());
        let report = load_weights_file(self.network.var_map(), &path, &self.device)?;
        info!(
            "Transferred {} tensors ({} mismatched, {} not in file)",
            report.loaded.len(),
            report.mismatched.len(),
            report.missing.len()
        );
        Ok(())
    }

    fn write_epoch_artifacts(
        &self,
        artifacts: &ArtifactWriter,
        state: &TrainingState,
        metrics: &EpochMetrics,
    ) -> Result<()> {
        let records: Vec<LossRecord> = state
            .loss_history
            .iter()
            .zip(state.train_loss_history.iter())
            .enumerate()
            .map(|(epoch, (&val_loss, &train_loss))| LossRecord {
                epoch,
                train_loss,
                val_loss,
            })
            .collect();
        artifacts.write_loss_history(&records)?;

        if self.config.checkpointing.save_epoch_weights {
            artifacts.save_epoch_weights(
                self.network.var_map(),
                metrics.epoch,
                metrics.train_loss,
                metrics.val_loss,
            )?;
        }
        Ok(())
    }
}

/// Run id for a new invocation
///
/// An explicit id wins; a resumed run keeps writing under the id it resumed
/// from; otherwise the current local time (`%m%d-%H%M%S`) is used.
pub fn resolve_run_id(config: &RunConfig) -> String {
    if let Some(run_id) = &config.run.run_id {
        return run_id.clone();
    }
    if let Some((run_id, _)) = config
        .run
        .resume
        .as_deref()
        .and_then(|r| r.trim_end_matches('/').rsplit_once('/'))
    {
        return run_id.to_string();
    }
    Local::now().format("%m%d-%H%M%S").to_string()
}
