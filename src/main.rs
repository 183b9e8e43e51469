use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stagetrain::config::DeviceType;
use stagetrain::training::{
    discover_samples, read_loss_history, split_train_val, SampleDirBatchSource, TrainingResult,
};
use stagetrain::{
    logging, DetectionNetwork, LossAggregator, Phase, RunConfig, StagedTrainer, TinyDetector, TrainingEvent,
    YoloScaleLoss,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "stagetrain")]
#[command(about = "Staged freeze/unfreeze fine-tuning for three-scale detectors", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "STAGETRAIN_JSON_LOGS")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) a staged training run
    Train {
        /// Configuration file (JSON or YAML)
        #[arg(short, long, default_value = "stagetrain.yaml")]
        config: PathBuf,

        /// Resume from `<run_id>/epoch_<n>` or `<run_id>/latest`
        #[arg(long)]
        resume: Option<String>,

        /// Run id to write checkpoints under
        #[arg(long)]
        run_id: Option<String>,

        /// Override the dataset directory
        #[arg(long)]
        dataset: Option<PathBuf>,

        /// Override the device
        #[arg(long, value_parser = parse_device)]
        device: Option<DeviceType>,

        /// Disable progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Validate a configuration file against the detector
    Validate {
        /// Configuration file to validate
        #[arg(short, long, default_value = "stagetrain.yaml")]
        config: PathBuf,

        /// Also compute the validation loss of the configured weights
        #[arg(long)]
        evaluate: bool,
    },

    /// Write the default configuration
    InitConfig {
        /// Output path; the extension selects JSON or YAML
        #[arg(short, long, default_value = "stagetrain.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the loss history of a run
    History {
        /// Run id
        run_id: String,

        /// Log directory the run wrote to
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,
    },

    /// Show build information
    Info,
}

fn parse_device(s: &str) -> std::result::Result<DeviceType, String> {
    match s.to_ascii_lowercase().as_str() {
        "cpu" => Ok(DeviceType::Cpu),
        "cuda" => Ok(DeviceType::Cuda),
        "metal" => Ok(DeviceType::Metal),
        other => Err(format!("unknown device '{}' (cpu, cuda, metal)", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A config file can ask for JSON logs too; load errors surface later
    let config_json = match &cli.command {
        Commands::Train { config, .. } | Commands::Validate { config, .. } => RunConfig::from_file(config)
            .map(|c| c.logging.json)
            .unwrap_or(false),
        _ => false,
    };
    let json = cli.json || config_json;
    logging::init_logging(cli.verbose, cli.quiet, json).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Train {
            config,
            resume,
            run_id,
            dataset,
            device,
            no_progress,
        } => {
            let mut config = RunConfig::from_file(&config)
                .with_context(|| format!("Failed to load configuration from {}", config.display()))?;
            if resume.is_some() {
                config.run.resume = resume;
            }
            if run_id.is_some() {
                config.run.run_id = run_id;
            }
            if let Some(dataset) = dataset {
                config.data.dataset_dir = dataset;
            }
            if let Some(device) = device {
                config.run.device = device;
            }
            if no_progress || json || cli.quiet {
                config.logging.progress = false;
            }
            train(config).await?;
        }

        Commands::Validate { config, evaluate } => {
            validate_config(config, evaluate).await?;
        }

        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
            }
            RunConfig::default()
                .to_file(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Default configuration written to {}", output.display());
        }

        Commands::History { run_id, log_dir } => {
            show_history(&run_id, log_dir)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

/// Train sources over the configured dataset directory
fn build_sources(config: &RunConfig, device: &candle_core::Device) -> Result<(SampleDirBatchSource, SampleDirBatchSource)> {
    let samples = discover_samples(&config.data.dataset_dir).context("Failed to read the dataset")?;
    let (train, val) = split_train_val(samples, config.data.val_split, config.run.seed);
    info!("{} training samples, {} validation samples", train.len(), val.len());

    let train = SampleDirBatchSource::new(
        train,
        config.data.batch_size,
        config.data.shuffle_train,
        config.run.seed,
        device.clone(),
    );
    let val = SampleDirBatchSource::new(
        val,
        config.data.batch_size,
        config.data.shuffle_val,
        config.run.seed,
        device.clone(),
    );
    Ok((train, val))
}

fn run_training(
    config: RunConfig,
    shutdown: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TrainingEvent>,
) -> Result<TrainingResult> {
    let device = config.run.device.to_device().context("Failed to create device")?;
    let mut network = TinyDetector::new(&config.model, &device).context("Failed to build the detector")?;
    let (train, val) = build_sources(&config, &device)?;
    let aggregator = LossAggregator::new(
        Box::new(YoloScaleLoss::new(&config.model)),
        config.loss.degenerate_policy,
    );

    let mut trainer = StagedTrainer::new(config, &mut network, aggregator, Box::new(train), Box::new(val), device)
        .context("Failed to set up training")?
        .with_event_monitoring(events)
        .with_shutdown(shutdown);

    info!("Starting run {}", trainer.run_id());
    Ok(trainer.run()?)
}

async fn train(config: RunConfig) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let signal_flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next batch boundary");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    let monitor = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_event(&event);
        }
    });

    let result = tokio::task::spawn_blocking(move || run_training(config, shutdown, tx))
        .await
        .context("Training task panicked")?;
    // The sender is dropped with the trainer, so the monitor drains and exits
    let _ = monitor.await;

    let result = result?;
    info!(
        "Run {} finished: {} epochs in {:.1}s",
        result.run_id,
        result.epochs.len(),
        result.duration_secs
    );
    if let Some(path) = &result.final_weights {
        info!("Final weights: {}", path.display());
    }
    if let Some(best) = result
        .epochs
        .iter()
        .min_by(|a, b| a.metrics.val_loss.total_cmp(&b.metrics.val_loss))
    {
        info!(
            "Best validation loss {:.4} at epoch {} ({})",
            best.metrics.val_loss,
            best.metrics.epoch + 1,
            best.checkpoint
        );
    }
    Ok(())
}

fn log_event(event: &TrainingEvent) {
    match event {
        TrainingEvent::PhaseEntered {
            phase,
            start_epoch,
            end_epoch,
            learning_rate,
            trainable_groups,
        } => {
            tracing::debug!(
                "phase {} entered: epochs {}..{}, lr {:.1e}, trainable {:?}",
                phase,
                start_epoch,
                end_epoch,
                learning_rate,
                trainable_groups
            );
        }
        TrainingEvent::PhaseSkipped { phase } => tracing::debug!("phase {} skipped", phase),
        TrainingEvent::EpochCompleted { metrics } => {
            tracing::debug!(
                "epoch {} done in {:.1}s: {} train batches, {} degenerate, {} skipped",
                metrics.epoch,
                metrics.duration_secs,
                metrics.train_batches,
                metrics.degenerate_batches,
                metrics.skipped_steps
            );
        }
        TrainingEvent::CheckpointSaved { id } => tracing::debug!("checkpoint {} saved", id),
        TrainingEvent::DegenerateBatch { .. } => {}
        TrainingEvent::TrainingCompleted { epochs_run } => {
            tracing::debug!("training completed after {} epochs", epochs_run)
        }
    }
}

async fn validate_config(config_path: PathBuf, evaluate: bool) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = RunConfig::from_file(&config_path).context("Failed to load configuration file")?;
    let schedule = config.schedule()?;

    let device = config.run.device.to_device().context("Failed to create device")?;
    let network = TinyDetector::new(&config.model, &device).context("Failed to build the detector")?;
    let network_groups = network.group_names()?;
    config.groups.validate_against(&network_groups)?;

    info!("Configuration is valid");
    for phase in Phase::ALL {
        let range = schedule.range(phase);
        info!(
            "  - {}: epochs {}..{}, lr {:.1e}",
            phase,
            range.start,
            range.end,
            config.phases.learning_rate(phase)
        );
    }
    info!("  - Parameter groups: {:?}", network_groups);
    info!("  - Batch size: {}, validation split: {}", config.data.batch_size, config.data.val_split);

    if evaluate {
        let stats = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut network = network;
            let (train, val) = build_sources(&config, &device)?;
            let aggregator = LossAggregator::new(
                Box::new(YoloScaleLoss::new(&config.model)),
                config.loss.degenerate_policy,
            );
            let mut trainer =
                StagedTrainer::new(config, &mut network, aggregator, Box::new(train), Box::new(val), device)?;
            Ok(trainer.evaluate()?)
        })
        .await
        .context("Evaluation task panicked")??;

        info!(
            "Validation loss: {:.4} over {} batches ({} degenerate)",
            stats.mean.mean(),
            stats.mean.count(),
            stats.degenerate
        );
    }

    Ok(())
}

fn show_history(run_id: &str, log_dir: PathBuf) -> Result<()> {
    let path = log_dir.join(run_id).join(stagetrain::training::artifacts::LOSS_HISTORY_JSON);
    let records =
        read_loss_history(&path).with_context(|| format!("Failed to read loss history from {}", path.display()))?;

    println!("{:>6}  {:>12}  {:>12}", "epoch", "train_loss", "val_loss");
    for record in &records {
        println!(
            "{:>6}  {:>12.4}  {:>12.4}",
            record.epoch + 1,
            record.train_loss,
            record.val_loss
        );
    }
    Ok(())
}

fn show_system_info() {
    println!("stagetrain {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  CUDA: compiled");
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA: not compiled");

    #[cfg(feature = "metal")]
    println!("  Metal: compiled");
    #[cfg(not(feature = "metal"))]
    println!("  Metal: not compiled");

    #[cfg(feature = "accelerate")]
    println!("  Accelerate: compiled");
    #[cfg(not(feature = "accelerate"))]
    println!("  Accelerate: not compiled");

    println!("  CPU: always");
    println!();
    println!("Usage:");
    println!("  stagetrain init-config -o stagetrain.yaml");
    println!("  stagetrain validate -c stagetrain.yaml");
    println!("  stagetrain train -c stagetrain.yaml [--resume <run_id>/latest]");
    println!("  stagetrain history <run_id>");
}
