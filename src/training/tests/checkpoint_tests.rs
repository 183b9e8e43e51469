//! Checkpoint store tests

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use tempfile::TempDir;

use crate::config::OptimizerConfig;
use crate::error::{Error, Result};
use crate::training::checkpoint::{restore_weights, CheckpointId, CheckpointMetadata, CheckpointStore};
use crate::training::network::{named_vars, DetectionNetwork};
use crate::training::optimizers::{create_optimizer, Optimizer, OptimizerStateDict};
use crate::training::phase::Phase;

use super::fixtures::ToyNetwork;

/// Take one optimizer step on every weight of `network`
fn trained_optimizer(network: &ToyNetwork) -> Result<Box<dyn Optimizer + Send>> {
    let params = named_vars(network.var_map())?;
    let mut optimizer = create_optimizer(&OptimizerConfig::default(), params, 0.05);

    let images = Tensor::new(&[[1.0f32, -2.0], [0.5, 3.0]], &Device::Cpu)?;
    let [a, b, c] = network.forward(&images)?;
    let loss = ((a.sqr()?.sum_all()? + b.sum_all()?)? + c.sqr()?.sum_all()?)?;
    optimizer.step(&loss.backward()?)?;
    Ok(optimizer)
}

fn metadata(run_id: &str, epoch: usize, optimizer: &OptimizerStateDict) -> CheckpointMetadata {
    CheckpointMetadata::new(
        run_id,
        epoch,
        Phase::Freeze,
        1.0,
        2.0,
        1e-3,
        vec![2.0; epoch + 1],
        vec![1.0; epoch + 1],
        optimizer.clone(),
    )
}

fn save_epoch(store: &CheckpointStore, network: &ToyNetwork, run_id: &str, epoch: usize) -> Result<CheckpointId> {
    let state = create_optimizer(&OptimizerConfig::default(), Vec::new(), 1e-3).state_dict()?;
    store.save(network.var_map(), &state, &metadata(run_id, epoch, &state))
}

#[test]
fn test_restore_is_bit_identical() -> Result<()> {
    let device = Device::Cpu;
    let dir = TempDir::new()?;
    let store = CheckpointStore::new(dir.path(), device.clone())?;

    let original = ToyNetwork::new(&device, 0.5)?;
    original
        .var("backbone.w")?
        .set(&Tensor::new(&[[0.123f32, -1.5], [2.25, 1e-3]], &device)?)?;
    let optimizer = trained_optimizer(&original)?;
    let state = optimizer.state_dict()?;
    let id = store.save(original.var_map(), &state, &metadata("run", 3, &state))?;
    assert_eq!(id, CheckpointId::new("run", 3));

    let restored = ToyNetwork::new(&device, -0.25)?;
    let checkpoint = store.load(&id)?;
    let report = restore_weights(restored.var_map(), &checkpoint.weights)?;
    assert!(report.is_complete());
    assert_eq!(report.loaded.len(), 5);
    assert_eq!(restored.snapshot()?, original.snapshot()?);

    let input = Tensor::new(&[[0.3f32, -0.7], [1.1, 0.2], [-4.0, 9.0]], &device)?;
    let expected = original.forward(&input)?;
    let actual = restored.forward(&input)?;
    for (e, a) in expected.iter().zip(actual.iter()) {
        assert_eq!(e.flatten_all()?.to_vec1::<f32>()?, a.flatten_all()?.to_vec1::<f32>()?);
    }

    assert_eq!(checkpoint.epoch(), 3);
    assert_eq!(checkpoint.loss_history(), &[2.0; 4]);
    assert_eq!(checkpoint.metadata.train_loss_history, vec![1.0; 4]);
    assert_eq!(checkpoint.metadata.phase, Phase::Freeze);
    Ok(())
}

#[test]
fn test_loss_history_is_stored_exactly() -> Result<()> {
    let device = Device::Cpu;
    let dir = TempDir::new()?;
    let store = CheckpointStore::new(dir.path(), device.clone())?;
    let network = ToyNetwork::new(&device, 0.5)?;

    let state = create_optimizer(&OptimizerConfig::default(), Vec::new(), 1e-3).state_dict()?;
    let losses = vec![0.7257109880447388, 0.13039527833461761, 7.067785801062598e-10];
    let mut meta = metadata("run", 2, &state);
    meta.loss_history = losses.clone();
    meta.train_loss_history = losses.iter().map(|l| l / 3.0).collect();
    let id = store.save(network.var_map(), &state, &meta)?;

    let checkpoint = store.load(&id)?;
    let bits = |values: &[f64]| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(checkpoint.loss_history()), bits(&losses[..]));
    assert_eq!(
        bits(&checkpoint.metadata.train_loss_history[..]),
        bits(&meta.train_loss_history[..])
    );
    Ok(())
}

#[test]
fn test_optimizer_buffers_survive_checkpoint() -> Result<()> {
    let device = Device::Cpu;
    let dir = TempDir::new()?;
    let store = CheckpointStore::new(dir.path(), device.clone())?;

    let network = ToyNetwork::new(&device, 0.5)?;
    let optimizer = trained_optimizer(&network)?;
    let state = optimizer.state_dict()?;
    let id = store.save(network.var_map(), &state, &metadata("run", 0, &state))?;

    let checkpoint = store.load(&id)?;
    assert_eq!(checkpoint.optimizer.step_count, 1);
    assert_eq!(checkpoint.optimizer.optimizer_type, "adam");
    assert_eq!(checkpoint.optimizer.buffers.len(), state.buffers.len());
    for (name, tensor) in &state.buffers {
        let loaded = &checkpoint.optimizer.buffers[name];
        assert_eq!(
            loaded.flatten_all()?.to_vec1::<f32>()?,
            tensor.flatten_all()?.to_vec1::<f32>()?
        );
    }

    let mut fresh = create_optimizer(&OptimizerConfig::default(), named_vars(network.var_map())?, 0.05);
    let restored = fresh.load_state_dict(&checkpoint.optimizer)?;
    assert_eq!(restored, 5);
    assert_eq!(fresh.step_count(), 1);
    Ok(())
}

#[test]
fn test_second_save_fails_and_leaves_no_staging() -> Result<()> {
    let device = Device::Cpu;
    let dir = TempDir::new()?;
    let store = CheckpointStore::new(dir.path(), device.clone())?;
    let network = ToyNetwork::new(&device, 0.5)?;

    save_epoch(&store, &network, "run", 0)?;
    let err = save_epoch(&store, &network, "run", 0).unwrap_err();
    assert!(matches!(err, Error::CheckpointExists { .. }));

    let entries: Vec<String> = std::fs::read_dir(dir.path().join("run"))?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<_>>()?;
    assert_eq!(entries, vec!["epoch_0000".to_string()]);
    Ok(())
}

#[test]
fn test_missing_checkpoint_is_resume_not_found() -> Result<()> {
    let device = Device::Cpu;
    let dir = TempDir::new()?;
    let store = CheckpointStore::new(dir.path(), device.clone())?;
    let network = ToyNetwork::new(&device, 0.5)?;
    save_epoch(&store, &network, "run", 0)?;

    assert!(matches!(
        store.load(&CheckpointId::new("run", 7)),
        Err(Error::ResumeNotFound { .. })
    ));
    assert!(matches!(store.resolve("run/epoch_7"), Err(Error::ResumeNotFound { .. })));
    assert!(matches!(store.resolve("other/latest"), Err(Error::ResumeNotFound { .. })));
    assert!(matches!(store.resolve("garbage"), Err(Error::ResumeNotFound { .. })));
    assert_eq!(store.resolve("run/epoch_0")?, CheckpointId::new("run", 0));
    Ok(())
}

#[test]
fn test_list_and_latest() -> Result<()> {
    let device = Device::Cpu;
    let dir = TempDir::new()?;
    let store = CheckpointStore::new(dir.path(), device.clone())?;
    let network = ToyNetwork::new(&device, 0.5)?;

    for epoch in [2, 0, 11, 1] {
        save_epoch(&store, &network, "run", epoch)?;
    }
    // Leftover staging directories are never listed
    std::fs::create_dir_all(dir.path().join("run").join(".epoch_0012.partial-1"))?;

    let epochs: Vec<usize> = store.list("run")?.into_iter().map(|id| id.epoch).collect();
    assert_eq!(epochs, vec![0, 1, 2, 11]);
    assert_eq!(store.latest("run")?, Some(CheckpointId::new("run", 11)));
    assert_eq!(store.resolve("run/latest")?, CheckpointId::new("run", 11));
    assert_eq!(store.latest("nobody")?, None);
    Ok(())
}

#[test]
fn test_shape_mismatch_is_skipped() -> Result<()> {
    let device = Device::Cpu;
    let network = ToyNetwork::new(&device, 0.5)?;

    let mut weights = HashMap::new();
    weights.insert("backbone.w".to_string(), Tensor::zeros((3, 3), DType::F32, &device)?);
    weights.insert("neck.w".to_string(), Tensor::ones((2, 2), DType::F32, &device)?);
    weights.insert("extra.w".to_string(), Tensor::ones(4, DType::F32, &device)?);

    let report = restore_weights(network.var_map(), &weights)?;
    assert_eq!(report.mismatched, vec!["backbone.w"]);
    assert_eq!(report.loaded, vec!["neck.w"]);
    assert_eq!(report.missing, vec!["yolo_head1.w", "yolo_head2.w", "yolo_head3.w"]);
    assert_eq!(report.unused, vec!["extra.w"]);
    assert!(!report.is_complete());

    let snapshot = network.snapshot()?;
    assert_eq!(snapshot["backbone.w"], vec![0.5; 4]);
    assert_eq!(snapshot["neck.w"], vec![1.0; 4]);
    Ok(())
}
