//! Batch sources for the training and validation passes
//!
//! A batch source is finite, declares its length up front and can be
//! restarted once per epoch. Shuffling is seeded from the run seed and the
//! epoch index so a resumed run sees the same batch order as a cold one.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One collated batch
#[derive(Debug, Clone)]
pub struct DetectionBatch {
    /// Images, `[B, 3, H, W]`
    pub images: Tensor,
    /// One `[n, 5]` tensor per image: normalized `(cx, cy, w, h, class)`
    pub targets: Vec<Tensor>,
}

impl DetectionBatch {
    /// Number of images in the batch
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the batch has no images
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Iterator over the batches of one pass
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<DetectionBatch>> + 'a>;

/// Finite, restartable source of batches
pub trait BatchSource {
    /// Declared number of batches per pass
    fn len(&self) -> usize;

    /// Whether the source declares no batches
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches for `epoch`, in that epoch's order
    fn batches(&self, epoch: usize) -> Result<BatchIter<'_>>;
}

/// Batches held in memory, replayed every epoch
#[derive(Debug, Clone, Default)]
pub struct InMemoryBatchSource {
    batches: Vec<DetectionBatch>,
    declared_len: Option<usize>,
}

impl InMemoryBatchSource {
    /// Create a source over `batches`
    pub fn new(batches: Vec<DetectionBatch>) -> Self {
        Self {
            batches,
            declared_len: None,
        }
    }

    /// Declare a length that differs from the number of stored batches
    pub fn with_declared_len(mut self, len: usize) -> Self {
        self.declared_len = Some(len);
        self
    }
}

impl BatchSource for InMemoryBatchSource {
    fn len(&self) -> usize {
        self.declared_len.unwrap_or(self.batches.len())
    }

    fn batches(&self, _epoch: usize) -> Result<BatchIter<'_>> {
        Ok(Box::new(self.batches.iter().cloned().map(Ok)))
    }
}

/// Samples stored one per `*.safetensors` file
///
/// Each file holds an `image` tensor `[3, H, W]` and a `boxes` tensor
/// `[n, 5]`. Incomplete trailing batches are dropped.
#[derive(Debug, Clone)]
pub struct SampleDirBatchSource {
    samples: Vec<PathBuf>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    device: Device,
}

impl SampleDirBatchSource {
    /// Create a source over the given sample files
    pub fn new(samples: Vec<PathBuf>, batch_size: usize, shuffle: bool, seed: u64, device: Device) -> Self {
        debug!(
            "Creating batch source with {} samples, batch_size={}, shuffle={}",
            samples.len(),
            batch_size,
            shuffle
        );
        Self {
            samples,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
            device,
        }
    }

    /// Number of sample files
    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    fn load_sample(&self, path: &Path) -> Result<(Tensor, Tensor)> {
        let mut tensors = candle_core::safetensors::load(path, &self.device)?;
        let image = tensors
            .remove("image")
            .ok_or_else(|| Error::internal(format!("{} has no 'image' tensor", path.display())))?;
        let boxes = tensors
            .remove("boxes")
            .ok_or_else(|| Error::internal(format!("{} has no 'boxes' tensor", path.display())))?;
        Ok((image.to_dtype(DType::F32)?, boxes.to_dtype(DType::F32)?))
    }

    fn load_batch(&self, indices: &[usize]) -> Result<DetectionBatch> {
        let mut images = Vec::with_capacity(indices.len());
        let mut targets = Vec::with_capacity(indices.len());
        for &index in indices {
            let (image, boxes) = self.load_sample(&self.samples[index])?;
            images.push(image);
            targets.push(boxes);
        }
        Ok(DetectionBatch {
            images: Tensor::stack(&images, 0)?,
            targets,
        })
    }
}

impl BatchSource for SampleDirBatchSource {
    fn len(&self) -> usize {
        self.samples.len() / self.batch_size
    }

    fn batches(&self, epoch: usize) -> Result<BatchIter<'_>> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        let chunks: Vec<Vec<usize>> = order
            .chunks_exact(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();

        Ok(Box::new(chunks.into_iter().map(move |indices| self.load_batch(&indices))))
    }
}

/// Sample files in `dir`, sorted by name
pub fn discover_samples(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(Error::config(format!(
            "dataset directory {} does not exist",
            dir.display()
        )));
    }

    let mut samples = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) == Some("safetensors") {
            samples.push(path);
        }
    }
    samples.sort();

    info!("Found {} samples in {}", samples.len(), dir.display());
    Ok(samples)
}

/// Shuffle `items` with a fixed seed and split off the validation tail
///
/// The first `len - floor(len * val_split)` items train, the rest validate.
pub fn split_train_val<T>(mut items: Vec<T>, val_split: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);

    let num_val = (items.len() as f64 * val_split).floor() as usize;
    let num_train = items.len() - num_val.min(items.len());
    let val = items.split_off(num_train);
    (items, val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn write_sample(dir: &Path, name: &str, value: f32) {
        let mut tensors = HashMap::new();
        tensors.insert(
            "image".to_string(),
            Tensor::full(value, (3, 4, 4), &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "boxes".to_string(),
            Tensor::new(&[[0.5f32, 0.5, 0.2, 0.2, 0.0]], &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, dir.join(name)).unwrap();
    }

    #[test]
    fn test_split_is_deterministic() {
        let items: Vec<usize> = (0..10).collect();
        let (train_a, val_a) = split_train_val(items.clone(), 0.2, 10101);
        let (train_b, val_b) = split_train_val(items, 0.2, 10101);

        assert_eq!(train_a.len(), 8);
        assert_eq!(val_a.len(), 2);
        assert_eq!(train_a, train_b);
        assert_eq!(val_a, val_b);
    }

    #[test]
    fn test_split_without_validation() {
        let (train, val) = split_train_val(vec![1, 2, 3], 0.0, 1);
        assert_eq!(train.len(), 3);
        assert!(val.is_empty());
    }

    #[test]
    fn test_in_memory_declared_len() {
        let source = InMemoryBatchSource::new(Vec::new()).with_declared_len(4);
        assert_eq!(source.len(), 4);
        assert_eq!(source.batches(0).unwrap().count(), 0);
    }

    #[test]
    fn test_sample_dir_source() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            write_sample(dir.path(), &format!("sample_{i}.safetensors"), i as f32);
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let samples = discover_samples(dir.path()).unwrap();
        assert_eq!(samples.len(), 5);

        let source = SampleDirBatchSource::new(samples, 2, true, 7, Device::Cpu);
        assert_eq!(source.len(), 2);

        let batches: Vec<DetectionBatch> = source
            .batches(0)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].images.dims(), &[2, 3, 4, 4]);
        assert_eq!(batches[0].targets[0].dims(), &[1, 5]);

        // Same epoch, same order
        let first: Vec<f32> = batches[0].images.flatten_all().unwrap().to_vec1().unwrap();
        let again = source.batches(0).unwrap().next().unwrap().unwrap();
        let again: Vec<f32> = again.images.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_missing_dataset_dir() {
        assert!(matches!(
            discover_samples("/definitely/not/here"),
            Err(Error::Config(_))
        ));
    }
}
