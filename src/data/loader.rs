//! Batch loading: drives a batch sampler over a dataset and collates the
//! drawn samples into tensors.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::data::dataset::LabeledDataset;
use crate::data::sampling::{
    SequentialBatches, SequentialBatchSampler, StratifiedBatches, StratifiedBatchSampler,
};
use crate::data::structures::TensorBatch;
use crate::Result;

/// Generic batch-loader trait the training loop pulls from.
pub trait BatchLoader {
    /// Collate the next batch onto `device`, or `None` at the end of a
    /// finite pass.
    fn next_batch(&mut self, device: &Device) -> Result<Option<TensorBatch>>;

    /// Restart the pass.
    fn reset(&mut self);

    /// Batches per pass; an error in step mode, where the stream is endless.
    fn num_batches(&self) -> Result<usize>;
}

/// Either of the two batch-index sources a datamodule can assemble.
pub enum BatchSampler {
    Sequential(SequentialBatchSampler),
    Stratified(StratifiedBatchSampler),
}

enum BatchIter {
    Sequential(SequentialBatches),
    Stratified(StratifiedBatches),
}

impl BatchSampler {
    fn iter(&self) -> BatchIter {
        match self {
            BatchSampler::Sequential(s) => BatchIter::Sequential(s.iter()),
            BatchSampler::Stratified(s) => BatchIter::Stratified(s.iter()),
        }
    }

    fn num_batches(&self) -> Result<usize> {
        match self {
            BatchSampler::Sequential(s) => s.num_batches(),
            BatchSampler::Stratified(s) => s.num_batches(),
        }
    }
}

impl Iterator for BatchIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        match self {
            BatchIter::Sequential(it) => it.next(),
            BatchIter::Stratified(it) => it.next(),
        }
    }
}

/// Pulls index batches from a sampler and materializes them as stacked
/// tensors, together with whatever labels and instance weights the dataset
/// carries.
pub struct DataLoader {
    dataset: Arc<dyn LabeledDataset>,
    sampler: BatchSampler,
    batches: BatchIter,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn LabeledDataset>, sampler: BatchSampler) -> Self {
        let batches = sampler.iter();
        Self {
            dataset,
            sampler,
            batches,
        }
    }

    pub fn dataset(&self) -> &Arc<dyn LabeledDataset> {
        &self.dataset
    }

    fn collate(&self, indices: &[usize], device: &Device) -> Result<TensorBatch> {
        let mut inputs = Vec::with_capacity(indices.len());
        for &i in indices {
            inputs.push(self.dataset.load_input(i, device)?);
        }
        let x = Tensor::stack(&inputs, 0)?;

        let y = match self.dataset.y() {
            Some(y) => {
                let vals: Vec<i64> = indices.iter().map(|&i| y[i]).collect();
                Some(Tensor::from_slice(&vals, (vals.len(),), device)?)
            }
            None => None,
        };
        let s = match self.dataset.s() {
            Some(s) => {
                let vals: Vec<i64> = indices.iter().map(|&i| s[i]).collect();
                Some(Tensor::from_slice(&vals, (vals.len(),), device)?)
            }
            None => None,
        };
        let iw = match self.dataset.instance_weight(0) {
            Some(_) => {
                let vals: Vec<f32> = indices
                    .iter()
                    .map(|&i| self.dataset.instance_weight(i).unwrap_or(0.0))
                    .collect();
                Some(
                    Tensor::from_slice(&vals, (vals.len(),), device)?
                        .to_dtype(DType::F32)?,
                )
            }
            None => None,
        };

        Ok(TensorBatch { x, y, s, iw })
    }
}

impl BatchLoader for DataLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<TensorBatch>> {
        match self.batches.next() {
            Some(indices) => Ok(Some(self.collate(&indices, device)?)),
            None => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.batches = self.sampler.iter();
    }

    fn num_batches(&self) -> Result<usize> {
        self.sampler.num_batches()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::InstanceWeighted;
    use crate::data::sampling::TrainingMode;
    use crate::data::tabular::TabularDataset;
    use ndarray::{array, Array2};

    fn toy_loader(instance_weighting: bool) -> Result<DataLoader> {
        let x = Array2::from_shape_fn((6, 3), |(i, j)| (i * 3 + j) as f32);
        let s = array![0i64, 0, 1, 1, 1, 0];
        let y = array![0i64, 1, 0, 1, 1, 1];
        let base: Arc<dyn LabeledDataset> =
            Arc::new(TabularDataset::from_arrays(x, Some(s), Some(y))?);
        let dataset: Arc<dyn LabeledDataset> = if instance_weighting {
            Arc::new(InstanceWeighted::new(base)?)
        } else {
            base
        };
        let sampler = BatchSampler::Sequential(SequentialBatchSampler::new(
            dataset.len(),
            4,
            false,
            false,
            TrainingMode::Epoch,
            0,
        )?);
        Ok(DataLoader::new(dataset, sampler))
    }

    #[test]
    fn test_collates_inputs_and_labels() -> Result<()> {
        let device = Device::Cpu;
        let mut loader = toy_loader(false)?;
        let batch = loader.next_batch(&device)?.unwrap();
        assert_eq!(batch.x.dims(), &[4, 3]);
        assert_eq!(batch.y()?.to_vec1::<i64>()?, vec![0, 1, 0, 1]);
        assert_eq!(batch.s()?.to_vec1::<i64>()?, vec![0, 0, 1, 1]);
        assert!(batch.iw.is_none());
        // trailing short batch
        let batch = loader.next_batch(&device)?.unwrap();
        assert_eq!(batch.x.dims(), &[2, 3]);
        assert!(loader.next_batch(&device)?.is_none());
        Ok(())
    }

    #[test]
    fn test_reset_restarts_the_pass() -> Result<()> {
        let device = Device::Cpu;
        let mut loader = toy_loader(false)?;
        while loader.next_batch(&device)?.is_some() {}
        loader.reset();
        let batch = loader.next_batch(&device)?.unwrap();
        assert_eq!(batch.y()?.to_vec1::<i64>()?, vec![0, 1, 0, 1]);
        Ok(())
    }

    #[test]
    fn test_instance_weights_ride_along() -> Result<()> {
        let device = Device::Cpu;
        let mut loader = toy_loader(true)?;
        let batch = loader.next_batch(&device)?.unwrap();
        let iw = batch.iw()?.to_vec1::<f32>()?;
        assert_eq!(iw, vec![1.0, 0.5, 1.0, 0.5]);
        Ok(())
    }
}
