//! Datamodules: seeded splitting plus loader assembly with optional
//! stratified sampling and instance weighting.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::dataset::{get_group_ids, InstanceWeighted, LabeledDataset, Subset};
use crate::data::loader::{BatchLoader, BatchSampler, DataLoader};
use crate::data::sampling::{
    SequentialBatchSampler, StratifiedBatchSampler, StratifiedSamplerConfig, TrainingMode,
};
use crate::data::structures::TrainValTestSplit;
use crate::{FbError, Result};

/// Datamodule configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DataModuleConfig {
    /// Samples per training batch.
    pub train_batch_size: usize,
    /// Samples per val/test batch; defaults to the training batch size.
    pub eval_batch_size: Option<usize>,
    /// Proportion of samples held out for validation.
    pub val_prop: f64,
    /// Proportion of samples held out for testing.
    pub test_prop: f64,
    /// RNG seed for the split and all samplers.
    pub seed: u64,
    /// Stratify training batches by (s, y) group.
    pub stratified_sampling: bool,
    /// Attach Kamiran & Calders instance weights to training batches.
    pub instance_weighting: bool,
    /// Epoch-bounded vs. endless streaming training batches.
    pub training_mode: TrainingMode,
}

impl Default for DataModuleConfig {
    fn default() -> Self {
        Self {
            train_batch_size: 64,
            eval_batch_size: None,
            val_prop: 0.2,
            test_prop: 0.2,
            seed: 47,
            stratified_sampling: false,
            instance_weighting: false,
            training_mode: TrainingMode::Epoch,
        }
    }
}

impl DataModuleConfig {
    /// Read a configuration from a JSON file.
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.train_batch_size == 0 {
            return Err(FbError::Config("train_batch_size must be > 0".to_string()));
        }
        if let Some(0) = self.eval_batch_size {
            return Err(FbError::Config("eval_batch_size must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.val_prop) || !(0.0..1.0).contains(&self.test_prop) {
            return Err(FbError::Config(
                "val_prop and test_prop must lie in [0, 1)".to_string(),
            ));
        }
        if self.val_prop + self.test_prop >= 1.0 {
            return Err(FbError::Config(
                "val_prop + test_prop must leave room for a training split".to_string(),
            ));
        }
        Ok(())
    }

    pub fn eval_batch_size(&self) -> usize {
        self.eval_batch_size.unwrap_or(self.train_batch_size)
    }
}

/// Splits a dataset into train/val/test subsets and hands out loaders.
///
/// The training loader honors the `stratified_sampling`,
/// `instance_weighting` and `training_mode` switches; val/test loaders are
/// always plain sequential epoch passes.
pub struct DataModule {
    config: DataModuleConfig,
    train: Arc<dyn LabeledDataset>,
    val: Arc<dyn LabeledDataset>,
    test: Arc<dyn LabeledDataset>,
}

impl DataModule {
    pub fn new<D: LabeledDataset + 'static>(dataset: D, config: DataModuleConfig) -> Result<Self> {
        config.validate()?;
        let base: Arc<dyn LabeledDataset> = Arc::new(dataset);
        if base.is_empty() {
            return Err(FbError::Config(
                "cannot build a datamodule from an empty dataset".to_string(),
            ));
        }

        let split = random_split(base.len(), &config);
        if split.train.is_empty() {
            return Err(FbError::Config(
                "split proportions leave no training samples".to_string(),
            ));
        }

        let val = Arc::new(Subset::new(base.clone(), split.val)?);
        let test = Arc::new(Subset::new(base.clone(), split.test)?);
        let train_subset = Subset::new(base, split.train)?;
        let train: Arc<dyn LabeledDataset> = if config.instance_weighting {
            Arc::new(InstanceWeighted::new(Arc::new(train_subset))?)
        } else {
            Arc::new(train_subset)
        };

        Ok(Self {
            config,
            train,
            val,
            test,
        })
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    pub fn train_data(&self) -> &Arc<dyn LabeledDataset> {
        &self.train
    }

    pub fn val_data(&self) -> &Arc<dyn LabeledDataset> {
        &self.val
    }

    pub fn test_data(&self) -> &Arc<dyn LabeledDataset> {
        &self.test
    }

    pub fn num_train_samples(&self) -> usize {
        self.train.len()
    }

    pub fn card_s(&self) -> Option<usize> {
        self.train.card_s()
    }

    pub fn card_y(&self) -> Option<usize> {
        self.train.card_y()
    }

    /// Shape of a single input sample.
    pub fn dims(&self) -> Result<Vec<usize>> {
        self.train.input_shape()
    }

    /// Training batches per epoch. Only defined in epoch mode.
    pub fn num_train_batches(&self) -> Result<usize> {
        if self.config.training_mode == TrainingMode::Step {
            return Err(FbError::Config(
                "num_train_batches is only defined in epoch mode".to_string(),
            ));
        }
        self.train_loader(false)?.num_batches()
    }

    /// Build the training loader.
    ///
    /// With stratified sampling the batch is split evenly across the
    /// observed (s, y) groups; when the configured batch size is not a
    /// multiple of the number of groups it is shrunk to the nearest one,
    /// with a warning, as the per-group share must be integral.
    pub fn train_loader(&self, shuffle: bool) -> Result<DataLoader> {
        let sampler = if self.config.stratified_sampling {
            let group_ids = get_group_ids(self.train.as_ref())?;
            let num_groups = {
                let mut distinct = group_ids.clone();
                distinct.sort_unstable();
                distinct.dedup();
                distinct.len()
            };
            let num_samples_per_group = self.config.train_batch_size / num_groups;
            if num_samples_per_group == 0 {
                return Err(FbError::Config(format!(
                    "batch size {} is smaller than the number of groups {num_groups}",
                    self.config.train_batch_size
                )));
            }
            if self.config.train_batch_size % num_groups != 0 {
                log::warn!(
                    "stratified sampling requires the batch size to be a multiple of the \
                     number of groups ({num_groups}); reducing it from {} to {}",
                    self.config.train_batch_size,
                    num_samples_per_group * num_groups
                );
            }
            BatchSampler::Stratified(StratifiedBatchSampler::new(
                &group_ids,
                StratifiedSamplerConfig {
                    num_samples_per_group,
                    shuffle,
                    multipliers: None,
                    mode: self.config.training_mode,
                    seed: self.config.seed,
                },
            )?)
        } else {
            BatchSampler::Sequential(SequentialBatchSampler::new(
                self.train.len(),
                self.config.train_batch_size,
                shuffle,
                false,
                self.config.training_mode,
                self.config.seed,
            )?)
        };
        Ok(DataLoader::new(self.train.clone(), sampler))
    }

    pub fn val_loader(&self) -> Result<DataLoader> {
        self.eval_loader(self.val.clone())
    }

    pub fn test_loader(&self) -> Result<DataLoader> {
        self.eval_loader(self.test.clone())
    }

    fn eval_loader(&self, data: Arc<dyn LabeledDataset>) -> Result<DataLoader> {
        let sampler = BatchSampler::Sequential(SequentialBatchSampler::new(
            data.len(),
            self.config.eval_batch_size(),
            false,
            false,
            TrainingMode::Epoch,
            self.config.seed,
        )?);
        Ok(DataLoader::new(data, sampler))
    }
}

/// Seeded shuffled partition of `0..n` into val/test/train index lists.
fn random_split(n: usize, config: &DataModuleConfig) -> TrainValTestSplit<Vec<usize>> {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(config.seed);
    indices.shuffle(&mut rng);

    let n_val = (n as f64 * config.val_prop) as usize;
    let n_test = (n as f64 * config.test_prop) as usize;
    TrainValTestSplit {
        val: indices[..n_val].to_vec(),
        test: indices[n_val..n_val + n_test].to_vec(),
        train: indices[n_val + n_test..].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tabular::TabularDataset;
    use candle_core::Device;
    use ndarray::{Array1, Array2};

    fn toy_dataset(n: usize) -> TabularDataset {
        let x = Array2::<f32>::zeros((n, 4));
        let s = Array1::from_iter((0..n).map(|i| (i % 2) as i64));
        let y = Array1::from_iter((0..n).map(|i| ((i / 2) % 2) as i64));
        TabularDataset::from_arrays(x, Some(s), Some(y)).unwrap()
    }

    #[test]
    fn test_split_proportions() -> Result<()> {
        let dm = DataModule::new(toy_dataset(100), DataModuleConfig::default())?;
        assert_eq!(dm.val_data().len(), 20);
        assert_eq!(dm.test_data().len(), 20);
        assert_eq!(dm.num_train_samples(), 60);
        Ok(())
    }

    #[test]
    fn test_split_is_seeded() -> Result<()> {
        let a = DataModule::new(toy_dataset(50), DataModuleConfig::default())?;
        let b = DataModule::new(toy_dataset(50), DataModuleConfig::default())?;
        assert_eq!(
            a.train_data().y().unwrap().to_vec(),
            b.train_data().y().unwrap().to_vec()
        );
        Ok(())
    }

    #[test]
    fn test_stratified_loader_balances_groups() -> Result<()> {
        let config = DataModuleConfig {
            train_batch_size: 8,
            stratified_sampling: true,
            ..Default::default()
        };
        let dm = DataModule::new(toy_dataset(64), config)?;
        let mut loader = dm.train_loader(false)?;
        let batch = loader.next_batch(&Device::Cpu)?.unwrap();
        // 4 groups x 2 samples each
        assert_eq!(batch.len()?, 8);
        let s = batch.s()?.to_vec1::<i64>()?;
        let y = batch.y()?.to_vec1::<i64>()?;
        for g in 0..4i64 {
            let count = s
                .iter()
                .zip(&y)
                .filter(|(&si, &yi)| yi * 2 + si == g)
                .count();
            assert_eq!(count, 2, "group {g} share");
        }
        Ok(())
    }

    #[test]
    fn test_instance_weighting_flows_to_batches() -> Result<()> {
        let config = DataModuleConfig {
            train_batch_size: 16,
            instance_weighting: true,
            ..Default::default()
        };
        let dm = DataModule::new(toy_dataset(64), config)?;
        let mut loader = dm.train_loader(false)?;
        let batch = loader.next_batch(&Device::Cpu)?.unwrap();
        assert!(batch.iw.is_some());
        Ok(())
    }

    #[test]
    fn test_num_train_batches_rejected_in_step_mode() -> Result<()> {
        let config = DataModuleConfig {
            training_mode: TrainingMode::Step,
            ..Default::default()
        };
        let dm = DataModule::new(toy_dataset(64), config)?;
        assert!(dm.num_train_batches().is_err());
        Ok(())
    }

    #[test]
    fn test_config_from_json_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dm.json");
        std::fs::write(
            &path,
            r#"{"train_batch_size": 16, "eval_batch_size": null, "val_prop": 0.1,
                "test_prop": 0.1, "seed": 3, "stratified_sampling": true,
                "instance_weighting": false, "training_mode": "step"}"#,
        )?;
        let config = DataModuleConfig::from_json_file(&path)?;
        assert_eq!(config.train_batch_size, 16);
        assert_eq!(config.training_mode, TrainingMode::Step);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_proportions() {
        let config = DataModuleConfig {
            val_prop: 0.6,
            test_prop: 0.5,
            ..Default::default()
        };
        assert!(DataModule::new(toy_dataset(10), config).is_err());
    }
}
