//! Dataset, sampling and datamodule abstractions.

pub mod audio;
pub mod datamodule;
pub mod dataset;
pub mod loader;
pub mod sampling;
pub mod structures;
pub mod tabular;
pub mod vision;

pub use datamodule::{DataModule, DataModuleConfig};
pub use dataset::{
    compute_instance_weights, get_group_ids, InstanceWeighted, LabeledDataset, Subset,
};
pub use loader::{BatchLoader, BatchSampler, DataLoader};
pub use sampling::{
    num_batches_per_epoch, SequentialBatchSampler, StratifiedBatchSampler,
    StratifiedSamplerConfig, TrainingMode,
};
pub use structures::{ImageSize, TensorBatch, TrainValTestSplit};
