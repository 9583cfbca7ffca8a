//! fairbolts - fairness-aware training building blocks on candle
//!
//! A collection of dataset/datamodule abstractions, fairness-aware losses
//! and self-supervised model definitions layered on top of candle. The
//! heavy numeric work (autograd, matmul, optimizer steps) is delegated to
//! candle; this crate supplies the orchestration glue:
//!
//! - **Datasets and datamodules**: vision/audio/tabular datasets exposing
//!   sensitive-attribute (`s`) and label (`y`) vectors, with seeded
//!   train/val/test splitting.
//! - **Stratified and instance-weighted sampling**: batches with controlled
//!   per-group composition for fairness-aware training, in either finite
//!   "epoch" or unbounded "step" mode.
//! - **Self-supervised training**: MoCo-v2 with a momentum teacher and a
//!   fixed-capacity memory bank of negative keys.
//! - **Adversarial fairness**: LAFTR min-max training with demographic
//!   parity / equalized odds / equal opportunity objectives.
//!
//! # Example
//!
//! ```ignore
//! use fairbolts::data::{DataModule, DataModuleConfig};
//! use fairbolts::data::tabular::TabularDataset;
//!
//! let ds = TabularDataset::from_csv("compas.csv", Some("race"), "two_year_recid")?;
//! let config = DataModuleConfig { stratified_sampling: true, ..Default::default() };
//! let dm = DataModule::new(ds, config)?;
//! let mut loader = dm.train_loader(true)?;
//! ```

pub mod data;
pub mod fair;
pub mod models;
pub mod training;

// Re-export commonly used items
pub use data::datamodule::{DataModule, DataModuleConfig};
pub use data::sampling::{StratifiedBatchSampler, TrainingMode};
pub use models::memory_bank::MemoryBank;

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum FbError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FbError>;
