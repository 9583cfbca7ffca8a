//! Fairness-aware losses and models.

pub mod kc;
pub mod laftr;
pub mod losses;

pub use kc::{KcClassifier, KcConfig};
pub use laftr::{FairnessType, Laftr, LaftrConfig};
pub use losses::{CrossEntropy, OnlineReweightingLoss, ReductionType};
