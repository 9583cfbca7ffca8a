//! Training utilities shared by the model definitions.

pub mod momentum;
pub mod scheduler;

pub use momentum::{copy_params, momentum_update};
pub use scheduler::CosineWarmRestarts;
