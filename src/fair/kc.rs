//! Kamiran & Calders instance-weighting baseline.
//!
//! An ordinary MLP classifier whose cross-entropy is weighted per sample
//! by the inverse size of the sample's (s, y) group, as produced by
//! instance-weighted datamodules.

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use crate::data::structures::TensorBatch;
use crate::fair::losses::{CrossEntropy, ReductionType};
use crate::models::accuracy;
use crate::models::encoder::{Encoder, MlpEncoder};
use crate::{FbError, Result};

/// Hyperparameters for the instance-weighted classifier.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KcConfig {
    pub input_dim: usize,
    pub hidden: Vec<usize>,
    pub num_classes: usize,
    pub lr: f64,
    pub weight_decay: f64,
}

impl Default for KcConfig {
    fn default() -> Self {
        Self {
            input_dim: 0,
            hidden: vec![64],
            num_classes: 2,
            lr: 1e-3,
            weight_decay: 1e-6,
        }
    }
}

impl KcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(FbError::Config("input_dim must be > 0".to_string()));
        }
        if self.num_classes < 2 {
            return Err(FbError::Config(
                "num_classes must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// The Kamiran & Calders reweighting classifier.
pub struct KcClassifier {
    encoder: MlpEncoder,
    head: Linear,
    optimizer: AdamW,
    loss_fn: CrossEntropy,
}

impl KcClassifier {
    pub fn new(config: KcConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, device);
        let feat_dim = *config.hidden.last().unwrap_or(&config.input_dim);
        let encoder = MlpEncoder::new(config.input_dim, &config.hidden, feat_dim, vb.pp("enc"))?;
        let head = candle_nn::linear(feat_dim, config.num_classes, vb.pp("clf"))?;
        let optimizer = AdamW::new(
            vars.all_vars(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        Ok(Self {
            encoder,
            head,
            optimizer,
            loss_fn: CrossEntropy::new(None, ReductionType::Mean),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let features = self.encoder.forward(x)?.relu()?;
        Ok(self.head.forward(&features)?)
    }

    /// One instance-weighted supervised step; the batch must carry the
    /// precomputed weights.
    pub fn training_step(&mut self, batch: &TensorBatch) -> Result<(f32, f32)> {
        let logits = self.forward(&batch.x)?;
        let loss = self
            .loss_fn
            .forward(&logits, batch.y()?, Some(batch.iw()?))?;
        self.optimizer.backward_step(&loss)?;
        Ok((loss.to_scalar::<f32>()?, accuracy(&logits, batch.y()?)?))
    }

    pub fn eval_step(&self, batch: &TensorBatch) -> Result<f32> {
        accuracy(&self.forward(&batch.x)?, batch.y()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_batch(device: &Device, with_weights: bool) -> Result<TensorBatch> {
        let x = Tensor::from_slice(
            &[1.0f32, 0.0, 0.0, 1.0, 1.0, 0.1, 0.1, 1.0],
            (4, 2),
            device,
        )?;
        let y = Tensor::from_slice(&[0i64, 1, 0, 1], (4,), device)?;
        let iw = if with_weights {
            Some(Tensor::from_slice(&[1.0f32, 0.5, 1.0, 0.5], (4,), device)?)
        } else {
            None
        };
        Ok(TensorBatch {
            x,
            y: Some(y),
            s: None,
            iw,
        })
    }

    #[test]
    fn test_training_requires_instance_weights() -> Result<()> {
        let device = Device::Cpu;
        let config = KcConfig {
            input_dim: 2,
            hidden: vec![8],
            ..Default::default()
        };
        let mut model = KcClassifier::new(config, &device)?;
        let unweighted = toy_batch(&device, false)?;
        assert!(model.training_step(&unweighted).is_err());
        Ok(())
    }

    #[test]
    fn test_weighted_training_learns() -> Result<()> {
        let device = Device::Cpu;
        let config = KcConfig {
            input_dim: 2,
            hidden: vec![8],
            lr: 0.05,
            ..Default::default()
        };
        let mut model = KcClassifier::new(config, &device)?;
        let batch = toy_batch(&device, true)?;
        let (first_loss, _) = model.training_step(&batch)?;
        let mut last_loss = first_loss;
        for _ in 0..40 {
            last_loss = model.training_step(&batch)?.0;
        }
        assert!(last_loss < first_loss);
        Ok(())
    }

    #[test]
    fn test_validate() {
        assert!(KcConfig::default().validate().is_err());
        let ok = KcConfig {
            input_dim: 3,
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }
}
