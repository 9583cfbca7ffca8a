//! LAFTR: Learning Adversarially Fair and Transferable Representations.
//!
//! An encoder maps inputs to a representation `z`; a classifier predicts
//! `y` from `z`, a decoder reconstructs the input from `(z, s)`, and an
//! adversary tries to recover `s` from `z`. The main model minimizes
//! classification + reconstruction loss while the adversary maximizes its
//! own objective, yielding representations from which the sensitive
//! attribute is hard to predict. The model is only defined for binary `s`
//! and binary `y`.

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use crate::data::structures::TensorBatch;
use crate::fair::losses::{CrossEntropy, ReductionType};
use crate::models::accuracy;
use crate::training::scheduler::CosineWarmRestarts;
use crate::{FbError, Result};

/// Which statistical fairness criterion the adversarial loss encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FairnessType {
    /// Demographic parity: balance the adversary across `s` alone.
    Dp,
    /// Equalized odds: balance across every `(s, y)` cell.
    Eo,
    /// Equal opportunity: balance across `s` within the `y == 1` stratum.
    EqOp,
}

impl std::fmt::Display for FairnessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FairnessType::Dp => write!(f, "DP"),
            FairnessType::Eo => write!(f, "EO"),
            FairnessType::EqOp => write!(f, "EqOp"),
        }
    }
}

/// LAFTR hyperparameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LaftrConfig {
    /// Input feature dimension.
    pub input_dim: usize,
    /// Representation dimension produced by the encoder.
    pub embed_dim: usize,
    /// Hidden widths of the encoder MLP.
    pub enc_hidden: Vec<usize>,
    /// Hidden widths of the decoder MLP.
    pub dec_hidden: Vec<usize>,
    /// Hidden widths of the adversary MLP.
    pub adv_hidden: Vec<usize>,
    /// Hidden widths of the classifier MLP.
    pub clf_hidden: Vec<usize>,
    pub fairness: FairnessType,
    /// Batches between main-model updates; the adversary updates every batch.
    pub disc_steps: usize,
    pub clf_weight: f64,
    pub recon_weight: f64,
    pub adv_weight: f64,
    pub lr: f64,
    pub weight_decay: f64,
    /// Cosine warm-restart schedule: steps in the first cycle.
    pub lr_initial_restart: usize,
    /// Cycle-length multiplier applied at each restart.
    pub lr_restart_mult: usize,
}

impl Default for LaftrConfig {
    fn default() -> Self {
        Self {
            input_dim: 0,
            embed_dim: 32,
            enc_hidden: vec![64],
            dec_hidden: vec![64],
            adv_hidden: vec![64],
            clf_hidden: vec![64],
            fairness: FairnessType::Dp,
            disc_steps: 1,
            clf_weight: 1.0,
            recon_weight: 1.0,
            adv_weight: 1.0,
            lr: 1e-3,
            weight_decay: 1e-6,
            lr_initial_restart: 10,
            lr_restart_mult: 2,
        }
    }
}

impl LaftrConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(FbError::Config("input_dim must be > 0".to_string()));
        }
        if self.embed_dim == 0 {
            return Err(FbError::Config("embed_dim must be > 0".to_string()));
        }
        if self.disc_steps == 0 {
            return Err(FbError::Config("disc_steps must be >= 1".to_string()));
        }
        if self.lr <= 0.0 {
            return Err(FbError::Config("lr must be positive".to_string()));
        }
        Ok(())
    }
}

/// Plain MLP with ReLU between layers.
struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    fn new(dims: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(dims.len() - 1);
        for (i, pair) in dims.windows(2).enumerate() {
            layers.push(candle_nn::linear(pair[0], pair[1], vb.pp(format!("fc{i}")))?);
        }
        Ok(Self { layers })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i + 1 < self.layers.len() {
                h = h.relu()?;
            }
        }
        Ok(h)
    }
}

fn stack_dims(input: usize, hidden: &[usize], output: usize) -> Vec<usize> {
    let mut dims = Vec::with_capacity(hidden.len() + 2);
    dims.push(input);
    dims.extend_from_slice(hidden);
    dims.push(output);
    dims
}

/// Everything the model produces for one batch.
pub struct LaftrOutput {
    /// Classifier logits over the two `y` values: `(N, 2)`.
    pub y_logits: Tensor,
    /// Encoded representation: `(N, embed_dim)`.
    pub z: Tensor,
    /// Adversary's estimate of `s` in `(0, 1)`: `(N, 1)`.
    pub s_pred: Tensor,
    /// Reconstruction of the input: `(N, input_dim)`.
    pub recon: Tensor,
}

/// Per-step metrics reported back to the training-loop controller.
#[derive(Debug, Clone, Copy)]
pub struct LaftrStepMetrics {
    pub loss: f32,
    pub model_loss: f32,
    pub adv_loss: f32,
    pub acc: f32,
}

/// The LAFTR model with its two optimizers and schedulers.
pub struct Laftr {
    enc: Mlp,
    dec: Mlp,
    adv: Mlp,
    clf: Mlp,
    opt_main: AdamW,
    opt_adv: AdamW,
    sched_main: CosineWarmRestarts,
    sched_adv: CosineWarmRestarts,
    clf_loss: CrossEntropy,
    config: LaftrConfig,
    device: Device,
}

impl Laftr {
    pub fn new(config: LaftrConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        // The min-max alternation is expressed through two optimizers over
        // disjoint variable sets: candle optimizers only ever update the
        // vars they were built over.
        let main_vars = VarMap::new();
        let adv_vars = VarMap::new();
        let vb_main = VarBuilder::from_varmap(&main_vars, DType::F32, device);
        let vb_adv = VarBuilder::from_varmap(&adv_vars, DType::F32, device);

        let enc = Mlp::new(
            &stack_dims(config.input_dim, &config.enc_hidden, config.embed_dim),
            vb_main.pp("enc"),
        )?;
        // the decoder is conditioned on s, appended as one extra input
        let dec = Mlp::new(
            &stack_dims(config.embed_dim + 1, &config.dec_hidden, config.input_dim),
            vb_main.pp("dec"),
        )?;
        let clf = Mlp::new(
            &stack_dims(config.embed_dim, &config.clf_hidden, 2),
            vb_main.pp("clf"),
        )?;
        let adv = Mlp::new(
            &stack_dims(config.embed_dim, &config.adv_hidden, 1),
            vb_adv.pp("adv"),
        )?;

        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let opt_main = AdamW::new(main_vars.all_vars(), params.clone())?;
        let opt_adv = AdamW::new(adv_vars.all_vars(), params)?;

        let sched_main = CosineWarmRestarts::new(
            config.lr,
            0.0,
            config.lr_initial_restart,
            config.lr_restart_mult,
        )?;
        let sched_adv = CosineWarmRestarts::new(
            config.lr,
            0.0,
            config.lr_initial_restart,
            config.lr_restart_mult,
        )?;

        Ok(Self {
            enc,
            dec,
            adv,
            clf,
            opt_main,
            opt_adv,
            sched_main,
            sched_adv,
            clf_loss: CrossEntropy::new(None, ReductionType::Mean),
            config,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &LaftrConfig {
        &self.config
    }

    /// Full forward pass through all four networks.
    pub fn forward(&self, x: &Tensor, s: &Tensor) -> Result<LaftrOutput> {
        let z = self.enc.forward(x)?;
        let y_logits = self.clf.forward(&z)?;
        let s_pred = candle_nn::ops::sigmoid(&self.adv.forward(&z)?)?;
        let s_in = s.reshape((s.dim(0)?, 1))?.to_dtype(DType::F32)?;
        let dec_in = Tensor::cat(&[&z, &s_in], 1)?;
        let recon = self.dec.forward(&dec_in)?;
        Ok(LaftrOutput {
            y_logits,
            z,
            s_pred,
            recon,
        })
    }

    /// Label logits alone, for downstream evaluation.
    pub fn predict(&self, x: &Tensor) -> Result<Tensor> {
        let z = self.enc.forward(x)?;
        self.clf.forward(&z)
    }

    /// Classification + reconstruction loss of the main model.
    fn loss_laftr(&self, out: &LaftrOutput, batch: &TensorBatch) -> Result<Tensor> {
        let clf_loss = self.clf_loss.forward(&out.y_logits, batch.y()?, None)?;
        let recon_loss = (&out.recon - &batch.x)?.abs()?.mean_all()?;
        let weighted = ((clf_loss * self.config.clf_weight)?
            + (recon_loss * self.config.recon_weight)?)?;
        Ok(weighted)
    }

    /// Adversarial loss for the configured fairness criterion.
    ///
    /// Every sample's L1 error is normalized by the size of its stratum in
    /// the batch, so each stratum contributes equally. Empty strata simply
    /// contribute nothing.
    fn loss_adv(&self, out: &LaftrOutput, batch: &TensorBatch) -> Result<Tensor> {
        let s = batch.s()?;
        let y = batch.y()?;
        let n = s.dim(0)?;
        let s_host = s.to_vec1::<i64>()?;
        let y_host = y.to_vec1::<i64>()?;

        let s_f = s.reshape((n, 1))?.to_dtype(DType::F32)?;
        let l1 = (&out.s_pred - &s_f)?.abs()?.reshape((n,))?;

        let mut weights = vec![0f32; n];
        let stratum_weights = |pred: &dyn Fn(i64, i64) -> bool, weights: &mut [f32]| {
            let count = s_host
                .iter()
                .zip(y_host.iter())
                .filter(|(&si, &yi)| pred(si, yi))
                .count();
            if count == 0 {
                return;
            }
            for (i, (&si, &yi)) in s_host.iter().zip(y_host.iter()).enumerate() {
                if pred(si, yi) {
                    weights[i] = 1.0 / count as f32;
                }
            }
        };

        match self.config.fairness {
            FairnessType::Dp => {
                for sv in 0..2i64 {
                    stratum_weights(&|si, _| si == sv, &mut weights);
                }
            }
            FairnessType::Eo => {
                for sv in 0..2i64 {
                    for yv in 0..2i64 {
                        stratum_weights(&|si, yi| si == sv && yi == yv, &mut weights);
                    }
                }
            }
            FairnessType::EqOp => {
                for sv in 0..2i64 {
                    stratum_weights(&|si, yi| si == sv && yi == 1, &mut weights);
                }
            }
        }

        let w = Tensor::from_slice(&weights, (n,), &self.device)?;
        let summed = (l1 * w)?.sum_all()?;
        let base = match self.config.fairness {
            FairnessType::Dp => (summed / 2.0)?.affine(-1.0, 1.0)?,
            FairnessType::Eo => (summed / 4.0)?.affine(-1.0, 2.0)?,
            FairnessType::EqOp => (summed / 2.0)?.affine(-1.0, 2.0)?,
        };
        Ok((base * self.config.adv_weight)?)
    }

    /// One training step driven by the external controller.
    ///
    /// The adversary ascends every batch; the main model descends every
    /// `disc_steps` batches, as in the original alternation.
    pub fn training_step(
        &mut self,
        batch: &TensorBatch,
        batch_idx: usize,
    ) -> Result<LaftrStepMetrics> {
        validate_binary(batch)?;

        // adversary update: gradient ascent on the joint objective
        let out = self.forward(&batch.x, batch.s()?)?;
        let model_loss = self.loss_laftr(&out, batch)?;
        let adv_loss = self.loss_adv(&out, batch)?;
        let joint = (&model_loss + &adv_loss)?;
        let adv_objective = joint.neg()?;
        self.opt_adv.set_learning_rate(self.sched_adv.get_lr());
        self.opt_adv.backward_step(&adv_objective)?;
        self.sched_adv.step();

        let mut metrics = LaftrStepMetrics {
            loss: joint.to_scalar::<f32>()?,
            model_loss: model_loss.to_scalar::<f32>()?,
            adv_loss: adv_loss.to_scalar::<f32>()?,
            acc: accuracy(&out.y_logits, batch.y()?)?,
        };

        // main-model update every disc_steps batches
        if (batch_idx + 1) % self.config.disc_steps == 0 {
            let out = self.forward(&batch.x, batch.s()?)?;
            let model_loss = self.loss_laftr(&out, batch)?;
            let adv_loss = self.loss_adv(&out, batch)?;
            let joint = (&model_loss + &adv_loss)?;
            self.opt_main.set_learning_rate(self.sched_main.get_lr());
            self.opt_main.backward_step(&joint)?;
            self.sched_main.step();
            metrics.loss = joint.to_scalar::<f32>()?;
            metrics.model_loss = model_loss.to_scalar::<f32>()?;
        }

        log::debug!(
            "{} laftr step {batch_idx}: loss={:.4} adv={:.4} acc={:.3}",
            self.config.fairness,
            metrics.loss,
            metrics.adv_loss,
            metrics.acc
        );
        Ok(metrics)
    }

    /// Loss and accuracy on one evaluation batch; no parameters change.
    pub fn inference_step(&self, batch: &TensorBatch) -> Result<LaftrStepMetrics> {
        validate_binary(batch)?;
        let out = self.forward(&batch.x, batch.s()?)?;
        let model_loss = self.loss_laftr(&out, batch)?;
        let adv_loss = self.loss_adv(&out, batch)?;
        Ok(LaftrStepMetrics {
            loss: (model_loss.to_scalar::<f32>()?) + (adv_loss.to_scalar::<f32>()?),
            model_loss: model_loss.to_scalar::<f32>()?,
            adv_loss: adv_loss.to_scalar::<f32>()?,
            acc: accuracy(&out.y_logits, batch.y()?)?,
        })
    }
}

fn validate_binary(batch: &TensorBatch) -> Result<()> {
    for (name, t) in [("s", batch.s()?), ("y", batch.y()?)] {
        let vals = t.to_vec1::<i64>()?;
        if let Some(&bad) = vals.iter().find(|&&v| !(0..2).contains(&v)) {
            return Err(FbError::Data(format!(
                "LAFTR is only defined for binary labels; got '{name}' = {bad}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_batch(device: &Device) -> Result<TensorBatch> {
        let x = Tensor::from_slice(
            &[0.1f32, 0.9, 0.8, 0.2, 0.4, 0.6, 0.7, 0.3],
            (4, 2),
            device,
        )?;
        let y = Tensor::from_slice(&[0i64, 1, 0, 1], (4,), device)?;
        let s = Tensor::from_slice(&[0i64, 0, 1, 1], (4,), device)?;
        Ok(TensorBatch {
            x,
            y: Some(y),
            s: Some(s),
            iw: None,
        })
    }

    fn toy_config() -> LaftrConfig {
        LaftrConfig {
            input_dim: 2,
            embed_dim: 4,
            enc_hidden: vec![8],
            dec_hidden: vec![8],
            adv_hidden: vec![8],
            clf_hidden: vec![8],
            ..Default::default()
        }
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let device = Device::Cpu;
        let model = Laftr::new(toy_config(), &device)?;
        let batch = toy_batch(&device)?;
        let out = model.forward(&batch.x, batch.s()?)?;
        assert_eq!(out.y_logits.dims(), &[4, 2]);
        assert_eq!(out.z.dims(), &[4, 4]);
        assert_eq!(out.s_pred.dims(), &[4, 1]);
        assert_eq!(out.recon.dims(), &[4, 2]);
        Ok(())
    }

    #[test]
    fn test_adversary_prediction_is_a_probability() -> Result<()> {
        let device = Device::Cpu;
        let model = Laftr::new(toy_config(), &device)?;
        let batch = toy_batch(&device)?;
        let out = model.forward(&batch.x, batch.s()?)?;
        for v in out.s_pred.reshape((4,))?.to_vec1::<f32>()? {
            assert!((0.0..=1.0).contains(&v));
        }
        Ok(())
    }

    #[test]
    fn test_training_step_updates_and_reports() -> Result<()> {
        let device = Device::Cpu;
        let mut model = Laftr::new(toy_config(), &device)?;
        let batch = toy_batch(&device)?;
        let m0 = model.training_step(&batch, 0)?;
        assert!(m0.loss.is_finite());
        assert!(m0.adv_loss.is_finite());
        // a few more steps keep everything finite
        for idx in 1..4 {
            let m = model.training_step(&batch, idx)?;
            assert!(m.loss.is_finite());
        }
        Ok(())
    }

    #[test]
    fn test_eqop_tolerates_batches_without_positives() -> Result<()> {
        let device = Device::Cpu;
        let config = LaftrConfig {
            fairness: FairnessType::EqOp,
            ..toy_config()
        };
        let mut model = Laftr::new(config, &device)?;
        let x = Tensor::zeros((2, 2), DType::F32, &device)?;
        let y = Tensor::from_slice(&[0i64, 0], (2,), &device)?;
        let s = Tensor::from_slice(&[0i64, 1], (2,), &device)?;
        let batch = TensorBatch {
            x,
            y: Some(y),
            s: Some(s),
            iw: None,
        };
        let m = model.training_step(&batch, 0)?;
        assert!(m.adv_loss.is_finite());
        Ok(())
    }

    #[test]
    fn test_non_binary_labels_rejected() -> Result<()> {
        let device = Device::Cpu;
        let mut model = Laftr::new(toy_config(), &device)?;
        let x = Tensor::zeros((2, 2), DType::F32, &device)?;
        let y = Tensor::from_slice(&[0i64, 2], (2,), &device)?;
        let s = Tensor::from_slice(&[0i64, 1], (2,), &device)?;
        let batch = TensorBatch {
            x,
            y: Some(y),
            s: Some(s),
            iw: None,
        };
        assert!(model.training_step(&batch, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_validate_rejects_zero_input_dim() {
        let device = Device::Cpu;
        let config = LaftrConfig::default();
        assert!(Laftr::new(config, &device).is_err());
    }
}
