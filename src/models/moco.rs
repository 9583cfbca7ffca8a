//! MoCo-v2 momentum-contrastive self-supervised model.
//!
//! Two encoders share one architecture: the student receives gradients
//! while the teacher is an exponential moving average of the student. Each
//! step embeds one augmented view with the student (queries) and a second
//! view with the teacher (keys); the contrastive loss discriminates the
//! matching key from a fixed-capacity memory bank of past keys.

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use crate::fair::losses::{CrossEntropy, ReductionType};
use crate::models::encoder::Encoder;
use crate::models::memory_bank::{l2_normalize, MemoryBank};
use crate::models::precision_at_k;
use crate::training::momentum::{copy_params, momentum_update};
use crate::{FbError, Result};

/// MoCo-v2 hyperparameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MocoConfig {
    /// Embedding dimension of the contrastive space.
    pub embed_dim: usize,
    /// Memory-bank capacity (number of negative keys).
    pub num_negatives: usize,
    /// Key batch size pushed into the bank each step. Must divide
    /// `num_negatives`.
    pub batch_size: usize,
    /// EMA coefficient for the teacher update.
    pub momentum_teacher: f64,
    /// Softmax temperature applied to the contrastive logits.
    pub temp: f64,
    pub lr: f64,
    pub weight_decay: f64,
    /// Insert a hidden ReLU layer into the projection heads (the "v2" MLP
    /// head).
    pub use_mlp: bool,
}

impl Default for MocoConfig {
    fn default() -> Self {
        Self {
            embed_dim: 128,
            num_negatives: 65_536,
            batch_size: 256,
            momentum_teacher: 0.999,
            temp: 0.07,
            lr: 0.03,
            weight_decay: 1.0e-4,
            use_mlp: false,
        }
    }
}

impl MocoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.embed_dim == 0 {
            return Err(FbError::Config("embed_dim must be > 0".to_string()));
        }
        if self.temp <= 0.0 {
            return Err(FbError::Config("temp must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.momentum_teacher) {
            return Err(FbError::Config(
                "momentum_teacher must lie in [0, 1]".to_string(),
            ));
        }
        // bank divisibility is re-checked by MemoryBank::new
        if self.batch_size == 0 || self.num_negatives % self.batch_size != 0 {
            return Err(FbError::Config(format!(
                "num_negatives ({}) must be a multiple of batch_size ({})",
                self.num_negatives, self.batch_size
            )));
        }
        Ok(())
    }
}

/// Projection from encoder features into the contrastive embedding space.
struct ProjectionHead {
    hidden: Option<Linear>,
    out: Linear,
}

impl ProjectionHead {
    fn new(in_dim: usize, out_dim: usize, use_mlp: bool, vb: VarBuilder) -> Result<Self> {
        let hidden = if use_mlp {
            Some(candle_nn::linear(in_dim, in_dim, vb.pp("hidden"))?)
        } else {
            None
        };
        let out = candle_nn::linear(in_dim, out_dim, vb.pp("out"))?;
        Ok(Self { hidden, out })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = match &self.hidden {
            Some(hidden) => hidden.forward(x)?.relu()?,
            None => x.clone(),
        };
        Ok(self.out.forward(&h)?)
    }
}

/// Per-step metrics reported back to the training-loop controller.
#[derive(Debug, Clone, Copy)]
pub struct MocoStepMetrics {
    pub loss: f32,
    pub acc1: f32,
    pub acc5: f32,
}

/// MoCo-v2 model: student/teacher encoder pair, projection heads, memory
/// bank and the student's optimizer.
pub struct MoCoV2<E: Encoder> {
    student: E,
    teacher: E,
    student_head: ProjectionHead,
    teacher_head: ProjectionHead,
    student_vars: VarMap,
    teacher_vars: VarMap,
    optimizer: AdamW,
    bank: MemoryBank,
    loss_fn: CrossEntropy,
    config: MocoConfig,
    device: Device,
}

impl<E: Encoder> MoCoV2<E> {
    /// Build both encoders with `build_encoder` (student and teacher get
    /// identical architectures and, initially, identical weights).
    pub fn new<F>(config: MocoConfig, device: &Device, build_encoder: F) -> Result<Self>
    where
        F: Fn(VarBuilder) -> Result<E>,
    {
        config.validate()?;

        let student_vars = VarMap::new();
        let teacher_vars = VarMap::new();
        let vb_student = VarBuilder::from_varmap(&student_vars, DType::F32, device);
        let vb_teacher = VarBuilder::from_varmap(&teacher_vars, DType::F32, device);

        let student = build_encoder(vb_student.pp("encoder"))?;
        let teacher = build_encoder(vb_teacher.pp("encoder"))?;
        let student_head = ProjectionHead::new(
            student.out_dim(),
            config.embed_dim,
            config.use_mlp,
            vb_student.pp("head"),
        )?;
        let teacher_head = ProjectionHead::new(
            teacher.out_dim(),
            config.embed_dim,
            config.use_mlp,
            vb_teacher.pp("head"),
        )?;

        // teacher starts from the student's weights and is only ever
        // updated through the momentum rule
        copy_params(&student_vars, &teacher_vars)?;

        let optimizer = AdamW::new(
            student_vars.all_vars(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        let bank = MemoryBank::new(
            config.embed_dim,
            config.num_negatives,
            config.batch_size,
            device,
        )?;

        log::info!(
            "MoCo-v2 initialized: embed_dim={}, num_negatives={}, momentum={}",
            config.embed_dim,
            config.num_negatives,
            config.momentum_teacher
        );

        Ok(Self {
            student,
            teacher,
            student_head,
            teacher_head,
            student_vars,
            teacher_vars,
            optimizer,
            bank,
            loss_fn: CrossEntropy::new(None, ReductionType::Mean),
            config,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &MocoConfig {
        &self.config
    }

    pub fn bank(&self) -> &MemoryBank {
        &self.bank
    }

    /// The gradient-receiving encoder, e.g. for downstream fine-tuning.
    pub fn student(&self) -> &E {
        &self.student
    }

    /// Unit-norm query embeddings from the student.
    pub fn embed_queries(&self, x: &Tensor) -> Result<Tensor> {
        let features = self.student.forward(x)?;
        l2_normalize(&self.student_head.forward(&features)?)
    }

    /// Unit-norm key embeddings from the teacher, detached from the graph:
    /// no gradient ever flows through the key encoder.
    pub fn embed_keys(&self, x: &Tensor) -> Result<Tensor> {
        let features = self.teacher.forward(x)?;
        Ok(l2_normalize(&self.teacher_head.forward(&features)?)?.detach())
    }

    /// Temperature-scaled logits: the positive pair similarity in column 0
    /// followed by similarities against every bank row.
    pub fn contrastive_logits(&self, queries: &Tensor, keys: &Tensor) -> Result<Tensor> {
        let l_pos = (queries * keys)?.sum_keepdim(1)?;
        let negatives = self.bank.read().t()?.contiguous()?;
        let l_neg = queries.matmul(&negatives)?;
        let logits = Tensor::cat(&[&l_pos, &l_neg], 1)?;
        Ok((logits / self.config.temp)?)
    }

    /// One contrastive training step on a pair of augmented views.
    ///
    /// In a distributed run `img_k` must already be the globally gathered
    /// key view so every replica pushes the same keys.
    pub fn training_step(&mut self, img_q: &Tensor, img_k: &Tensor) -> Result<MocoStepMetrics> {
        momentum_update(
            &self.student_vars,
            &self.teacher_vars,
            self.config.momentum_teacher,
        )?;

        let queries = self.embed_queries(img_q)?;
        let keys = self.embed_keys(img_k)?;
        let logits = self.contrastive_logits(&queries, &keys)?;

        // the positive key sits in column 0
        let targets = Tensor::zeros((logits.dim(0)?,), DType::I64, &self.device)?;
        let loss = self.loss_fn.forward(&logits, &targets, None)?;
        self.optimizer.backward_step(&loss)?;

        self.bank.push(&keys)?;

        let precision = precision_at_k(&logits, &targets, &[1, 5])?;
        Ok(MocoStepMetrics {
            loss: loss.to_scalar::<f32>()?,
            acc1: precision[0],
            acc5: precision[1],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::encoder::MlpEncoder;

    fn toy_moco(device: &Device) -> Result<MoCoV2<MlpEncoder>> {
        let config = MocoConfig {
            embed_dim: 8,
            num_negatives: 16,
            batch_size: 4,
            use_mlp: true,
            ..Default::default()
        };
        MoCoV2::new(config, device, |vb| MlpEncoder::new(6, &[12], 8, vb))
    }

    #[test]
    fn test_teacher_starts_from_student_weights() -> Result<()> {
        let device = Device::Cpu;
        let moco = toy_moco(&device)?;
        let x = Tensor::randn(0f32, 1f32, (4, 6), &device)?;
        let q = moco.embed_queries(&x)?;
        let k = moco.embed_keys(&x)?;
        let diff = (&q - &k)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "student/teacher diverge at init: {diff}");
        Ok(())
    }

    #[test]
    fn test_embeddings_are_unit_norm() -> Result<()> {
        let device = Device::Cpu;
        let moco = toy_moco(&device)?;
        let x = Tensor::randn(0f32, 1f32, (4, 6), &device)?;
        let norms = moco
            .embed_keys(&x)?
            .sqr()?
            .sum_keepdim(1)?
            .sqrt()?
            .reshape((4,))?
            .to_vec1::<f32>()?;
        for n in norms {
            assert!((n - 1.0).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_logit_layout() -> Result<()> {
        let device = Device::Cpu;
        let moco = toy_moco(&device)?;
        let x = Tensor::randn(0f32, 1f32, (4, 6), &device)?;
        let q = moco.embed_queries(&x)?;
        let k = moco.embed_keys(&x)?;
        let logits = moco.contrastive_logits(&q, &k)?;
        // one positive column plus num_negatives
        assert_eq!(logits.dims(), &[4, 17]);
        Ok(())
    }

    #[test]
    fn test_training_step_advances_bank_and_reports() -> Result<()> {
        let device = Device::Cpu;
        let mut moco = toy_moco(&device)?;
        let view_a = Tensor::randn(0f32, 1f32, (4, 6), &device)?;
        let view_b = Tensor::randn(0f32, 1f32, (4, 6), &device)?;
        let m = moco.training_step(&view_a, &view_b)?;
        assert!(m.loss.is_finite());
        assert!((0.0..=1.0).contains(&m.acc1));
        assert!((0.0..=1.0).contains(&m.acc5));
        assert_eq!(moco.bank().ptr(), 4);
        // four steps wrap the 16-slot bank back to the start
        for _ in 0..3 {
            moco.training_step(&view_a, &view_b)?;
        }
        assert_eq!(moco.bank().ptr(), 0);
        Ok(())
    }

    #[test]
    fn test_teacher_drifts_toward_student_after_steps() -> Result<()> {
        let device = Device::Cpu;
        let mut moco = toy_moco(&device)?;
        let view_a = Tensor::randn(0f32, 1f32, (4, 6), &device)?;
        let view_b = Tensor::randn(0f32, 1f32, (4, 6), &device)?;
        for _ in 0..3 {
            moco.training_step(&view_a, &view_b)?;
        }
        // after optimizer updates the student and teacher differ, but only
        // slightly thanks to the high momentum
        let q = moco.embed_queries(&view_a)?;
        let k = moco.embed_keys(&view_a)?;
        let diff = (&q - &k)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff > 0.0);
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        let device = Device::Cpu;
        let config = MocoConfig {
            num_negatives: 10,
            batch_size: 4,
            ..Default::default()
        };
        assert!(MoCoV2::new(config, &device, |vb| MlpEncoder::new(6, &[], 8, vb)).is_err());
    }
}
