//! Embedding encoders: the forward functions that map input batches to
//! embedding matrices for the self-supervised models.

use candle_core::Tensor;
use candle_nn::{Conv2dConfig, Linear, Module, VarBuilder};

use crate::data::structures::ImageSize;
use crate::{FbError, Result};

/// A network mapping a batch of inputs to a `(N, out_dim)` embedding matrix.
pub trait Encoder {
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Embedding dimensionality of the output.
    fn out_dim(&self) -> usize;
}

/// MLP encoder for flat (tabular) inputs.
pub struct MlpEncoder {
    layers: Vec<Linear>,
    out_dim: usize,
}

impl MlpEncoder {
    pub fn new(
        input_dim: usize,
        hidden: &[usize],
        out_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if input_dim == 0 || out_dim == 0 {
            return Err(FbError::Config(
                "encoder input and output dimensions must be > 0".to_string(),
            ));
        }
        let mut dims = vec![input_dim];
        dims.extend_from_slice(hidden);
        dims.push(out_dim);

        let mut layers = Vec::with_capacity(dims.len() - 1);
        for (i, pair) in dims.windows(2).enumerate() {
            layers.push(candle_nn::linear(pair[0], pair[1], vb.pp(format!("fc{i}")))?);
        }
        Ok(Self { layers, out_dim })
    }
}

impl Encoder for MlpEncoder {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.flatten_from(1)?;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i + 1 < self.layers.len() {
                h = h.relu()?;
            }
        }
        Ok(h)
    }

    fn out_dim(&self) -> usize {
        self.out_dim
    }
}

/// Configuration for the small convolutional encoder.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConvEncoderConfig {
    /// Input image dimensions; each conv stage halves height and width.
    pub input: ImageSize,
    /// Output channels of the successive conv stages.
    pub channels: Vec<usize>,
    pub out_dim: usize,
}

impl ConvEncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input.c == 0 || self.out_dim == 0 || self.channels.is_empty() {
            return Err(FbError::Config(
                "conv encoder needs channels, input channels > 0 and out_dim > 0".to_string(),
            ));
        }
        let ImageSize { h, w, .. } = self.input;
        if h >> self.channels.len() == 0 || w >> self.channels.len() == 0 {
            return Err(FbError::Config(format!(
                "input {h}x{w} is too small for {} pooling stages",
                self.channels.len()
            )));
        }
        Ok(())
    }
}

/// Small convolutional encoder for image/spectrogram inputs: conv + ReLU +
/// 2x2 max-pool stages followed by a linear projection of the flattened
/// feature map.
pub struct ConvEncoder {
    convs: Vec<candle_nn::Conv2d>,
    proj: Linear,
    out_dim: usize,
}

impl ConvEncoder {
    pub fn new(config: &ConvEncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let mut convs = Vec::with_capacity(config.channels.len());
        let mut in_c = config.input.c;
        for (i, &out_c) in config.channels.iter().enumerate() {
            convs.push(candle_nn::conv2d(
                in_c,
                out_c,
                3,
                conv_cfg,
                vb.pp(format!("conv{i}")),
            )?);
            in_c = out_c;
        }

        let ImageSize { h, w, .. } = config.input;
        let stages = config.channels.len();
        let flat = in_c * (h >> stages) * (w >> stages);
        let proj = candle_nn::linear(flat, config.out_dim, vb.pp("proj"))?;

        Ok(Self {
            convs,
            proj,
            out_dim: config.out_dim,
        })
    }
}

impl Encoder for ConvEncoder {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for conv in &self.convs {
            h = conv.forward(&h)?.relu()?.max_pool2d(2)?;
        }
        Ok(self.proj.forward(&h.flatten_from(1)?)?)
    }

    fn out_dim(&self) -> usize {
        self.out_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_mlp_encoder_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = MlpEncoder::new(10, &[16], 8, vb)?;
        let x = Tensor::zeros((4, 10), DType::F32, &device)?;
        let z = enc.forward(&x)?;
        assert_eq!(z.dims(), &[4, 8]);
        assert_eq!(enc.out_dim(), 8);
        Ok(())
    }

    #[test]
    fn test_conv_encoder_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ConvEncoderConfig {
            input: ImageSize { c: 3, h: 32, w: 32 },
            channels: vec![8, 16],
            out_dim: 64,
        };
        let enc = ConvEncoder::new(&config, vb)?;
        let x = Tensor::zeros((2, 3, 32, 32), DType::F32, &device)?;
        let z = enc.forward(&x)?;
        assert_eq!(z.dims(), &[2, 64]);
        Ok(())
    }

    #[test]
    fn test_conv_encoder_rejects_tiny_inputs() {
        let config = ConvEncoderConfig {
            input: ImageSize { c: 1, h: 4, w: 4 },
            channels: vec![8, 16, 32],
            out_dim: 16,
        };
        assert!(config.validate().is_err());
    }
}
