//! Sample and batch structures shared across datasets and models.

use candle_core::Tensor;

/// Channel/height/width dimensions of an image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ImageSize {
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl ImageSize {
    pub fn num_elements(&self) -> usize {
        self.c * self.h * self.w
    }
}

/// The three subsets produced by a datamodule split.
#[derive(Debug, Clone)]
pub struct TrainValTestSplit<D> {
    pub train: D,
    pub val: D,
    pub test: D,
}

/// A collated batch of samples.
///
/// `x` is the stacked input tensor. `y`/`s` are `I64` label vectors when the
/// underlying dataset carries them, and `iw` holds per-instance weights when
/// instance weighting is enabled.
#[derive(Debug, Clone)]
pub struct TensorBatch {
    pub x: Tensor,
    pub y: Option<Tensor>,
    pub s: Option<Tensor>,
    pub iw: Option<Tensor>,
}

impl TensorBatch {
    /// Number of samples in the batch.
    pub fn len(&self) -> crate::Result<usize> {
        Ok(self.x.dim(0)?)
    }

    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Label vector, or a data error if the dataset carries none.
    pub fn y(&self) -> crate::Result<&Tensor> {
        self.y
            .as_ref()
            .ok_or_else(|| crate::FbError::Data("batch carries no 'y' labels".to_string()))
    }

    /// Sensitive-attribute vector, or a data error if the dataset carries none.
    pub fn s(&self) -> crate::Result<&Tensor> {
        self.s
            .as_ref()
            .ok_or_else(|| crate::FbError::Data("batch carries no 's' labels".to_string()))
    }

    /// Instance-weight vector, or a data error if weighting is not enabled.
    pub fn iw(&self) -> crate::Result<&Tensor> {
        self.iw.as_ref().ok_or_else(|| {
            crate::FbError::Data("batch carries no instance weights".to_string())
        })
    }
}
