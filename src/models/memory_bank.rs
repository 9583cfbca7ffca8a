//! Fixed-capacity ring buffer of embedding vectors used as the negative
//! pool for contrastive losses.

use candle_core::{Device, Tensor};

use crate::{FbError, Result};

/// Rolling window over the most recent `capacity` key embeddings.
///
/// The buffer is allocated once with random unit-norm rows and mutated in
/// place by [`push`](MemoryBank::push); it is never resized. A write cursor
/// `ptr` marks where the next batch of keys lands, so rows near `ptr` are
/// the most recently overwritten ones. The bank is single-writer: one
/// logical push per global training step, pre-synchronized by the caller.
/// In a multi-replica setting the caller must push the globally gathered
/// key batch so every replica sees the same buffer.
pub struct MemoryBank {
    buffer: Tensor,
    ptr: usize,
    capacity: usize,
    dim: usize,
}

impl MemoryBank {
    /// Allocate a bank of `capacity` unit-norm `dim`-vectors.
    ///
    /// `batch_size` is the per-step key-batch size the bank will be fed;
    /// the batch-aligned wraparound policy requires it to divide
    /// `capacity`, checked here once rather than on every push.
    pub fn new(dim: usize, capacity: usize, batch_size: usize, device: &Device) -> Result<Self> {
        if dim == 0 || capacity == 0 {
            return Err(FbError::Config(
                "memory bank capacity and dim must be > 0".to_string(),
            ));
        }
        if batch_size == 0 || capacity % batch_size != 0 {
            return Err(FbError::Config(format!(
                "memory bank capacity ({capacity}) must be a multiple of the \
                 key batch size ({batch_size})"
            )));
        }
        let buffer = l2_normalize(&Tensor::randn(0f32, 1f32, (capacity, dim), device)?)?;
        Ok(Self {
            buffer,
            ptr: 0,
            capacity,
            dim,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Current write cursor.
    pub fn ptr(&self) -> usize {
        self.ptr
    }

    /// Overwrite the `B` oldest rows with a `(B, dim)` batch of keys and
    /// advance the cursor by `B` modulo capacity.
    ///
    /// The write is block-wise: a batch that straddles the end of the
    /// buffer is split into a tail segment `[ptr, capacity)` and a head
    /// segment starting at row 0.
    pub fn push(&mut self, keys: &Tensor) -> Result<()> {
        let (batch, dim) = keys.dims2().map_err(|_| {
            FbError::Data(format!(
                "memory bank expects a (batch, dim) matrix of keys, got shape {:?}",
                keys.dims()
            ))
        })?;
        if dim != self.dim {
            return Err(FbError::Data(format!(
                "key dimensionality {dim} does not match the bank's {}",
                self.dim
            )));
        }
        if batch == 0 || batch > self.capacity {
            return Err(FbError::Data(format!(
                "key batch of {batch} cannot fill a bank of capacity {}",
                self.capacity
            )));
        }

        let keys = keys.to_dtype(self.buffer.dtype())?.detach();
        let tail = self.capacity - self.ptr;
        if batch <= tail {
            self.buffer = self
                .buffer
                .slice_assign(&[self.ptr..self.ptr + batch, 0..self.dim], &keys)?;
        } else {
            let head = batch - tail;
            self.buffer = self
                .buffer
                .slice_assign(
                    &[self.ptr..self.capacity, 0..self.dim],
                    &keys.narrow(0, 0, tail)?,
                )?
                .slice_assign(&[0..head, 0..self.dim], &keys.narrow(0, tail, head)?)?;
        }
        self.ptr = (self.ptr + batch) % self.capacity;
        Ok(())
    }

    /// Snapshot of the full `(capacity, dim)` buffer contents.
    ///
    /// Row order carries no meaning beyond "rows just behind `ptr` are the
    /// most recently written".
    pub fn read(&self) -> Tensor {
        self.buffer.clone()
    }
}

/// Normalize each row to unit L2 norm.
pub fn l2_normalize(t: &Tensor) -> Result<Tensor> {
    let norm = t
        .sqr()?
        .sum_keepdim(candle_core::D::Minus1)?
        .sqrt()?
        .clamp(1e-12, f64::INFINITY)?;
    Ok(t.broadcast_div(&norm)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn constant_batch(value: f32, rows: usize, dim: usize, device: &Device) -> Result<Tensor> {
        Ok(Tensor::full(value, (rows, dim), device)?)
    }

    fn row_ids(bank: &MemoryBank) -> Result<Vec<f32>> {
        // first column of each row identifies the batch it came from
        Ok(bank
            .read()
            .narrow(1, 0, 1)?
            .reshape((bank.capacity(),))?
            .to_vec1::<f32>()?)
    }

    #[test]
    fn test_construction_requires_divisible_capacity() {
        let device = Device::Cpu;
        assert!(MemoryBank::new(2, 8, 4, &device).is_ok());
        assert!(MemoryBank::new(2, 8, 3, &device).is_err());
        assert!(MemoryBank::new(2, 0, 1, &device).is_err());
        assert!(MemoryBank::new(0, 8, 4, &device).is_err());
    }

    #[test]
    fn test_initial_rows_are_unit_norm() -> Result<()> {
        let device = Device::Cpu;
        let bank = MemoryBank::new(16, 32, 8, &device)?;
        let norms = bank
            .read()
            .sqr()?
            .sum_keepdim(1)?
            .sqrt()?
            .reshape((32,))?
            .to_vec1::<f32>()?;
        for n in norms {
            assert!((n - 1.0).abs() < 1e-5, "row norm {n}");
        }
        Ok(())
    }

    #[test]
    fn test_block_overwrite_scenario() -> Result<()> {
        // capacity 8, dim 2, batch 4: two pushes fill the bank exactly.
        let device = Device::Cpu;
        let mut bank = MemoryBank::new(2, 8, 4, &device)?;

        let ones = Tensor::from_slice(&[1f32, 0.0].repeat(4), (4, 2), &device)?;
        let twos = Tensor::from_slice(&[0f32, 1.0].repeat(4), (4, 2), &device)?;
        bank.push(&ones)?;
        assert_eq!(bank.ptr(), 4);
        bank.push(&twos)?;
        assert_eq!(bank.ptr(), 0);

        let rows = bank.read().to_vec2::<f32>()?;
        for row in &rows[..4] {
            assert_eq!(row, &[1.0, 0.0]);
        }
        for row in &rows[4..] {
            assert_eq!(row, &[0.0, 1.0]);
        }
        Ok(())
    }

    #[test]
    fn test_full_cycle_retains_every_pushed_vector_once() -> Result<()> {
        let device = Device::Cpu;
        let mut bank = MemoryBank::new(3, 12, 4, &device)?;
        for step in 0..3 {
            bank.push(&constant_batch(step as f32 + 1.0, 4, 3, &device)?)?;
        }
        assert_eq!(bank.ptr(), 0);
        let ids = row_ids(&bank)?;
        for step in 0..3 {
            let count = ids.iter().filter(|&&v| v == step as f32 + 1.0).count();
            assert_eq!(count, 4, "batch {step} should occupy exactly 4 rows");
        }
        Ok(())
    }

    #[test]
    fn test_straddling_push_splits_into_tail_and_head() -> Result<()> {
        let device = Device::Cpu;
        let mut bank = MemoryBank::new(2, 8, 2, &device)?;
        // advance the cursor to 6 with three aligned pushes
        for _ in 0..3 {
            bank.push(&constant_batch(1.0, 2, 2, &device)?)?;
        }
        assert_eq!(bank.ptr(), 6);

        // a batch of 4 must wrap: rows 6..8 then rows 0..2
        bank.push(&constant_batch(9.0, 4, 2, &device)?)?;
        assert_eq!(bank.ptr(), 2);
        let ids = row_ids(&bank)?;
        assert_eq!(&ids[6..8], &[9.0, 9.0]);
        assert_eq!(&ids[0..2], &[9.0, 9.0]);
        // rows 2..6 keep their previous contents
        assert_eq!(&ids[2..6], &[1.0, 1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_push_validates_shape() -> Result<()> {
        let device = Device::Cpu;
        let mut bank = MemoryBank::new(4, 8, 4, &device)?;
        // wrong dim
        assert!(bank.push(&constant_batch(1.0, 4, 3, &device)?).is_err());
        // larger than capacity
        assert!(bank.push(&constant_batch(1.0, 9, 4, &device)?).is_err());
        // not a matrix
        let flat = Tensor::zeros((4,), DType::F32, &device)?;
        assert!(bank.push(&flat).is_err());
        Ok(())
    }

    #[test]
    fn test_read_is_a_snapshot() -> Result<()> {
        let device = Device::Cpu;
        let mut bank = MemoryBank::new(2, 4, 2, &device)?;
        bank.push(&constant_batch(5.0, 2, 2, &device)?)?;
        let before = bank.read().to_vec2::<f32>()?;
        bank.push(&constant_batch(7.0, 2, 2, &device)?)?;
        // the earlier snapshot is unaffected by the later push
        let after = bank.read().to_vec2::<f32>()?;
        assert_eq!(before[0], [5.0, 5.0]);
        assert_eq!(after[2], [7.0, 7.0]);
        assert_ne!(before[2], [7.0, 7.0]);
        Ok(())
    }
}
