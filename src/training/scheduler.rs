//! Cosine-annealing learning-rate schedule with warm restarts.

use std::f64::consts::PI;

use crate::{FbError, Result};

/// Cosine annealing with warm restarts.
///
/// The learning rate decays from `lr_init` to `eta_min` over a cycle of
/// `t_0` steps, then restarts at `lr_init` with the cycle length multiplied
/// by `t_mult`.
pub struct CosineWarmRestarts {
    lr_init: f64,
    eta_min: f64,
    t_mult: usize,
    cycle_len: usize,
    step_in_cycle: usize,
}

impl CosineWarmRestarts {
    pub fn new(lr_init: f64, eta_min: f64, t_0: usize, t_mult: usize) -> Result<Self> {
        if t_0 == 0 {
            return Err(FbError::Config("t_0 must be > 0".to_string()));
        }
        if t_mult == 0 {
            return Err(FbError::Config("t_mult must be >= 1".to_string()));
        }
        if lr_init < eta_min {
            return Err(FbError::Config(
                "lr_init must not be below eta_min".to_string(),
            ));
        }
        Ok(Self {
            lr_init,
            eta_min,
            t_mult,
            cycle_len: t_0,
            step_in_cycle: 0,
        })
    }

    /// Learning rate at the current position within the current cycle.
    pub fn get_lr(&self) -> f64 {
        let progress = self.step_in_cycle as f64 / self.cycle_len as f64;
        let cosine_factor = 0.5 * (1.0 + (PI * progress).cos());
        self.eta_min + (self.lr_init - self.eta_min) * cosine_factor
    }

    /// Advance one step, restarting (and lengthening) the cycle when it
    /// completes.
    pub fn step(&mut self) {
        self.step_in_cycle += 1;
        if self.step_in_cycle >= self.cycle_len {
            self.step_in_cycle = 0;
            self.cycle_len *= self.t_mult;
        }
    }

    pub fn cycle_len(&self) -> usize {
        self.cycle_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_lr_init() -> Result<()> {
        let sched = CosineWarmRestarts::new(1.0, 0.0, 10, 2)?;
        assert!((sched.get_lr() - 1.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_decays_within_a_cycle() -> Result<()> {
        let mut sched = CosineWarmRestarts::new(1.0, 0.0, 10, 2)?;
        for _ in 0..5 {
            sched.step();
        }
        // halfway through the cycle the cosine factor is 0.5
        assert!((sched.get_lr() - 0.5).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_restart_resets_and_lengthens_cycle() -> Result<()> {
        let mut sched = CosineWarmRestarts::new(1.0, 0.1, 4, 3)?;
        for _ in 0..4 {
            sched.step();
        }
        // fresh cycle: back to lr_init, cycle three times longer
        assert!((sched.get_lr() - 1.0).abs() < 1e-9);
        assert_eq!(sched.cycle_len(), 12);
        Ok(())
    }

    #[test]
    fn test_t_mult_one_keeps_cycle_length() -> Result<()> {
        let mut sched = CosineWarmRestarts::new(1.0, 0.0, 3, 1)?;
        for _ in 0..7 {
            sched.step();
        }
        assert_eq!(sched.cycle_len(), 3);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_configs() {
        assert!(CosineWarmRestarts::new(1.0, 0.0, 0, 2).is_err());
        assert!(CosineWarmRestarts::new(1.0, 0.0, 5, 0).is_err());
        assert!(CosineWarmRestarts::new(0.1, 0.5, 5, 1).is_err());
    }
}
