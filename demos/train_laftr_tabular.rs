//! LAFTR on a synthetic tabular task with stratified sampling.
use candle_core::Device;
use fairbolts::data::tabular::TabularDataset;
use fairbolts::data::{BatchLoader, DataModule, DataModuleConfig};
use fairbolts::fair::{FairnessType, Laftr, LaftrConfig};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let device = Device::Cpu;
    log::info!("=== LAFTR - adversarially fair representations ===");

    // Synthetic data: two features, a sensitive attribute that shifts the
    // first feature, and a label correlated with the second.
    let n = 512;
    let mut rng = StdRng::seed_from_u64(7);
    let mut x = Array2::<f32>::zeros((n, 2));
    let mut s = Array1::<i64>::zeros(n);
    let mut y = Array1::<i64>::zeros(n);
    for i in 0..n {
        let si = (rng.gen::<f32>() < 0.3) as i64;
        let yi = (rng.gen::<f32>() < 0.5) as i64;
        x[[i, 0]] = rng.gen::<f32>() + 0.8 * si as f32;
        x[[i, 1]] = rng.gen::<f32>() + 1.2 * yi as f32;
        s[i] = si;
        y[i] = yi;
    }
    let dataset = TabularDataset::from_arrays(x, Some(s), Some(y))?;

    let dm_config = DataModuleConfig {
        train_batch_size: 32,
        stratified_sampling: true,
        ..Default::default()
    };
    let dm = DataModule::new(dataset, dm_config)?;
    log::info!(
        "Datamodule ready: {} train samples, {} batches/epoch",
        dm.num_train_samples(),
        dm.num_train_batches()?
    );

    let laftr_config = LaftrConfig {
        input_dim: 2,
        embed_dim: 8,
        fairness: FairnessType::Dp,
        disc_steps: 2,
        ..Default::default()
    };
    let mut model = Laftr::new(laftr_config, &device)?;

    for epoch in 0..5 {
        let mut loader = dm.train_loader(true)?;
        let mut batch_idx = 0usize;
        let mut epoch_loss = 0.0f32;
        let mut epoch_acc = 0.0f32;
        while let Some(batch) = loader.next_batch(&device)? {
            let metrics = model.training_step(&batch, batch_idx)?;
            epoch_loss += metrics.loss;
            epoch_acc += metrics.acc;
            batch_idx += 1;
        }
        log::info!(
            "Epoch {}: loss={:.4}, acc={:.3}",
            epoch + 1,
            epoch_loss / batch_idx as f32,
            epoch_acc / batch_idx as f32
        );
    }

    // held-out evaluation
    let mut loader = dm.test_loader()?;
    let mut acc = 0.0f32;
    let mut batches = 0usize;
    while let Some(batch) = loader.next_batch(&device)? {
        acc += model.inference_step(&batch)?.acc;
        batches += 1;
    }
    log::info!("Test accuracy: {:.3}", acc / batches as f32);

    Ok(())
}
