//! MoCo-v2 self-supervised pretraining on synthetic image views.
use candle_core::{Device, Tensor};
use fairbolts::data::ImageSize;
use fairbolts::models::{ConvEncoder, ConvEncoderConfig, MocoConfig, MoCoV2};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let device = Device::Cpu;
    log::info!("=== MoCo-v2 - momentum contrastive pretraining ===");

    let encoder_config = ConvEncoderConfig {
        input: ImageSize { c: 3, h: 32, w: 32 },
        channels: vec![8, 16],
        out_dim: 64,
    };
    let moco_config = MocoConfig {
        embed_dim: 32,
        num_negatives: 256,
        batch_size: 16,
        use_mlp: true,
        ..Default::default()
    };
    let mut model = MoCoV2::new(moco_config, &device, |vb| {
        ConvEncoder::new(&encoder_config, vb)
    })?;
    log::info!("Bank capacity: {}", model.bank().capacity());

    // Step-budget-driven training on synthetic augmented pairs: both views
    // are the same underlying batch plus independent noise.
    let total_steps = 40;
    for step in 0..total_steps {
        let base = Tensor::randn(0f32, 1f32, (16, 3, 32, 32), &device)?;
        let noise_q = Tensor::randn(0f32, 0.1f32, (16, 3, 32, 32), &device)?;
        let noise_k = Tensor::randn(0f32, 0.1f32, (16, 3, 32, 32), &device)?;
        let view_q = (&base + &noise_q)?;
        let view_k = (&base + &noise_k)?;

        let metrics = model.training_step(&view_q, &view_k)?;
        if (step + 1) % 10 == 0 {
            log::info!(
                "Step {}: loss={:.4}, acc1={:.3}, acc5={:.3}",
                step + 1,
                metrics.loss,
                metrics.acc1,
                metrics.acc5
            );
        }
    }

    log::info!("Pretraining complete; bank cursor at {}", model.bank().ptr());
    Ok(())
}
