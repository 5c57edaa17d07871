use std::{path::PathBuf, time::Instant};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use clap::{Parser, Subcommand};
use fluxdeclip_core::{
    initialize_logging, load_fluxdeclip, FluxDeclip, FluxParams, LoadConfig, ModelDType,
    TransformerOptions, TryIntoDType,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Load and exercise FluxDeCLIP checkpoints")]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Transformer checkpoint (safetensors).
    #[arg(short, long)]
    model: PathBuf,

    /// Separate safetensors file holding the distilled guidance layer.
    #[arg(short, long)]
    adapter: Option<PathBuf>,

    /// JSON file overriding the default FluxDeCLIP architecture.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Weight dtype: auto, bf16, f16 or f32.
    #[arg(short, long, default_value_t = ModelDType::Auto)]
    dtype: ModelDType,

    /// Run on the CPU even if an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Integer seed to ensure reproducible random number generation.
    #[arg(short, long)]
    seed: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the architecture and the modulation routing table.
    Inspect,
    /// Run one forward pass on random inputs.
    Probe {
        /// Latent height.
        #[arg(long, default_value_t = 64)]
        height: usize,

        /// Latent width.
        #[arg(long, default_value_t = 64)]
        width: usize,

        /// Number of text tokens.
        #[arg(long, default_value_t = 256)]
        txt_len: usize,

        #[arg(long, default_value_t = 1.0)]
        timestep: f32,

        /// Guidance value. Zero guidance is embedded when omitted.
        #[arg(long)]
        guidance: Option<f32>,
    },
}

fn device(cpu: bool) -> anyhow::Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    let device = Device::new_metal(0)?;
    #[cfg(not(feature = "metal"))]
    let device = Device::cuda_if_available(0)?;
    Ok(device)
}

fn inspect(model: &FluxDeclip) {
    let params = model.params();
    println!("{params:#?}");
    println!(
        "{} modulation consumers, {} rows",
        model.inventory().len(),
        model.inventory().total_rows()
    );
    for (consumer, start) in model.inventory().iter() {
        println!(
            "{start:>5}..{:<5} {consumer}",
            start + consumer.rows()
        );
    }
}

fn probe(
    model: &FluxDeclip,
    dtype: DType,
    (height, width, txt_len): (usize, usize, usize),
    timestep: f32,
    guidance: Option<f32>,
) -> anyhow::Result<()> {
    let params = model.params();
    let dev = model.device();
    let x = Tensor::randn(0f32, 1., (1, params.in_channels, height, width), dev)?.to_dtype(dtype)?;
    let context =
        Tensor::randn(0f32, 1., (1, txt_len, params.context_in_dim), dev)?.to_dtype(dtype)?;
    let timestep = Tensor::new(&[timestep], dev)?;
    let guidance = guidance.map(|g| Tensor::new(&[g], dev)).transpose()?;

    let start = Instant::now();
    let out = model.forward(
        &x,
        &timestep,
        &context,
        None,
        guidance.as_ref(),
        None,
        &TransformerOptions::default(),
    )?;
    dev.synchronize()?;
    let elapsed = start.elapsed();

    let mean_abs = out
        .to_dtype(DType::F32)?
        .abs()?
        .mean_all()?
        .to_scalar::<f32>()?;
    info!("Forward pass took {:.2}s", elapsed.as_secs_f32());
    println!("output shape {:?}, mean |x| = {mean_abs:.5}", out.shape());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    let device = device(args.cpu)?;
    if let Some(seed) = args.seed {
        if device.is_cpu() {
            warn!("Seeding is not supported on the CPU, ignoring seed {seed}.");
        } else {
            device.set_seed(seed)?;
        }
    }

    let params = match &args.config {
        Some(path) => FluxParams::from_json_file(path)
            .with_context(|| format!("reading config `{}`", path.display()))?,
        None => FluxParams::default(),
    };
    let cfg = LoadConfig {
        dtype: args.dtype,
        device: device.clone(),
    };
    let dtype = cfg.dtype.try_into_dtype(&device)?;

    let start = Instant::now();
    let model = load_fluxdeclip(&args.model, args.adapter.as_deref(), &params, &cfg)?;
    info!("Model loaded in {:.2}s", start.elapsed().as_secs_f32());

    match args.command {
        Command::Inspect => inspect(&model),
        Command::Probe {
            height,
            width,
            txt_len,
            timestep,
            guidance,
        } => probe(&model, dtype, (height, width, txt_len), timestep, guidance)?,
    }
    Ok(())
}
