use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use burn::tensor::backend::Backend;
use clap::{Args, Parser, Subcommand};
use dcgan_rerun::RerunLogger;
use dcgan_train::checkpoint::load_generator;
use dcgan_train::image::{save_image_grid, PngLogger};
use dcgan_train::latent::LatentSampler;
use dcgan_train::loss::GanLoss;
use dcgan_train::{Events, PlotHook, Runner, RunnerConfig, StatsHook};
use tracing::info;

#[cfg(feature = "wgpu")]
type InnerBackend = burn::backend::Wgpu;
#[cfg(not(feature = "wgpu"))]
type InnerBackend = burn::backend::NdArray;

type TrainBackend = Autodiff<InnerBackend>;

#[derive(Parser)]
#[command(author, version, about = "Train and sample a DCGAN on a folder of images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a generator and discriminator
    Train(TrainArgs),
    /// Write a grid of images from a trained generator
    Sample(SampleArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Directory with one subdirectory of images per class
    #[arg(long, default_value = "data/processed")]
    root: PathBuf,

    /// Channel width multiplier of both networks
    #[arg(long, default_value_t = 16)]
    capacity: usize,

    /// Latent dimension
    #[arg(long, default_value_t = 128)]
    zdim: usize,

    /// Times the image folder is repeated per epoch
    #[arg(long, default_value_t = 100)]
    ds_repeat: usize,

    /// Shorter image side after resizing
    #[arg(long, default_value_t = 144)]
    base_size: u32,

    /// Side of the square training crops, a power of two
    #[arg(long, default_value_t = 128)]
    crop_size: u32,

    /// Probability of augmenting a discriminator input batch
    #[arg(long, default_value_t = 0.5)]
    aug_prob: f64,

    /// Iterations between generated image plots
    #[arg(long, default_value_t = 100)]
    plot_every: u32,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Dataset loading threads
    #[arg(long, default_value_t = 4)]
    num_workers: usize,

    #[arg(long, default_value_t = 2e-4)]
    lr: f64,

    #[arg(long, default_value_t = 100)]
    max_epochs: usize,

    /// Iterations between checkpoints
    #[arg(long, default_value_t = 1000)]
    save_every: u32,

    /// Iterations between loss reports
    #[arg(long, default_value_t = 10)]
    log_every: u32,

    #[arg(long)]
    seed: Option<u64>,

    /// Adversarial loss, "non-saturating" or "hinge"
    #[arg(long, default_value_t = GanLoss::NonSaturating)]
    loss: GanLoss,

    /// Directory for checkpoints and samples
    #[arg(short, long, default_value = "runs/dcgan")]
    output: PathBuf,

    /// Continue from the latest checkpoint in the output directory
    #[arg(long)]
    resume: bool,

    /// Stream images and losses to a rerun viewer
    #[arg(long)]
    rerun: bool,
}

impl TrainArgs {
    fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::new()
            .with_root(self.root.clone())
            .with_capacity(self.capacity)
            .with_zdim(self.zdim)
            .with_ds_repeat(self.ds_repeat)
            .with_base_size(self.base_size)
            .with_crop_size(self.crop_size)
            .with_aug_prob(self.aug_prob)
            .with_plot_every(self.plot_every)
            .with_batch_size(self.batch_size)
            .with_num_workers(self.num_workers)
            .with_lr(self.lr)
            .with_max_epochs(self.max_epochs)
            .with_save_every(self.save_every)
            .with_loss(self.loss)
            .with_seed(self.seed)
    }
}

#[derive(Args)]
struct SampleArgs {
    /// Run output directory, or its checkpoint subdirectory
    #[arg(long)]
    checkpoint: PathBuf,

    #[arg(long, default_value_t = 64)]
    count: usize,

    #[arg(short, long, default_value = "samples.png")]
    output: PathBuf,

    /// Images per grid row
    #[arg(long, default_value_t = 8)]
    columns: usize,

    #[arg(long)]
    seed: Option<u64>,
}

fn train(args: TrainArgs) -> Result<()> {
    let device = Default::default();
    let runner = Runner::<TrainBackend>::new(args.runner_config(), device)?
        .with_output_dir(&args.output)
        .with_resume(args.resume);

    let mut events = Events::new();
    let mut stats = StatsHook::new(args.log_every);
    events.on_iteration_completed(PlotHook::new(
        args.plot_every,
        PngLogger::new(args.output.join("samples"))?,
    ));
    if args.rerun {
        let logger = RerunLogger::spawn("dcgan")?;
        events.on_iteration_completed(PlotHook::new(args.plot_every, logger.clone()));
        stats = stats.with_logger(logger);
    }
    events.on_iteration_completed(stats);

    let state = runner.train(&mut events)?;
    info!(
        iteration = state.iteration,
        epoch = state.epoch,
        output = %args.output.display(),
        "Training finished"
    );
    Ok(())
}

// Accepts either the run directory or its checkpoint subdirectory.
fn resolve_run(dir: &Path) -> Result<(RunnerConfig, PathBuf)> {
    for (config_dir, weights_dir) in [
        (dir.to_path_buf(), dir.join("checkpoint")),
        (dir.join(".."), dir.to_path_buf()),
    ] {
        let config_path = config_dir.join("config.json");
        if config_path.exists() {
            let config = RunnerConfig::load(&config_path)
                .with_context(|| format!("Invalid run config {}", config_path.display()))?;
            return Ok((config, weights_dir));
        }
    }
    anyhow::bail!("No config.json found for {}", dir.display())
}

fn sample(args: SampleArgs) -> Result<()> {
    let device = Default::default();
    if let Some(seed) = args.seed {
        InnerBackend::seed(seed);
    }

    let (config, weights_dir) = resolve_run(&args.checkpoint)?;
    let model = config.model_config();
    let generator = load_generator::<InnerBackend>(&weights_dir, &model, &device)?;

    let latent = LatentSampler::new(model.zdim).sample::<InnerBackend>(args.count, &device);
    let images = generator.forward(latent).add_scalar(0.5).clamp(0.0, 1.0);
    save_image_grid(images, args.columns, &args.output)?;

    info!(
        count = args.count,
        output = %args.output.display(),
        "Wrote samples"
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => train(args),
        Command::Sample(args) => sample(args),
    }
}
