use std::path::Path;

use anyhow::{Context, Result};
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use dcgan_model::{Discriminator, Generator, ModelConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

const GENERATOR: &str = "generator";
const DISCRIMINATOR: &str = "discriminator";
const OPTIMIZER_GEN: &str = "optimizer_gen";
const OPTIMIZER_DISC: &str = "optimizer_disc";
const STATE: &str = "state.json";
const RECORD_EXTENSION: &str = "mpk";

/// Progress persisted next to the weights for resuming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    pub iteration: u32,
    pub epoch: usize,
}

pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

fn record_exists(dir: &Path, name: &str) -> bool {
    dir.join(name).with_extension(RECORD_EXTENSION).exists()
}

pub fn has_checkpoint(dir: &Path) -> bool {
    dir.join(STATE).exists() && record_exists(dir, GENERATOR)
}

/// Saves models, optimizer state and training progress into `dir`.
pub fn save_checkpoint<B, OG, OD>(
    dir: &Path,
    generator: &Generator<B>,
    discriminator: &Discriminator<B>,
    optim_gen: &OG,
    optim_disc: &OD,
    state: &TrainingState,
) -> Result<()>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B> + Clone,
    OD: Optimizer<Discriminator<B>, B> + Clone,
{
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let recorder = CheckpointRecorder::new();
    generator.clone().save_file(dir.join(GENERATOR), &recorder)?;
    discriminator.clone().save_file(dir.join(DISCRIMINATOR), &recorder)?;
    recorder.record(optim_gen.to_record(), dir.join(OPTIMIZER_GEN))?;
    recorder.record(optim_disc.to_record(), dir.join(OPTIMIZER_DISC))?;

    std::fs::write(dir.join(STATE), serde_json::to_string_pretty(state)?)?;
    info!(
        iteration = state.iteration,
        epoch = state.epoch,
        dir = %dir.display(),
        "Saved checkpoint"
    );
    Ok(())
}

/// Restores whatever parts of a checkpoint exist in `dir`. Returns the saved
/// progress, or `None` when there is no state file.
pub fn load_checkpoint<B, OG, OD>(
    dir: &Path,
    device: &B::Device,
    generator: &mut Generator<B>,
    discriminator: &mut Discriminator<B>,
    optim_gen: &mut OG,
    optim_disc: &mut OD,
) -> Result<Option<TrainingState>>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B> + Clone,
    OD: Optimizer<Discriminator<B>, B> + Clone,
{
    let recorder = CheckpointRecorder::new();

    if record_exists(dir, GENERATOR) {
        *generator = generator
            .clone()
            .load_file(dir.join(GENERATOR), &recorder, device)?;
    }
    if record_exists(dir, DISCRIMINATOR) {
        *discriminator = discriminator
            .clone()
            .load_file(dir.join(DISCRIMINATOR), &recorder, device)?;
    }
    if record_exists(dir, OPTIMIZER_GEN) {
        let record = recorder.load(dir.join(OPTIMIZER_GEN), device)?;
        *optim_gen = optim_gen.clone().load_record(record);
    }
    if record_exists(dir, OPTIMIZER_DISC) {
        let record = recorder.load(dir.join(OPTIMIZER_DISC), device)?;
        *optim_disc = optim_disc.clone().load_record(record);
    }

    load_state(dir)
}

pub fn load_state(dir: &Path) -> Result<Option<TrainingState>> {
    let path = dir.join(STATE);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let state = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid training state in {}", path.display()))?;
    Ok(Some(state))
}

/// Loads only the generator weights, eg. for sampling.
pub fn load_generator<B: Backend>(
    dir: &Path,
    config: &ModelConfig,
    device: &B::Device,
) -> Result<Generator<B>> {
    anyhow::ensure!(
        record_exists(dir, GENERATOR),
        "No generator weights in {}",
        dir.display()
    );
    let generator = config
        .init_generator::<B>(device)
        .load_file(dir.join(GENERATOR), &CheckpointRecorder::new(), device)?;
    Ok(generator)
}
