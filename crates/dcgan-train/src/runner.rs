use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::config::Config;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Int, Tensor};
use dcgan_dataset::{
    create_dataset, BatchLoader, DatasetConfig, DatasetError, ImageBatch, ImageFolder,
    RepeatDataset,
};
use dcgan_model::{Discriminator, Generator, ModelConfig, ModelConfigError};
use thiserror::Error;
use tracing::{info, info_span};

use crate::adabelief::AdaBeliefConfig;
use crate::augment::AugWrapper;
use crate::checkpoint::{self, TrainingState};
use crate::hooks::{Events, IterationContext};
use crate::latent::LatentSampler;
use crate::loss::GanLoss;
use crate::train::{GanTrainer, TrainConfig};

/// Every knob of a training run. Saved as `config.json` next to checkpoints.
#[derive(Config, Debug)]
pub struct RunnerConfig {
    #[config(default = "PathBuf::from(\"data/processed\")")]
    pub root: PathBuf,
    #[config(default = 16)]
    pub capacity: usize,
    #[config(default = 128)]
    pub zdim: usize,
    #[config(default = 100)]
    pub ds_repeat: usize,
    #[config(default = 144)]
    pub base_size: u32,
    #[config(default = 128)]
    pub crop_size: u32,
    #[config(default = 0.5)]
    pub aug_prob: f64,
    #[config(default = 100)]
    pub plot_every: u32,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 2e-4)]
    pub lr: f64,
    #[config(default = 100)]
    pub max_epochs: usize,
    #[config(default = 1000)]
    pub save_every: u32,
    #[config(default = "GanLoss::NonSaturating")]
    pub loss: GanLoss,
    pub seed: Option<u64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("dataset root {0} does not exist or is not a directory")]
    MissingRoot(PathBuf),

    #[error("{name} must be positive")]
    NotPositive { name: &'static str },

    #[error("base size {base_size} is smaller than crop size {crop_size}")]
    BaseSmallerThanCrop { base_size: u32, crop_size: u32 },

    #[error("augmentation probability must be within [0, 1], got {0}")]
    AugProb(f64),

    #[error(transparent)]
    Model(#[from] ModelConfigError),
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("ds_repeat", self.ds_repeat),
            ("base_size", self.base_size as usize),
            ("crop_size", self.crop_size as usize),
            ("plot_every", self.plot_every as usize),
            ("batch_size", self.batch_size),
            ("num_workers", self.num_workers),
            ("max_epochs", self.max_epochs),
            ("save_every", self.save_every as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { name });
            }
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(ConfigError::NotPositive { name: "lr" });
        }
        if self.base_size < self.crop_size {
            return Err(ConfigError::BaseSmallerThanCrop {
                base_size: self.base_size,
                crop_size: self.crop_size,
            });
        }
        if !(0.0..=1.0).contains(&self.aug_prob) {
            return Err(ConfigError::AugProb(self.aug_prob));
        }
        self.model_config().validate()?;
        if !self.root.is_dir() {
            return Err(ConfigError::MissingRoot(self.root.clone()));
        }
        Ok(())
    }

    pub fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig::new(self.root.clone())
            .with_base_size(self.base_size)
            .with_crop_size(self.crop_size)
            .with_ds_repeat(self.ds_repeat)
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new()
            .with_capacity(self.capacity)
            .with_zdim(self.zdim)
            .with_image_size(self.crop_size as usize)
    }
}

/// Builds the pieces of a DCGAN run from a validated config and drives the
/// training loop.
pub struct Runner<B: AutodiffBackend> {
    config: RunnerConfig,
    output_dir: PathBuf,
    resume: bool,
    sampler: LatentSampler,
    device: B::Device,
}

impl<B: AutodiffBackend> Runner<B> {
    pub const DEFAULT_OUTPUT: &'static str = "runs/dcgan";

    pub fn new(config: RunnerConfig, device: B::Device) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            sampler: LatentSampler::new(config.zdim),
            config,
            output_dir: PathBuf::from(Self::DEFAULT_OUTPUT),
            resume: false,
            device,
        })
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output_dir.join("checkpoint")
    }

    pub fn create_dataset(&self) -> Result<RepeatDataset<ImageFolder>, DatasetError> {
        create_dataset(&self.config.dataset_config())
    }

    pub fn create_model(&self) -> (Generator<B>, AugWrapper<Discriminator<B>>) {
        let model = self.config.model_config();
        let generator = model.init_generator(&self.device);
        let discriminator = AugWrapper::new(
            model.init_discriminator(&self.device),
            model.image_size,
            self.config.aug_prob,
        );
        (generator, discriminator)
    }

    /// Training is unconditional, labels are dropped.
    pub fn prepare_batch(
        &self,
        batch: ImageBatch<B>,
    ) -> (Tensor<B, 4>, Option<Tensor<B, 1, Int>>) {
        (batch.images, None)
    }

    /// Latents from the same sampler the trainer feeds the generator.
    pub fn sample(&self, count: usize) -> Tensor<B, 2> {
        self.sampler.sample(count, &self.device)
    }

    /// AdaBelief with GAN friendly betas. The learning rate is supplied per step.
    pub fn optimizer(&self) -> AdaBeliefConfig {
        AdaBeliefConfig::new()
            .with_epsilon(1e-12)
            .with_beta_1(0.5)
            .with_beta_2(0.9)
    }

    pub fn train_config(&self) -> TrainConfig {
        TrainConfig::new(self.config.model_config(), self.optimizer())
            .with_lr(self.config.lr)
            .with_loss(self.config.loss)
            .with_seed(self.config.seed)
    }

    pub fn create_trainer(&self) -> GanTrainer<B> {
        GanTrainer::new(self.train_config()).with_sampler(self.sampler)
    }

    /// Runs `max_epochs` epochs, firing `events` after every step. Returns the
    /// progress at the end of the run.
    pub fn train(&self, events: &mut Events<B::InnerBackend>) -> Result<TrainingState> {
        let config = &self.config;
        if let Some(seed) = config.seed {
            B::seed(seed);
        }

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;
        config
            .save(self.output_dir.join("config.json"))
            .context("Failed to save run config")?;

        let dataset = Arc::new(self.create_dataset()?);
        let (mut generator, mut discriminator) = self.create_model();
        let mut trainer = self.create_trainer();

        let checkpoint_dir = self.checkpoint_dir();
        let mut state = TrainingState::default();
        if self.resume && checkpoint::has_checkpoint(&checkpoint_dir) {
            if let Some(loaded) = trainer.load_checkpoint(
                &checkpoint_dir,
                &self.device,
                &mut generator,
                &mut discriminator,
            )? {
                info!(
                    iteration = loaded.iteration,
                    epoch = loaded.epoch,
                    "Resuming from checkpoint"
                );
                state = loaded;
            }
        }

        let shuffle_seed = config.seed.unwrap_or_else(rand::random);
        let mut loader = BatchLoader::<B>::new(
            dataset,
            config.batch_size,
            config.num_workers,
            shuffle_seed,
            state.epoch,
            &self.device,
        );
        let batches_per_epoch = loader.batches_per_epoch();
        info!(
            batches_per_epoch,
            start_epoch = state.epoch,
            max_epochs = config.max_epochs,
            "Starting training"
        );

        for epoch in state.epoch..config.max_epochs {
            let _span = info_span!("Epoch", epoch).entered();

            for _ in 0..batches_per_epoch {
                let batch = loader.next_batch()?;
                let (real, _) = self.prepare_batch(batch);

                let (g, d, stats) = trainer.step(real, generator, discriminator)?;
                generator = g;
                discriminator = d;

                let ctx = IterationContext {
                    iteration: stats.iter,
                    epoch,
                    stats: &stats,
                    last_generated: trainer.last_generated(),
                };
                events.fire_iteration_completed(&ctx)?;

                if stats.iter % config.save_every == 0 {
                    trainer.save_checkpoint(&checkpoint_dir, &generator, &discriminator, epoch)?;
                }
            }

            state = TrainingState {
                iteration: trainer.iter(),
                epoch: epoch + 1,
            };
            trainer.save_checkpoint(&checkpoint_dir, &generator, &discriminator, state.epoch)?;
            info!(iteration = state.iteration, "Finished epoch");
        }

        Ok(state)
    }
}
