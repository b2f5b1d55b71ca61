use std::path::Path;

use anyhow::Result;
use burn::config::Config;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use dcgan_model::{ensure_image_shape, Discriminator, Generator, ModelConfig, ShapeError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info_span;

use crate::adabelief::{AdaBelief, AdaBeliefConfig};
use crate::augment::AugWrapper;
use crate::checkpoint::{self, TrainingState};
use crate::hooks::GeneratedSlot;
use crate::latent::LatentSampler;
use crate::loss::GanLoss;

#[derive(Config)]
pub struct TrainConfig {
    pub model: ModelConfig,
    pub optimizer: AdaBeliefConfig,
    #[config(default = 2e-4)]
    pub lr: f64,
    #[config(default = "GanLoss::NonSaturating")]
    pub loss: GanLoss,
    // Seeds augmentation draws. Unseeded runs draw from entropy.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainStepStats {
    pub iter: u32,
    pub d_loss: f64,
    pub g_loss: f64,
    /// Mean discriminator logit on real images.
    pub d_real: f64,
    /// Mean discriminator logit on generated images.
    pub d_fake: f64,
}

pub type Discriminated<B> = AugWrapper<Discriminator<B>>;

/// Optimizer state and bookkeeping for alternating GAN updates.
pub struct GanTrainer<B: AutodiffBackend> {
    iter: u32,
    config: TrainConfig,
    sampler: LatentSampler,
    optim_gen: OptimizerAdaptor<AdaBelief, Generator<B>, B>,
    optim_disc: OptimizerAdaptor<AdaBelief, Discriminator<B>, B>,
    rng: StdRng,
    generated: GeneratedSlot<B::InnerBackend>,
}

fn scalar<B: AutodiffBackend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

impl<B: AutodiffBackend> GanTrainer<B> {
    pub fn new(config: TrainConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            iter: 0,
            sampler: LatentSampler::new(config.model.zdim),
            optim_gen: config.optimizer.init(),
            optim_disc: config.optimizer.init(),
            rng,
            generated: GeneratedSlot::default(),
            config,
        }
    }

    /// Replaces the latent source used for every generator call.
    pub fn with_sampler(mut self, sampler: LatentSampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn sampler(&self) -> &LatentSampler {
        &self.sampler
    }

    pub fn iter(&self) -> u32 {
        self.iter
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// The output of the most recent generator call, without gradients.
    pub fn last_generated(&self) -> Option<&Tensor<B::InnerBackend, 4>> {
        self.generated.latest()
    }

    /// Runs the generator on fresh latents, validating and capturing the output.
    pub fn generate(
        &mut self,
        generator: &Generator<B>,
        count: usize,
        device: &B::Device,
    ) -> Result<Tensor<B, 4>, ShapeError> {
        let latent = self.sampler.sample::<B>(count, device);
        let images = generator.forward(latent);
        ensure_image_shape(
            "generator output",
            &images.dims(),
            self.config.model.channels,
            self.config.model.image_size,
        )?;
        self.generated.record(images.clone().inner());
        Ok(images)
    }

    /// One discriminator update followed by one generator update.
    pub fn step(
        &mut self,
        real: Tensor<B, 4>,
        generator: Generator<B>,
        discriminator: Discriminated<B>,
    ) -> Result<(Generator<B>, Discriminated<B>, TrainStepStats)> {
        let _span = info_span!("Train step", iter = self.iter).entered();

        let device = real.device();
        let batch_size = real.dims()[0];
        let lr = self.config.lr;

        let (discriminator, d_loss, d_real, d_fake) = {
            let _span = info_span!("Discriminator update").entered();

            let fake = self.generate(&generator, batch_size, &device)?.detach();
            let real_scores = discriminator.score_with_rng(real, &mut self.rng)?;
            let fake_scores = discriminator.score_with_rng(fake, &mut self.rng)?;

            let d_real = scalar(real_scores.clone().detach().mean());
            let d_fake = scalar(fake_scores.clone().detach().mean());

            let loss = self
                .config
                .loss
                .discriminator_loss(real_scores, fake_scores);
            let d_loss = scalar(loss.clone().detach());

            let grads = info_span!("Backward pass").in_scope(|| loss.backward());
            let grads = GradientsParams::from_grads(grads, discriminator.inner());
            let optim = &mut self.optim_disc;
            let discriminator = discriminator.map_inner(|d| optim.step(lr, d, grads));

            (discriminator, d_loss, d_real, d_fake)
        };

        let (generator, g_loss) = {
            let _span = info_span!("Generator update").entered();

            let fake = self.generate(&generator, batch_size, &device)?;
            let scores = discriminator.score_with_rng(fake, &mut self.rng)?;
            let loss = self.config.loss.generator_loss(scores);
            let g_loss = scalar(loss.clone().detach());

            let grads = info_span!("Backward pass").in_scope(|| loss.backward());
            let grads = GradientsParams::from_grads(grads, &generator);
            let generator = self.optim_gen.step(lr, generator, grads);

            (generator, g_loss)
        };

        self.iter += 1;

        let stats = TrainStepStats {
            iter: self.iter,
            d_loss,
            g_loss,
            d_real,
            d_fake,
        };
        Ok((generator, discriminator, stats))
    }

    pub fn save_checkpoint(
        &self,
        dir: &Path,
        generator: &Generator<B>,
        discriminator: &Discriminated<B>,
        epoch: usize,
    ) -> Result<()> {
        let state = TrainingState {
            iteration: self.iter,
            epoch,
        };
        checkpoint::save_checkpoint(
            dir,
            generator,
            discriminator.inner(),
            &self.optim_gen,
            &self.optim_disc,
            &state,
        )
    }

    /// Restores models and optimizer state from `dir` and continues counting
    /// from the saved iteration.
    pub fn load_checkpoint(
        &mut self,
        dir: &Path,
        device: &B::Device,
        generator: &mut Generator<B>,
        discriminator: &mut Discriminated<B>,
    ) -> Result<Option<TrainingState>> {
        let mut inner = discriminator.inner().clone();
        let state = checkpoint::load_checkpoint(
            dir,
            device,
            generator,
            &mut inner,
            &mut self.optim_gen,
            &mut self.optim_disc,
        )?;
        *discriminator = discriminator.clone().map_inner(|_| inner);

        if let Some(state) = state {
            self.iter = state.iteration;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::AutodiffModule;
    use burn::tensor::Distribution;

    type TestBackend = Autodiff<NdArray>;

    fn tiny_config() -> TrainConfig {
        let model = ModelConfig::new()
            .with_capacity(2)
            .with_zdim(4)
            .with_image_size(8);
        TrainConfig::new(model, AdaBeliefConfig::new().with_beta_1(0.5).with_beta_2(0.9))
            .with_seed(Some(7))
    }

    fn models(
        config: &TrainConfig,
        device: &<TestBackend as burn::tensor::backend::Backend>::Device,
    ) -> (Generator<TestBackend>, Discriminated<TestBackend>) {
        let generator = config.model.init_generator(device);
        let discriminator = AugWrapper::new(config.model.init_discriminator(device), 8, 0.5);
        (generator, discriminator)
    }

    fn real_batch(size: usize) -> Tensor<TestBackend, 4> {
        Tensor::random(
            [4, 3, size, size],
            Distribution::Uniform(-0.5, 0.5),
            &Default::default(),
        )
    }

    #[test]
    fn steps_update_models() {
        let device = Default::default();
        let config = tiny_config();
        let (mut generator, mut discriminator) = models(&config, &device);
        let mut trainer = GanTrainer::<TestBackend>::new(config);
        assert!(trainer.last_generated().is_none());

        let latent = Tensor::<NdArray, 2>::random([2, 4], Distribution::Default, &device);
        let before = generator.valid().forward(latent.clone()).into_data();

        for expected_iter in 1..=2 {
            let (g, d, stats) = trainer
                .step(real_batch(8), generator, discriminator)
                .unwrap();
            generator = g;
            discriminator = d;

            assert_eq!(stats.iter, expected_iter);
            for value in [stats.d_loss, stats.g_loss, stats.d_real, stats.d_fake] {
                assert!(value.is_finite());
            }
            assert!(stats.d_loss >= 0.0);
        }

        assert_eq!(trainer.iter(), 2);
        let captured = trainer.last_generated().unwrap();
        assert_eq!(captured.dims(), [4, 3, 8, 8]);

        let after = generator.valid().forward(latent).into_data();
        assert_ne!(before, after);
    }

    #[test]
    fn rejects_wrong_real_size() {
        let device = Default::default();
        let config = tiny_config();
        let (generator, discriminator) = models(&config, &device);
        let mut trainer = GanTrainer::<TestBackend>::new(config);

        let err = trainer
            .step(real_batch(16), generator, discriminator)
            .err()
            .unwrap();
        let shape = err.downcast_ref::<ShapeError>().unwrap();
        assert_eq!(shape.tensor, "discriminator input");
        assert_eq!(trainer.iter(), 0);
    }

    #[test]
    fn generate_validates_output_size() {
        let device = Default::default();
        let config = tiny_config();
        let generator = config.model.init_generator::<TestBackend>(&device);

        // Trainer expecting larger images than the generator produces.
        let mut wrong = tiny_config();
        wrong.model.image_size = 16;
        let mut trainer = GanTrainer::<TestBackend>::new(wrong);

        let err = trainer.generate(&generator, 2, &device).unwrap_err();
        assert_eq!(err.tensor, "generator output");
        assert_eq!(err.actual, vec![2, 3, 8, 8]);
        assert!(trainer.last_generated().is_none());
    }

    #[test]
    fn checkpoint_restores_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let (generator, discriminator) = models(&config, &device);
        let mut trainer = GanTrainer::<TestBackend>::new(config.clone());

        let (generator, discriminator, _) = trainer
            .step(real_batch(8), generator, discriminator)
            .unwrap();
        trainer
            .save_checkpoint(dir.path(), &generator, &discriminator, 0)
            .unwrap();

        let (mut loaded_gen, mut loaded_disc) = models(&config, &device);
        let mut restored = GanTrainer::<TestBackend>::new(config);
        let state = restored
            .load_checkpoint(dir.path(), &device, &mut loaded_gen, &mut loaded_disc)
            .unwrap();

        assert_eq!(state.map(|s| s.iteration), Some(1));
        assert_eq!(restored.iter(), 1);
        let (_, _, stats) = restored
            .step(real_batch(8), loaded_gen, loaded_disc)
            .unwrap();
        assert_eq!(stats.iter, 2);
    }
}
