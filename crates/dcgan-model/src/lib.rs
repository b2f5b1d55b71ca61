use burn::config::Config;
use burn::nn::Initializer;
use burn::tensor::backend::Backend;
use thiserror::Error;

pub mod discriminator;
pub mod generator;
pub mod shape;

pub use discriminator::Discriminator;
pub use generator::Generator;
pub use shape::{ensure_image_shape, ShapeError};

/// Hyperparameters shared by the generator and discriminator.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 3)]
    pub channels: usize,

    // Channel width multiplier for both networks.
    #[config(default = 16)]
    pub capacity: usize,

    #[config(default = 128)]
    pub zdim: usize,

    // Spatial size of generated and scored images.
    #[config(default = 128)]
    pub image_size: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelConfigError {
    #[error("{name} must be positive")]
    NotPositive { name: &'static str },

    #[error("image size must be a power of two of at least 8, got {0}")]
    ImageSize(usize),
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ModelConfigError> {
        for (name, value) in [
            ("channels", self.channels),
            ("capacity", self.capacity),
            ("zdim", self.zdim),
        ] {
            if value == 0 {
                return Err(ModelConfigError::NotPositive { name });
            }
        }
        if self.image_size < 8 || !self.image_size.is_power_of_two() {
            return Err(ModelConfigError::ImageSize(self.image_size));
        }
        Ok(())
    }

    // Number of stride-2 stages between the 4x4 bottleneck and the full image.
    pub(crate) fn num_stages(&self) -> usize {
        (self.image_size / 4).trailing_zeros() as usize
    }

    // Channels at the 4x4 bottleneck.
    pub(crate) fn bottleneck_channels(&self) -> usize {
        self.capacity * self.image_size / 8
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        Generator::new(self, device)
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        Discriminator::new(self, device)
    }
}

// DCGAN weight init.
pub(crate) fn dcgan_initializer() -> Initializer {
    Initializer::Normal {
        mean: 0.0,
        std: 0.02,
    }
}
