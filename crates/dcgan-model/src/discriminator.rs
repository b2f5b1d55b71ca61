use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::leaky_relu;
use burn::tensor::{backend::Backend, Tensor};

use crate::{dcgan_initializer, ModelConfig};

const LEAKY_SLOPE: f64 = 0.2;

#[derive(Module, Debug)]
struct DownBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
}

impl<B: Backend> DownBlock<B> {
    fn new(channels_in: usize, channels_out: usize, normalize: bool, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([channels_in, channels_out], [4, 4])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .with_initializer(dcgan_initializer())
            .init(device);
        let norm = normalize.then(|| BatchNormConfig::new(channels_out).init(device));
        Self { conv, norm }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        leaky_relu(x, LEAKY_SLOPE)
    }
}

/// Scores images `[n, channels, size, size]`, returning one logit per image `[n, 1]`.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    blocks: Vec<DownBlock<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> Discriminator<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let mut channels = config.capacity;
        let mut blocks = vec![DownBlock::new(config.channels, channels, false, device)];

        for _ in 1..config.num_stages() {
            blocks.push(DownBlock::new(channels, channels * 2, true, device));
            channels *= 2;
        }

        // 4x4 -> 1x1.
        let head = Conv2dConfig::new([channels, 1], [4, 4])
            .with_bias(false)
            .with_initializer(dcgan_initializer())
            .init(device);

        Self { blocks, head }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let batch = images.dims()[0];
        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.head.forward(x).reshape([batch, 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn scores_one_logit_per_image() {
        let device = Default::default();
        for image_size in [8, 16, 64] {
            let config = ModelConfig::new()
                .with_capacity(2)
                .with_image_size(image_size);
            let discriminator: Discriminator<TestBackend> = config.init_discriminator(&device);

            let images = Tensor::random(
                [2, 3, image_size, image_size],
                Distribution::Uniform(-0.5, 0.5),
                &device,
            );
            assert_eq!(discriminator.forward(images).dims(), [2, 1]);
        }
    }
}
