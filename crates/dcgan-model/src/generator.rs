use burn::module::Module;
use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig};
use burn::tensor::activation::{relu, tanh};
use burn::tensor::{backend::Backend, Tensor};

use crate::{dcgan_initializer, ModelConfig};

#[derive(Module, Debug)]
struct UpBlock<B: Backend> {
    conv: ConvTranspose2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> UpBlock<B> {
    fn new(
        channels_in: usize,
        channels_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        device: &B::Device,
    ) -> Self {
        let conv = ConvTranspose2dConfig::new([channels_in, channels_out], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding([padding, padding])
            .with_bias(false)
            .with_initializer(dcgan_initializer())
            .init(device);
        let norm = BatchNormConfig::new(channels_out).init(device);
        Self { conv, norm }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

/// Maps latent vectors `[n, zdim]` to images `[n, channels, size, size]`.
///
/// Outputs are squashed to `[-0.5, 0.5]`, the same range as normalized
/// dataset images.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    stem: UpBlock<B>,
    blocks: Vec<UpBlock<B>>,
    head: ConvTranspose2d<B>,
}

impl<B: Backend> Generator<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let mut channels = config.bottleneck_channels();

        // 1x1 -> 4x4.
        let stem = UpBlock::new(config.zdim, channels, 4, 1, 0, device);

        let mut blocks = Vec::new();
        for _ in 1..config.num_stages() {
            blocks.push(UpBlock::new(channels, channels / 2, 4, 2, 1, device));
            channels /= 2;
        }

        let head = ConvTranspose2dConfig::new([channels, config.channels], [4, 4])
            .with_stride([2, 2])
            .with_padding([1, 1])
            .with_bias(false)
            .with_initializer(dcgan_initializer())
            .init(device);

        Self { stem, blocks, head }
    }

    pub fn forward(&self, latent: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, zdim] = latent.dims();
        let mut x = self.stem.forward(latent.reshape([batch, zdim, 1, 1]));
        for block in &self.blocks {
            x = block.forward(x);
        }
        tanh(self.head.forward(x)) * 0.5
    }
}
