use burn::tensor::{backend::Backend, Distribution, Tensor};

// Lower bound on the norm, keeps all-zero rows finite.
const NORM_EPS: f32 = 1e-12;

/// Draws generator inputs: standard normal vectors scaled to unit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentSampler {
    zdim: usize,
}

impl LatentSampler {
    pub fn new(zdim: usize) -> Self {
        Self { zdim }
    }

    pub fn zdim(&self) -> usize {
        self.zdim
    }

    pub fn sample<B: Backend>(&self, n: usize, device: &B::Device) -> Tensor<B, 2> {
        let z = Tensor::random([n, self.zdim], Distribution::Normal(0.0, 1.0), device);
        l2_normalize(z)
    }
}

/// Scales each row to unit L2 norm.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .clamp_min(NORM_EPS);
    x / norm
}
