use std::fmt;
use std::str::FromStr;

use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

/// Adversarial objective on discriminator logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GanLoss {
    /// Logistic loss, generator maximizes `log D(G(z))`.
    #[default]
    NonSaturating,
    Hinge,
}

// log(1 + exp(x)) without overflow.
fn softplus<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    relu(x.clone()) + x.abs().neg().exp().log1p()
}

impl GanLoss {
    pub fn discriminator_loss<B: Backend>(
        &self,
        real: Tensor<B, 2>,
        fake: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        match self {
            GanLoss::NonSaturating => softplus(real.neg()).mean() + softplus(fake).mean(),
            GanLoss::Hinge => relu(real.neg() + 1.0).mean() + relu(fake + 1.0).mean(),
        }
    }

    pub fn generator_loss<B: Backend>(&self, fake: Tensor<B, 2>) -> Tensor<B, 1> {
        match self {
            GanLoss::NonSaturating => softplus(fake.neg()).mean(),
            GanLoss::Hinge => fake.neg().mean(),
        }
    }
}

impl fmt::Display for GanLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GanLoss::NonSaturating => f.write_str("non-saturating"),
            GanLoss::Hinge => f.write_str("hinge"),
        }
    }
}

impl FromStr for GanLoss {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "non-saturating" => Ok(GanLoss::NonSaturating),
            "hinge" => Ok(GanLoss::Hinge),
            other => Err(format!(
                "unknown loss '{other}', expected 'non-saturating' or 'hinge'"
            )),
        }
    }
}
