use burn::config::Config;
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::SimpleOptimizer;
use burn::record::Record;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use burn::LearningRate;

/// AdaBelief: Adam with the second moment tracking the variance of the
/// gradient around its running mean instead of its raw magnitude.
///
/// The learning rate isn't part of the config, it is passed at every step.
/// There is no RAdam style variance rectification: every step, including the
/// first ones, applies the full bias corrected update.
#[derive(Config)]
pub struct AdaBeliefConfig {
    #[config(default = 0.9)]
    beta_1: f32,
    #[config(default = 0.999)]
    beta_2: f32,
    #[config(default = 1e-16)]
    epsilon: f32,
    // Decoupled, applied to the weights directly.
    #[config(default = 0.0)]
    weight_decay: f32,
    grad_clipping: Option<GradientClippingConfig>,
}

#[derive(Clone, Debug)]
pub struct AdaBelief {
    beta_1: f64,
    beta_2: f64,
    epsilon: f64,
    weight_decay: f64,
}

#[derive(Record, Clone)]
pub struct AdaBeliefState<B: Backend, const D: usize> {
    pub time: usize,
    pub exp_avg: Tensor<B, D>,
    pub exp_avg_var: Tensor<B, D>,
}

impl AdaBeliefConfig {
    fn build(&self) -> AdaBelief {
        AdaBelief {
            beta_1: self.beta_1 as f64,
            beta_2: self.beta_2 as f64,
            epsilon: self.epsilon as f64,
            weight_decay: self.weight_decay as f64,
        }
    }

    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
    ) -> OptimizerAdaptor<AdaBelief, M, B> {
        let mut optim = OptimizerAdaptor::from(self.build());
        if let Some(config) = &self.grad_clipping {
            optim = optim.with_grad_clipping(config.init());
        }
        optim
    }
}

impl<B: Backend> SimpleOptimizer<B> for AdaBelief {
    type State<const D: usize> = AdaBeliefState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let (time, exp_avg, exp_avg_var) = match state {
            Some(state) => (state.time, state.exp_avg, state.exp_avg_var),
            None => (0, Tensor::zeros_like(&grad), Tensor::zeros_like(&grad)),
        };
        let time = time + 1;

        let exp_avg = exp_avg.mul_scalar(self.beta_1) + grad.clone().mul_scalar(1.0 - self.beta_1);
        let belief = (grad - exp_avg.clone()).powf_scalar(2.0);
        let exp_avg_var = (exp_avg_var.mul_scalar(self.beta_2)
            + belief.mul_scalar(1.0 - self.beta_2))
        .add_scalar(self.epsilon);

        let bias_correction_1 = 1.0 - self.beta_1.powi(time as i32);
        let bias_correction_2 = 1.0 - self.beta_2.powi(time as i32);

        let denom = exp_avg_var
            .clone()
            .sqrt()
            .div_scalar(bias_correction_2.sqrt())
            .add_scalar(self.epsilon);
        let update = (exp_avg.clone() / denom).mul_scalar(lr / bias_correction_1);

        let tensor = if self.weight_decay > 0.0 {
            tensor.mul_scalar(1.0 - lr * self.weight_decay)
        } else {
            tensor
        };

        let state = AdaBeliefState {
            time,
            exp_avg,
            exp_avg_var,
        };
        (tensor - update, Some(state))
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.exp_avg = state.exp_avg.to_device(device);
        state.exp_avg_var = state.exp_avg_var.to_device(device);
        state
    }
}
