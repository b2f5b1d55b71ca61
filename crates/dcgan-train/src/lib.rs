pub mod adabelief;
pub mod augment;
pub mod checkpoint;
pub mod hooks;
pub mod image;
pub mod latent;
pub mod loss;
pub mod runner;
pub mod train;

pub use augment::AugWrapper;
pub use hooks::{Events, IterationContext, IterationHook, PlotHook, StatsHook, TrainLogger};
pub use runner::{ConfigError, Runner, RunnerConfig};
pub use train::{GanTrainer, TrainConfig, TrainStepStats};
