use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};
use tracing::{info, trace};

use crate::train::TrainStepStats;

/// Sink for images and scalars produced while training.
pub trait TrainLogger<B: Backend> {
    /// `images` are `[n, c, h, w]` in display range `[0, 1]`.
    fn add_images(&mut self, tag: &str, images: Tensor<B, 4>, iteration: u32) -> Result<()>;

    fn add_scalar(&mut self, _tag: &str, _value: f64, _iteration: u32) -> Result<()> {
        Ok(())
    }
}

/// Holds the most recent generator output.
#[derive(Debug, Clone)]
pub struct GeneratedSlot<B: Backend> {
    latest: Option<Tensor<B, 4>>,
}

impl<B: Backend> Default for GeneratedSlot<B> {
    fn default() -> Self {
        Self { latest: None }
    }
}

impl<B: Backend> GeneratedSlot<B> {
    pub fn record(&mut self, images: Tensor<B, 4>) {
        self.latest = Some(images);
    }

    pub fn latest(&self) -> Option<&Tensor<B, 4>> {
        self.latest.as_ref()
    }
}

pub struct IterationContext<'a, B: Backend> {
    /// 1-based, counts optimizer steps since the start of the run.
    pub iteration: u32,
    pub epoch: usize,
    pub stats: &'a TrainStepStats,
    pub last_generated: Option<&'a Tensor<B, 4>>,
}

pub trait IterationHook<B: Backend> {
    fn on_iteration(&mut self, ctx: &IterationContext<B>) -> Result<()>;
}

impl<B: Backend, F> IterationHook<B> for F
where
    F: FnMut(&IterationContext<B>) -> Result<()>,
{
    fn on_iteration(&mut self, ctx: &IterationContext<B>) -> Result<()> {
        self(ctx)
    }
}

/// Callbacks invoked by the runner, in registration order.
pub struct Events<B: Backend> {
    pub iteration_completed: Vec<Box<dyn IterationHook<B>>>,
}

impl<B: Backend> Default for Events<B> {
    fn default() -> Self {
        Self {
            iteration_completed: Vec::new(),
        }
    }
}

impl<B: Backend> Events<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_iteration_completed(&mut self, hook: impl IterationHook<B> + 'static) -> &mut Self {
        self.iteration_completed.push(Box::new(hook));
        self
    }

    pub fn fire_iteration_completed(&mut self, ctx: &IterationContext<B>) -> Result<()> {
        for hook in &mut self.iteration_completed {
            hook.on_iteration(ctx)?;
        }
        Ok(())
    }
}

/// Periodically logs a few of the latest generated images.
pub struct PlotHook<B: Backend> {
    plot_every: u32,
    max_images: usize,
    logger: Box<dyn TrainLogger<B>>,
}

impl<B: Backend> PlotHook<B> {
    pub const DEFAULT_MAX_IMAGES: usize = 16;

    pub fn new(plot_every: u32, logger: impl TrainLogger<B> + 'static) -> Self {
        Self {
            plot_every: plot_every.max(1),
            max_images: Self::DEFAULT_MAX_IMAGES,
            logger: Box::new(logger),
        }
    }

    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images;
        self
    }
}

impl<B: Backend> IterationHook<B> for PlotHook<B> {
    fn on_iteration(&mut self, ctx: &IterationContext<B>) -> Result<()> {
        if ctx.iteration % self.plot_every != 0 {
            return Ok(());
        }

        let Some(generated) = ctx.last_generated else {
            trace!(iteration = ctx.iteration, "No generated images to plot yet");
            return Ok(());
        };

        let count = self.max_images.min(generated.dims()[0]);
        if count == 0 {
            return Ok(());
        }

        let images = generated
            .clone()
            .slice([0..count])
            .add_scalar(0.5)
            .clamp(0.0, 1.0);
        self.logger.add_images("generated", images, ctx.iteration)
    }
}

/// Reports the losses of every `every`-th step.
pub struct StatsHook<B: Backend> {
    every: u32,
    logger: Option<Box<dyn TrainLogger<B>>>,
}

impl<B: Backend> StatsHook<B> {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: impl TrainLogger<B> + 'static) -> Self {
        self.logger = Some(Box::new(logger));
        self
    }
}

impl<B: Backend> IterationHook<B> for StatsHook<B> {
    fn on_iteration(&mut self, ctx: &IterationContext<B>) -> Result<()> {
        if ctx.iteration % self.every != 0 {
            return Ok(());
        }

        let stats = ctx.stats;
        info!(
            iteration = ctx.iteration,
            epoch = ctx.epoch,
            d_loss = stats.d_loss,
            g_loss = stats.g_loss,
            d_real = stats.d_real,
            d_fake = stats.d_fake,
            "Training step"
        );

        if let Some(logger) = self.logger.as_mut() {
            logger.add_scalar("loss/discriminator", stats.d_loss, ctx.iteration)?;
            logger.add_scalar("loss/generator", stats.g_loss, ctx.iteration)?;
            logger.add_scalar("score/real", stats.d_real, ctx.iteration)?;
            logger.add_scalar("score/fake", stats.d_fake, ctx.iteration)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone)]
    pub(crate) struct LoggedImages {
        pub tag: String,
        pub dims: [usize; 4],
        pub iteration: u32,
        pub values: Vec<f32>,
    }

    #[derive(Default, Clone)]
    pub(crate) struct RecordingLogger {
        pub images: Rc<RefCell<Vec<LoggedImages>>>,
        pub scalars: Rc<RefCell<Vec<(String, f64, u32)>>>,
    }

    impl<B: Backend> TrainLogger<B> for RecordingLogger {
        fn add_images(&mut self, tag: &str, images: Tensor<B, 4>, iteration: u32) -> Result<()> {
            let dims = images.dims();
            let values = images.into_data().to_vec::<f32>().unwrap();
            self.images.borrow_mut().push(LoggedImages {
                tag: tag.to_owned(),
                dims,
                iteration,
                values,
            });
            Ok(())
        }

        fn add_scalar(&mut self, tag: &str, value: f64, iteration: u32) -> Result<()> {
            self.scalars
                .borrow_mut()
                .push((tag.to_owned(), value, iteration));
            Ok(())
        }
    }
}
