use anyhow::{anyhow, Result};
use burn::tensor::{backend::Backend, Tensor};
use dcgan_train::image::{image_grid, GRID_COLUMNS, GRID_PADDING};
use dcgan_train::TrainLogger;
use rerun::{RecordingStream, RecordingStreamBuilder};

// Quantizes a [0, 1] float image to bytes.
fn to_u8_pixels<B: Backend>(image: Tensor<B, 3>) -> Result<Vec<u8>> {
    (image.clamp(0.0, 1.0) * 255.0 + 0.5)
        .into_data()
        .convert::<u8>()
        .to_vec::<u8>()
        .map_err(|e| anyhow!("Failed to read image data: {e:?}"))
}

pub trait BurnToImage {
    fn into_rerun_image(self) -> Result<rerun::Image>;
}

// Expects [h, w, c] float images in [0, 1].
impl<B: Backend> BurnToImage for Tensor<B, 3> {
    fn into_rerun_image(self) -> Result<rerun::Image> {
        let [h, w, c] = self.dims();
        let size = [w as u32, h as u32];
        let pixels = to_u8_pixels(self)?;
        match c {
            3 => Ok(rerun::Image::from_rgb24(pixels, size)),
            4 => Ok(rerun::Image::from_rgba32(pixels, size)),
            _ => anyhow::bail!("Unsupported number of channels: {c}"),
        }
    }
}

/// Streams training images and scalars to a rerun viewer, on the
/// `iterations` timeline.
#[derive(Clone)]
pub struct RerunLogger {
    rec: RecordingStream,
    columns: usize,
}

impl RerunLogger {
    /// Spawns a viewer process and connects to it.
    pub fn spawn(app_id: &str) -> Result<Self> {
        let rec = RecordingStreamBuilder::new(app_id).spawn()?;
        Ok(Self::new(rec))
    }

    pub fn new(rec: RecordingStream) -> Self {
        Self {
            rec,
            columns: GRID_COLUMNS,
        }
    }

    pub fn recording(&self) -> &RecordingStream {
        &self.rec
    }
}

impl<B: Backend> TrainLogger<B> for RerunLogger {
    fn add_images(&mut self, tag: &str, images: Tensor<B, 4>, iteration: u32) -> Result<()> {
        if !self.rec.is_enabled() {
            return Ok(());
        }

        self.rec.set_time_sequence("iterations", iteration);
        let grid = image_grid(images, self.columns, GRID_PADDING);
        self.rec.log(tag, &grid.into_rerun_image()?)?;
        Ok(())
    }

    fn add_scalar(&mut self, tag: &str, value: f64, iteration: u32) -> Result<()> {
        if !self.rec.is_enabled() {
            return Ok(());
        }

        self.rec.set_time_sequence("iterations", iteration);
        self.rec.log(tag, &rerun::Scalar::new(value))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn quantizes_to_bytes() {
        let image = Tensor::<TestBackend, 1>::from_floats(
            [0.0, 0.5, 1.0, -0.2, 1.3, 0.25],
            &Default::default(),
        )
        .reshape([1, 2, 3]);
        let pixels = to_u8_pixels(image).unwrap();
        assert_eq!(pixels, vec![0, 128, 255, 0, 255, 64]);
    }

    #[test]
    fn rejects_two_channel_images() {
        let image = Tensor::<TestBackend, 3>::zeros([2, 2, 2], &Default::default());
        assert!(image.into_rerun_image().is_err());
    }

    #[test]
    fn disabled_stream_accepts_logs() {
        let mut logger = RerunLogger::new(RecordingStream::disabled());
        let images = Tensor::<TestBackend, 4>::ones([3, 3, 4, 4], &Default::default());
        TrainLogger::<TestBackend>::add_images(&mut logger, "generated", images, 1).unwrap();
        TrainLogger::<TestBackend>::add_scalar(&mut logger, "loss/generator", 0.5, 1).unwrap();
        assert!(!logger.recording().is_enabled());
    }
}
