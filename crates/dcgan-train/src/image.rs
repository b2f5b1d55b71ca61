use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use burn::tensor::{backend::Backend, DType, Tensor, TensorData};
use image::{DynamicImage, Rgb32FImage, Rgba32FImage};

use crate::hooks::TrainLogger;

pub const GRID_COLUMNS: usize = 8;
pub const GRID_PADDING: usize = 2;

/// Tiles `[n, c, h, w]` images into a single `[height, width, c]` image,
/// `columns` per row with `padding` black pixels around each tile.
pub fn image_grid<B: Backend>(
    images: Tensor<B, 4>,
    columns: usize,
    padding: usize,
) -> Tensor<B, 3> {
    let [n, c, h, w] = images.dims();
    let columns = columns.min(n).max(1);
    let rows = n.div_ceil(columns);

    let (tile_h, tile_w) = (h + padding, w + padding);
    let mut grid = Tensor::zeros(
        [c, rows * tile_h + padding, columns * tile_w + padding],
        &images.device(),
    );

    for index in 0..n {
        let top = (index / columns) * tile_h + padding;
        let left = (index % columns) * tile_w + padding;
        let tile = images
            .clone()
            .slice([index..index + 1])
            .reshape([c, h, w]);
        grid = grid.slice_assign([0..c, top..top + h, left..left + w], tile);
    }

    grid.permute([1, 2, 0])
}

// Converts float HWC data in [0, 1] to an image.
pub fn tensor_into_image(data: TensorData) -> Result<DynamicImage> {
    let [h, w, c] = [data.shape[0], data.shape[1], data.shape[2]];

    let img: DynamicImage = match data.dtype {
        DType::F32 => {
            let data = data
                .to_vec::<f32>()
                .map_err(|e| anyhow!("Failed to read image data: {e:?}"))?;
            match c {
                3 => Rgb32FImage::from_raw(w as u32, h as u32, data)
                    .context("Image buffer too small")?
                    .into(),
                4 => Rgba32FImage::from_raw(w as u32, h as u32, data)
                    .context("Image buffer too small")?
                    .into(),
                _ => anyhow::bail!("Unsupported number of channels: {c}"),
            }
        }
        dtype => anyhow::bail!("Unsupported dtype {dtype:?}"),
    };

    Ok(img)
}

/// Writes `[n, c, h, w]` images in `[0, 1]` as one PNG grid.
pub fn save_image_grid<B: Backend>(
    images: Tensor<B, 4>,
    columns: usize,
    path: impl AsRef<Path>,
) -> Result<()> {
    let path = path.as_ref();
    let grid = image_grid(images, columns, GRID_PADDING);
    let image = tensor_into_image(grid.into_data().convert::<f32>())?;

    // PNG holds 8 bit channels.
    let image: DynamicImage = if image.color().has_alpha() {
        image.to_rgba8().into()
    } else {
        image.to_rgb8().into()
    };
    image
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Logger writing one PNG grid per call into a directory.
#[derive(Debug, Clone)]
pub struct PngLogger {
    dir: PathBuf,
    columns: usize,
}

impl PngLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self {
            dir,
            columns: GRID_COLUMNS,
        })
    }

    pub fn with_columns(mut self, columns: usize) -> Self {
        self.columns = columns;
        self
    }

    pub fn path_for(&self, tag: &str, iteration: u32) -> PathBuf {
        let tag = tag.replace(['/', '\\'], "_");
        self.dir.join(format!("{tag}_{iteration:06}.png"))
    }
}

impl<B: Backend> TrainLogger<B> for PngLogger {
    fn add_images(&mut self, tag: &str, images: Tensor<B, 4>, iteration: u32) -> Result<()> {
        save_image_grid(images, self.columns, self.path_for(tag, iteration))
    }
}
