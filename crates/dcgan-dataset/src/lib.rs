pub mod batch;
pub mod image_folder;
pub mod preprocess;
pub mod repeat;

use std::path::PathBuf;

use burn::config::Config;
use thiserror::Error;

pub use batch::{BatchLoader, ImageBatch};
pub use image_folder::{ImageFolder, ImageItem};
pub use preprocess::Preprocess;
pub use repeat::RepeatDataset;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset root {0} does not exist or is not a directory")]
    MissingRoot(PathBuf),

    #[error("no readable images found under {0}")]
    NoImages(PathBuf),

    #[error("failed to list {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("image of {width}x{height} is smaller than the {crop}x{crop} crop")]
    ImageTooSmall { width: u32, height: u32, crop: u32 },

    #[error("index {index} is out of range for a dataset of {len} images")]
    OutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Config, Debug)]
pub struct DatasetConfig {
    // Directory with one subdirectory of images per class.
    pub root: PathBuf,

    // Shorter image side after resizing.
    #[config(default = 144)]
    pub base_size: u32,

    #[config(default = 128)]
    pub crop_size: u32,

    // Virtual repeats of the image folder per epoch.
    #[config(default = 100)]
    pub ds_repeat: usize,
}

/// Builds the repeated, preprocessed image folder described by `config`.
pub fn create_dataset(config: &DatasetConfig) -> Result<RepeatDataset<ImageFolder>, DatasetError> {
    let preprocess = Preprocess::new(config.base_size, config.crop_size);
    let folder = ImageFolder::new(&config.root, preprocess)?;
    tracing::info!(
        "Loaded {} images in {} classes from {}",
        folder.num_images(),
        folder.classes().len(),
        config.root.display()
    );
    Ok(RepeatDataset::new(folder, config.ds_repeat))
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::path::Path;

    use image::{Rgb, RgbImage};

    pub(crate) fn write_image(path: &Path, width: u32, height: u32, value: u8) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
            .save(path)
            .unwrap();
    }

    // Two classes, three images.
    pub(crate) fn write_folder(root: &Path) {
        write_image(&root.join("cats/a.png"), 40, 30, 0);
        write_image(&root.join("cats/b.png"), 30, 40, 128);
        write_image(&root.join("dogs/c.png"), 32, 32, 255);
    }
}
