use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array3;
use rand::Rng;

use crate::DatasetError;

// Normalization with mean 0.5 and std 1 centers pixels at zero.
const NORMALIZE_MEAN: f32 = 0.5;

/// Resize, random crop, tensor conversion and normalization applied to every
/// dataset image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocess {
    pub base_size: u32,
    pub crop_size: u32,
}

impl Preprocess {
    pub fn new(base_size: u32, crop_size: u32) -> Self {
        Self {
            base_size,
            crop_size,
        }
    }

    /// Resizes so the shorter side equals `base_size`, keeping the aspect ratio.
    pub fn resize_shorter_side(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = (image.width(), image.height());
        let base = self.base_size as u64;

        let (new_width, new_height) = if width <= height {
            (base, base * height as u64 / width as u64)
        } else {
            (base * width as u64 / height as u64, base)
        };
        let (new_width, new_height) = (new_width as u32, new_height as u32);

        if (new_width, new_height) == (width, height) {
            return image.clone();
        }
        image.resize_exact(new_width, new_height, FilterType::Triangle)
    }

    /// Cuts a random `crop_size` square; every offset that keeps the crop inside
    /// the image is reachable.
    pub fn random_crop(
        &self,
        image: &DynamicImage,
        rng: &mut impl Rng,
    ) -> Result<DynamicImage, DatasetError> {
        let (width, height) = (image.width(), image.height());
        let crop = self.crop_size;

        if width < crop || height < crop {
            return Err(DatasetError::ImageTooSmall {
                width,
                height,
                crop,
            });
        }

        let left = rng.gen_range(0..=width - crop);
        let top = rng.gen_range(0..=height - crop);
        Ok(image.crop_imm(left, top, crop, crop))
    }

    pub fn apply(
        &self,
        image: &DynamicImage,
        rng: &mut impl Rng,
    ) -> Result<Array3<f32>, DatasetError> {
        let resized = self.resize_shorter_side(image);
        let cropped = self.random_crop(&resized, rng)?;
        image_to_normalized_array(&cropped)
    }
}

/// Converts an image to a `[3, height, width]` array with values in `[-0.5, 0.5]`.
pub fn image_to_normalized_array(image: &DynamicImage) -> Result<Array3<f32>, DatasetError> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let hwc = Array3::from_shape_vec((height, width, 3), image.to_rgb32f().into_raw())?;
    Ok(hwc
        .permuted_axes([2, 0, 1])
        .as_standard_layout()
        .mapv(|v| v - NORMALIZE_MEAN))
}
