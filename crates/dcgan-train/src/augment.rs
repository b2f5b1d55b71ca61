use std::ops::Range;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use dcgan_model::{ensure_image_shape, Discriminator, ShapeError};
use rand::Rng;

const IMAGE_CHANNELS: usize = 3;
const FLIP_PROB: f64 = 0.5;

/// Range the crop scale is drawn from.
pub const CROP_SCALE: Range<f64> = 0.75..0.95;

/// Anything that maps an image batch `[n, c, h, w]` to scores `[n, 1]`.
pub trait ImageScorer<B: Backend> {
    fn score(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

impl<B: Backend> ImageScorer<B> for Discriminator<B> {
    fn score(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub top: usize,
    pub left: usize,
    pub side: usize,
}

impl CropWindow {
    /// Square crop of `floor(size * scale)` pixels at a uniformly drawn position.
    /// Every offset in `0..=size - side` can be drawn.
    pub fn sample(size: usize, scale: f64, rng: &mut impl Rng) -> Self {
        let side = ((size as f64 * scale).floor() as usize).clamp(1, size);
        let range = size - side;
        let top = rng.gen_range(0..=range);
        let left = rng.gen_range(0..=range);
        Self { top, left, side }
    }

    pub fn full(size: usize) -> Self {
        Self {
            top: 0,
            left: 0,
            side: size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmentation {
    pub flipped: bool,
    pub scale: f64,
    pub window: CropWindow,
}

/// Flips images along the width axis with probability `prob`.
pub fn random_hflip<B: Backend>(
    images: Tensor<B, 4>,
    prob: f64,
    rng: &mut impl Rng,
) -> (Tensor<B, 4>, bool) {
    if rng.gen::<f64>() < prob {
        (images.flip([3]), true)
    } else {
        (images, false)
    }
}

// Row `i` holds the bilinear weights (aligned corners) that output pixel `i`
// takes from the input pixels.
fn interpolation_matrix<B: Backend>(
    input: usize,
    output: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let mut weights = vec![0.0f32; output * input];
    for i in 0..output {
        let src = if output > 1 {
            i as f64 * (input - 1) as f64 / (output - 1) as f64
        } else {
            0.0
        };
        let i0 = (src.floor() as usize).min(input - 1);
        let i1 = (i0 + 1).min(input - 1);
        let frac = (src - i0 as f64) as f32;
        weights[i * input + i0] += 1.0 - frac;
        weights[i * input + i1] += frac;
    }
    Tensor::from_data(TensorData::new(weights, [output, input]), device)
}

/// Bilinear resize with aligned corners, written as two matrix products so it
/// has gradients on every backend.
pub fn resize_bilinear<B: Backend>(images: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [n, c, h, w] = images.dims();
    let [out_h, out_w] = size;
    if [h, w] == size {
        return images;
    }

    let device = images.device();
    let rows = interpolation_matrix::<B>(h, out_h, &device)
        .unsqueeze::<4>()
        .repeat_dim(0, n)
        .repeat_dim(1, c);
    let cols = interpolation_matrix::<B>(w, out_w, &device)
        .transpose()
        .unsqueeze::<4>()
        .repeat_dim(0, n)
        .repeat_dim(1, c);

    rows.matmul(images).matmul(cols)
}

/// Cuts `window` out of every image and scales it back to the original size.
pub fn crop_and_resize<B: Backend>(images: Tensor<B, 4>, window: CropWindow) -> Tensor<B, 4> {
    let [n, c, h, w] = images.dims();
    if window.side >= h && window.side >= w {
        return images;
    }

    let CropWindow { top, left, side } = window;
    let cropped = images.slice([0..n, 0..c, top..top + side, left..left + side]);
    resize_bilinear(cropped, [h, w])
}

pub fn random_crop_and_resize<B: Backend>(
    images: Tensor<B, 4>,
    scale: f64,
    rng: &mut impl Rng,
) -> (Tensor<B, 4>, CropWindow) {
    let size = images.dims()[3];
    let window = CropWindow::sample(size, scale, rng);
    (crop_and_resize(images, window), window)
}

/// Wraps a discriminator so that, with probability `prob`, every scored batch
/// is randomly flipped and crop-resized first. Real and generated batches go
/// through the same perturbations; stored data is never touched.
#[derive(Debug, Clone)]
pub struct AugWrapper<D> {
    inner: D,
    image_size: usize,
    prob: f64,
}

impl<D> AugWrapper<D> {
    pub fn new(inner: D, image_size: usize, prob: f64) -> Self {
        Self {
            inner,
            image_size,
            prob,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Replaces the wrapped model, eg. with the result of an optimizer step.
    pub fn map_inner(self, f: impl FnOnce(D) -> D) -> Self {
        Self {
            inner: f(self.inner),
            ..self
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn prob(&self) -> f64 {
        self.prob
    }

    pub fn augment_with_rng<B: Backend>(
        &self,
        images: Tensor<B, 4>,
        rng: &mut impl Rng,
    ) -> (Tensor<B, 4>, Option<Augmentation>) {
        if rng.gen::<f64>() >= self.prob {
            return (images, None);
        }

        let scale = rng.gen_range(CROP_SCALE);
        let (images, flipped) = random_hflip(images, FLIP_PROB, rng);
        let (images, window) = random_crop_and_resize(images, scale, rng);

        (
            images,
            Some(Augmentation {
                flipped,
                scale,
                window,
            }),
        )
    }

    pub fn score_with_rng<B: Backend>(
        &self,
        images: Tensor<B, 4>,
        rng: &mut impl Rng,
    ) -> Result<Tensor<B, 2>, ShapeError>
    where
        D: ImageScorer<B>,
    {
        ensure_image_shape(
            "discriminator input",
            &images.dims(),
            IMAGE_CHANNELS,
            self.image_size,
        )?;
        let (images, _) = self.augment_with_rng(images, rng);
        Ok(self.inner.score(images))
    }

    pub fn score<B: Backend>(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>, ShapeError>
    where
        D: ImageScorer<B>,
    {
        self.score_with_rng(images, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::{BTreeMap, BTreeSet};

    type TestBackend = NdArray;

    // Sums pixels weighted by their position so flips and crops change the score.
    struct PositionScorer;

    impl<B: Backend> ImageScorer<B> for PositionScorer {
        fn score(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
            let [n, c, h, w] = images.dims();
            let ramp = Tensor::<B, 1>::from_floats(
                (0..w).map(|x| x as f32).collect::<Vec<_>>().as_slice(),
                &images.device(),
            )
            .reshape([1, 1, 1, w]);
            (images * ramp).reshape([n, c * h * w]).sum_dim(1)
        }
    }

    fn random_images(dims: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::random(dims, Distribution::Uniform(-0.5, 0.5), &Default::default())
    }

    fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
    }

    #[test]
    fn crop_resize_keeps_spatial_size() {
        let mut rng = StdRng::seed_from_u64(0);
        let images = random_images([2, 3, 16, 16]);
        for scale in [0.1, 0.5, 0.75, 0.8, 0.9, 0.95, 0.99] {
            let (out, window) = random_crop_and_resize(images.clone(), scale, &mut rng);
            assert_eq!(out.dims(), [2, 3, 16, 16]);
            assert_eq!(window.side, (16.0 * scale) as usize);
        }
    }

    #[test]
    fn full_scale_is_a_no_op() {
        let mut rng = StdRng::seed_from_u64(1);
        let images = random_images([2, 3, 12, 12]);
        let (out, window) = random_crop_and_resize(images.clone(), 1.0, &mut rng);
        assert_eq!(window, CropWindow::full(12));
        assert_close(&values(out), &values(images.clone()));

        // Resizing to the same size through the interpolation matrices is exact too.
        let identity = interpolation_matrix::<TestBackend>(12, 12, &Default::default());
        let resized = identity
            .unsqueeze::<4>()
            .repeat_dim(0, 2)
            .repeat_dim(1, 3)
            .matmul(images.clone());
        assert_close(&values(resized), &values(images));
    }

    #[test]
    fn bilinear_weights_align_corners() {
        let weights = values(interpolation_matrix::<TestBackend>(2, 3, &Default::default()));
        assert_close(&weights, &[1.0, 0.0, 0.5, 0.5, 0.0, 1.0]);

        let images = Tensor::<TestBackend, 4>::from_floats(
            [[[[0.0, 1.0], [2.0, 3.0]]]],
            &Default::default(),
        );
        let resized = resize_bilinear(images, [3, 3]);
        assert_close(
            &values(resized),
            &[0.0, 0.5, 1.0, 1.0, 1.5, 2.0, 2.0, 2.5, 3.0],
        );
    }

    #[test]
    fn double_flip_restores_input() {
        let mut rng = StdRng::seed_from_u64(2);
        let images = random_images([2, 3, 8, 8]);

        let (once, flipped_once) = random_hflip(images.clone(), 1.0, &mut rng);
        let (twice, flipped_twice) = random_hflip(once.clone(), 1.0, &mut rng);
        assert!(flipped_once && flipped_twice);
        assert_ne!(values(once), values(images.clone()));
        assert_eq!(values(twice), values(images));
    }

    #[test]
    fn zero_probability_never_augments() {
        let wrapper = AugWrapper::new(PositionScorer, 8, 0.0);
        let mut rng = StdRng::seed_from_u64(3);
        let images = random_images([4, 3, 8, 8]);

        let reference = values(wrapper.score_with_rng(images.clone(), &mut rng).unwrap());
        for _ in 0..20 {
            let scores = wrapper.score_with_rng(images.clone(), &mut rng).unwrap();
            assert_eq!(values(scores), reference);
            assert!(wrapper.augment_with_rng(images.clone(), &mut rng).1.is_none());
        }
    }

    #[test]
    fn offsets_cover_full_range() {
        let wrapper = AugWrapper::new(PositionScorer, 16, 1.0);
        let mut rng = StdRng::seed_from_u64(4);
        let images = Tensor::<TestBackend, 4>::full([1, 3, 16, 16], 0.25, &Default::default());

        let mut tops: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        let mut lefts: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for _ in 0..1000 {
            let (out, aug) = wrapper.augment_with_rng(images.clone(), &mut rng);
            let CropWindow { top, left, side } = aug.unwrap().window;
            tops.entry(16 - side).or_default().insert(top);
            lefts.entry(16 - side).or_default().insert(left);
            assert_eq!(out.dims(), [1, 3, 16, 16]);
        }

        // Sides 12..=15 for scales in [0.75, 0.95).
        assert_eq!(tops.keys().copied().collect::<Vec<_>>(), [1, 2, 3, 4]);
        for (range, seen) in tops.iter().chain(lefts.iter()) {
            assert_eq!(*seen, (0..=*range).collect::<BTreeSet<_>>());
        }

        // A constant image stays constant under flip and bilinear resize.
        let (out, _) = wrapper.augment_with_rng(images, &mut rng);
        assert!(values(out).iter().all(|v| (v - 0.25).abs() < 1e-5));
    }

    #[test]
    fn augmentation_does_not_touch_input() {
        let wrapper = AugWrapper::new(PositionScorer, 8, 1.0);
        let mut rng = StdRng::seed_from_u64(5);
        let images = random_images([2, 3, 8, 8]);
        let before = values(images.clone());

        let _ = wrapper.augment_with_rng(images.clone(), &mut rng);
        assert_eq!(values(images), before);
    }

    #[test]
    fn rejects_wrong_image_size() {
        let wrapper = AugWrapper::new(PositionScorer, 16, 0.5);
        let err = wrapper.score(random_images([2, 3, 8, 8])).unwrap_err();
        assert_eq!(err.tensor, "discriminator input");

        assert!(wrapper.score(random_images([2, 1, 16, 16])).is_err());
    }

    #[test]
    fn augmentation_is_differentiable() {
        type AutodiffBackend = Autodiff<NdArray>;

        let wrapper = AugWrapper::new(PositionScorer, 8, 1.0);
        let mut rng = StdRng::seed_from_u64(6);
        let images = Tensor::<AutodiffBackend, 4>::random(
            [2, 3, 8, 8],
            Distribution::Uniform(-0.5, 0.5),
            &Default::default(),
        )
        .require_grad();

        let scores = wrapper.score_with_rng(images.clone(), &mut rng).unwrap();
        let grads = scores.sum().backward();
        let grad = images.grad(&grads).unwrap();
        assert_eq!(grad.dims(), [2, 3, 8, 8]);
    }
}
