use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use ndarray::Array3;

use crate::preprocess::Preprocess;
use crate::DatasetError;

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "bmp", "gif", "ppm", "pgm", "tif", "tiff", "webp",
];

#[derive(Debug, Clone)]
pub struct ImageItem {
    // [3, crop, crop], normalized.
    pub pixels: Array3<f32>,
    pub label: usize,
}

/// Images stored as `root/<class>/**/<image>`. Classes are sorted by name and
/// labelled by their position.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    classes: Vec<String>,
    samples: Vec<(PathBuf, usize)>,
    preprocess: Preprocess,
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let entries = std::fs::read_dir(dir).map_err(|source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| DatasetError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    paths.sort();
    Ok(paths)
}

fn collect_images(dir: &Path, images: &mut Vec<PathBuf>) -> Result<(), DatasetError> {
    for path in read_dir_sorted(dir)? {
        if path.is_dir() {
            collect_images(&path, images)?;
        } else if has_image_extension(&path) {
            images.push(path);
        }
    }
    Ok(())
}

impl ImageFolder {
    pub fn new(root: impl AsRef<Path>, preprocess: Preprocess) -> Result<Self, DatasetError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(DatasetError::MissingRoot(root.to_path_buf()));
        }

        let mut classes = vec![];
        let mut samples = vec![];

        for class_dir in read_dir_sorted(root)?.into_iter().filter(|p| p.is_dir()) {
            let label = classes.len();
            let mut images = vec![];
            collect_images(&class_dir, &mut images)?;
            samples.extend(images.into_iter().map(|path| (path, label)));

            let name = class_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            classes.push(name);
        }

        if samples.is_empty() {
            return Err(DatasetError::NoImages(root.to_path_buf()));
        }

        Ok(Self {
            classes,
            samples,
            preprocess,
        })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_images(&self) -> usize {
        self.samples.len()
    }

    pub fn sample_path(&self, index: usize) -> Option<&Path> {
        self.samples.get(index).map(|(path, _)| path.as_path())
    }

    pub fn try_get(&self, index: usize) -> Result<ImageItem, DatasetError> {
        let (path, label) = self.samples.get(index).ok_or(DatasetError::OutOfRange {
            index,
            len: self.samples.len(),
        })?;

        let _span = tracing::trace_span!("Decode image").entered();
        let image = image::open(path).map_err(|source| DatasetError::Decode {
            path: path.clone(),
            source,
        })?;
        let pixels = self.preprocess.apply(&image, &mut rand::thread_rng())?;

        Ok(ImageItem {
            pixels,
            label: *label,
        })
    }
}

impl Dataset<ImageItem> for ImageFolder {
    fn get(&self, index: usize) -> Option<ImageItem> {
        if index >= self.samples.len() {
            return None;
        }
        match self.try_get(index) {
            Ok(item) => Some(item),
            Err(err) => {
                tracing::warn!("Skipping image {index}: {err}");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}
