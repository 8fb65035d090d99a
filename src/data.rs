use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use image::imageops::FilterType;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use tch::{Kind, Tensor};
use tracing::{debug, info};

const IMG_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp"];

// =============== PREPROCESSING ===============
/// Maps raw 0..=255 pixel values to roughly [-1, 1].
pub fn fixed_image_standardization(tensor: Tensor) -> Tensor {
    (tensor - 127.5) / 128.0
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMG_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn load_image(path: &Path, size: u32) -> Result<Tensor> {
    let img = image::open(path).with_context(|| format!("decode {}", path.display()))?;
    let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    let tensor = Tensor::from_slice(&rgb.into_raw())
        .reshape(&[size as i64, size as i64, 3])
        .permute(&[2, 0, 1])
        .to_kind(Kind::Float);
    Ok(fixed_image_standardization(tensor))
}

// =============== DATASET ===============
fn list_classes(root: &Path) -> Result<Vec<String>> {
    let mut classes: Vec<String> = fs::read_dir(root)
        .with_context(|| format!("read dataset root {}", root.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(|s| s.to_string()))
        .collect();
    classes.sort();
    Ok(classes)
}

fn list_images(class_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(class_dir)
        .with_context(|| format!("read class directory {}", class_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Images held in memory as standardized `[3, S, S]` tensors, labelled by the
/// sorted index of their class directory.
#[derive(Debug)]
pub struct ImageFolder {
    classes: Vec<String>,
    images: Vec<Tensor>,
    labels: Vec<i64>,
}

impl ImageFolder {
    pub fn load(root: impl AsRef<Path>, image_size: u32, workers: usize) -> Result<Self> {
        let root = root.as_ref();
        let classes = list_classes(root)?;
        if classes.is_empty() {
            bail!("no class directories found in {}", root.display());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()
            .context("build decode pool")?;

        let mut images = Vec::new();
        let mut labels = Vec::new();
        for (class_idx, class_name) in classes.iter().enumerate() {
            let paths = list_images(&root.join(class_name))?;
            if paths.is_empty() {
                bail!("found no valid image file for class '{}' in {}", class_name, root.display());
            }
            debug!("class {}: {} ({} images)", class_idx, class_name, paths.len());

            let tensors = pool.install(|| {
                paths
                    .par_iter()
                    .map(|p| load_image(p, image_size))
                    .collect::<Result<Vec<_>>>()
            })?;
            labels.extend(std::iter::repeat(class_idx as i64).take(tensors.len()));
            images.extend(tensors);
        }

        info!("loaded {} images in {} classes from {}", images.len(), classes.len(), root.display());
        Ok(Self { classes, images, labels })
    }

    /// Builds a dataset from already decoded tensors.
    pub fn from_tensors(classes: Vec<String>, images: Vec<Tensor>, labels: Vec<i64>) -> Result<Self> {
        ensure!(
            images.len() == labels.len(),
            "{} images but {} labels",
            images.len(),
            labels.len()
        );
        let n = classes.len() as i64;
        ensure!(
            labels.iter().all(|&l| (0..n).contains(&l)),
            "label out of range for {} classes",
            n
        );
        Ok(Self { classes, images, labels })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    /// Stacks the samples at `idxs` into `([B, C, H, W], [B])`.
    pub fn batch(&self, idxs: &[usize]) -> (Tensor, Tensor) {
        let xs: Vec<Tensor> = idxs.iter().map(|&i| self.images[i].shallow_clone()).collect();
        let ys: Vec<i64> = idxs.iter().map(|&i| self.labels[i]).collect();
        (Tensor::stack(&xs, 0), Tensor::from_slice(&ys))
    }
}

// =============== SPLIT ===============
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
}

/// Shuffles `0..n` once and cuts it at `floor(train_fraction * n)`.
pub fn split_indices<R: Rng + ?Sized>(n: usize, train_fraction: f64, rng: &mut R) -> Split {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    let cut = ((train_fraction * n as f64) as usize).min(n);
    let valid = indices.split_off(cut);
    Split { train: indices, valid }
}

// =============== LOADER ===============
/// Draws batches without replacement from a subset of a dataset, reshuffling
/// on every call to [`SubsetLoader::batches`].
#[derive(Debug)]
pub struct SubsetLoader<'a> {
    dataset: &'a ImageFolder,
    indices: Vec<usize>,
    batch_size: usize,
}

impl<'a> SubsetLoader<'a> {
    pub fn new(dataset: &'a ImageFolder, indices: Vec<usize>, batch_size: usize) -> Result<Self> {
        ensure!(batch_size > 0, "batch size must be positive");
        if let Some(&bad) = indices.iter().find(|&&i| i >= dataset.len()) {
            bail!("index {} out of range for dataset of {} images", bad, dataset.len());
        }
        Ok(Self { dataset, indices, batch_size })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    pub fn batches<R: Rng + ?Sized>(&self, rng: &mut R) -> Batches<'a> {
        let mut order = self.indices.clone();
        order.shuffle(rng);
        Batches {
            dataset: self.dataset,
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

/// One epoch's worth of batches; the last one may be short.
pub struct Batches<'a> {
    dataset: &'a ImageFolder,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = (Tensor, Tensor);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.dataset.batch(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}
