use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use models::STEM_STRIDE;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{TrainError, TrainResult};

/// One image with its per-landmark target heatmaps, both CHW and normalized.
#[derive(Debug, Clone)]
pub struct HeatmapSample {
    pub image_chw: Vec<f32>,
    /// `[channels, height, width]` of `image_chw`.
    pub image_shape: [usize; 3],
    pub heatmaps_chw: Vec<f32>,
    pub heatmap_shape: [usize; 3],
}

impl HeatmapSample {
    fn check(&self) -> TrainResult<()> {
        let image_len: usize = self.image_shape.iter().product();
        let heatmap_len: usize = self.heatmap_shape.iter().product();
        if image_len != self.image_chw.len() || heatmap_len != self.heatmaps_chw.len() {
            return Err(TrainError::Dataset(format!(
                "sample buffers ({} / {}) do not match shapes {:?} / {:?}",
                self.image_chw.len(),
                self.heatmaps_chw.len(),
                self.image_shape,
                self.heatmap_shape
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HeatmapBatch<B: Backend> {
    /// `[batch, 3, H, W]`.
    pub images: Tensor<B, 4>,
    /// `[batch, classes, H / 4, W / 4]`.
    pub heatmaps: Tensor<B, 4>,
}

/// Restartable source of batches. `num_items` counts examples, not batches.
pub trait HeatmapLoader<B: Backend> {
    fn num_items(&self) -> usize;

    fn batches(
        &self,
        epoch: usize,
        device: &B::Device,
    ) -> Box<dyn Iterator<Item = HeatmapBatch<B>> + '_>;
}

/// Holds decoded samples and collates them into tensors on demand.
#[derive(Debug, Clone)]
pub struct InMemoryLoader {
    samples: Vec<HeatmapSample>,
    batch_size: usize,
    shuffle_seed: Option<u64>,
}

impl InMemoryLoader {
    pub fn new(samples: Vec<HeatmapSample>, batch_size: usize) -> TrainResult<Self> {
        if batch_size == 0 {
            return Err(TrainError::Config("batch_size must be positive".into()));
        }
        if let Some(first) = samples.first() {
            for sample in &samples {
                sample.check()?;
                if sample.image_shape != first.image_shape
                    || sample.heatmap_shape != first.heatmap_shape
                {
                    return Err(TrainError::Dataset(format!(
                        "sample shapes differ: {:?}/{:?} vs {:?}/{:?}",
                        sample.image_shape,
                        sample.heatmap_shape,
                        first.image_shape,
                        first.heatmap_shape
                    )));
                }
            }
        }
        Ok(Self {
            samples,
            batch_size,
            shuffle_seed: None,
        })
    }

    /// Reshuffle every epoch from `seed` mixed with the epoch number.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    fn collate<B: Backend>(&self, indices: &[usize], device: &B::Device) -> HeatmapBatch<B> {
        let [c, h, w] = self.samples[indices[0]].image_shape;
        let [k, hh, hw] = self.samples[indices[0]].heatmap_shape;
        let mut images = Vec::with_capacity(indices.len() * c * h * w);
        let mut heatmaps = Vec::with_capacity(indices.len() * k * hh * hw);
        for &idx in indices {
            images.extend_from_slice(&self.samples[idx].image_chw);
            heatmaps.extend_from_slice(&self.samples[idx].heatmaps_chw);
        }
        let n = indices.len();
        HeatmapBatch {
            images: Tensor::from_data(TensorData::new(images, [n, c, h, w]), device),
            heatmaps: Tensor::from_data(TensorData::new(heatmaps, [n, k, hh, hw]), device),
        }
    }
}

impl<B: Backend> HeatmapLoader<B> for InMemoryLoader {
    fn num_items(&self) -> usize {
        self.samples.len()
    }

    fn batches(
        &self,
        epoch: usize,
        device: &B::Device,
    ) -> Box<dyn Iterator<Item = HeatmapBatch<B>> + '_> {
        let chunks: Vec<Vec<usize>> = self
            .order(epoch)
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        let device = device.clone();
        Box::new(
            chunks
                .into_iter()
                .map(move |indices| self.collate::<B>(&indices, &device)),
        )
    }
}

/// Splits samples into (train, validation) after a seeded shuffle.
///
/// With two or more samples both sides keep at least one.
pub fn split(
    mut samples: Vec<HeatmapSample>,
    train_ratio: f32,
    seed: u64,
) -> TrainResult<(Vec<HeatmapSample>, Vec<HeatmapSample>)> {
    if !(train_ratio > 0.0 && train_ratio < 1.0) {
        return Err(TrainError::Config(format!(
            "split ratio {train_ratio} must lie in (0, 1)"
        )));
    }
    let n = samples.len();
    if n < 2 {
        return Err(TrainError::Dataset(format!(
            "need at least 2 samples to split, found {n}"
        )));
    }
    samples.shuffle(&mut StdRng::seed_from_u64(seed));
    let train_len = ((n as f32 * train_ratio).round() as usize).clamp(1, n - 1);
    let valid = samples.split_off(train_len);
    Ok((samples, valid))
}

/// Gaussian heatmaps of `size x size`, one per landmark, in heatmap pixel coordinates.
pub fn render_heatmaps(landmarks: &[[f32; 2]], size: usize, sigma: f32) -> Vec<f32> {
    let mut out = vec![0.0f32; landmarks.len() * size * size];
    let denom = 2.0 * sigma * sigma;
    for (k, [cx, cy]) in landmarks.iter().enumerate() {
        let plane = &mut out[k * size * size..(k + 1) * size * size];
        for y in 0..size {
            let dy = y as f32 - cy;
            for x in 0..size {
                let dx = x as f32 - cx;
                plane[y * size + x] = (-(dx * dx + dy * dy) / denom).exp();
            }
        }
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandmarkRecord {
    /// Image path relative to the dataset root.
    pub image: PathBuf,
    /// Pixel coordinates in the original image.
    pub landmarks: Vec<[f32; 2]>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LandmarkManifest {
    pub samples: Vec<LandmarkRecord>,
}

impl LandmarkManifest {
    pub fn from_path(path: &Path) -> TrainResult<Self> {
        let raw = fs::read(path).map_err(|e| TrainError::io(path, e))?;
        serde_json::from_slice(&raw).map_err(|source| TrainError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LandmarkDatasetConfig {
    pub manifest: PathBuf,
    /// Defaults to the manifest's directory.
    pub root: Option<PathBuf>,
    pub input_size: usize,
    pub sigma: f32,
    pub num_classes: usize,
}

impl LandmarkDatasetConfig {
    fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            self.manifest
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        })
    }

    pub fn load(&self) -> TrainResult<Vec<HeatmapSample>> {
        if self.input_size == 0 || self.input_size % STEM_STRIDE != 0 {
            return Err(TrainError::Config(format!(
                "input_size {} must be a positive multiple of {STEM_STRIDE}",
                self.input_size
            )));
        }
        let manifest = LandmarkManifest::from_path(&self.manifest)?;
        let root = self.root();
        manifest
            .samples
            .iter()
            .map(|record| self.load_record(&root, record))
            .collect()
    }

    fn load_record(&self, root: &Path, record: &LandmarkRecord) -> TrainResult<HeatmapSample> {
        if record.landmarks.len() != self.num_classes {
            return Err(TrainError::Dataset(format!(
                "{:?} has {} landmarks, model expects {}",
                record.image,
                record.landmarks.len(),
                self.num_classes
            )));
        }
        let path = root.join(&record.image);
        let rgb = image::open(&path)
            .map_err(|source| TrainError::Image {
                path: path.clone(),
                source,
            })?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        let outside = record.landmarks.iter().any(|[x, y]| {
            !(0.0..width as f32).contains(x) || !(0.0..height as f32).contains(y)
        });
        if outside {
            warn!("{:?}: landmarks fall outside the {width}x{height} image", record.image);
        }
        let side = self.input_size as u32;
        let resized = image::imageops::resize(&rgb, side, side, image::imageops::FilterType::Triangle);

        let mut image_chw = Vec::with_capacity(3 * self.input_size * self.input_size);
        for c in 0..3 {
            for px in resized.pixels() {
                image_chw.push(px[c] as f32 / 255.0);
            }
        }

        let heatmap_size = self.input_size / STEM_STRIDE;
        let sx = heatmap_size as f32 / width as f32;
        let sy = heatmap_size as f32 / height as f32;
        let scaled: Vec<[f32; 2]> = record
            .landmarks
            .iter()
            .map(|[x, y]| [x * sx, y * sy])
            .collect();

        Ok(HeatmapSample {
            image_chw,
            image_shape: [3, self.input_size, self.input_size],
            heatmaps_chw: render_heatmaps(&scaled, heatmap_size, self.sigma),
            heatmap_shape: [self.num_classes, heatmap_size, heatmap_size],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn sample(tag: f32) -> HeatmapSample {
        HeatmapSample {
            image_chw: vec![tag; 3 * 4 * 4],
            image_shape: [3, 4, 4],
            heatmaps_chw: vec![tag; 2],
            heatmap_shape: [2, 1, 1],
        }
    }

    #[test]
    fn batches_cover_every_sample_once() {
        let loader = InMemoryLoader::new((0..5).map(|i| sample(i as f32)).collect(), 2)
            .unwrap()
            .with_shuffle(3);
        let device = Default::default();
        assert_eq!(HeatmapLoader::<TestBackend>::num_items(&loader), 5);
        assert_eq!(loader.num_batches(), 3);

        let mut seen = Vec::new();
        for batch in HeatmapLoader::<TestBackend>::batches(&loader, 1, &device) {
            let n = batch.images.dims()[0];
            assert_eq!(batch.heatmaps.dims(), [n, 2, 1, 1]);
            let tags = batch.heatmaps.into_data().to_vec::<f32>().unwrap();
            seen.extend(tags.into_iter().step_by(2));
        }
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn shuffle_is_reproducible_per_epoch() {
        let loader = InMemoryLoader::new((0..16).map(|i| sample(i as f32)).collect(), 16)
            .unwrap()
            .with_shuffle(11);
        assert_eq!(loader.order(2), loader.order(2));
        assert_ne!(loader.order(1), loader.order(2));
    }

    #[test]
    fn rejects_mismatched_samples() {
        let mut odd = sample(0.0);
        odd.heatmap_shape = [1, 1, 1];
        odd.heatmaps_chw = vec![0.0];
        assert!(InMemoryLoader::new(vec![sample(0.0), odd], 1).is_err());
        assert!(InMemoryLoader::new(vec![sample(0.0)], 0)
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn split_keeps_both_sides_non_empty() {
        let (train, valid) = split((0..10).map(|i| sample(i as f32)).collect(), 0.9, 1).unwrap();
        assert_eq!((train.len(), valid.len()), (9, 1));
        let (train, valid) = split(vec![sample(0.0), sample(1.0)], 0.99, 1).unwrap();
        assert_eq!((train.len(), valid.len()), (1, 1));
        assert!(split(vec![sample(0.0)], 0.5, 1).is_err());
        assert!(split(vec![sample(0.0), sample(1.0)], 1.0, 1).is_err());
    }

    #[test]
    fn heatmap_peaks_at_landmark() {
        let maps = render_heatmaps(&[[2.0, 1.0]], 4, 1.0);
        assert_eq!(maps.len(), 16);
        assert!((maps[4 + 2] - 1.0).abs() < 1e-6);
        let peak = maps.iter().cloned().fold(f32::MIN, f32::max);
        assert_eq!(peak, maps[6]);
        assert!(maps[0] < maps[5]);
    }
}
