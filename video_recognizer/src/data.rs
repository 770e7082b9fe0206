use std::{fs::File, io::{BufRead, BufReader}, path::Path};

use burn::{data::{dataloader::batcher::Batcher, dataset::{Dataset, InMemDataset}}, tensor::{backend::Backend, Data, Int, Shape, Tensor}};
use derive_new::new;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RecognizerError, Result};

/// One video sample.
///
/// `shape` is `[T, C, H, W]` for segment heads and `[C, T, H, W]` for the
/// TimeSformer head; `frames` holds the values in that row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, new)]
pub struct VideoItem {
    pub frames: Vec<f32>,
    pub shape: [usize; 4],
    pub label: usize,
}

impl VideoItem {
    /// Verifies that `frames` fills `shape` exactly; `index` is only used in the error.
    pub fn check(&self, index: usize) -> Result<()> {
        if self.shape.contains(&0) {
            return Err(RecognizerError::InvalidItem { index, msg: "zero-sized dimension".into() });
        }
        let expected = self.shape.iter().product::<usize>();
        if self.frames.len() != expected {
            return Err(RecognizerError::InvalidItem {
                index,
                msg: format!("{} values for shape {:?} ({} expected)", self.frames.len(), self.shape, expected),
            });
        }
        Ok(())
    }

    /// Joins `[C, T, H, W]` clips of the same sample along `T`, producing the
    /// `[C, clips*T, H, W]` input used for uniform-crop testing.
    pub fn uniform_crop(clips: &[VideoItem]) -> Result<VideoItem> {
        let first = clips.first().ok_or(RecognizerError::EmptyDataset)?;
        let [channels, t, h, w] = first.shape;
        for (index, clip) in clips.iter().enumerate() {
            if clip.shape != first.shape || clip.label != first.label {
                return Err(RecognizerError::InvalidItem {
                    index,
                    msg: format!("clip {:?}/{} does not match {:?}/{}", clip.shape, clip.label, first.shape, first.label),
                });
            }
            clip.check(index)?;
        }

        let plane = t * h * w;
        let mut frames = Vec::with_capacity(first.frames.len() * clips.len());
        for c in 0..channels {
            for clip in clips {
                frames.extend_from_slice(&clip.frames[c * plane..(c + 1) * plane]);
            }
        }

        Ok(VideoItem {
            frames,
            shape: [channels, t * clips.len(), h, w],
            label: first.label,
        })
    }
}

/// Batch labels: a single target per sample, or the mixup triple.
#[derive(Debug, Clone)]
pub enum Labels<B: Backend> {
    Hard(Tensor<B, 1, Int>),
    Mixed {
        a: Tensor<B, 1, Int>,
        b: Tensor<B, 1, Int>,
        lam: f32,
    },
}

impl<B: Backend> Labels<B> {
    /// The dominant targets; for mixup these are the unshuffled labels.
    pub fn primary(&self) -> Tensor<B, 1, Int> {
        match self {
            Labels::Hard(targets) => targets.clone(),
            Labels::Mixed { a, .. } => a.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoBatch<B: Backend> {
    /// `[N, T, C, H, W]` or `[N, C, T, H, W]`, following the items' layout.
    pub imgs: Tensor<B, 5>,
    pub labels: Labels<B>,
}

#[derive(new)]
pub struct VideoBatcher<B: Backend> {
    device: B::Device,
    #[new(default)]
    mixup: Option<f32>,
}

impl<B: Backend> VideoBatcher<B> {
    /// Blend every sample with a shuffled partner using a fixed `lam`.
    pub fn with_mixup(mut self, lam: f32) -> Self {
        self.mixup = Some(lam);
        self
    }

    fn to_tensor(&self, frames: &[f32], shape: [usize; 4]) -> Tensor<B, 4> {
        Tensor::<B, 4>::from_data(Data::new(frames.to_vec(), Shape::new(shape)).convert(), &self.device)
    }

    fn to_labels(&self, labels: &[i64]) -> Tensor<B, 1, Int> {
        Tensor::<B, 1, Int>::from_data(Data::from(labels).convert(), &self.device)
    }
}

impl<B: Backend> Batcher<VideoItem, VideoBatch<B>> for VideoBatcher<B> {
    /// Items must share one shape; `VideoDataset` guarantees it.
    fn batch(&self, items: Vec<VideoItem>) -> VideoBatch<B> {
        let labels = items.iter().map(|item| item.label as i64).collect::<Vec<i64>>();

        match self.mixup {
            None => {
                let clips = items
                    .par_iter()
                    .map(|item| self.to_tensor(&item.frames, item.shape))
                    .collect::<Vec<Tensor<B, 4>>>();

                VideoBatch {
                    imgs: Tensor::stack(clips, 0),
                    labels: Labels::Hard(self.to_labels(&labels)),
                }
            }
            Some(lam) => {
                let mut partners = (0..items.len()).collect::<Vec<usize>>();
                partners.shuffle(&mut rand::thread_rng());

                let clips = items
                    .par_iter()
                    .zip(partners.par_iter())
                    .map(|(item, &partner)| {
                        let other = &items[partner].frames;
                        let mixed = item
                            .frames
                            .iter()
                            .zip(other)
                            .map(|(x, y)| lam * x + (1.0 - lam) * y)
                            .collect::<Vec<f32>>();
                        self.to_tensor(&mixed, item.shape)
                    })
                    .collect::<Vec<Tensor<B, 4>>>();
                let shuffled = partners.iter().map(|&p| labels[p]).collect::<Vec<i64>>();

                VideoBatch {
                    imgs: Tensor::stack(clips, 0),
                    labels: Labels::Mixed {
                        a: self.to_labels(&labels),
                        b: self.to_labels(&shuffled),
                        lam,
                    },
                }
            }
        }
    }
}

/// In-memory video dataset whose items all share one shape.
pub struct VideoDataset {
    dataset: InMemDataset<VideoItem>,
    shape: [usize; 4],
}

impl Dataset<VideoItem> for VideoDataset {
    fn get(&self, index: usize) -> Option<VideoItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl VideoDataset {
    pub fn new(items: Vec<VideoItem>) -> Result<Self> {
        let shape = items.first().ok_or(RecognizerError::EmptyDataset)?.shape;
        for (index, item) in items.iter().enumerate() {
            if item.shape != shape {
                return Err(RecognizerError::InvalidItem {
                    index,
                    msg: format!("shape {:?} differs from {:?}", item.shape, shape),
                });
            }
            item.check(index)?;
        }
        debug!(len = items.len(), ?shape, "video dataset ready");

        Ok(Self {
            dataset: InMemDataset::new(items),
            shape,
        })
    }

    /// Reads a JSON-lines manifest, one `VideoItem` per line.
    pub fn from_manifest<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let io_err = |source| RecognizerError::Io { path: path.to_path_buf(), source };
        let reader = BufReader::new(File::open(path).map_err(io_err)?);

        let mut items = vec![];
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let item = serde_json::from_str::<VideoItem>(&line).map_err(|source| RecognizerError::Json {
                path: path.to_path_buf(),
                line: line_no + 1,
                source,
            })?;
            items.push(item);
        }
        info!(path = %path.display(), len = items.len(), "loaded manifest");

        Self::new(items)
    }

    /// Random clips whose values are offset by their label, so that a model
    /// can actually separate the classes.
    pub fn synthetic(len: usize, shape: [usize; 4], num_classes: usize, seed: u64) -> Result<Self> {
        if num_classes == 0 {
            return Err(RecognizerError::Config("synthetic dataset needs at least one class".into()));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let values = shape.iter().product::<usize>();

        let items = (0..len)
            .map(|_| {
                let label = rng.gen_range(0..num_classes);
                let offset = label as f32 / num_classes as f32;
                let frames = (0..values).map(|_| offset + rng.gen_range(-0.1f32..0.1)).collect();
                VideoItem::new(frames, shape, label)
            })
            .collect();

        Self::new(items)
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    fn item(value: f32, label: usize) -> VideoItem {
        VideoItem::new(vec![value; 2 * 3 * 4 * 4], [2, 3, 4, 4], label)
    }

    #[test]
    fn batches_items_into_five_dims() {
        let batcher = VideoBatcher::<TestBackend>::new(Default::default());
        let batch = batcher.batch(vec![item(0.0, 1), item(1.0, 2), item(2.0, 0)]);

        assert_eq!(batch.imgs.dims(), [3, 2, 3, 4, 4]);
        let Labels::Hard(labels) = batch.labels else { panic!("expected hard labels") };
        assert_eq!(labels.into_data().convert::<i64>().value, vec![1, 2, 0]);
    }

    #[test]
    fn mixup_blends_with_partner() {
        let batcher = VideoBatcher::<TestBackend>::new(Default::default()).with_mixup(0.75);
        let batch = batcher.batch(vec![item(0.0, 0), item(4.0, 1)]);

        let Labels::Mixed { a, b, lam } = batch.labels else { panic!("expected mixed labels") };
        assert_eq!(lam, 0.75);
        let a = a.into_data().convert::<i64>().value;
        let b = b.into_data().convert::<i64>().value;
        assert_eq!(a, vec![0, 1]);

        let values = batch.imgs.into_data().convert::<f32>().value;
        let per_item = values.len() / 2;
        for (row, &partner) in b.iter().enumerate() {
            let own = if row == 0 { 0.0 } else { 4.0 };
            let other = if partner == 0 { 0.0 } else { 4.0 };
            let expected = 0.75 * own + 0.25 * other;
            assert!((values[row * per_item] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_inconsistent_items() {
        let mut bad = item(0.0, 0);
        bad.frames.pop();
        assert!(matches!(VideoDataset::new(vec![item(0.0, 0), bad]), Err(RecognizerError::InvalidItem { index: 1, .. })));

        let other = VideoItem::new(vec![0.0; 8], [1, 2, 2, 2], 0);
        assert!(VideoDataset::new(vec![item(0.0, 0), other]).is_err());
        assert!(matches!(VideoDataset::new(vec![]), Err(RecognizerError::EmptyDataset)));
    }

    #[test]
    fn synthetic_is_reproducible() {
        let a = VideoDataset::synthetic(4, [2, 3, 4, 4], 3, 7).unwrap();
        let b = VideoDataset::synthetic(4, [2, 3, 4, 4], 3, 7).unwrap();

        assert_eq!(a.len(), 4);
        assert_eq!(a.shape(), [2, 3, 4, 4]);
        assert_eq!(a.get(3), b.get(3));
        assert!(a.get(4).is_none());
    }

    #[test]
    fn uniform_crop_concatenates_along_time() {
        let clip = |v: f32| VideoItem::new(vec![v; 2 * 2 * 1 * 1], [2, 2, 1, 1], 5);
        let joined = VideoItem::uniform_crop(&[clip(0.0), clip(1.0), clip(2.0)]).unwrap();

        assert_eq!(joined.shape, [2, 6, 1, 1]);
        assert_eq!(joined.frames, vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        assert_eq!(joined.label, 5);
    }

    #[test]
    fn uniform_crop_rejects_short_clips() {
        let whole = VideoItem::new(vec![0.0; 4], [2, 2, 1, 1], 0);
        let short = VideoItem::new(vec![0.0; 3], [2, 2, 1, 1], 0);

        let err = VideoItem::uniform_crop(&[whole, short]).unwrap_err();
        assert!(matches!(err, RecognizerError::InvalidItem { index: 1, .. }));
    }
}
