use burn::{config::Config, module::Module, nn::{loss::CrossEntropyLossConfig, pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig}, Dropout, DropoutConfig, Linear, LinearConfig}, tensor::{backend::Backend, Float, Int, Tensor}};
use tracing::trace;

use crate::{backbone::Features, data::Labels, error::{RecognizerError, Result}, metrics::{checked_label, topk_accuracy, LossMetrics, TOP_K}};

/// Classification head variants.
///
/// Segment heads (`Tsn`, `Tsm`) see one feature row per frame and average
/// over the segments of a clip. `TimeSformer` sees one row per clip and is
/// the only variant that takes its input in `[N, C, T, H, W]` layout.
#[derive(Module, Config, Debug, PartialEq)]
pub enum HeadKind {
    Tsn,
    Tsm,
    TimeSformer,
}

impl HeadKind {
    pub fn name(&self) -> &'static str {
        match self {
            HeadKind::Tsn => "TSNHead",
            HeadKind::Tsm => "TSMHead",
            HeadKind::TimeSformer => "TimeSformerHead",
        }
    }

    /// Whether the head needs `num_segs` and a `[N*T, ...]` input.
    pub fn uses_segments(&self) -> bool {
        !matches!(self, HeadKind::TimeSformer)
    }
}

#[derive(Config, Debug)]
pub struct HeadConfig {
    pub kind: HeadKind,
    pub in_channels: usize,
    pub num_classes: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
    /// Label smoothing epsilon, applied to training losses only.
    #[config(default = 0.0)]
    pub ls_eps: f32,
}

impl HeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Head<B> {
        Head {
            kind: self.kind.clone(),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc: LinearConfig::new(self.in_channels, self.num_classes).init(device),
            in_channels: self.in_channels,
            num_classes: self.num_classes,
            ls_eps: self.ls_eps,
        }
    }
}

#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    kind: HeadKind,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    fc: Linear<B>,
    in_channels: usize,
    num_classes: usize,
    ls_eps: f32,
}

impl<B: Backend> Head<B> {
    pub fn kind(&self) -> &HeadKind {
        &self.kind
    }

    /// Class scores `[N, num_classes]`.
    ///
    /// Segment heads require `num_segs` and treat every `num_segs` consecutive
    /// feature rows as one clip.
    pub fn forward(&self, features: Features<B>, num_segs: Option<usize>) -> Result<Tensor<B, 2>> {
        match self.kind {
            HeadKind::TimeSformer => {
                let x = match features {
                    Features::Embedding(x) => x,
                    Features::Clip(clip) => {
                        let [n, c, t, h, w] = clip.dims();
                        clip.reshape([n, c, t * h * w]).mean_dim(2).reshape([n, c])
                    }
                    other => {
                        return Err(RecognizerError::UnsupportedFeatures {
                            consumer: self.kind.name(),
                            features: other.name(),
                        })
                    }
                };
                self.check_channels(x.dims()[1])?;

                let x = self.dropout.forward(x);
                Ok(self.fc.forward(x))
            }
            HeadKind::Tsn | HeadKind::Tsm => {
                let num_segs = num_segs.ok_or(RecognizerError::MissingSegments { kind: self.kind.name() })?;
                let x = self.pool_rows(features)?;
                let [rows, channels] = x.dims();
                self.check_channels(channels)?;
                if num_segs == 0 || rows % num_segs != 0 {
                    return Err(RecognizerError::SegmentMismatch { rows, num_segs });
                }
                let n = rows / num_segs;
                trace!(kind = self.kind.name(), n, num_segs, "segment consensus");

                if self.kind == HeadKind::Tsn {
                    // consensus over segments, then classify
                    let x = x.reshape([n, num_segs, channels]).mean_dim(1).reshape([n, channels]);
                    let x = self.dropout.forward(x);
                    Ok(self.fc.forward(x))
                } else {
                    // classify every segment, then consensus
                    let x = self.dropout.forward(x);
                    let x = self.fc.forward(x);
                    Ok(x.reshape([n, num_segs, self.num_classes]).mean_dim(1).reshape([n, self.num_classes]))
                }
            }
        }
    }

    /// Loss and top-1/top-5 accuracy for a batch of scores.
    ///
    /// Hard labels are label-smoothed only outside of `valid_mode`; mixed
    /// labels interpolate loss and accuracy between their two targets.
    pub fn loss(&self, scores: Tensor<B, 2>, labels: &Labels<B>, valid_mode: bool) -> Result<LossMetrics<B>> {
        match labels {
            Labels::Hard(targets) => {
                let smooth = self.ls_eps != 0.0 && !valid_mode;
                let loss = self.classification_loss(scores.clone(), targets.clone(), smooth)?;
                let (top1, top5) = self.accuracy(scores, targets.clone())?;

                Ok(LossMetrics { loss, top1, top5 })
            }
            Labels::Mixed { a, b, lam } => {
                let lam = *lam;
                let smooth = self.ls_eps != 0.0;
                let loss_a = self.classification_loss(scores.clone(), a.clone(), smooth)?;
                let loss_b = self.classification_loss(scores.clone(), b.clone(), smooth)?;
                let (top1_a, top5_a) = self.accuracy(scores.clone(), a.clone())?;
                let (top1_b, top5_b) = self.accuracy(scores, b.clone())?;

                Ok(LossMetrics {
                    loss: loss_a.mul_scalar(lam) + loss_b.mul_scalar(1.0 - lam),
                    top1: lam * top1_a + (1.0 - lam) * top1_b,
                    top5: lam * top5_a + (1.0 - lam) * top5_b,
                })
            }
        }
    }

    fn pool_rows(&self, features: Features<B>) -> Result<Tensor<B, 2>> {
        match features {
            Features::Frames(x) => {
                let [rows, channels, _, _] = x.dims();
                Ok(self.pool.forward(x).reshape([rows, channels]))
            }
            Features::Embedding(x) => Ok(x),
            other => Err(RecognizerError::UnsupportedFeatures {
                consumer: self.kind.name(),
                features: other.name(),
            }),
        }
    }

    fn check_channels(&self, channels: usize) -> Result<()> {
        if channels != self.in_channels {
            return Err(RecognizerError::ChannelMismatch {
                expected: self.in_channels,
                actual: channels,
            });
        }
        Ok(())
    }

    fn classification_loss(&self, scores: Tensor<B, 2>, targets: Tensor<B, 1, Int>, smooth: bool) -> Result<Tensor<B, 1, Float>> {
        let [rows, num_classes] = scores.dims();
        let labels = targets.to_data().convert::<i64>().value;
        if labels.len() != rows {
            return Err(RecognizerError::BatchMismatch { scores: rows, labels: labels.len() });
        }
        for label in labels {
            checked_label(label, num_classes)?;
        }

        // (1 - eps) * one_hot + eps / K
        let smoothing = smooth.then_some(self.ls_eps);
        let loss = CrossEntropyLossConfig::new()
            .with_smoothing(smoothing)
            .init(&scores.device())
            .forward(scores, targets);

        Ok(loss)
    }

    fn accuracy(&self, scores: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Result<(f32, f32)> {
        let top1 = topk_accuracy(scores.clone(), targets.clone(), 1)?;
        let top5 = topk_accuracy(scores, targets, TOP_K)?;
        Ok((top1, top5))
    }
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, tensor::{Data, Int, Tensor}};

    use super::*;

    type TestBackend = NdArray<f32>;

    fn labels(values: &[i64]) -> Labels<TestBackend> {
        Labels::Hard(Tensor::<TestBackend, 1, Int>::from_data(Data::from(values).convert(), &Default::default()))
    }

    fn scores() -> Tensor<TestBackend, 2> {
        Tensor::from_data(Data::<f32, 2>::from([[2.0, 0.5, -1.0], [0.1, 0.3, 1.5]]).convert(), &Default::default())
    }

    #[test]
    fn segment_heads_average_over_segments() {
        let device = Default::default();
        for kind in [HeadKind::Tsn, HeadKind::Tsm] {
            let head = HeadConfig::new(kind, 8, 5).init::<TestBackend>(&device);
            let frames = Tensor::<TestBackend, 4>::ones([6, 8, 4, 4], &device);

            let scores = head.forward(Features::Frames(frames), Some(3)).unwrap();
            assert_eq!(scores.dims(), [2, 5]);
        }
    }

    #[test]
    fn segment_heads_need_num_segs() {
        let head = HeadConfig::new(HeadKind::Tsn, 8, 5).init::<TestBackend>(&Default::default());
        let frames = Tensor::<TestBackend, 4>::ones([6, 8, 4, 4], &Default::default());

        let err = head.forward(Features::Frames(frames.clone()), None).unwrap_err();
        assert!(matches!(err, RecognizerError::MissingSegments { .. }));

        let err = head.forward(Features::Frames(frames), Some(4)).unwrap_err();
        assert!(matches!(err, RecognizerError::SegmentMismatch { rows: 6, num_segs: 4 }));
    }

    #[test]
    fn timesformer_head_takes_clips_and_embeddings() {
        let device = Default::default();
        let head = HeadConfig::new(HeadKind::TimeSformer, 3, 4).init::<TestBackend>(&device);

        let clip = Tensor::<TestBackend, 5>::ones([2, 3, 4, 8, 8], &device);
        assert_eq!(head.forward(Features::Clip(clip), None).unwrap().dims(), [2, 4]);

        let embedding = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        assert_eq!(head.forward(Features::Embedding(embedding), Some(7)).unwrap().dims(), [2, 4]);

        let frames = Tensor::<TestBackend, 4>::ones([2, 3, 8, 8], &device);
        assert!(head.forward(Features::Frames(frames), None).is_err());
    }

    #[test]
    fn smoothing_applies_to_training_loss_only() {
        let head = HeadConfig::new(HeadKind::Tsn, 8, 3).with_ls_eps(0.1).init::<TestBackend>(&Default::default());
        let targets = labels(&[0, 2]);

        let train = head.loss(scores(), &targets, false).unwrap();
        let valid = head.loss(scores(), &targets, true).unwrap();

        assert!(train.loss_value() > valid.loss_value());
        assert_eq!(train.top1, 1.0);
        assert_eq!(valid.top1, 1.0);
    }

    #[test]
    fn smoothed_loss_matches_soft_target_cross_entropy() {
        let eps = 0.1f32;
        let head = HeadConfig::new(HeadKind::Tsn, 8, 3).with_ls_eps(eps).init::<TestBackend>(&Default::default());
        let loss = head.loss(scores(), &labels(&[0, 2]), false).unwrap().loss_value();

        let rows = [([2.0f32, 0.5, -1.0], 0usize), ([0.1, 0.3, 1.5], 2)];
        let expected = rows
            .iter()
            .map(|(row, label)| {
                let lse = row.iter().map(|x| x.exp()).sum::<f32>().ln();
                row.iter()
                    .enumerate()
                    .map(|(class, x)| {
                        let target = eps / 3.0 + if class == *label { 1.0 - eps } else { 0.0 };
                        -target * (x - lse)
                    })
                    .sum::<f32>()
            })
            .sum::<f32>()
            / 2.0;

        assert!((loss - expected).abs() < 1e-5, "{loss} != {expected}");
    }

    #[test]
    fn mixed_labels_stay_smoothed_in_valid_mode() {
        let device = Default::default();
        let smoothed = HeadConfig::new(HeadKind::Tsn, 8, 3).with_ls_eps(0.2).init::<TestBackend>(&device);
        let plain = HeadConfig::new(HeadKind::Tsn, 8, 3).init::<TestBackend>(&device);
        let Labels::Hard(a) = labels(&[0, 2]) else { unreachable!() };
        let Labels::Hard(b) = labels(&[1, 1]) else { unreachable!() };
        let mixed = Labels::Mixed { a, b, lam: 0.5 };

        let train = smoothed.loss(scores(), &mixed, false).unwrap().loss_value();
        let valid = smoothed.loss(scores(), &mixed, true).unwrap().loss_value();
        let unsmoothed = plain.loss(scores(), &mixed, true).unwrap().loss_value();

        assert!((train - valid).abs() < 1e-6);
        assert!((valid - unsmoothed).abs() > 1e-3);
    }

    #[test]
    fn mixed_labels_interpolate_loss_and_accuracy() {
        let head = HeadConfig::new(HeadKind::Tsn, 8, 3).init::<TestBackend>(&Default::default());
        let Labels::Hard(a) = labels(&[0, 2]) else { unreachable!() };
        let Labels::Hard(b) = labels(&[1, 1]) else { unreachable!() };

        let loss_a = head.loss(scores(), &Labels::Hard(a.clone()), false).unwrap();
        let loss_b = head.loss(scores(), &Labels::Hard(b.clone()), false).unwrap();
        let mixed = head.loss(scores(), &Labels::Mixed { a, b, lam: 0.25 }, false).unwrap();

        let expected = 0.25 * loss_a.loss_value() + 0.75 * loss_b.loss_value();
        assert!((mixed.loss_value() - expected).abs() < 1e-5);
        assert!((mixed.top1 - 0.25).abs() < 1e-6);
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let head = HeadConfig::new(HeadKind::Tsn, 8, 3).init::<TestBackend>(&Default::default());
        let err = head.loss(scores(), &labels(&[0, 3]), false).unwrap_err();
        assert!(matches!(err, RecognizerError::LabelOutOfRange { label: 3, num_classes: 3 }));
    }
}
