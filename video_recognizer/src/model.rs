use std::fmt::Display;

use burn::{config::Config, module::Module, tensor::{activation::softmax, backend::{AutodiffBackend, Backend}, Float, Int, Tensor}, train::{metric::{AccuracyInput, Adaptor, LossInput}, TrainOutput, TrainStep, ValidStep}};
use tracing::debug;

use crate::{backbone::{BackboneConfig, ConvBackbone, Features}, data::VideoBatch, error::{RecognizerError, Result}, head::{Head, HeadConfig}, metrics::LossMetrics};

#[derive(Config, Debug)]
pub struct RecognizerConfig {
    pub backbone: Option<BackboneConfig>,
    pub head: Option<HeadConfig>,
    /// Clips a TimeSformer test input is split into along time.
    #[config(default = 3)]
    pub num_test_clips: usize,
}

impl RecognizerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Recognizer2D<B>> {
        if self.num_test_clips == 0 {
            return Err(RecognizerError::Config("num_test_clips must be positive".into()));
        }
        if let Some(head) = &self.head {
            if !(0.0..=1.0).contains(&head.ls_eps) {
                return Err(RecognizerError::Config(format!("ls_eps {} outside [0, 1]", head.ls_eps)));
            }
        }
        if let (Some(backbone), Some(head)) = (&self.backbone, &self.head) {
            if head.in_channels != backbone.out_channels() {
                return Err(RecognizerError::ChannelMismatch {
                    expected: head.in_channels,
                    actual: backbone.out_channels(),
                });
            }
        }

        Ok(Recognizer2D {
            backbone: self.backbone.as_ref().map(|config| config.init(device)),
            head: self.head.as_ref().map(|config| config.init(device)),
            num_test_clips: self.num_test_clips,
        })
    }
}

/// 2D recognizer: a frame backbone plus a classification head.
///
/// Inputs are `[N, T, C, H, W]` for segment heads, whose frames are folded
/// into the batch before the backbone, and `[N, C, T, H, W]` for the
/// TimeSformer head, which receives whole clips.
#[derive(Module, Debug)]
pub struct Recognizer2D<B: Backend> {
    backbone: Option<ConvBackbone<B>>,
    head: Option<Head<B>>,
    num_test_clips: usize,
}

impl<B: Backend> Recognizer2D<B> {
    pub fn head(&self) -> Option<&Head<B>> {
        self.head.as_ref()
    }

    fn clip_input(&self) -> bool {
        self.head.as_ref().map_or(false, |head| !head.kind().uses_segments())
    }

    /// Backbone then head; `None` when there is no head.
    pub fn forward_net(&self, imgs: Tensor<B, 5>) -> Result<Option<Tensor<B, 2>>> {
        // num_segs belongs to the dataset, so it is read off the input
        let (features, num_segs) = if self.clip_input() {
            (Features::Clip(imgs), None)
        } else {
            let [n, t, c, h, w] = imgs.dims();
            (Features::Frames(imgs.reshape([n * t, c, h, w])), Some(t))
        };

        let features = match &self.backbone {
            Some(backbone) => backbone.forward(features)?,
            None => features,
        };

        match &self.head {
            Some(head) => head.forward(features, num_segs).map(Some),
            None => Ok(None),
        }
    }

    pub fn train_step(&self, batch: VideoBatch<B>) -> Result<LossMetrics<B>> {
        self.step_loss(batch, false).map(|(_, metrics)| metrics)
    }

    pub fn val_step(&self, batch: VideoBatch<B>) -> Result<LossMetrics<B>> {
        self.step_loss(batch, true).map(|(_, metrics)| metrics)
    }

    /// Scores without a loss. The TimeSformer head sees `num_test_clips`
    /// temporal clips and its softmax outputs are averaged.
    pub fn test_step(&self, batch: VideoBatch<B>) -> Result<Option<Tensor<B, 2>>> {
        let imgs = batch.imgs;
        if !self.clip_input() {
            return self.forward_net(imgs);
        }

        let [n, c, t, h, w] = imgs.dims();
        let clips = self.num_test_clips;
        if t == 0 || t % clips != 0 {
            return Err(RecognizerError::ClipSplit { len: t, clips });
        }
        let len = t / clips;
        debug!(clips, len, "uniform crop test");

        let mut summed: Option<Tensor<B, 2>> = None;
        for i in 0..clips {
            let clip = imgs.clone().slice([0..n, 0..c, i * len..(i + 1) * len, 0..h, 0..w]);
            let scores = self.forward_net(clip)?.ok_or(RecognizerError::MissingHead)?;
            let probs = softmax(scores, 1);
            summed = Some(match summed {
                Some(acc) => acc + probs,
                None => probs,
            });
        }

        Ok(summed.map(|probs| probs.div_scalar(clips as f32)))
    }

    pub fn infer_step(&self, imgs: Tensor<B, 5>) -> Result<Option<Tensor<B, 2>>> {
        self.forward_net(imgs)
    }

    fn step_loss(&self, batch: VideoBatch<B>, valid_mode: bool) -> Result<(Tensor<B, 2>, LossMetrics<B>)> {
        let head = self.head.as_ref().ok_or(RecognizerError::MissingHead)?;
        let scores = self.forward_net(batch.imgs)?.ok_or(RecognizerError::MissingHead)?;
        let metrics = head.loss(scores.clone(), &batch.labels, valid_mode)?;
        Ok((scores, metrics))
    }

    pub fn forward_output(&self, batch: VideoBatch<B>, valid_mode: bool) -> Result<RecognizerOutput<B>> {
        let targets = batch.labels.primary();
        let (output, metrics) = self.step_loss(batch, valid_mode)?;

        Ok(RecognizerOutput {
            loss: metrics.loss,
            output,
            targets,
            top1: metrics.top1,
            top5: metrics.top5,
        })
    }
}

#[derive(Debug)]
pub struct RecognizerOutput<B: Backend> {
    pub loss: Tensor<B, 1, Float>,
    pub output: Tensor<B, 2>,
    /// For mixup batches, the unshuffled labels.
    pub targets: Tensor<B, 1, Int>,
    pub top1: f32,
    pub top5: f32,
}

impl<B: Backend> Display for RecognizerOutput<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loss_val: Vec<f32> = self.loss.to_data().convert().value;
        write!(f, "{} (top1 {:.3}, top5 {:.3})", loss_val[0], self.top1, self.top5)
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for RecognizerOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<AccuracyInput<B>> for RecognizerOutput<B> {
    fn adapt(&self) -> AccuracyInput<B> {
        AccuracyInput::new(self.output.clone(), self.targets.clone())
    }
}

impl<B: AutodiffBackend> TrainStep<VideoBatch<B>, RecognizerOutput<B>> for Recognizer2D<B> {
    fn step(&self, batch: VideoBatch<B>) -> TrainOutput<RecognizerOutput<B>> {
        let item = self
            .forward_output(batch, false)
            .unwrap_or_else(|err| panic!("train step failed: {err}"));

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<VideoBatch<B>, RecognizerOutput<B>> for Recognizer2D<B> {
    fn step(&self, batch: VideoBatch<B>) -> RecognizerOutput<B> {
        self.forward_output(batch, true)
            .unwrap_or_else(|err| panic!("validation step failed: {err}"))
    }
}
