use burn::{config::Config, module::Module, nn::{conv::{Conv2d, Conv2dConfig}, pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig}, BatchNorm, BatchNormConfig, PaddingConfig2d, ReLU}, tensor::{backend::Backend, Tensor}};

use crate::error::{RecognizerError, Result};

/// What flows from the backbone (or straight from the input when there is
/// no backbone) into the head.
#[derive(Debug, Clone)]
pub enum Features<B: Backend> {
    /// Per-frame feature maps, time folded into the batch: `[N*T, C, H, W]`.
    Frames(Tensor<B, 4>),
    /// A whole clip in channel-first layout: `[N, C, T, H, W]`.
    Clip(Tensor<B, 5>),
    /// Pooled vectors, one row per frame or per clip: `[M, D]`.
    Embedding(Tensor<B, 2>),
}

impl<B: Backend> Features<B> {
    pub fn name(&self) -> &'static str {
        match self {
            Features::Frames(_) => "frame",
            Features::Clip(_) => "clip",
            Features::Embedding(_) => "embedding",
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Features::Frames(x) => x.dims()[1],
            Features::Clip(x) => x.dims()[1],
            Features::Embedding(x) => x.dims()[1],
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: ReLU,
}

impl<B: Backend> ConvBlock<B> {
    fn new(channels: [usize; 2], stride: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new(channels, [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            norm: BatchNormConfig::new(channels[1]).init(device),
            activation: ReLU::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        self.activation.forward(x)
    }
}

/// 2D convolutional frame encoder.
///
/// A stride-1 stem followed by `depth` stages, each doubling the channels and
/// halving the resolution.
#[derive(Module, Debug)]
pub struct ConvBackbone<B: Backend> {
    stem: ConvBlock<B>,
    stages: Vec<ConvBlock<B>>,
    pool: AdaptiveAvgPool2d,
    in_channels: usize,
    out_channels: usize,
}

#[derive(Config, Debug)]
pub struct BackboneConfig {
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 16)]
    pub stem_channels: usize,
    #[config(default = 2)]
    pub depth: usize,
}

impl BackboneConfig {
    pub fn out_channels(&self) -> usize {
        self.stem_channels << self.depth
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBackbone<B> {
        let stages = (0..self.depth)
            .map(|i| {
                let channels_in = self.stem_channels << i;
                ConvBlock::new([channels_in, channels_in * 2], 2, device)
            })
            .collect();

        ConvBackbone {
            stem: ConvBlock::new([self.in_channels, self.stem_channels], 1, device),
            stages,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            in_channels: self.in_channels,
            out_channels: self.out_channels(),
        }
    }
}

impl<B: Backend> ConvBackbone<B> {
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// `[M, C, H, W]` -> `[M, F, H / 2^depth, W / 2^depth]`
    pub fn forward_frames(&self, frames: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem.forward(frames);
        self.stages.iter().fold(x, |x, stage| stage.forward(x))
    }

    /// `[N, C, T, H, W]` -> `[N, F]`, frames are encoded independently and
    /// averaged over time.
    pub fn forward_clip(&self, clip: Tensor<B, 5>) -> Tensor<B, 2> {
        let [n, c, t, h, w] = clip.dims();
        let frames = clip.swap_dims(1, 2).reshape([n * t, c, h, w]);

        let x = self.forward_frames(frames);
        let x = self.pool.forward(x);
        let x = x.reshape([n, t, self.out_channels]);

        x.mean_dim(1).reshape([n, self.out_channels])
    }

    pub fn forward(&self, features: Features<B>) -> Result<Features<B>> {
        if !matches!(features, Features::Embedding(_)) && features.channels() != self.in_channels {
            return Err(RecognizerError::ChannelMismatch {
                expected: self.in_channels,
                actual: features.channels(),
            });
        }

        match features {
            Features::Frames(frames) => Ok(Features::Frames(self.forward_frames(frames))),
            Features::Clip(clip) => Ok(Features::Embedding(self.forward_clip(clip))),
            other => Err(RecognizerError::UnsupportedFeatures {
                consumer: "backbone",
                features: other.name(),
            }),
        }
    }
}
