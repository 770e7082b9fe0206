pub mod backbone;
pub mod data;
pub mod error;
pub mod head;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod training;

pub use backbone::{BackboneConfig, ConvBackbone, Features};
pub use data::{Labels, VideoBatch, VideoBatcher, VideoDataset, VideoItem};
pub use error::{RecognizerError, Result};
pub use head::{Head, HeadConfig, HeadKind};
pub use metrics::LossMetrics;
pub use model::{Recognizer2D, RecognizerConfig, RecognizerOutput};
pub use training::TrainingConfig;
