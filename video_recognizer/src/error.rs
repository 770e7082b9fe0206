use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = RecognizerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RecognizerError {
    #[error("recognizer has no head, scores cannot be produced")]
    MissingHead,
    #[error("head expects {expected} input channels but the backbone produces {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
    #[error("{kind} head needs the number of segments")]
    MissingSegments { kind: &'static str },
    #[error("{rows} feature rows cannot be grouped into segments of {num_segs}")]
    SegmentMismatch { rows: usize, num_segs: usize },
    #[error("{consumer} cannot consume {features} features")]
    UnsupportedFeatures {
        consumer: &'static str,
        features: &'static str,
    },
    #[error("axis of length {len} cannot be split into {clips} clips")]
    ClipSplit { len: usize, clips: usize },
    #[error("{scores} score rows but {labels} labels")]
    BatchMismatch { scores: usize, labels: usize },
    #[error("label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: i64, num_classes: usize },
    #[error("invalid dataset item {index}: {msg}")]
    InvalidItem { index: usize, msg: String },
    #[error("dataset is empty")]
    EmptyDataset,
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}:{line}: {source}")]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("artifact error: {0}")]
    Artifact(String),
    #[error("{0}")]
    Config(String),
}
