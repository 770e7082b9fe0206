use burn::{config::Config, data::{dataloader::DataLoaderBuilder, dataset::Dataset}, module::Module, optim::AdamConfig, record::CompactRecorder, tensor::backend::AutodiffBackend, train::{metric::{store::{Aggregate, Direction, Split}, AccuracyMetric, CpuMemory, CpuUse, LossMetric}, LearnerBuilder, MetricEarlyStoppingStrategy, StoppingCondition}};
use tracing::info;

use crate::{data::{VideoBatcher, VideoDataset}, error::{RecognizerError, Result}, model::{Recognizer2D, RecognizerConfig}};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: RecognizerConfig,
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 2)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// Fixed mixup lambda for training batches.
    pub mixup: Option<f32>,
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &str,
    config: TrainingConfig,
    dataset_train: VideoDataset,
    dataset_valid: VideoDataset,
    device: B::Device,
) -> Result<Recognizer2D<B>> {
    std::fs::create_dir_all(artifact_dir).map_err(|source| RecognizerError::Io {
        path: artifact_dir.into(),
        source,
    })?;
    let config_path = format!("{artifact_dir}/config.json");
    config.save(&config_path).map_err(|source| RecognizerError::Io {
        path: config_path.into(),
        source,
    })?;

    B::seed(config.seed);

    let model = config.model.init::<B>(&device)?;
    if model.head().is_none() {
        return Err(RecognizerError::MissingHead);
    }

    let batcher_train = match config.mixup {
        Some(lam) => VideoBatcher::<B>::new(device.clone()).with_mixup(lam),
        None => VideoBatcher::<B>::new(device.clone()),
    };
    let batcher_valid = VideoBatcher::<B::InnerBackend>::new(device.clone());

    info!(len = dataset_train.len(), "train dataset");
    info!(len = dataset_valid.len(), "valid dataset");

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset_valid);

    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(CpuUse::new())
        .metric_valid_numeric(CpuUse::new())
        .metric_train_numeric(CpuMemory::new())
        .metric_valid_numeric(CpuMemory::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .early_stopping(MetricEarlyStoppingStrategy::new::<LossMetric<B>>(
            Aggregate::Mean,
            Direction::Lowest,
            Split::Valid,
            StoppingCondition::NoImprovementSince { n_epochs: 2 },
        ))
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .build(model, config.optimizer.init(), config.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_valid);
    model_trained
        .clone()
        .save_file(format!("{artifact_dir}/model"), &CompactRecorder::new())
        .map_err(|err| RecognizerError::Artifact(format!("saving model: {err:?}")))?;
    info!(artifact_dir, "model saved");

    Ok(model_trained)
}
