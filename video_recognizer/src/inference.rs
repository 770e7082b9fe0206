use burn::{config::Config, data::dataloader::{batcher::Batcher, DataLoaderBuilder}, module::Module, record::{CompactRecorder, Recorder}, tensor::{activation::softmax, backend::Backend}};
use tracing::{debug, info};

use crate::{data::{VideoBatcher, VideoDataset, VideoItem}, error::{RecognizerError, Result}, metrics::{topk_accuracy, AccuracyAccumulator, TOP_K}, model::Recognizer2D, training::TrainingConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationReport {
    pub samples: usize,
    pub top1: f32,
    pub top5: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub class: usize,
    pub probability: f32,
    pub expected: usize,
}

/// Restores the config and weights written by `training::train`.
pub fn load_model<B: Backend>(artifact_dir: &str, device: &B::Device) -> Result<(TrainingConfig, Recognizer2D<B>)> {
    let config = TrainingConfig::load(format!("{artifact_dir}/config.json"))
        .map_err(|err| RecognizerError::Artifact(format!("loading config: {err:?}")))?;
    let record = CompactRecorder::new()
        .load(format!("{artifact_dir}/model").into(), device)
        .map_err(|err| RecognizerError::Artifact(format!("loading model: {err:?}")))?;

    let model = config.model.init::<B>(device)?.load_record(record);
    Ok((config, model))
}

/// Runs the test step over a whole dataset and reports top-1/top-5 accuracy.
pub fn evaluate<B: Backend>(model: &Recognizer2D<B>, dataset: VideoDataset, batch_size: usize, device: B::Device) -> Result<EvaluationReport> {
    let batcher = VideoBatcher::<B>::new(device);
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size.max(1))
        .build(dataset);

    let mut accuracy = AccuracyAccumulator::default();
    for batch in dataloader.iter() {
        let targets = batch.labels.primary();
        let [batch_len] = targets.dims();
        let scores = model.test_step(batch)?.ok_or(RecognizerError::MissingHead)?;

        let top1 = topk_accuracy(scores.clone(), targets.clone(), 1)?;
        let top5 = topk_accuracy(scores, targets, TOP_K)?;
        debug!(batch_len, top1, top5, "test batch");
        accuracy.update(top1, top5, batch_len);
    }

    let (top1, top5) = accuracy.accuracy();
    let report = EvaluationReport {
        samples: accuracy.samples(),
        top1,
        top5,
    };
    info!(samples = report.samples, top1, top5, "evaluation finished");
    Ok(report)
}

/// Infer-mode prediction for a single item.
pub fn predict<B: Backend>(model: &Recognizer2D<B>, device: B::Device, item: VideoItem) -> Result<Prediction> {
    item.check(0)?;
    let expected = item.label;
    let batcher = VideoBatcher::<B>::new(device);
    let batch = batcher.batch(vec![item]);

    let scores = model.infer_step(batch.imgs)?.ok_or(RecognizerError::MissingHead)?;
    let probs = softmax(scores, 1).into_data().convert::<f32>().value;
    let (class, probability) = probs
        .into_iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (class, p)| if p > best.1 { (class, p) } else { best });

    info!("Predicted {} ({:.3}) Expected {}", class, probability, expected);
    Ok(Prediction {
        class,
        probability,
        expected,
    })
}

pub fn infer<B: Backend>(artifact_dir: &str, device: B::Device, item: VideoItem) -> Result<Prediction> {
    let (_, model) = load_model::<B>(artifact_dir, &device)?;
    predict(&model, device, item)
}
