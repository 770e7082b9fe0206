use burn::{backend::Autodiff, data::dataset::Dataset, optim::AdamConfig, tensor::backend::Backend};
use clap::{Args, Parser, Subcommand, ValueEnum};
use video_recognizer::{inference, training::{self, TrainingConfig}, BackboneConfig, HeadConfig, HeadKind, RecognizerConfig, VideoDataset};

#[cfg(not(feature = "wgpu"))]
type MyBackend = burn::backend::NdArray<f32>;
#[cfg(feature = "wgpu")]
type MyBackend = burn::backend::Wgpu<burn::backend::wgpu::AutoGraphicsApi, f32, i32>;
type MyAutodiffBackend = Autodiff<MyBackend>;

#[derive(ValueEnum, Debug, Clone, Copy)]
enum HeadArg {
    Tsn,
    Tsm,
    TimeSformer,
}

impl From<HeadArg> for HeadKind {
    fn from(value: HeadArg) -> Self {
        match value {
            HeadArg::Tsn => HeadKind::Tsn,
            HeadArg::Tsm => HeadKind::Tsm,
            HeadArg::TimeSformer => HeadKind::TimeSformer,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "video_recognizer", about = "Train, test and run a 2D video recognizer")]
struct Cli {
    /// Directory holding config.json, checkpoints and the trained model.
    #[arg(long, default_value = "./video_recognizer/model")]
    artifact_dir: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a recognizer and save it to the artifact directory.
    Train(TrainArgs),
    /// Evaluate a trained recognizer in test mode.
    Test(DataArgs),
    /// Predict the class of one item.
    Infer {
        #[command(flatten)]
        data: DataArgs,
        /// Index of the item in the dataset.
        #[arg(long, default_value_t = 0)]
        index: usize,
    },
}

#[derive(Args, Debug)]
struct DataArgs {
    /// JSON-lines manifest; a synthetic dataset is generated when absent.
    #[arg(long)]
    manifest: Option<String>,
    /// Size of the synthetic dataset.
    #[arg(long, default_value_t = 32)]
    synthetic_len: usize,
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long, value_enum, default_value_t = HeadArg::Tsn)]
    head: HeadArg,
    #[arg(long, default_value_t = 4)]
    num_classes: usize,
    /// Segments per clip (frames per clip for the TimeSformer head).
    #[arg(long, default_value_t = 4)]
    num_segs: usize,
    #[arg(long, default_value_t = 32)]
    size: usize,
    #[arg(long)]
    train_manifest: Option<String>,
    #[arg(long)]
    valid_manifest: Option<String>,
    #[arg(long, default_value_t = 128)]
    synthetic_len: usize,
    #[arg(long, default_value_t = 10)]
    epochs: usize,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,
    #[arg(long, default_value_t = 0.0)]
    ls_eps: f32,
    /// Fixed mixup lambda; mixup is off when absent.
    #[arg(long)]
    mixup: Option<f32>,
}

fn load_or_synthesize(manifest: Option<&str>, len: usize, shape: [usize; 4], num_classes: usize, seed: u64) -> anyhow::Result<VideoDataset> {
    Ok(match manifest {
        Some(path) => VideoDataset::from_manifest(path)?,
        None => VideoDataset::synthetic(len, shape, num_classes, seed)?,
    })
}

fn run_train(artifact_dir: &str, args: TrainArgs) -> anyhow::Result<()> {
    let device = <MyBackend as Backend>::Device::default();
    let kind = HeadKind::from(args.head);
    let backbone = BackboneConfig::new();
    let shape = if kind.uses_segments() {
        [args.num_segs, backbone.in_channels, args.size, args.size]
    } else {
        [backbone.in_channels, args.num_segs, args.size, args.size]
    };
    let head = HeadConfig::new(kind, backbone.out_channels(), args.num_classes).with_ls_eps(args.ls_eps);

    let model = RecognizerConfig {
        backbone: Some(backbone),
        head: Some(head),
        num_test_clips: 3,
    };
    let config = TrainingConfig::new(model, AdamConfig::new())
        .with_num_epochs(args.epochs)
        .with_batch_size(args.batch_size)
        .with_learning_rate(args.lr)
        .with_mixup(args.mixup);

    let dataset_train = load_or_synthesize(args.train_manifest.as_deref(), args.synthetic_len, shape, args.num_classes, config.seed)?;
    let dataset_valid = load_or_synthesize(args.valid_manifest.as_deref(), args.synthetic_len / 4, shape, args.num_classes, config.seed + 1)?;

    training::train::<MyAutodiffBackend>(artifact_dir, config, dataset_train, dataset_valid, device)?;
    Ok(())
}

/// Synthetic test/infer data follows the trained model's input layout.
fn synthetic_shape(config: &TrainingConfig) -> anyhow::Result<([usize; 4], usize)> {
    let head = config.model.head.as_ref().ok_or_else(|| anyhow::anyhow!("trained model has no head"))?;
    let channels = config.model.backbone.as_ref().map_or(head.in_channels, |backbone| backbone.in_channels);
    let shape = if head.kind.uses_segments() {
        [4, channels, 32, 32]
    } else {
        [channels, 4 * config.model.num_test_clips, 32, 32]
    };
    Ok((shape, head.num_classes))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Train(args) => run_train(&cli.artifact_dir, args),
        Command::Test(args) => {
            tracing_subscriber::fmt::init();
            let device = <MyBackend as Backend>::Device::default();
            let (config, model) = inference::load_model::<MyBackend>(&cli.artifact_dir, &device)?;
            let (shape, num_classes) = synthetic_shape(&config)?;
            let dataset = load_or_synthesize(args.manifest.as_deref(), args.synthetic_len, shape, num_classes, args.seed)?;

            let report = inference::evaluate(&model, dataset, args.batch_size, device)?;
            println!("samples={} top1={:.4} top5={:.4}", report.samples, report.top1, report.top5);
            Ok(())
        }
        Command::Infer { data, index } => {
            tracing_subscriber::fmt::init();
            let device = <MyBackend as Backend>::Device::default();
            let (config, model) = inference::load_model::<MyBackend>(&cli.artifact_dir, &device)?;
            let (mut shape, num_classes) = synthetic_shape(&config)?;
            if !config.model.head.as_ref().map_or(true, |head| head.kind.uses_segments()) {
                // infer mode runs a single clip
                shape[1] /= config.model.num_test_clips;
            }
            let dataset = load_or_synthesize(data.manifest.as_deref(), data.synthetic_len, shape, num_classes, data.seed)?;
            let item = dataset
                .get(index)
                .ok_or_else(|| anyhow::anyhow!("index {index} out of range ({} items)", dataset.len()))?;

            let prediction = inference::predict(&model, device, item)?;
            println!("Predicted {} Expected {}", prediction.class, prediction.expected);
            Ok(())
        }
    }
}
