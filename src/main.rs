use std::{error::Error, path::PathBuf, process::ExitCode, time::Instant};

use clap::{Parser, ValueEnum};
use craft_train::{
    visualize, CraftError, CraftLoss, CraftNet, GeneratorBuilder, LossKind, Manifest, SourceKind,
    DEFAULT_PROVIDERS,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "craft-train",
    about = "Ground-truth synthesis and loss driver for character-region text detection"
)]
struct Args {
    /// Weight of the foreground loss term.
    #[arg(long, default_value_t = 1.0)]
    alpha: f32,
    /// Learning rate for the external optimizer; recorded here so runs are
    /// reproducible from the logs alone.
    #[arg(long, default_value_t = 1e-4)]
    learning_rate: f32,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 768)]
    canvas_size: u32,
    #[arg(long, alias = "iter", default_value_t = 100_000)]
    iterations: usize,
    /// JSON annotation manifest with train/test (and optionally fake) lists.
    #[arg(long, default_value = "dataset/manifest.json")]
    manifest: PathBuf,
    /// Mix in the manifest's synthetic entries at a 5:1 real/fake ratio.
    #[arg(long, default_value_t = false)]
    use_fake: bool,
    /// ONNX detection model; enables forward passes and loss reporting.
    #[arg(long)]
    model: Option<PathBuf>,
    #[arg(long, default_value_t = 4)]
    threads: usize,
    /// Directory for diagnostic snapshots.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = LossArg::Mse)]
    loss: LossArg,
    /// Seed for shuffling, source draws and crop augmentation.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LossArg {
    Mse,
    Mae,
    Huber,
}

impl From<LossArg> for LossKind {
    fn from(value: LossArg) -> Self {
        match value {
            LossArg::Mse => LossKind::Mse,
            LossArg::Mae => LossKind::Mae,
            LossArg::Huber => LossKind::Huber,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("fatal: {error}");
            let mut source = error.source();
            while let Some(cause) = source {
                tracing::error!("caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), CraftError> {
    let mut manifest = Manifest::load(&args.manifest)?;
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    manifest.train.shuffle(&mut rng);
    manifest.test.shuffle(&mut rng);
    log::info!(
        "{} train / {} test samples, lr {}",
        manifest.train.len(),
        manifest.test.len(),
        args.learning_rate
    );

    let mut builder = GeneratorBuilder::new(args.canvas_size, args.iterations).source(
        SourceKind::Real,
        manifest.train,
        if args.use_fake { 5.0 } else { 1.0 },
    );
    if args.use_fake {
        if manifest.fake.is_empty() {
            return Err(CraftError::Config {
                message: "--use-fake set but the manifest has no fake entries".into(),
            });
        }
        // the synthetic path also needs a CharBoxEstimator wired through
        // GeneratorBuilder::estimator; none ships with this binary
        return Err(CraftError::Config {
            message: "--use-fake requires a character-box estimator implementation".into(),
        });
    }
    if let Some(seed) = args.seed {
        builder = builder.seed(seed);
    }
    let mut generator = builder.build()?;

    let model = args
        .model
        .clone()
        .map(|path| {
            CraftNet::init(
                path,
                args.threads,
                args.canvas_size,
                DEFAULT_PROVIDERS,
                None,
            )
        })
        .transpose()?;
    let loss = CraftLoss::new(args.loss.into(), args.alpha);

    log::info!("training start");
    for idx in 0..args.iterations {
        let start = Instant::now();
        let batch = generator.get_batch(args.batch_size).map_err(|error| {
            tracing::error!(iteration = idx + 1, "batch assembly failed");
            error
        })?;

        let snapshot_due = idx % 50 == 0;
        if let Some(model) = &model {
            let heatmaps = model.forward(batch.images.view())?;
            let output = match loss.forward(
                batch.regions.view(),
                batch.affinities.view(),
                heatmaps.region.view(),
                heatmaps.affinity.view(),
                batch.confidences.view(),
                batch.fg_masks.view(),
                batch.bg_masks.view(),
            ) {
                Ok(output) => output,
                Err(error) => {
                    // dump the offending batch before going down
                    if let Err(dump) = visualize::save_batch_images(&args.log_dir, idx, &batch, "error_")
                    {
                        log::warn!("error-batch dump failed: {dump}");
                    }
                    return Err(error);
                }
            };
            log::info!(
                "iteration {}, batch loss {:.6} ({:?})",
                idx + 1,
                output.total,
                start.elapsed()
            );
            if snapshot_due {
                visualize::save_batch_images(&args.log_dir, idx, &batch, "")?;
                let prefix = format!("iter{}", idx + 1);
                visualize::save_heatmap_log(
                    &args.log_dir,
                    &prefix,
                    "region",
                    output.region,
                    heatmaps.region.view(),
                    batch.regions.view(),
                    batch.fg_masks.view(),
                    output.hard_bg_mask.view(),
                )?;
                visualize::save_heatmap_log(
                    &args.log_dir,
                    &prefix,
                    "affinity",
                    output.affinity,
                    heatmaps.affinity.view(),
                    batch.affinities.view(),
                    batch.fg_masks.view(),
                    output.hard_bg_mask.view(),
                )?;
            }
        } else {
            log::info!(
                "iteration {}, assembled {} samples ({:?})",
                idx + 1,
                batch.len(),
                start.elapsed()
            );
            if snapshot_due {
                visualize::save_batch_images(&args.log_dir, idx, &batch, "")?;
            }
        }
    }
    Ok(())
}
