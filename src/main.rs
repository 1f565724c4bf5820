use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use clap::Parser;

use framestack::config::{AlignerKind, ComparatorKind};
use framestack::image_io::{load_image, save_image};
use framestack::stacking::MergeMode;
use framestack::{settings, Container, Progress, ProgressCallback};

/// Command line arguments structure.
#[derive(Parser, Debug)]
#[command(author, version, about = "Stack near-duplicate frames into one cleaner image.")]
struct Args {
    /// Input images, in sequence order
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output path for the stacked image
    #[arg(short, long, default_value = "stacked.png")]
    output: PathBuf,

    /// Alignment strategy: average, recursive, cluster, independent,
    /// linear, framecalculator, superres
    #[arg(long)]
    aligner: Option<String>,

    /// Offset search strategy: bruteforce, gradient, multiscale
    #[arg(long)]
    comparator: Option<String>,

    /// Merge mode: average, median, min, max, difference
    #[arg(long)]
    merge: Option<String>,

    /// Search range as a fraction of image size
    #[arg(long)]
    movement: Option<f64>,

    /// Metric sampling stride (1 = every pixel)
    #[arg(long)]
    stride: Option<usize>,

    /// Merge at most this many images
    #[arg(long)]
    max_count: Option<usize>,

    /// Persist the effective configuration for future runs
    #[arg(long)]
    save_settings: bool,
}

fn parse_aligner(name: &str) -> Result<AlignerKind> {
    Ok(match name {
        "average" => AlignerKind::Average,
        "recursive" => AlignerKind::Recursive,
        "cluster" => AlignerKind::Cluster,
        "independent" => AlignerKind::Independent,
        "linear" => AlignerKind::Linear,
        "framecalculator" => AlignerKind::FrameCalculator,
        "superres" => AlignerKind::SuperRes,
        _ => bail!("unknown aligner '{}'", name),
    })
}

fn parse_comparator(name: &str) -> Result<ComparatorKind> {
    Ok(match name {
        "bruteforce" => ComparatorKind::BruteForce,
        "gradient" => ComparatorKind::Gradient,
        "multiscale" => ComparatorKind::MultiScale,
        "logpolar" => ComparatorKind::LogPolar,
        _ => bail!("unknown comparator '{}'", name),
    })
}

fn parse_merge(name: &str) -> Result<MergeMode> {
    Ok(match name {
        "average" => MergeMode::Average,
        "median" => MergeMode::Median,
        "min" => MergeMode::Min,
        "max" => MergeMode::Max,
        "difference" => MergeMode::Difference,
        _ => bail!("unknown merge mode '{}'", name),
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = settings::load_settings();
    if let Some(ref name) = args.aligner {
        config.aligner = parse_aligner(name)?;
    }
    if let Some(ref name) = args.comparator {
        config.comparator = parse_comparator(name)?;
    }
    if let Some(ref name) = args.merge {
        config.merge_mode = parse_merge(name)?;
    }
    if let Some(movement) = args.movement {
        config.movement = movement;
    }
    if let Some(stride) = args.stride {
        config.stride = stride;
    }
    if let Some(max_count) = args.max_count {
        config.max_render_count = Some(max_count);
    }
    if args.save_settings {
        settings::save_settings(&config)?;
    }

    let mut container = Container::new(config.build_comparator());
    for path in &args.inputs {
        container.add_image(load_image(path)?);
    }

    let callback: ProgressCallback = Arc::new(Mutex::new(|msg: String, pct: f32| {
        println!("[{:5.1}%] {}", pct, msg);
    }));
    let mut progress = Progress::new(Some(callback), None);

    log::info!("Aligning {} images with {}", container.count(), config.aligner);
    config.build_aligner().align(&mut container, &mut progress)?;

    log::info!("Merging with {:?}", config.merge_mode);
    let result = config
        .build_renderer()
        .render(&container, config.max_render_count, &mut progress)?;
    save_image(&result, &args.output)?;
    println!("Saved {}", args.output.display());
    Ok(())
}
