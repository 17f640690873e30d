//! QuadStretch - capture two cameras and stretch a marked quadrilateral
//!
//! This application grabs one frame from each of two cameras (or image
//! files), takes four reference corners per frame, and perspective-warps
//! each marked region into a fixed-size upright rectangle.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

use quadstretch::capture::{FrameSource, ImageFile, V4l2Camera};
use quadstretch::config::Config;
use quadstretch::corners::{parse_points, CornerSource, FixedOffsetCorners, MarkedCorners};
use quadstretch::display::{annotate_corners, FrameSink, PngDirectory};
use quadstretch::pipeline::{capture_stage, stretch_stage, CaptureInput};
use quadstretch::transform::{Interpolation, TargetRect};

/// QuadStretch - perspective stretching for a pair of cameras
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "stretch.toml")]
    config: PathBuf,

    /// Read the first frame from an image file instead of the first camera
    #[arg(long)]
    image1: Option<PathBuf>,

    /// Read the second frame from an image file instead of the second camera
    #[arg(long)]
    image2: Option<PathBuf>,

    /// Marked corners for the first frame, as "x,y;x,y;x,y;x,y"
    #[arg(long)]
    corners1: Option<String>,

    /// Marked corners for the second frame, as "x,y;x,y;x,y;x,y"
    #[arg(long)]
    corners2: Option<String>,

    /// Output width (overrides config)
    #[arg(long)]
    target_width: Option<u32>,

    /// Output height (overrides config)
    #[arg(long)]
    target_height: Option<u32>,

    /// Use nearest-neighbour sampling instead of bilinear
    #[arg(long)]
    nearest: bool,

    /// Output directory (overrides config)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("QuadStretch v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_or_create(&args.config)?;

    config.target = TargetRect::new(
        args.target_width.unwrap_or(config.target.width),
        args.target_height.unwrap_or(config.target.height),
    )?;
    if args.nearest {
        config.rectify.interpolation = Interpolation::Nearest;
    }
    if let Some(dir) = &args.output_dir {
        config.output.directory = dir.clone();
    }
    config.validate()?;

    let target = config.target;
    let options = config.rectify;
    info!("Target: {}x{} ({:?})", target.width, target.height, options.interpolation);

    let inputs = [
        build_input(&config, 0, args.image1.as_ref(), args.corners1.as_deref())?,
        build_input(&config, 1, args.image2.as_ref(), args.corners2.as_deref())?,
    ];

    let captures = capture_stage(inputs, config.capture.timeout()).await;

    let mut sink = PngDirectory::create(&config.output.directory)?;

    if config.output.save_captures {
        for (i, capture) in captures.iter().enumerate() {
            if let Ok(capture) = capture {
                let marked = annotate_corners(&capture.image, &capture.corners);
                sink.present(&format!("capture_{}", i + 1), &marked)?;
            }
        }
    }

    let stretched = tokio::task::spawn_blocking(move || stretch_stage(captures, target, &options))
        .await
        .context("Stretch task panicked")?;

    let mut failures = 0;
    for (i, result) in stretched.into_iter().enumerate() {
        match result {
            Ok(stretched) => {
                debug!("{} transform: {:?}", stretched.source_name, stretched.transform.matrix());
                sink.present(&format!("stretched_{}", i + 1), &stretched.image)?;
            }
            Err(e) => {
                error!("Camera {}: {}", i + 1, e);
                failures += 1;
            }
        }
    }

    if failures == 2 {
        bail!("Neither frame could be stretched");
    }

    info!("Done: {} of 2 frames stretched, {} files in {:?}",
        2 - failures, sink.written().len(), config.output.directory);
    Ok(())
}

/// Pick the frame source and corner source for camera `index`
fn build_input(
    config: &Config,
    index: usize,
    image: Option<&PathBuf>,
    corners: Option<&str>,
) -> Result<CaptureInput> {
    let source: Arc<dyn FrameSource> = match image {
        Some(path) => Arc::new(ImageFile::new(path)),
        None => {
            let camera = &config.cameras[index];
            Arc::new(V4l2Camera::new(
                camera.device.clone(),
                camera.width,
                camera.height,
                config.capture.warmup_frames,
            ))
        }
    };

    let corner_source: Arc<dyn CornerSource> = match corners {
        Some(raw) => {
            let points = parse_points(raw)
                .with_context(|| format!("Invalid corners for camera {}", index + 1))?;
            Arc::new(MarkedCorners::new(points))
        }
        None => Arc::new(FixedOffsetCorners::new(config.corners.offset)),
    };

    info!("Camera {}: {}", index + 1, source.name());
    Ok(CaptureInput::new(source, corner_source))
}
