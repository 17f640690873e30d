//! Capture and stretch stages for the camera pair
//!
//! Data flows explicitly between stages: the capture stage hands back one
//! `Capture` (frame plus corners) per camera, and the stretch stage consumes
//! those and returns the rectified frames. Nothing is retained between runs.

use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::capture::{capture_frame, FrameSource};
use crate::corners::{CornerSet, CornerSource};
use crate::error::StretchResult;
use crate::transform::{rectify_with_transform, RectifyOptions, TargetRect, TransformMatrix};

/// Where one camera's frame and corners come from
#[derive(Clone)]
pub struct CaptureInput {
    pub source: Arc<dyn FrameSource>,
    pub corners: Arc<dyn CornerSource>,
}

impl CaptureInput {
    pub fn new(source: Arc<dyn FrameSource>, corners: Arc<dyn CornerSource>) -> Self {
        Self { source, corners }
    }
}

/// A captured frame with its validated corners
#[derive(Debug)]
pub struct Capture {
    pub source_name: String,
    pub image: RgbImage,
    pub corners: CornerSet,
}

/// A rectified frame
#[derive(Debug)]
pub struct Stretched {
    pub source_name: String,
    pub image: RgbImage,
    /// Forward transform from the captured frame into `image`
    pub transform: TransformMatrix,
}

/// Capture both cameras concurrently, each bounded by `timeout`
pub async fn capture_stage(
    inputs: [CaptureInput; 2],
    timeout: Duration,
) -> [StretchResult<Capture>; 2] {
    let [first, second] = inputs;
    let (a, b) = tokio::join!(capture_one(first, timeout), capture_one(second, timeout));
    [a, b]
}

async fn capture_one(input: CaptureInput, timeout: Duration) -> StretchResult<Capture> {
    let source_name = input.source.name();
    let start = Instant::now();

    let image = capture_frame(input.source, timeout).await?;
    debug!("Captured {}x{} from {} in {} ms",
        image.width(), image.height(), source_name, start.elapsed().as_millis());

    let corners = input.corners.acquire(&image)?;
    let centre = corners.centroid();
    debug!("Corners for {} centred at ({:.1}, {:.1})", source_name, centre.x, centre.y);

    Ok(Capture {
        source_name,
        image,
        corners,
    })
}

/// Rectify both captures in parallel. A failed capture stays failed.
pub fn stretch_stage(
    captures: [StretchResult<Capture>; 2],
    target: TargetRect,
    options: &RectifyOptions,
) -> [StretchResult<Stretched>; 2] {
    let [first, second] = captures;
    let (a, b) = rayon::join(
        || first.and_then(|c| stretch_one(c, target, options)),
        || second.and_then(|c| stretch_one(c, target, options)),
    );
    [a, b]
}

fn stretch_one(capture: Capture, target: TargetRect, options: &RectifyOptions) -> StretchResult<Stretched> {
    let start = Instant::now();
    let (image, transform) = rectify_with_transform(&capture.image, &capture.corners, target, options)?;

    info!("Stretched {} to {}x{} in {} ms",
        capture.source_name, target.width, target.height, start.elapsed().as_millis());
    if transform.is_identity(1e-9) {
        debug!("{} was already rectified", capture.source_name);
    }

    Ok(Stretched {
        source_name: capture.source_name,
        image,
        transform,
    })
}
