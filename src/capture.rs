//! Still-frame capture from V4L2 devices and image files
//!
//! Each camera is opened, warmed up for a few frames, and a single frame is
//! converted to RGB. Opening and reading a device can block indefinitely, so
//! every grab runs on the blocking pool under a timeout.

use anyhow::{bail, Context, Result};
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::error::{StretchError, StretchResult};

/// Supported pixel formats in order of preference
const PREFERRED_FORMATS: &[&[u8; 4]] = &[
    b"MJPG", // Motion JPEG - most webcams offer full resolution only in MJPEG
    b"YUYV", // YUV 4:2:2
    b"RGB3",
    b"BGR3",
];

/// Anything that can produce one RGB frame on demand
pub trait FrameSource: Send + Sync {
    /// Human readable name for logs and errors
    fn name(&self) -> String;

    /// Produce a frame. May block.
    fn grab(&self) -> StretchResult<RgbImage>;
}

/// A V4L2 camera device such as `/dev/video0`
#[derive(Debug, Clone)]
pub struct V4l2Camera {
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Frames discarded before the kept one, while exposure settles
    pub warmup_frames: u32,
}

impl V4l2Camera {
    pub fn new(device: impl Into<String>, width: u32, height: u32, warmup_frames: u32) -> Self {
        Self {
            device: device.into(),
            width,
            height,
            warmup_frames,
        }
    }

    fn grab_frame(&self) -> Result<RgbImage> {
        let dev = Device::with_path(&self.device)
            .with_context(|| format!("Failed to open input device: {}", self.device))?;

        let caps = dev.query_caps()
            .context("Failed to query device capabilities")?;
        info!("Camera {}: {} (driver: {})", self.device, caps.card, caps.driver);

        let format = configure_capture_format(&dev, self.width, self.height)?;

        let mut stream = Stream::with_buffers(&dev, Type::VideoCapture, 4)
            .context("Failed to create capture stream")?;

        for _ in 0..self.warmup_frames {
            stream.next().context("Failed to capture warm-up frame")?;
        }

        let (buf, _meta) = stream.next()
            .context("Failed to capture frame")?;

        frame_to_rgb(buf, &format.fourcc.repr, format.width, format.height)
    }
}

impl FrameSource for V4l2Camera {
    fn name(&self) -> String {
        self.device.clone()
    }

    fn grab(&self) -> StretchResult<RgbImage> {
        self.grab_frame()
            .map_err(|e| StretchError::capture(&self.device, format!("{:#}", e)))
    }
}

/// A still image on disk standing in for a camera
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub path: PathBuf,
}

impl ImageFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FrameSource for ImageFile {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn grab(&self) -> StretchResult<RgbImage> {
        let img = image::open(&self.path).map_err(|e| StretchError::capture(self.name(), e))?;
        debug!("Loaded {} ({}x{})", self.name(), img.width(), img.height());
        Ok(img.to_rgb8())
    }
}

/// Grab one frame on the blocking pool, giving up after `timeout`.
///
/// A device stuck past the deadline is abandoned; its thread finishes in the
/// background and the result is dropped.
pub async fn capture_frame(source: Arc<dyn FrameSource>, timeout: Duration) -> StretchResult<RgbImage> {
    let name = source.name();
    let task = tokio::task::spawn_blocking(move || source.grab());

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(StretchError::capture(name, format!("capture task failed: {}", e))),
        Err(_) => {
            warn!("No frame from {} within {} ms", name, timeout.as_millis());
            Err(StretchError::capture(
                name,
                format!("no frame within {} ms", timeout.as_millis()),
            ))
        }
    }
}

/// Configure the capture format, trying preferred formats in order
fn configure_capture_format(dev: &Device, width: u32, height: u32) -> Result<v4l::Format> {
    let formats = dev.enum_formats()
        .context("Failed to enumerate formats")?;

    for fmt in &formats {
        debug!("  available: {:?}: {}", String::from_utf8_lossy(&fmt.fourcc.repr), fmt.description);
    }

    for preferred in PREFERRED_FORMATS {
        let fourcc = FourCC::new(preferred);
        if !formats.iter().any(|f| f.fourcc == fourcc) {
            continue;
        }

        let mut format = dev.format()
            .context("Failed to get current format")?;
        format.width = width;
        format.height = height;
        format.fourcc = fourcc;

        match dev.set_format(&format) {
            Ok(actual) if actual.fourcc == fourcc => {
                info!("Capture format: {}x{} {:?}",
                    actual.width, actual.height,
                    String::from_utf8_lossy(&actual.fourcc.repr));
                return Ok(actual);
            }
            Ok(actual) => {
                warn!("Device switched {:?} to {:?}",
                    String::from_utf8_lossy(*preferred),
                    String::from_utf8_lossy(&actual.fourcc.repr));
            }
            Err(e) => {
                warn!("Could not set format {:?} at {}x{}: {}",
                    String::from_utf8_lossy(*preferred), width, height, e);
            }
        }
    }

    bail!("device offers none of the supported formats (MJPG, YUYV, RGB3, BGR3)")
}

/// Convert a raw frame in the given fourcc to an RGB image
pub fn frame_to_rgb(buf: &[u8], fourcc: &[u8; 4], width: u32, height: u32) -> Result<RgbImage> {
    let pixels = width as usize * height as usize;

    let rgb = match fourcc {
        b"MJPG" => return decode_mjpeg(buf),
        b"YUYV" => {
            if buf.len() < pixels * 2 {
                bail!("short YUYV frame: {} bytes for {}x{}", buf.len(), width, height);
            }
            let mut rgb = vec![0u8; pixels * 3];
            yuyv_to_rgb(buf, &mut rgb, width as usize, height as usize);
            rgb
        }
        b"BGR3" => {
            let mut rgb = vec![0u8; pixels * 3];
            bgr_to_rgb(buf, &mut rgb);
            rgb
        }
        b"RGB3" => buf
            .get(..pixels * 3)
            .context("short RGB frame")?
            .to_vec(),
        other => bail!("unsupported pixel format {:?}", String::from_utf8_lossy(other)),
    };

    RgbImage::from_raw(width, height, rgb)
        .with_context(|| format!("frame does not fill {}x{}", width, height))
}

/// Decode an MJPEG frame to RGB
fn decode_mjpeg(mjpeg_data: &[u8]) -> Result<RgbImage> {
    use std::io::Cursor;

    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(mjpeg_data));
    let pixels = decoder.decode().context("Failed to decode MJPEG frame")?;
    let info = decoder.info().context("MJPEG frame has no header")?;
    let (width, height) = (info.width as u32, info.height as u32);

    let rgb = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => pixels,
        jpeg_decoder::PixelFormat::L8 => pixels.iter().flat_map(|&g| [g, g, g]).collect(),
        other => bail!("unsupported JPEG pixel format {:?}", other),
    };

    RgbImage::from_raw(width, height, rgb)
        .with_context(|| format!("decoded JPEG does not fill {}x{}", width, height))
}

/// Convert YUYV to RGB using fast integer math (no floating point)
/// Uses fixed-point arithmetic with 8-bit shift for BT.601 color conversion
#[inline]
pub fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut [u8], width: usize, height: usize) {
    let pixels = width * height;

    // 4 bytes YUYV -> 6 bytes RGB
    for (src, dst) in yuyv
        .chunks_exact(4)
        .zip(rgb.chunks_exact_mut(6))
        .take(pixels / 2)
    {
        let y0 = src[0] as i32;
        let u = src[1] as i32 - 128;
        let y1 = src[2] as i32;
        let v = src[3] as i32 - 128;

        // R = Y + 1.402 * V, G = Y - 0.344 * U - 0.714 * V, B = Y + 1.772 * U
        let v_r = (359 * v) >> 8;
        let uv_g = (88 * u + 183 * v) >> 8;
        let u_b = (454 * u) >> 8;

        dst[0] = (y0 + v_r).clamp(0, 255) as u8;
        dst[1] = (y0 - uv_g).clamp(0, 255) as u8;
        dst[2] = (y0 + u_b).clamp(0, 255) as u8;

        dst[3] = (y1 + v_r).clamp(0, 255) as u8;
        dst[4] = (y1 - uv_g).clamp(0, 255) as u8;
        dst[5] = (y1 + u_b).clamp(0, 255) as u8;
    }
}

/// Convert BGR to RGB (swap R and B channels)
#[inline]
pub fn bgr_to_rgb(bgr: &[u8], rgb: &mut [u8]) {
    for (bgr_chunk, rgb_chunk) in bgr.chunks_exact(3).zip(rgb.chunks_exact_mut(3)) {
        rgb_chunk[0] = bgr_chunk[2];
        rgb_chunk[1] = bgr_chunk[1];
        rgb_chunk[2] = bgr_chunk[0];
    }
}
