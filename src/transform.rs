//! Perspective rectification
//!
//! This module derives the perspective (homography) transform that maps a
//! marked quadrilateral onto an upright target rectangle, and resamples the
//! source image through it.

use image::RgbImage;
use nalgebra::Matrix3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::corners::{CornerSet, Point2D};
use crate::error::{StretchError, StretchResult};

/// Pivots smaller than this make the (normalized) DLT system singular
const PIVOT_EPSILON: f64 = 1e-10;

/// Slack for sample positions that land a rounding error outside the image
const EDGE_TOLERANCE: f64 = 1e-6;

/// Output rectangle size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRect {
    pub width: u32,
    pub height: u32,
}

impl Default for TargetRect {
    fn default() -> Self {
        Self {
            width: 300,
            height: 400,
        }
    }
}

impl TargetRect {
    pub fn new(width: u32, height: u32) -> StretchResult<Self> {
        let target = Self { width, height };
        target.check()?;
        Ok(target)
    }

    pub fn check(&self) -> StretchResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(StretchError::InvalidTarget {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }

    /// Rectangle corners in canonical order: (0,0), (W,0), (0,H), (W,H)
    pub fn corners(&self) -> [Point2D; 4] {
        let (w, h) = (self.width as f64, self.height as f64);
        [
            Point2D::new(0.0, 0.0),
            Point2D::new(w, 0.0),
            Point2D::new(0.0, h),
            Point2D::new(w, h),
        ]
    }
}

/// How source pixels are sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Weighted average of the four neighbouring pixels
    #[default]
    Bilinear,
    /// Closest pixel only. Faster, but blocky and lower fidelity.
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectifyOptions {
    #[serde(default)]
    pub interpolation: Interpolation,
    /// Fill colour (RGB) for target pixels that map outside the source
    #[serde(default)]
    pub background: [u8; 3],
}

impl Default for RectifyOptions {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::Bilinear,
            background: [0, 0, 0],
        }
    }
}

/// A 3x3 homography, normalized so the bottom-right entry is 1
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformMatrix {
    matrix: Matrix3<f64>,
}

impl TransformMatrix {
    /// Solve the homography mapping each `src[i]` onto `dst[i]`
    pub fn from_correspondences(src: &[Point2D; 4], dst: &[Point2D; 4]) -> StretchResult<Self> {
        // Condition both point sets before building the system
        let (t_src, src_n) = normalize_points(src)?;
        let (t_dst, dst_n) = normalize_points(dst)?;

        let h = compute_homography(&src_n, &dst_n)?;
        let h_n = Matrix3::from_row_slice(&h);

        let t_dst_inv = t_dst.try_inverse().ok_or(StretchError::SingularTransform)?;
        let full = t_dst_inv * h_n * t_src;

        let scale = full[(2, 2)];
        if !scale.is_finite() || scale.abs() < PIVOT_EPSILON {
            return Err(StretchError::SingularTransform);
        }
        let matrix = full / scale;

        if matrix.iter().any(|v| !v.is_finite()) || matrix.determinant().abs() < PIVOT_EPSILON {
            return Err(StretchError::SingularTransform);
        }

        Ok(Self { matrix })
    }

    /// Homography taking `corners` onto the corners of `target`
    pub fn to_target(corners: &CornerSet, target: TargetRect) -> StretchResult<Self> {
        Self::from_correspondences(corners.points(), &target.corners())
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Map a point through the transform; `None` when it lands at infinity
    #[inline]
    pub fn apply(&self, p: Point2D) -> Option<Point2D> {
        apply_homography(&self.matrix, p.x, p.y).map(|(x, y)| Point2D::new(x, y))
    }

    pub fn inverse(&self) -> StretchResult<Self> {
        let inv = self
            .matrix
            .try_inverse()
            .ok_or(StretchError::SingularTransform)?;
        let scale = inv[(2, 2)];
        if scale.abs() < PIVOT_EPSILON {
            // Still a valid homography, just not normalizable to h33 = 1
            return Ok(Self { matrix: inv });
        }
        Ok(Self { matrix: inv / scale })
    }

    pub fn is_identity(&self, tolerance: f64) -> bool {
        (self.matrix - Matrix3::identity()).iter().all(|v| v.abs() <= tolerance)
    }
}

/// Stretch the quadrilateral `corners` of `image` into a `target`-sized image
pub fn rectify(
    image: &RgbImage,
    corners: &CornerSet,
    target: TargetRect,
    options: &RectifyOptions,
) -> StretchResult<RgbImage> {
    rectify_with_transform(image, corners, target, options).map(|(out, _)| out)
}

/// Like [`rectify`], also returning the forward transform that was used
pub fn rectify_with_transform(
    image: &RgbImage,
    corners: &CornerSet,
    target: TargetRect,
    options: &RectifyOptions,
) -> StretchResult<(RgbImage, TransformMatrix)> {
    target.check()?;

    let forward = TransformMatrix::to_target(corners, target)?;
    let inverse = forward.inverse()?;

    let out = warp_image(image, &inverse, target, options);
    Ok((out, forward))
}

/// Resample `src` into a new image: each target pixel is pulled from the
/// source through `inverse`. Rows are processed in parallel.
fn warp_image(
    src: &RgbImage,
    inverse: &TransformMatrix,
    target: TargetRect,
    options: &RectifyOptions,
) -> RgbImage {
    let src_w = src.width() as usize;
    let src_h = src.height() as usize;
    let src_stride = src_w * 3;
    let src_raw: &[u8] = src.as_raw();

    let mut out = RgbImage::new(target.width, target.height);
    let dst_stride = target.width as usize * 3;
    let pixels: &mut [u8] = &mut out;

    pixels
        .par_chunks_mut(dst_stride)
        .enumerate()
        .for_each(|(dst_y, row)| {
            for (dst_x, px) in row.chunks_exact_mut(3).enumerate() {
                let sample = inverse
                    .apply(Point2D::new(dst_x as f64, dst_y as f64))
                    .and_then(|p| match options.interpolation {
                        Interpolation::Bilinear => {
                            bilinear_sample(src_raw, src_stride, src_w, src_h, p.x, p.y)
                        }
                        Interpolation::Nearest => {
                            nearest_sample(src_raw, src_stride, src_w, src_h, p.x, p.y)
                        }
                    })
                    .unwrap_or(options.background);
                px.copy_from_slice(&sample);
            }
        });

    out
}

/// Translate to the centroid and scale to mean distance sqrt(2)
fn normalize_points(points: &[Point2D; 4]) -> StretchResult<(Matrix3<f64>, [Point2D; 4])> {
    let cx = points.iter().map(|p| p.x).sum::<f64>() / 4.0;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / 4.0;
    let mean_dist = points
        .iter()
        .map(|p| (p.x - cx).hypot(p.y - cy))
        .sum::<f64>()
        / 4.0;

    if !mean_dist.is_finite() || mean_dist < PIVOT_EPSILON {
        return Err(StretchError::SingularTransform);
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = points.map(|p| Point2D::new(s * (p.x - cx), s * (p.y - cy)));

    Ok((t, normalized))
}

/// Compute a 3x3 homography matrix (row-major) from 4 point correspondences
/// using the Direct Linear Transform with h33 fixed to 1
fn compute_homography(src: &[Point2D; 4], dst: &[Point2D; 4]) -> StretchResult<[f64; 9]> {
    // For each correspondence (x,y) -> (x',y'):
    //   x*h1 + y*h2 + h3 - x'*x*h7 - x'*y*h8 = x'
    //   x*h4 + y*h5 + h6 - y'*x*h7 - y'*y*h8 = y'
    let mut a = [[0.0f64; 8]; 8];
    let mut b = [0.0f64; 8];

    for i in 0..4 {
        let (x, y) = (src[i].x, src[i].y);
        let (xp, yp) = (dst[i].x, dst[i].y);

        let row1 = i * 2;
        let row2 = i * 2 + 1;

        a[row1] = [x, y, 1.0, 0.0, 0.0, 0.0, -xp * x, -xp * y];
        b[row1] = xp;

        a[row2] = [0.0, 0.0, 0.0, x, y, 1.0, -yp * x, -yp * y];
        b[row2] = yp;
    }

    let h = solve_linear_system(&mut a, &mut b)?;

    Ok([h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0])
}

/// Solve an 8x8 linear system using Gaussian elimination with partial pivoting
fn solve_linear_system(a: &mut [[f64; 8]; 8], b: &mut [f64; 8]) -> StretchResult<[f64; 8]> {
    let n = 8;

    for col in 0..n {
        let mut max_row = col;
        let mut max_val = a[col][col].abs();
        for row in (col + 1)..n {
            if a[row][col].abs() > max_val {
                max_val = a[row][col].abs();
                max_row = row;
            }
        }

        if max_val < PIVOT_EPSILON {
            return Err(StretchError::SingularTransform);
        }

        if max_row != col {
            a.swap(col, max_row);
            b.swap(col, max_row);
        }

        let pivot = a[col][col];
        for row in (col + 1)..n {
            let factor = a[row][col] / pivot;
            for j in col..n {
                a[row][j] -= factor * a[col][j];
            }
            b[row] -= factor * b[col];
        }
    }

    // Back substitution
    let mut x = [0.0f64; 8];
    for i in (0..n).rev() {
        let mut sum = b[i];
        for j in (i + 1)..n {
            sum -= a[i][j] * x[j];
        }
        x[i] = sum / a[i][i];
    }

    if x.iter().any(|v| !v.is_finite()) {
        return Err(StretchError::SingularTransform);
    }

    Ok(x)
}

#[inline]
fn apply_homography(h: &Matrix3<f64>, x: f64, y: f64) -> Option<(f64, f64)> {
    let w = h[(2, 0)] * x + h[(2, 1)] * y + h[(2, 2)];
    if w.abs() < 1e-12 {
        return None;
    }
    let xp = (h[(0, 0)] * x + h[(0, 1)] * y + h[(0, 2)]) / w;
    let yp = (h[(1, 0)] * x + h[(1, 1)] * y + h[(1, 2)]) / w;
    Some((xp, yp))
}

#[inline]
fn inside(width: usize, height: usize, x: f64, y: f64) -> bool {
    x > -EDGE_TOLERANCE && x < width as f64 && y > -EDGE_TOLERANCE && y < height as f64
}

/// Bilinear interpolation sampling; `None` outside the image
#[inline]
fn bilinear_sample(
    src: &[u8],
    stride: usize,
    width: usize,
    height: usize,
    x: f64,
    y: f64,
) -> Option<[u8; 3]> {
    if !inside(width, height, x, y) {
        return None;
    }

    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let mut result = [0u8; 3];

    for (c, out) in result.iter_mut().enumerate() {
        let p00 = src.get(y0 * stride + x0 * 3 + c).copied()? as f64;
        let p10 = src.get(y0 * stride + x1 * 3 + c).copied()? as f64;
        let p01 = src.get(y1 * stride + x0 * 3 + c).copied()? as f64;
        let p11 = src.get(y1 * stride + x1 * 3 + c).copied()? as f64;

        let value = p00 * (1.0 - fx) * (1.0 - fy)
            + p10 * fx * (1.0 - fy)
            + p01 * (1.0 - fx) * fy
            + p11 * fx * fy;

        *out = value.round().clamp(0.0, 255.0) as u8;
    }

    Some(result)
}

/// Nearest-neighbour sampling; `None` outside the image
#[inline]
fn nearest_sample(
    src: &[u8],
    stride: usize,
    width: usize,
    height: usize,
    x: f64,
    y: f64,
) -> Option<[u8; 3]> {
    if !inside(width, height, x, y) {
        return None;
    }

    let x = (x.max(0.0).round() as usize).min(width - 1);
    let y = (y.max(0.0).round() as usize).min(height - 1);

    let offset = y * stride + x * 3;
    let px = src.get(offset..offset + 3)?;
    Some([px[0], px[1], px[2]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const RED: Rgb<u8> = Rgb([255, 0, 0]);
    const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
    const BLUE: Rgb<u8> = Rgb([0, 0, 255]);
    const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);

    /// 640x480 image with one solid colour per quadrant
    fn quadrant_image() -> RgbImage {
        RgbImage::from_fn(640, 480, |x, y| match (x < 320, y < 240) {
            (true, true) => RED,
            (false, true) => GREEN,
            (true, false) => BLUE,
            (false, false) => YELLOW,
        })
    }

    fn corner_set(raw: [(f64, f64); 4]) -> CornerSet {
        CornerSet::from_ordered(raw.map(Point2D::from))
    }

    fn assert_close(p: Point2D, x: f64, y: f64) {
        assert!(
            (p.x - x).abs() < 1e-6 && (p.y - y).abs() < 1e-6,
            "expected ({}, {}), got ({}, {})",
            x,
            y,
            p.x,
            p.y
        );
    }

    #[test]
    fn test_identity_transform() {
        let image = RgbImage::from_fn(40, 30, |x, y| Rgb([(x * 6) as u8, (y * 8) as u8, ((x + y) * 3) as u8]));
        let target = TargetRect::new(40, 30).unwrap();
        let corners = CornerSet::from_ordered(target.corners());

        let (out, h) =
            rectify_with_transform(&image, &corners, target, &RectifyOptions::default()).unwrap();

        assert!(h.is_identity(1e-9), "{:?}", h.matrix());
        assert_eq!(out.dimensions(), (40, 30));
        assert_eq!(out.as_raw(), image.as_raw());
    }

    #[test]
    fn test_corners_round_trip() {
        let corners = corner_set([(100.0, 60.0), (560.0, 40.0), (40.0, 440.0), (600.0, 420.0)]);
        let target = TargetRect::default();
        let h = TransformMatrix::to_target(&corners, target).unwrap();

        for (src, dst) in corners.points().iter().zip(target.corners()) {
            assert_close(h.apply(*src).unwrap(), dst.x, dst.y);
        }

        let inv = h.inverse().unwrap();
        for (src, dst) in corners.points().iter().zip(target.corners()) {
            assert_close(inv.apply(dst).unwrap(), src.x, src.y);
        }
    }

    #[test]
    fn test_quadrant_colours_follow_corners() {
        let image = quadrant_image();
        let quads = [
            corner_set([(50.0, 50.0), (590.0, 50.0), (50.0, 430.0), (590.0, 430.0)]),
            corner_set([(100.0, 60.0), (560.0, 40.0), (40.0, 440.0), (600.0, 420.0)]),
        ];
        let targets = [TargetRect::default(), TargetRect::new(120, 80).unwrap()];

        for corners in &quads {
            for &target in &targets {
                for interpolation in [Interpolation::Bilinear, Interpolation::Nearest] {
                    let options = RectifyOptions {
                        interpolation,
                        ..RectifyOptions::default()
                    };
                    let out = rectify(&image, corners, target, &options).unwrap();
                    assert_eq!(out.dimensions(), (target.width, target.height));

                    let (qx, qy) = (target.width / 4, target.height / 4);
                    assert_eq!(*out.get_pixel(qx, qy), RED);
                    assert_eq!(*out.get_pixel(3 * qx, qy), GREEN);
                    assert_eq!(*out.get_pixel(qx, 3 * qy), BLUE);
                    assert_eq!(*out.get_pixel(3 * qx, 3 * qy), YELLOW);
                }
            }
        }
    }

    #[test]
    fn test_center_maps_to_quad_center() {
        let image = RgbImage::from_fn(640, 480, |x, y| Rgb([(x / 3) as u8, (y / 2) as u8, 7]));
        let corners = corner_set([(50.0, 50.0), (590.0, 50.0), (50.0, 430.0), (590.0, 430.0)]);
        let target = TargetRect::new(300, 400).unwrap();

        let (out, h) =
            rectify_with_transform(&image, &corners, target, &RectifyOptions::default()).unwrap();
        assert_eq!(out.dimensions(), (300, 400));

        let center = h.inverse().unwrap().apply(Point2D::new(150.0, 200.0)).unwrap();
        assert_close(center, 320.0, 240.0);
        assert_eq!(out.get_pixel(150, 200), image.get_pixel(320, 240));
    }

    #[test]
    fn test_outside_source_uses_background() {
        let image = RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]));
        // Quad reaching 50px beyond every image edge
        let corners = corner_set([(-50.0, -50.0), (150.0, -50.0), (-50.0, 150.0), (150.0, 150.0)]);
        let target = TargetRect::new(200, 200).unwrap();
        let options = RectifyOptions {
            background: [255, 0, 255],
            ..RectifyOptions::default()
        };

        let out = rectify(&image, &corners, target, &options).unwrap();

        assert_eq!(*out.get_pixel(10, 10), Rgb([255, 0, 255]));
        assert_eq!(*out.get_pixel(199, 199), Rgb([255, 0, 255]));
        assert_eq!(*out.get_pixel(0, 100), Rgb([255, 0, 255]));
        assert_eq!(*out.get_pixel(100, 100), Rgb([255, 255, 255]));
        assert_eq!(*out.get_pixel(60, 60), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_collinear_corners_are_singular() {
        let corners = corner_set([(0.0, 0.0), (10.0, 0.0), (20.0, 0.0), (30.0, 0.0)]);
        let image = RgbImage::new(64, 48);
        let err = rectify(&image, &corners, TargetRect::default(), &RectifyOptions::default())
            .unwrap_err();
        assert!(matches!(err, StretchError::SingularTransform));
    }

    #[test]
    fn test_coincident_corners_are_singular() {
        let corners = corner_set([(5.0, 5.0); 4]);
        assert!(matches!(
            TransformMatrix::to_target(&corners, TargetRect::default()),
            Err(StretchError::SingularTransform)
        ));
    }

    #[test]
    fn test_invalid_target() {
        assert!(matches!(
            TargetRect::new(0, 400),
            Err(StretchError::InvalidTarget { width: 0, height: 400 })
        ));

        let corners = CornerSet::from_ordered(TargetRect::default().corners());
        let image = RgbImage::new(300, 400);
        let target = TargetRect { width: 300, height: 0 };
        assert!(rectify(&image, &corners, target, &RectifyOptions::default()).is_err());
    }

    #[test]
    fn test_sampling_never_reads_out_of_bounds() {
        let src = [10u8, 20, 30, 40, 50, 60];
        assert_eq!(bilinear_sample(&src, 6, 2, 1, 1.9, 0.0), Some([40, 50, 60]));
        assert_eq!(bilinear_sample(&src, 6, 2, 1, 2.0, 0.0), None);
        assert_eq!(bilinear_sample(&src, 6, 2, 1, -0.5, 0.0), None);
        assert_eq!(bilinear_sample(&src, 6, 2, 1, 0.5, 0.0), Some([25, 35, 45]));
        assert_eq!(nearest_sample(&src, 6, 2, 1, 1.9, 0.5), Some([40, 50, 60]));
        assert_eq!(nearest_sample(&src, 6, 2, 1, f64::NAN, 0.0), None);
        assert_eq!(bilinear_sample(&[], 0, 0, 0, 0.0, 0.0), None);
    }
}
