//! Corner points, validation and canonical ordering
//!
//! A stretch needs four reference corners per image. This module checks that
//! the points span a real quadrilateral and labels them A (top-left),
//! B (top-right), C (bottom-left) and D (bottom-right).

use anyhow::{bail, Context};
use image::RgbImage;

use crate::error::{StretchError, StretchResult};

/// Tolerance for coincidence and collinearity tests, relative to the
/// squared extent of the point set
pub const GEOMETRY_EPSILON: f64 = 1e-6;

/// A point in image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point2D) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl From<(f64, f64)> for Point2D {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Corner labels in canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CornerLabel {
    A,
    B,
    C,
    D,
}

impl CornerLabel {
    pub const ALL: [CornerLabel; 4] = [CornerLabel::A, CornerLabel::B, CornerLabel::C, CornerLabel::D];

    pub fn index(&self) -> usize {
        match self {
            CornerLabel::A => 0,
            CornerLabel::B => 1,
            CornerLabel::C => 2,
            CornerLabel::D => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CornerLabel::A => "Top Left",
            CornerLabel::B => "Top Right",
            CornerLabel::C => "Bottom Left",
            CornerLabel::D => "Bottom Right",
        }
    }
}

/// Four corners in canonical order: top-left, top-right, bottom-left, bottom-right
#[derive(Debug, Clone, PartialEq)]
pub struct CornerSet {
    points: [Point2D; 4],
}

impl CornerSet {
    /// Wrap corners that are already in canonical order, without checking them.
    ///
    /// Use [`validate`] for anything coming from a user or a detector.
    pub fn from_ordered(points: [Point2D; 4]) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Point2D; 4] {
        &self.points
    }

    pub fn get(&self, label: CornerLabel) -> Point2D {
        self.points[label.index()]
    }

    /// Corners paired with their labels
    pub fn labeled(&self) -> impl Iterator<Item = (CornerLabel, Point2D)> + '_ {
        CornerLabel::ALL.into_iter().map(move |label| (label, self.get(label)))
    }

    pub fn centroid(&self) -> Point2D {
        centroid(&self.points)
    }

    /// Corners in drawing order around the outline (A, B, D, C)
    pub fn outline(&self) -> [Point2D; 4] {
        let [a, b, c, d] = self.points;
        [a, b, d, c]
    }
}

/// Validate four points against an image of `width` x `height` and return
/// them in canonical order
pub fn validate(points: &[Point2D], width: u32, height: u32) -> StretchResult<CornerSet> {
    if points.len() > 4 {
        return Err(StretchError::TooManyPoints { found: points.len() });
    }

    let distinct = count_distinct(points);
    if points.len() < 4 || distinct < 4 {
        return Err(StretchError::InsufficientPoints { found: distinct });
    }

    for p in points {
        let inside = p.x >= 0.0 && p.x < width as f64 && p.y >= 0.0 && p.y < height as f64;
        if !inside {
            return Err(StretchError::PointOutOfBounds { x: p.x, y: p.y, width, height });
        }
    }

    let quad = [points[0], points[1], points[2], points[3]];
    let tolerance = area_tolerance(&quad);

    // Every triple must span a triangle
    for skip in 0..4 {
        let tri: Vec<Point2D> = (0..4).filter(|&i| i != skip).map(|i| quad[i]).collect();
        if cross(tri[0], tri[1], tri[2]).abs() < tolerance {
            return Err(StretchError::DegenerateGeometry(format!(
                "points ({:.1}, {:.1}), ({:.1}, {:.1}), ({:.1}, {:.1}) are collinear",
                tri[0].x, tri[0].y, tri[1].x, tri[1].y, tri[2].x, tri[2].y
            )));
        }
    }

    let Some(ordered) = canonical_order(quad) else {
        return Err(StretchError::DegenerateGeometry(
            "corners do not form a convex quadrilateral".to_string(),
        ));
    };

    tracing::debug!(
        "Validated corners: A=({:.1}, {:.1}) B=({:.1}, {:.1}) C=({:.1}, {:.1}) D=({:.1}, {:.1})",
        ordered[0].x, ordered[0].y, ordered[1].x, ordered[1].y,
        ordered[2].x, ordered[2].y, ordered[3].x, ordered[3].y
    );

    Ok(CornerSet::from_ordered(ordered))
}

/// Sort four points into top-left, top-right, bottom-left, bottom-right.
///
/// The points are walked around the centroid so the result always traces the
/// outline without crossing itself; `None` when that outline is not convex.
fn canonical_order(points: [Point2D; 4]) -> Option<[Point2D; 4]> {
    let c = centroid(&points);

    // Clockwise on screen (y grows downwards)
    let mut ring = points;
    ring.sort_by(|a, b| {
        let ta = (a.y - c.y).atan2(a.x - c.x);
        let tb = (b.y - c.y).atan2(b.x - c.x);
        ta.total_cmp(&tb)
    });
    if !is_convex_ring(&ring) {
        return None;
    }

    let top = top_pair(&points, c);
    let is_top = |p: &Point2D| top.contains(p);

    // Start at the top corner whose clockwise neighbour is the other top corner
    let start = (0..4)
        .find(|&i| is_top(&ring[i]) && is_top(&ring[(i + 1) % 4]))
        .unwrap_or_else(|| {
            (0..4)
                .min_by(|&i, &j| (ring[i].x + ring[i].y).total_cmp(&(ring[j].x + ring[j].y)))
                .unwrap_or(0)
        });

    let tl = ring[start];
    let tr = ring[(start + 1) % 4];
    let br = ring[(start + 2) % 4];
    let bl = ring[(start + 3) % 4];
    Some([tl, tr, bl, br])
}

/// The two points above the centroid, or the two highest when the centroid
/// does not split the quad 2/2
fn top_pair(points: &[Point2D; 4], c: Point2D) -> [Point2D; 2] {
    let above: Vec<Point2D> = points.iter().copied().filter(|p| p.y < c.y).collect();
    if above.len() == 2 {
        return [above[0], above[1]];
    }
    let mut sorted = *points;
    sorted.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));
    [sorted[0], sorted[1]]
}

fn is_convex_ring(ring: &[Point2D; 4]) -> bool {
    let mut sign = 0.0f64;
    for i in 0..4 {
        let turn = cross(ring[i], ring[(i + 1) % 4], ring[(i + 2) % 4]);
        if sign == 0.0 {
            sign = turn.signum();
        } else if turn.signum() != sign {
            return false;
        }
    }
    true
}

fn centroid(points: &[Point2D; 4]) -> Point2D {
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point2D::new(sx / 4.0, sy / 4.0)
}

/// Twice the signed area of triangle (o, a, b)
#[inline]
fn cross(o: Point2D, a: Point2D, b: Point2D) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn area_tolerance(points: &[Point2D; 4]) -> f64 {
    let (min_x, max_x, min_y, max_y) = points.iter().fold(
        (f64::MAX, f64::MIN, f64::MAX, f64::MIN),
        |(x0, x1, y0, y1), p| (x0.min(p.x), x1.max(p.x), y0.min(p.y), y1.max(p.y)),
    );
    let extent = (max_x - min_x).max(max_y - min_y).max(1.0);
    GEOMETRY_EPSILON * extent * extent
}

fn count_distinct(points: &[Point2D]) -> usize {
    let mut distinct: Vec<Point2D> = Vec::with_capacity(points.len());
    for p in points {
        if !distinct.iter().any(|q| q.distance_to(p) < GEOMETRY_EPSILON) {
            distinct.push(*p);
        }
    }
    distinct.len()
}

/// Supplies the reference corners for a captured image
pub trait CornerSource: Send + Sync {
    fn acquire(&self, image: &RgbImage) -> StretchResult<CornerSet>;
}

/// Corners inset by a fixed number of pixels from each image edge
#[derive(Debug, Clone, Copy)]
pub struct FixedOffsetCorners {
    pub offset: f64,
}

impl FixedOffsetCorners {
    pub fn new(offset: f64) -> Self {
        Self { offset }
    }
}

impl CornerSource for FixedOffsetCorners {
    fn acquire(&self, image: &RgbImage) -> StretchResult<CornerSet> {
        let (w, h) = (image.width() as f64, image.height() as f64);
        let o = self.offset;
        // Zero would put the right and bottom corners one past the last pixel
        if !(o > 0.0 && 2.0 * o < w && 2.0 * o < h) {
            return Err(StretchError::DegenerateGeometry(format!(
                "corner offset {} does not fit inside a {}x{} image",
                o,
                image.width(),
                image.height()
            )));
        }
        let points = [
            Point2D::new(o, o),
            Point2D::new(w - o, o),
            Point2D::new(o, h - o),
            Point2D::new(w - o, h - o),
        ];
        validate(&points, image.width(), image.height())
    }
}

/// Corners marked by the operator, in any order
#[derive(Debug, Clone)]
pub struct MarkedCorners {
    pub points: Vec<Point2D>,
}

impl MarkedCorners {
    pub fn new(points: Vec<Point2D>) -> Self {
        Self { points }
    }
}

impl CornerSource for MarkedCorners {
    fn acquire(&self, image: &RgbImage) -> StretchResult<CornerSet> {
        validate(&self.points, image.width(), image.height())
    }
}

/// Parse points written as `x,y;x,y;...`
pub fn parse_points(s: &str) -> anyhow::Result<Vec<Point2D>> {
    let mut points = Vec::new();
    for pair in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((x, y)) = pair.split_once(',') else {
            bail!("expected 'x,y' but found {:?}", pair);
        };
        let x: f64 = x.trim().parse().with_context(|| format!("invalid x in {:?}", pair))?;
        let y: f64 = y.trim().parse().with_context(|| format!("invalid y in {:?}", pair))?;
        points.push(Point2D::new(x, y));
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(raw: &[(f64, f64)]) -> Vec<Point2D> {
        raw.iter().copied().map(Point2D::from).collect()
    }

    #[test]
    fn test_canonical_order_from_shuffled() {
        let points = pts(&[(590.0, 430.0), (50.0, 50.0), (50.0, 430.0), (590.0, 50.0)]);
        let corners = validate(&points, 640, 480).unwrap();
        assert_eq!(corners.get(CornerLabel::A), Point2D::new(50.0, 50.0));
        assert_eq!(corners.get(CornerLabel::B), Point2D::new(590.0, 50.0));
        assert_eq!(corners.get(CornerLabel::C), Point2D::new(50.0, 430.0));
        assert_eq!(corners.get(CornerLabel::D), Point2D::new(590.0, 430.0));
    }

    #[test]
    fn test_skewed_quad_ordering() {
        // One corner pulled far down: the centroid splits 1/3
        let points = pts(&[(10.0, 10.0), (100.0, 20.0), (15.0, 90.0), (120.0, 400.0)]);
        let corners = validate(&points, 200, 500).unwrap();
        assert_eq!(corners.get(CornerLabel::A), Point2D::new(10.0, 10.0));
        assert_eq!(corners.get(CornerLabel::B), Point2D::new(100.0, 20.0));
        assert_eq!(corners.get(CornerLabel::C), Point2D::new(15.0, 90.0));
        assert_eq!(corners.get(CornerLabel::D), Point2D::new(120.0, 400.0));
    }

    #[test]
    fn test_collinear_rejected() {
        let points = pts(&[(0.0, 0.0), (10.0, 0.0), (20.0, 0.0), (30.0, 0.0)]);
        let err = validate(&points, 640, 480).unwrap_err();
        assert!(matches!(err, StretchError::DegenerateGeometry(_)));
    }

    #[test]
    fn test_three_collinear_rejected() {
        let points = pts(&[(0.0, 0.0), (50.0, 0.0), (100.0, 0.0), (50.0, 80.0)]);
        let err = validate(&points, 640, 480).unwrap_err();
        assert!(matches!(err, StretchError::DegenerateGeometry(_)));
    }

    #[test]
    fn test_non_convex_rejected() {
        // Fourth point sits inside the triangle of the other three
        let points = pts(&[(0.0, 0.0), (100.0, 0.0), (50.0, 100.0), (50.0, 30.0)]);
        let err = validate(&points, 640, 480).unwrap_err();
        assert!(matches!(err, StretchError::DegenerateGeometry(_)));
    }

    #[test]
    fn test_insufficient_points() {
        let err = validate(&pts(&[(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)]), 640, 480).unwrap_err();
        assert!(matches!(err, StretchError::InsufficientPoints { found: 3 }));

        let dup = pts(&[(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 0.0)]);
        let err = validate(&dup, 640, 480).unwrap_err();
        assert!(matches!(err, StretchError::InsufficientPoints { found: 3 }));
    }

    #[test]
    fn test_too_many_points() {
        let points = pts(&[(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0), (5.0, 5.0)]);
        let err = validate(&points, 640, 480).unwrap_err();
        assert!(matches!(err, StretchError::TooManyPoints { found: 5 }));
    }

    #[test]
    fn test_out_of_bounds() {
        let points = pts(&[(0.0, 0.0), (640.0, 0.0), (0.0, 479.0), (639.0, 479.0)]);
        let err = validate(&points, 640, 480).unwrap_err();
        assert!(matches!(err, StretchError::PointOutOfBounds { .. }));
    }

    #[test]
    fn test_points_on_image_edge_accepted() {
        let points = pts(&[(0.0, 0.0), (639.0, 0.0), (0.0, 479.0), (639.0, 479.0)]);
        assert!(validate(&points, 640, 480).is_ok());
    }

    #[test]
    fn test_fixed_offset_source() {
        let image = RgbImage::new(640, 480);
        let corners = FixedOffsetCorners::new(50.0).acquire(&image).unwrap();
        assert_eq!(corners.get(CornerLabel::A), Point2D::new(50.0, 50.0));
        assert_eq!(corners.get(CornerLabel::D), Point2D::new(590.0, 430.0));
        assert_eq!(corners.centroid(), Point2D::new(320.0, 240.0));
    }

    #[test]
    fn test_fixed_offset_too_large_for_image() {
        let image = RgbImage::new(80, 60);
        let err = FixedOffsetCorners::new(50.0).acquire(&image).unwrap_err();
        assert!(matches!(err, StretchError::DegenerateGeometry(_)));

        // Exactly half the height leaves nothing between the corners
        assert!(FixedOffsetCorners::new(30.0).acquire(&image).is_err());
        assert!(FixedOffsetCorners::new(29.0).acquire(&image).is_ok());
    }

    #[test]
    fn test_zero_offset_rejected() {
        let image = RgbImage::new(640, 480);
        assert!(FixedOffsetCorners::new(0.0).acquire(&image).is_err());
        assert!(FixedOffsetCorners::new(-5.0).acquire(&image).is_err());

        let corners = FixedOffsetCorners::new(1.0).acquire(&image).unwrap();
        assert_eq!(corners.get(CornerLabel::D), Point2D::new(639.0, 479.0));
    }

    #[test]
    fn test_thin_convex_quad_accepted() {
        // Convex, but sorting each half by x alone would cross the outline
        let points = pts(&[(262.7, 191.6), (339.4, 248.5), (458.7, 406.3), (1.0, 24.2)]);
        let corners = validate(&points, 640, 480).unwrap();

        assert_eq!(corners.get(CornerLabel::A), Point2D::new(1.0, 24.2));
        assert_eq!(corners.get(CornerLabel::B), Point2D::new(262.7, 191.6));
        assert_eq!(corners.get(CornerLabel::D), Point2D::new(339.4, 248.5));
        assert_eq!(corners.get(CornerLabel::C), Point2D::new(458.7, 406.3));

        let ring = corners.outline();
        assert!(is_convex_ring(&ring));
    }

    #[test]
    fn test_convex_quads_always_accepted() {
        // Deterministic sweep of convex quads: four points on an ellipse at
        // irregular angles, centred at different spots in the frame
        let mut rejected = Vec::new();
        for step in 0..500u32 {
            let s = step as f64;
            let (cx, cy) = (200.0 + (s * 7.3) % 240.0, 150.0 + (s * 5.1) % 180.0);
            let (rx, ry) = (40.0 + (s * 3.7) % 150.0, 30.0 + (s * 2.9) % 110.0);
            let base = (s * 0.37) % std::f64::consts::TAU;
            let gaps = [0.3 + (s * 0.11) % 1.2, 0.3 + (s * 0.17) % 1.2, 0.3 + (s * 0.23) % 1.2];
            let mut angle = base;
            let mut quad = vec![Point2D::new(cx + rx * angle.cos(), cy + ry * angle.sin())];
            for gap in gaps {
                angle += gap;
                quad.push(Point2D::new(cx + rx * angle.cos(), cy + ry * angle.sin()));
            }
            quad.rotate_left(step as usize % 4);

            if let Err(e) = validate(&quad, 640, 480) {
                rejected.push((quad, e.to_string()));
            }
        }
        assert!(rejected.is_empty(), "rejected convex quads: {:?}", rejected);
    }

    #[test]
    fn test_parse_points() {
        let points = parse_points("10,20; 30.5,40 ;50,60;70,80").unwrap();
        assert_eq!(points.len(), 4);
        assert_eq!(points[1], Point2D::new(30.5, 40.0));

        assert!(parse_points("10;20").is_err());
        assert!(parse_points("a,1").is_err());
    }
}
