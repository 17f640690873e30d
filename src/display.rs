//! Presenting captured and stretched frames
//!
//! The stretching core never shows anything itself. Frames are handed to a
//! `FrameSink`; the command line tool uses one that writes PNG files.

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_hollow_circle_mut, draw_line_segment_mut};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::corners::{CornerLabel, CornerSet};

const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const MARKER_RADIUS: i32 = 8;
/// Height of a corner letter, in pixels
const GLYPH_SIZE: f32 = 16.0;
/// Gap between a corner marker and its letter
const GLYPH_GAP: f32 = 12.0;

type Stroke = &'static [(f32, f32)];

/// Letters A-D as polylines in a unit box (x right, y down)
fn glyph(label: CornerLabel) -> &'static [Stroke] {
    match label {
        CornerLabel::A => &[
            &[(0.0, 1.0), (0.5, 0.0), (1.0, 1.0)],
            &[(0.25, 0.5), (0.75, 0.5)],
        ],
        CornerLabel::B => &[
            &[(0.0, 0.0), (0.0, 1.0), (0.7, 1.0), (0.95, 0.85), (0.95, 0.65), (0.7, 0.5), (0.0, 0.5)],
            &[(0.0, 0.0), (0.65, 0.0), (0.9, 0.12), (0.9, 0.38), (0.65, 0.5)],
        ],
        CornerLabel::C => &[&[
            (1.0, 0.1), (0.8, 0.0), (0.2, 0.0), (0.0, 0.2),
            (0.0, 0.8), (0.2, 1.0), (0.8, 1.0), (1.0, 0.9),
        ]],
        CornerLabel::D => &[&[
            (0.0, 0.0), (0.0, 1.0), (0.6, 1.0), (1.0, 0.7),
            (1.0, 0.3), (0.6, 0.0), (0.0, 0.0),
        ]],
    }
}

/// Draw the letter for `label` with its top-left corner at `origin`
fn draw_label(canvas: &mut RgbImage, label: CornerLabel, origin: (f32, f32), color: Rgb<u8>) {
    let scale = |(x, y): (f32, f32)| (origin.0 + x * GLYPH_SIZE, origin.1 + y * GLYPH_SIZE);
    for stroke in glyph(label) {
        for segment in stroke.windows(2) {
            draw_line_segment_mut(canvas, scale(segment[0]), scale(segment[1]), color);
        }
    }
}

/// Receives frames for presentation
pub trait FrameSink {
    fn present(&mut self, name: &str, image: &RgbImage) -> Result<()>;
}

/// Writes every presented frame as `<name>.png` into a directory
#[derive(Debug)]
pub struct PngDirectory {
    dir: PathBuf,
    written: Vec<PathBuf>,
}

impl PngDirectory {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            written: Vec::new(),
        })
    }

    /// Files written so far
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl FrameSink for PngDirectory {
    fn present(&mut self, name: &str, image: &RgbImage) -> Result<()> {
        let path = self.dir.join(format!("{}.png", name));
        image.save(&path)
            .with_context(|| format!("Failed to write {:?}", path))?;
        info!("Wrote {}x{} image to {:?}", image.width(), image.height(), path);
        self.written.push(path);
        Ok(())
    }
}

fn label_color(label: CornerLabel) -> Rgb<u8> {
    match label {
        CornerLabel::A => Rgb([255, 0, 0]),
        CornerLabel::B => Rgb([255, 255, 0]),
        CornerLabel::C => Rgb([0, 128, 255]),
        CornerLabel::D => Rgb([255, 0, 255]),
    }
}

/// Copy of `image` with the quadrilateral outlined and each corner marked
/// and lettered in its label colour (A red, B yellow, C blue, D magenta).
/// Letters sit on the inner side of their corner.
pub fn annotate_corners(image: &RgbImage, corners: &CornerSet) -> RgbImage {
    let mut out = image.clone();

    let outline = corners.outline();
    for i in 0..outline.len() {
        let (from, to) = (outline[i], outline[(i + 1) % outline.len()]);
        draw_line_segment_mut(
            &mut out,
            (from.x as f32, from.y as f32),
            (to.x as f32, to.y as f32),
            OUTLINE_COLOR,
        );
    }

    let centre = corners.centroid();
    for (label, p) in corners.labeled() {
        let (x, y) = (p.x.round() as i32, p.y.round() as i32);
        let color = label_color(label);
        debug!("Corner {:?} ({}) at ({}, {})", label, label.name(), x, y);
        draw_hollow_circle_mut(&mut out, (x, y), MARKER_RADIUS, color);
        draw_cross_mut(&mut out, color, x, y);

        let gx = if p.x <= centre.x { x as f32 + GLYPH_GAP } else { x as f32 - GLYPH_GAP - GLYPH_SIZE };
        let gy = if p.y <= centre.y { y as f32 + GLYPH_GAP } else { y as f32 - GLYPH_GAP - GLYPH_SIZE };
        draw_label(&mut out, label, (gx, gy), color);
    }

    out
}
