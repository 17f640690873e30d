//! Error types for the stretching core
//!
//! Everything the validator, rectifier and capture stage can report. None of
//! these are fatal: the caller skips the affected image and keeps going.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StretchError {
    /// Fewer than four distinct corner points were available
    #[error("need 4 distinct corner points, got {found}")]
    InsufficientPoints { found: usize },

    #[error("expected exactly 4 corner points, got {found}")]
    TooManyPoints { found: usize },

    #[error("corner ({x:.1}, {y:.1}) lies outside the {width}x{height} image")]
    PointOutOfBounds { x: f64, y: f64, width: u32, height: u32 },

    /// The corners do not span a usable quadrilateral
    #[error("degenerate corner geometry: {0}")]
    DegenerateGeometry(String),

    /// The homography system has no unique solution
    #[error("perspective transform is singular")]
    SingularTransform,

    #[error("invalid target rectangle {width}x{height}")]
    InvalidTarget { width: u32, height: u32 },

    /// A frame source produced nothing usable
    #[error("capture from {source_name} unavailable: {reason}")]
    CaptureUnavailable { source_name: String, reason: String },
}

impl StretchError {
    pub fn capture(source_name: impl Into<String>, reason: impl ToString) -> Self {
        StretchError::CaptureUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

pub type StretchResult<T> = std::result::Result<T, StretchError>;
