//! QuadStretch - perspective stretching of marked quadrilaterals
//!
//! The core takes a frame and four corner points, validates the corners
//! ([`corners::validate`]) and warps the marked region into an upright
//! rectangle ([`transform::rectify`]). Capture from a camera pair and
//! presentation of the results live around that core in [`capture`],
//! [`pipeline`] and [`display`].

pub mod capture;
pub mod config;
pub mod corners;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod transform;

pub use corners::{validate, CornerLabel, CornerSet, CornerSource, Point2D};
pub use error::{StretchError, StretchResult};
pub use transform::{rectify, Interpolation, RectifyOptions, TargetRect, TransformMatrix};
