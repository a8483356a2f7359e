//! Calibration pattern detection.
//!
//! A [`PatternDetector`] locates the inner corners of a known grid in a single
//! grayscale image and reports them in row-major order, the same order in
//! which [`crate::geometry::WorldPatternModel`] generates the board points.

use image::GrayImage;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

pub mod chessboard;
pub mod overlay;

pub use chessboard::{ChessboardDetector, ChessboardDetectorOptions};
pub use overlay::draw_detection;

/// Inner-corner grid of a chessboard: `rows` corners down, `cols` across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSize {
    pub rows: usize,
    pub cols: usize,
}

impl PatternSize {
    pub fn new(rows: usize, cols: usize) -> Self {
        PatternSize { rows, cols }
    }

    pub fn corner_count(&self) -> usize {
        self.rows * self.cols
    }
}

impl Default for PatternSize {
    /// The 9×6 board: nine corners across, six down.
    fn default() -> Self {
        PatternSize { rows: 6, cols: 9 }
    }
}

/// Outcome of running a detector on one image.
///
/// `corners` is only meaningful when `found` is true; it is then ordered
/// row-major over the grid.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Detection {
    pub found: bool,
    pub corners: Vec<Vector2<f64>>,
}

impl Detection {
    pub fn found(corners: Vec<Vector2<f64>>) -> Self {
        Detection {
            found: true,
            corners,
        }
    }

    pub fn not_found() -> Self {
        Detection::default()
    }

    /// True when the detection succeeded and carries one corner per grid
    /// position of `pattern`.
    pub fn matches(&self, pattern: PatternSize) -> bool {
        self.found && self.corners.len() == pattern.corner_count()
    }
}

/// Finds the corners of a known pattern in an image.
///
/// Implementations must be deterministic: the same image always yields the
/// same detection.
pub trait PatternDetector {
    fn detect(&self, image: &GrayImage, pattern: PatternSize) -> Detection;
}
