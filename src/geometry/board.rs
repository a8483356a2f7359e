//! Planar calibration board expressed in its own reference frame.

use crate::pattern::PatternSize;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Known geometry of a chessboard: the inner-corner grid and the edge length
/// of one square in world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldPatternModel {
    pub pattern: PatternSize,
    pub square_size: f64,
}

impl WorldPatternModel {
    pub fn new(pattern: PatternSize, square_size: f64) -> Self {
        WorldPatternModel {
            pattern,
            square_size,
        }
    }

    /// Generates the board corners on the `z = 0` plane.
    ///
    /// The order is row-major and matches the corner order produced by the
    /// detector: row `i` (down the board) is the outer loop, column `j`
    /// (across) the inner one, and the corner at `(i, j)` sits at
    /// `(j·s, i·s, 0)`.
    pub fn generate(&self) -> Vec<Vector3<f64>> {
        let s = self.square_size;
        (0..self.pattern.rows)
            .flat_map(|i| {
                (0..self.pattern.cols).map(move |j| Vector3::new(j as f64 * s, i as f64 * s, 0.0))
            })
            .collect()
    }

    /// Generates the board once and repeats it for `views` frames.
    pub fn replicate(&self, views: usize) -> Vec<Vec<Vector3<f64>>> {
        let corners = self.generate();
        vec![corners; views]
    }
}
