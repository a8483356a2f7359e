//! The `optimization` module estimates camera parameters from point
//! correspondences.
//!
//! Two solvers live here:
//!
//! * [`IntrinsicSolver`] recovers the camera matrix and lens distortion from
//!   several views of a planar board. It follows the usual two-stage recipe:
//!   a closed-form estimate from the view homographies
//!   ([`Optimizer::linear_estimation`]) followed by a Levenberg-Marquardt
//!   refinement of every parameter ([`Optimizer::optimize`]).
//! * [`ExtrinsicSolver`] recovers a single camera pose from 3D-2D
//!   correspondences with RANSAC over P3P hypotheses.
//!
//! Both report failures through [`SolveError`] and never hand back a
//! placeholder model.

use serde::{Deserialize, Serialize};

pub mod extrinsics;
pub mod intrinsics;
mod ransac;

pub use extrinsics::{
    persist_extrinsics, CorrespondenceSet, ExtrinsicSolution, ExtrinsicSolver,
    ExtrinsicSolverOptions,
};
pub use intrinsics::{
    IntrinsicCalibration, IntrinsicOptimizationCost, IntrinsicSolver, IntrinsicSolverOptions,
};

use crate::camera::CameraModelError;

#[derive(thiserror::Error, Debug)]
pub enum SolveError {
    /// The data does not constrain the parameters well enough to trust a
    /// result, or the optimizer did not converge to one.
    #[error("Poorly conditioned problem: {0}")]
    PoorConditioning(String),
    #[error("No pose found: {inliers} supporting correspondences, {required} required")]
    PoseNotFound { inliers: usize, required: usize },
    #[error("Invalid solver input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

/// Summary statistics of per-point reprojection distances, in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl ProjectionError {
    /// Computes the statistics of `distances`. Returns `None` when empty.
    pub fn from_distances(distances: &[f64]) -> Option<Self> {
        if distances.is_empty() {
            return None;
        }
        let n = distances.len() as f64;
        let mean = distances.iter().sum::<f64>() / n;
        let rmse = (distances.iter().map(|d| d * d).sum::<f64>() / n).sqrt();
        let variance = distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;

        let mut sorted = distances.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            0.5 * (sorted[mid - 1] + sorted[mid])
        } else {
            sorted[mid]
        };

        Some(ProjectionError {
            rmse,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// A two-stage parameter estimation task.
///
/// Implementors hold the observations and the current parameter estimate.
/// [`Optimizer::linear_estimation`] seeds the estimate in closed form and
/// [`Optimizer::optimize`] refines it in place.
pub trait Optimizer {
    /// Computes a closed-form initial estimate.
    ///
    /// # Errors
    ///
    /// [`SolveError::PoorConditioning`] when the observations are degenerate.
    fn linear_estimation(&mut self) -> Result<(), SolveError>;

    /// Refines the current estimate with Levenberg-Marquardt.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, logs progress at `info` level instead of
    ///   `debug`.
    ///
    /// # Errors
    ///
    /// [`SolveError::PoorConditioning`] when the optimizer fails or returns
    /// non-finite parameters.
    fn optimize(&mut self, verbose: bool) -> Result<(), SolveError>;
}
