//! Implements the intrinsic model produced by calibration.
//!
//! The lens model is the rational radial/tangential model with eight
//! coefficients `[k1, k2, p1, p2, k3, k4, k5, k6]`:
//!
//! ```text
//! r²     = x² + y²
//! radial = (1 + k1·r² + k2·r⁴ + k3·r⁶) / (1 + k4·r² + k5·r⁴ + k6·r⁶)
//! x'     = x·radial + 2·p1·x·y + p2·(r² + 2·x²)
//! y'     = y·radial + p1·(r² + 2·y²) + 2·p2·x·y
//! u      = fx·x' + cx,  v = fy·y' + cy
//! ```
//!
//! With `k4 = k5 = k6 = 0` this reduces to the classic five-coefficient
//! Brown-Conrady model.

use crate::camera::{
    validation, CameraModel, CameraModelError, ExtrinsicModel, Intrinsics, Resolution,
};
use nalgebra::{DMatrix, Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of lens distortion coefficients stored by [`IntrinsicModel`].
pub const DISTORTION_COEFFICIENTS: usize = 8;

/// Camera matrix and lens distortion estimated by calibration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicModel {
    /// Focal lengths and principal point, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// Image size the model was estimated for. `0x0` when unknown, e.g. after
    /// loading from a matrix file, which does not carry it.
    pub resolution: Resolution,
    /// `[k1, k2, p1, p2, k3, k4, k5, k6]`
    pub distortions: [f64; DISTORTION_COEFFICIENTS],
}

impl IntrinsicModel {
    /// Creates a model with all distortion coefficients set to zero.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    pub fn new(intrinsics: Intrinsics, resolution: Resolution) -> Result<Self, CameraModelError> {
        let model = IntrinsicModel {
            intrinsics,
            resolution,
            distortions: [0.0; DISTORTION_COEFFICIENTS],
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Rebuilds a model from a 3×3 camera matrix and a distortion matrix.
    ///
    /// The distortion matrix may be a row or a column holding 4, 5 or 8
    /// coefficients; missing higher-order terms are zero.
    pub fn from_matrices(
        camera: &DMatrix<f64>,
        distortion: &DMatrix<f64>,
    ) -> Result<Self, CameraModelError> {
        if camera.shape() != (3, 3) {
            return Err(CameraModelError::InvalidParams(format!(
                "camera matrix must be 3x3, got {}x{}",
                camera.nrows(),
                camera.ncols()
            )));
        }
        if distortion.nrows() != 1 && distortion.ncols() != 1 {
            return Err(CameraModelError::InvalidParams(format!(
                "distortion must be a vector, got {}x{}",
                distortion.nrows(),
                distortion.ncols()
            )));
        }
        let count = distortion.len();
        if ![4, 5, DISTORTION_COEFFICIENTS].contains(&count) {
            return Err(CameraModelError::InvalidParams(format!(
                "expected 4, 5 or {} distortion coefficients, got {}",
                DISTORTION_COEFFICIENTS, count
            )));
        }

        let k = Matrix3::from_fn(|r, c| camera[(r, c)]);
        let mut model = IntrinsicModel::new(Intrinsics::from_matrix(&k), Resolution::default())?;
        // Column-major iteration is also row order for a single row or column.
        for (slot, value) in model.distortions.iter_mut().zip(distortion.iter()) {
            *slot = *value;
        }
        model.validate_params()?;
        Ok(model)
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.to_matrix()
    }

    /// The camera matrix as a dynamically sized 3×3 matrix.
    pub fn camera_dmatrix(&self) -> DMatrix<f64> {
        let k = self.camera_matrix();
        DMatrix::from_fn(3, 3, |r, c| k[(r, c)])
    }

    /// The distortion coefficients as an 8×1 column.
    pub fn distortion_dmatrix(&self) -> DMatrix<f64> {
        DMatrix::from_column_slice(DISTORTION_COEFFICIENTS, 1, &self.distortions)
    }

    /// Applies the lens model to a point on the normalised image plane.
    pub fn distort(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = distort_normalized(normalized.x, normalized.y, &self.distortions);
        Vector2::new(x, y)
    }

    /// Removes lens distortion from a point on the normalised image plane by
    /// fixed-point iteration.
    pub fn undistort(&self, distorted: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: usize = 50;

        let [k1, k2, p1, p2, k3, k4, k5, k6] = self.distortions;
        let mut point = *distorted;

        for _ in 0..MAX_ITERATIONS {
            let (x, y) = (point.x, point.y);
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let numerator = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
            let denominator = 1.0 + k4 * r2 + k5 * r4 + k6 * r6;
            if numerator.abs() < f64::EPSILON {
                return Err(CameraModelError::NumericalError(
                    "radial distortion factor vanished during undistortion".to_string(),
                ));
            }
            let inv_radial = denominator / numerator;
            let delta_x = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let delta_y = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            let next = Vector2::new(
                (distorted.x - delta_x) * inv_radial,
                (distorted.y - delta_y) * inv_radial,
            );
            let step = (next - point).norm();
            point = next;
            if step < EPS {
                break;
            }
        }

        if !point.x.is_finite() || !point.y.is_finite() {
            return Err(CameraModelError::NumericalError(
                "undistortion diverged".to_string(),
            ));
        }
        Ok(point)
    }

    /// Transforms a world point with `pose` and projects it to pixels.
    pub fn project_world(
        &self,
        pose: &ExtrinsicModel,
        point_world: &Vector3<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        self.project(&pose.transform(point_world))
    }

    /// Root-mean-square pixel distance between `observed` points and the
    /// projections of `world` points under `pose`.
    pub fn reprojection_rms(
        &self,
        pose: &ExtrinsicModel,
        world: &[Vector3<f64>],
        observed: &[Vector2<f64>],
    ) -> Result<f64, CameraModelError> {
        if world.len() != observed.len() || world.is_empty() {
            return Err(CameraModelError::InvalidParams(format!(
                "{} world points for {} image points",
                world.len(),
                observed.len()
            )));
        }
        let mut sum_sq = 0.0;
        for (pw, obs) in world.iter().zip(observed) {
            let projected = self.project_world(pose, pw)?;
            sum_sq += (projected - obs).norm_squared();
        }
        Ok((sum_sq / world.len() as f64).sqrt())
    }
}

/// Applies the rational lens model to normalised coordinates.
///
/// Generic over the scalar so the same expression serves both plain `f64`
/// evaluation and the automatic differentiation inside the solvers.
/// `d` holds at least the first five coefficients; absent terms are zero.
pub(crate) fn distort_normalized<T: RealField>(x: T, y: T, d: &[T]) -> (T, T) {
    let coeff = |i: usize| d.get(i).cloned().unwrap_or_else(T::zero);
    let (k1, k2, p1, p2, k3) = (coeff(0), coeff(1), coeff(2), coeff(3), coeff(4));
    let (k4, k5, k6) = (coeff(5), coeff(6), coeff(7));

    let one = T::one();
    let two = one.clone() + one.clone();

    let xy = x.clone() * y.clone();
    let x2 = x.clone() * x.clone();
    let y2 = y.clone() * y.clone();
    let r2 = x2.clone() + y2.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();

    let numerator = one.clone() + k1 * r2.clone() + k2 * r4.clone() + k3 * r6.clone();
    let denominator = one + k4 * r2.clone() + k5 * r4 + k6 * r6;
    let radial = numerator / denominator;

    let xd = x * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x2);
    let yd = y * radial + p1 * (r2 + two.clone() * y2) + two * p2 * xy;
    (xd, yd)
}

impl fmt::Debug for IntrinsicModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IntrinsicModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for IntrinsicModel {
    /// Projects a point in camera coordinates to pixels, applying distortion.
    ///
    /// Points outside the image are still projected; calibration and pose
    /// scoring need residuals for them.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: if the point is not in
    ///   front of the camera.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        let distorted = self.distort(&normalized);

        Ok(Vector2::new(
            self.intrinsics.fx * distorted.x + self.intrinsics.cx,
            self.intrinsics.fy * distorted.y + self.intrinsics.cy,
        ))
    }

    /// Unprojects a pixel to a unit ray, removing distortion first.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let distorted = Vector2::new(
            (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx,
            (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        let normalized = self.undistort(&distorted)?;
        Ok(Vector3::new(normalized.x, normalized.y, 1.0).normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_distortion(&self.distortions)?;
        Ok(())
    }
}
