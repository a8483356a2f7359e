//! Rigid camera pose relative to a world frame.

use crate::camera::CameraModelError;
use crate::geometry::{nearest_rotation, rodrigues, rotation_vector};
use nalgebra::{DMatrix, Matrix3, Matrix3x4, Vector3};
use std::fmt;

/// World-to-camera transform `x_cam = R·X_world + t`.
#[derive(Clone, PartialEq)]
pub struct ExtrinsicModel {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl ExtrinsicModel {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        ExtrinsicModel {
            rotation,
            translation,
        }
    }

    /// Builds the pose from an axis-angle rotation vector (Rodrigues).
    pub fn from_rotation_vector(rvec: &Vector3<f64>, translation: &Vector3<f64>) -> Self {
        ExtrinsicModel::new(rodrigues(rvec), *translation)
    }

    pub fn rotation_vector(&self) -> Vector3<f64> {
        rotation_vector(&self.rotation)
    }

    pub fn transform(&self, point_world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point_world + self.translation
    }

    /// The 3×4 matrix `[R | t]`.
    pub fn to_matrix(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.set_column(3, &self.translation);
        m
    }

    pub fn to_dmatrix(&self) -> DMatrix<f64> {
        let m = self.to_matrix();
        DMatrix::from_fn(3, 4, |r, c| m[(r, c)])
    }

    /// Reads a pose back from a 3×4 `[R | t]` matrix. The rotation block is
    /// projected onto the nearest proper rotation.
    pub fn from_dmatrix(m: &DMatrix<f64>) -> Result<Self, CameraModelError> {
        if m.shape() != (3, 4) {
            return Err(CameraModelError::InvalidParams(format!(
                "extrinsic matrix must be 3x4, got {}x{}",
                m.nrows(),
                m.ncols()
            )));
        }
        if m.iter().any(|v| !v.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "extrinsic matrix contains non-finite values".to_string(),
            ));
        }
        let rotation = Matrix3::from_fn(|r, c| m[(r, c)]);
        let translation = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Ok(ExtrinsicModel::new(nearest_rotation(&rotation), translation))
    }
}

impl fmt::Debug for ExtrinsicModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.rotation_vector();
        write!(
            f,
            "ExtrinsicModel [rvec: ({}, {}, {}) t: ({}, {}, {})]",
            r.x, r.y, r.z, self.translation.x, self.translation.y, self.translation.z
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_to_matrix_concatenates_rotation_and_translation() {
        let pose = ExtrinsicModel::from_rotation_vector(
            &Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2),
            &Vector3::new(1.0, 2.0, 3.0),
        );
        let m = pose.to_matrix();
        let expected = Matrix3x4::new(
            0.0, -1.0, 0.0, 1.0, //
            1.0, 0.0, 0.0, 2.0, //
            0.0, 0.0, 1.0, 3.0,
        );
        assert_relative_eq!(m, expected, epsilon = 1e-12);

        let p = pose.transform(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p, Vector3::new(1.0, 3.0, 3.0), epsilon = 1e-12);
    }

    #[test]
    fn test_dmatrix_round_trip() {
        let pose = ExtrinsicModel::from_rotation_vector(
            &Vector3::new(0.2, -0.1, 0.4),
            &Vector3::new(-0.3, 0.1, 2.0),
        );
        let back = ExtrinsicModel::from_dmatrix(&pose.to_dmatrix()).unwrap();
        assert_relative_eq!(back.rotation, pose.rotation, epsilon = 1e-12);
        assert_eq!(back.translation, pose.translation);
        assert_relative_eq!(back.rotation_vector(), Vector3::new(0.2, -0.1, 0.4), epsilon = 1e-12);

        assert!(ExtrinsicModel::from_dmatrix(&DMatrix::zeros(3, 3)).is_err());
    }
}
