//! Camera models used by the calibration pipeline.
//!
//! [`IntrinsicModel`] is the pinhole camera matrix together with the
//! eight-coefficient rational radial/tangential lens model, and
//! [`ExtrinsicModel`] is a rigid world-to-camera transform.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod extrinsics;
pub mod rational;

pub use extrinsics::ExtrinsicModel;
pub use rational::{IntrinsicModel, DISTORTION_COEFFICIENTS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Builds the 3×3 upper-triangular camera matrix with zero skew.
    pub fn to_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Reads `fx, fy, cx, cy` back from a camera matrix. Skew is ignored.
    pub fn from_matrix(k: &Matrix3<f64>) -> Self {
        Intrinsics {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("z is close to zero or negative, point cannot be projected")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point given in camera coordinates to pixel coordinates
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject pixel coordinates to a unit-length ray in camera coordinates
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0)
            || !intrinsics.fx.is_finite()
            || !intrinsics.fy.is_finite()
        {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_distortion(distortions: &[f64]) -> Result<(), CameraModelError> {
        if let Some(i) = distortions.iter().position(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(format!(
                "distortion coefficient {} is not finite",
                i
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsics_matrix_round_trip() {
        let intrinsics = Intrinsics {
            fx: 610.5,
            fy: 608.25,
            cx: 319.5,
            cy: 241.0,
        };
        let k = intrinsics.to_matrix();
        assert_eq!(k[(0, 1)], 0.0);
        assert_eq!(k[(2, 2)], 1.0);
        assert_eq!(Intrinsics::from_matrix(&k), intrinsics);
    }

    #[test]
    fn test_validate_intrinsics_rejects_bad_focal() {
        let bad = Intrinsics {
            fx: -1.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
        };
        assert!(matches!(
            validation::validate_intrinsics(&bad),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));

        let nan = Intrinsics {
            fx: f64::NAN,
            ..bad.clone()
        };
        assert!(validation::validate_intrinsics(&nan).is_err());

        let off = Intrinsics {
            fx: 500.0,
            cx: f64::INFINITY,
            ..bad
        };
        assert!(matches!(
            validation::validate_intrinsics(&off),
            Err(CameraModelError::PrincipalPointMustBeFinite)
        ));
    }
}
