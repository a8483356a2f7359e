//! Geometric building blocks shared by the solvers: rotation vector
//! conversions, rigid alignment, homographies, the P3P minimal solver and the
//! planar calibration board model.

use nalgebra::{Matrix3, RealField, Vector2, Vector3};

pub mod board;
pub mod homography;
pub mod p3p;

pub use board::WorldPatternModel;
pub use homography::{find_homography, pose_from_homography};
pub use p3p::{p3p, solve_polynomial_real};

/// Converts an axis-angle rotation vector to a rotation matrix with
/// Rodrigues' formula `R = I + sin(θ)·K + (1 − cos(θ))·K²`.
///
/// `K` is the skew-symmetric matrix of the unit axis and `θ = |rvec|`.
/// A zero vector yields the identity.
pub fn rodrigues(rvec: &Vector3<f64>) -> Matrix3<f64> {
    let theta = rvec.norm();
    if theta < f64::EPSILON {
        return Matrix3::identity();
    }
    let axis = rvec / theta;
    let k = axis.cross_matrix();
    Matrix3::identity() + k * theta.sin() + k * k * (1.0 - theta.cos())
}

/// Inverse of [`rodrigues`]: returns the rotation vector of `rotation`.
///
/// The input is first projected onto SO(3), so slightly non-orthogonal
/// matrices (e.g. read back from a text file) are accepted.
pub fn rotation_vector(rotation: &Matrix3<f64>) -> Vector3<f64> {
    let r = nalgebra::Rotation3::from_matrix_unchecked(nearest_rotation(rotation));
    r.scaled_axis()
}

/// Projects an arbitrary 3×3 matrix onto the closest rotation (Frobenius
/// norm) through its SVD, forcing a determinant of `+1`.
pub fn nearest_rotation(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix3::identity();
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut fix = Matrix3::identity();
        fix[(2, 2)] = -1.0;
        r = u * fix * v_t;
    }
    r
}

/// Rotates `p` by the rotation vector `w`.
///
/// Works on any [`RealField`] so it can be evaluated on the dual numbers used
/// by `tiny_solver`. Near zero the first-order form `p + w × p` keeps the
/// derivatives finite.
pub(crate) fn rotate_point<T: RealField>(w: &[T; 3], p: &[T; 3]) -> [T; 3] {
    let [wx, wy, wz] = w.clone();
    let [px, py, pz] = p.clone();

    let cross = [
        wy.clone() * pz.clone() - wz.clone() * py.clone(),
        wz.clone() * px.clone() - wx.clone() * pz.clone(),
        wx.clone() * py.clone() - wy.clone() * px.clone(),
    ];

    let theta2 = wx.clone() * wx.clone() + wy.clone() * wy.clone() + wz.clone() * wz.clone();
    if theta2 <= T::from_f64(1e-16).unwrap() {
        let [cx, cy, cz] = cross;
        return [px + cx, py + cy, pz + cz];
    }

    let theta = theta2.sqrt();
    let (sin, cos) = (theta.clone().sin(), theta.clone().cos());
    let one = T::one();
    let k_dot_p = (wx.clone() * px.clone() + wy.clone() * py.clone() + wz.clone() * pz.clone())
        / theta.clone();
    let [cx, cy, cz] = cross;
    let scale = k_dot_p * (one - cos.clone()) / theta.clone();
    let sin_over_theta = sin / theta;

    [
        px * cos.clone() + cx * sin_over_theta.clone() + wx * scale.clone(),
        py * cos.clone() + cy * sin_over_theta.clone() + wy * scale.clone(),
        pz * cos + cz * sin_over_theta + wz * scale,
    ]
}

/// Least-squares rigid transform `(R, t)` with `dst ≈ R·src + t` (Kabsch).
///
/// Returns `None` for fewer than three pairs or mismatched lengths.
pub fn kabsch(
    src: &[Vector3<f64>],
    dst: &[Vector3<f64>],
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    if src.len() != dst.len() || src.len() < 3 {
        return None;
    }
    let n = src.len() as f64;
    let src_centroid = src.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let dst_centroid = dst.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;

    let mut h = Matrix3::zeros();
    for (s, d) in src.iter().zip(dst) {
        h += (s - src_centroid) * (d - dst_centroid).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v = svd.v_t?.transpose();
    let mut r = v * u.transpose();
    if r.determinant() < 0.0 {
        let mut fix = Matrix3::identity();
        fix[(2, 2)] = -1.0;
        r = v * fix * u.transpose();
    }
    let t = dst_centroid - r * src_centroid;
    Some((r, t))
}

/// Hartley normalisation: translates the points to their centroid and scales
/// them so the mean distance from the origin is `√2`.
pub(crate) fn normalization_transform(points: &[Vector2<f64>]) -> Matrix3<f64> {
    let n = points.len().max(1) as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let scale = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(
        scale, 0.0, -scale * centroid.x, //
        0.0, scale, -scale * centroid.y, //
        0.0, 0.0, 1.0,
    )
}
