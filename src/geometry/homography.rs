//! Plane-to-image homographies and the board pose they imply.

use crate::geometry::{nearest_rotation, normalization_transform};
use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

/// Estimates the homography `H` with `dst ~ H·src` by the normalised DLT.
///
/// Needs at least four correspondences. The result is scaled so that
/// `H[(2, 2)] == 1` when that entry is not vanishing, otherwise to unit
/// Frobenius norm. Returns `None` for degenerate input.
pub fn find_homography(src: &[Vector2<f64>], dst: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }

    let t_src = normalization_transform(src);
    let t_dst = normalization_transform(dst);

    // Pad to at least nine rows so the SVD exposes the full null space.
    let rows = (2 * src.len()).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let s = t_src * Vector3::new(s.x, s.y, 1.0);
        let d = t_dst * Vector3::new(d.x, d.y, 1.0);
        let (x, y) = (s.x / s.z, s.y / s.z);
        let (u, v) = (d.x / d.z, d.y / d.z);

        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = v_t.row(min_idx);
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let h = t_dst.try_inverse()? * h_norm * t_src;
    let scale = if h[(2, 2)].abs() > 1e-12 {
        h[(2, 2)]
    } else {
        h.norm()
    };
    let h = h / scale;
    if h.iter().all(|v| v.is_finite()) {
        Some(h)
    } else {
        None
    }
}

/// Decomposes a board-to-image homography into a camera pose, given the
/// camera matrix `k`.
///
/// Returns `(R, t)` with `x_cam = R·X_board + t`. The sign is chosen so the
/// board lies in front of the camera, and the rotation is re-orthogonalised.
pub fn pose_from_homography(
    k: &Matrix3<f64>,
    h: &Matrix3<f64>,
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let m = k.try_inverse()? * h;
    let m1 = m.column(0).into_owned();
    let m2 = m.column(1).into_owned();
    let m3 = m.column(2).into_owned();

    let norm = 0.5 * (m1.norm() + m2.norm());
    if norm < f64::EPSILON {
        return None;
    }
    let mut lambda = 1.0 / norm;
    if m3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = m1 * lambda;
    let r2 = m2 * lambda;
    let r3 = r1.cross(&r2);
    let rotation = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r3]));
    let translation = m3 * lambda;
    Some((rotation, translation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rodrigues;
    use approx::assert_relative_eq;

    fn apply(h: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
        let q = h * Vector3::new(p.x, p.y, 1.0);
        Vector2::new(q.x / q.z, q.y / q.z)
    }

    #[test]
    fn test_find_homography_four_points() {
        let truth = Matrix3::new(1.2, 0.1, 30.0, -0.05, 0.9, 12.0, 1e-4, -2e-4, 1.0);
        let src = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(100.0, 0.0),
            Vector2::new(100.0, 80.0),
            Vector2::new(0.0, 80.0),
        ];
        let dst: Vec<_> = src.iter().map(|p| apply(&truth, p)).collect();
        let h = find_homography(&src, &dst).unwrap();
        assert_relative_eq!(h, truth, epsilon = 1e-8, max_relative = 1e-8);
    }

    #[test]
    fn test_find_homography_rejects_too_few() {
        let pts = vec![Vector2::new(0.0, 0.0); 3];
        assert!(find_homography(&pts, &pts).is_none());
    }

    #[test]
    fn test_pose_from_homography_recovers_board_pose() {
        let k = Matrix3::new(800.0, 0.0, 320.0, 0.0, 780.0, 240.0, 0.0, 0.0, 1.0);
        let r = rodrigues(&Vector3::new(0.2, -0.3, 0.1));
        let t = Vector3::new(-0.1, 0.05, 0.8);

        let mut board = Vec::new();
        let mut image = Vec::new();
        for i in 0..4 {
            for j in 0..5 {
                let pw = Vector3::new(j as f64 * 0.03, i as f64 * 0.03, 0.0);
                let pc = k * (r * pw + t);
                board.push(Vector2::new(pw.x, pw.y));
                image.push(Vector2::new(pc.x / pc.z, pc.y / pc.z));
            }
        }

        let h = find_homography(&board, &image).unwrap();
        let (r_est, t_est) = pose_from_homography(&k, &h).unwrap();
        assert_relative_eq!(r_est, r, epsilon = 1e-6);
        assert_relative_eq!(t_est, t, epsilon = 1e-6);
    }
}
