//! Minimal absolute pose from three world points and their viewing rays.
//!
//! Uses the classic Grunert formulation: the three unknown depths are tied
//! together by the law of cosines, which reduces to a quartic in the depth
//! ratio `u = s2 / s1`. Each positive real root yields one candidate pose.

use crate::geometry::kabsch;
use nalgebra::{DMatrix, Matrix3, Vector3};

/// Real roots of `c[0] + c[1]·x + … + c[n]·xⁿ`.
///
/// Roots come from the eigenvalues of the companion matrix and are polished
/// with a few Newton steps. Nearly real complex pairs are kept, since callers
/// score every candidate anyway.
pub fn solve_polynomial_real(coeffs: &[f64]) -> Vec<f64> {
    let scale = coeffs.iter().fold(0.0_f64, |m, c| m.max(c.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return Vec::new();
    }
    let mut degree = coeffs.len() - 1;
    while degree > 0 && coeffs[degree].abs() <= 1e-12 * scale {
        degree -= 1;
    }
    match degree {
        0 => return Vec::new(),
        1 => return vec![-coeffs[0] / coeffs[1]],
        _ => {}
    }

    let lead = coeffs[degree];
    let mut companion = DMatrix::<f64>::zeros(degree, degree);
    for k in 0..degree {
        companion[(0, k)] = -coeffs[degree - 1 - k] / lead;
    }
    for k in 1..degree {
        companion[(k, k - 1)] = 1.0;
    }

    let eigenvalues = nalgebra::Schur::new(companion).complex_eigenvalues();
    let mut roots: Vec<f64> = eigenvalues
        .iter()
        .filter(|z| z.im.abs() <= 1e-4 * (1.0 + z.re.abs()))
        .map(|z| polish_root(&coeffs[..=degree], z.re))
        .filter(|r| r.is_finite())
        .collect();

    roots.sort_by(|a, b| a.total_cmp(b));
    roots.dedup_by(|a, b| (*a - *b).abs() < 1e-10 * (1.0 + b.abs()));
    roots
}

fn polish_root(coeffs: &[f64], mut x: f64) -> f64 {
    for _ in 0..4 {
        let (mut p, mut dp) = (0.0, 0.0);
        for c in coeffs.iter().rev() {
            dp = dp * x + p;
            p = p * x + c;
        }
        if dp.abs() < f64::EPSILON {
            break;
        }
        x -= p / dp;
    }
    x
}

fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, ai) in a.iter().enumerate() {
        for (j, bj) in b.iter().enumerate() {
            out[i + j] += ai * bj;
        }
    }
    out
}

fn poly_add_scaled(acc: &mut [f64], p: &[f64], scale: f64) {
    for (slot, v) in acc.iter_mut().zip(p) {
        *slot += scale * v;
    }
}

/// Solves the perspective-three-point problem.
///
/// # Arguments
///
/// * `world` - Three non-collinear points in the world frame.
/// * `bearings` - The matching viewing rays in the camera frame (any length,
///   they are normalised here).
///
/// # Returns
///
/// Up to four candidate poses `(R, t)` with `x_cam = R·X_world + t`.
pub fn p3p(
    world: &[Vector3<f64>; 3],
    bearings: &[Vector3<f64>; 3],
) -> Vec<(Matrix3<f64>, Vector3<f64>)> {
    let [x1, x2, x3] = world;
    let a2 = (x2 - x3).norm_squared();
    let b2 = (x1 - x3).norm_squared();
    let c2 = (x1 - x2).norm_squared();
    if a2 < 1e-18 || b2 < 1e-18 || c2 < 1e-18 {
        return Vec::new();
    }
    if (x2 - x1).cross(&(x3 - x1)).norm() < 1e-12 * (b2 + c2) {
        return Vec::new();
    }

    let j: Vec<Vector3<f64>> = bearings.iter().map(|b| b.normalize()).collect();
    let cos_alpha = j[1].dot(&j[2]);
    let cos_beta = j[0].dot(&j[2]);
    let cos_gamma = j[0].dot(&j[1]);

    let d = (b2 - a2) / c2;
    let e = b2 / c2;

    // v = n(u) / den(u), substituted back into the b² constraint.
    let n = [1.0 - d, 2.0 * d * cos_gamma, -(1.0 + d)];
    let den = [2.0 * cos_beta, -2.0 * cos_alpha];
    let e_poly = [1.0 - e, 2.0 * e * cos_gamma, -e];

    let mut quartic = [0.0; 5];
    poly_add_scaled(&mut quartic, &poly_mul(&n, &n), 1.0);
    poly_add_scaled(&mut quartic, &poly_mul(&n, &den), -2.0 * cos_beta);
    poly_add_scaled(&mut quartic, &poly_mul(&e_poly, &poly_mul(&den, &den)), 1.0);

    let mut poses = Vec::new();
    for u in solve_polynomial_real(&quartic) {
        if u <= 0.0 {
            continue;
        }
        let den_u = den[0] + den[1] * u;
        if den_u.abs() < 1e-12 {
            continue;
        }
        let v = (n[0] + n[1] * u + n[2] * u * u) / den_u;
        if v <= 0.0 {
            continue;
        }
        let q = 1.0 + u * u - 2.0 * u * cos_gamma;
        if q <= 0.0 {
            continue;
        }
        let s1 = (c2 / q).sqrt();
        let camera = [j[0] * s1, j[1] * (u * s1), j[2] * (v * s1)];
        if let Some(pose) = kabsch(world, &camera) {
            poses.push(pose);
        }
    }
    poses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rodrigues;
    use approx::assert_relative_eq;

    #[test]
    fn test_solve_polynomial_real_known_roots() {
        // (x - 1)(x - 2)(x + 3)(x - 0.5)
        let p1 = poly_mul(&[-1.0, 1.0], &[-2.0, 1.0]);
        let p2 = poly_mul(&[3.0, 1.0], &[-0.5, 1.0]);
        let quartic = poly_mul(&p1, &p2);
        let roots = solve_polynomial_real(&quartic);
        assert_eq!(roots.len(), 4);
        for (r, expected) in roots.iter().zip([-3.0, 0.5, 1.0, 2.0]) {
            assert_relative_eq!(*r, expected, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_solve_polynomial_real_skips_complex_and_degenerate() {
        // x² + 1 has no real roots.
        assert!(solve_polynomial_real(&[1.0, 0.0, 1.0]).is_empty());
        // Vanishing leading terms fall back to the linear case.
        let roots = solve_polynomial_real(&[-4.0, 2.0, 0.0, 0.0]);
        assert_eq!(roots, vec![2.0]);
        assert!(solve_polynomial_real(&[0.0, 0.0]).is_empty());
    }

    #[test]
    fn test_p3p_contains_true_pose() {
        let r = rodrigues(&Vector3::new(0.1, -0.4, 0.25));
        let t = Vector3::new(0.2, -0.1, 3.0);
        let world = [
            Vector3::new(-0.5, -0.3, 0.2),
            Vector3::new(0.6, -0.2, -0.1),
            Vector3::new(0.1, 0.7, 0.3),
        ];
        let bearings = [r * world[0] + t, r * world[1] + t, r * world[2] + t];

        let poses = p3p(&world, &bearings);
        assert!(!poses.is_empty() && poses.len() <= 4);
        let best = poses
            .iter()
            .map(|(r_est, t_est)| (r_est - r).norm() + (t_est - t).norm())
            .fold(f64::INFINITY, f64::min);
        assert!(best < 1e-6, "closest candidate is {} away", best);
    }

    #[test]
    fn test_p3p_rejects_collinear_points() {
        let world = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, 0.0),
        ];
        let bearings = [Vector3::z(), Vector3::z(), Vector3::z()];
        assert!(p3p(&world, &bearings).is_empty());
    }
}
