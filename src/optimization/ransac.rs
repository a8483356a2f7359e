//! Generic RANSAC loop used by the pose solver.
//!
//! The estimator may return several hypotheses per minimal sample (P3P
//! yields up to four); all of them are scored against the full data set.

use log::debug;
use rand::prelude::IndexedRandom;
use rand::{rngs::StdRng, SeedableRng};

#[derive(Debug, Clone)]
pub(crate) struct RansacOptions {
    /// Upper bound on the number of samples drawn.
    pub max_iters: usize,
    /// Inlier residual threshold, in the units of [`Estimator::residual`].
    pub thresh: f64,
    /// Minimum consensus size for a hypothesis to count.
    pub min_inliers: usize,
    /// Probability of drawing at least one outlier-free sample.
    pub confidence: f64,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct RansacResult<M> {
    pub model: M,
    /// Indices of inlier data points, ascending.
    pub inliers: Vec<usize>,
    /// Root-mean-square residual over the inliers.
    pub inlier_rms: f64,
    pub iters: usize,
}

pub(crate) trait Estimator {
    type Model;

    /// Size of a minimal sample.
    const MIN_SAMPLES: usize;

    /// Number of data points available.
    fn len(&self) -> usize;

    /// All hypotheses consistent with the sampled indices. Empty when the
    /// sample is degenerate.
    fn fit(&self, sample: &[usize]) -> Vec<Self::Model>;

    /// Non-negative residual of datum `index` under `model`.
    fn residual(&self, model: &Self::Model, index: usize) -> f64;
}

fn rms(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::INFINITY;
    }
    (vals.iter().map(|v| v * v).sum::<f64>() / vals.len() as f64).sqrt()
}

/// Number of samples needed to draw one outlier-free sample with probability
/// `confidence` at the observed `inlier_ratio`, clamped to
/// `[iters_so_far, max_iters]`.
pub(crate) fn calculate_iterations(
    confidence: f64,
    inlier_ratio: f64,
    min_samples: usize,
    iters_so_far: usize,
    max_iters: usize,
) -> usize {
    if confidence <= 0.0 || confidence >= 1.0 || inlier_ratio <= 0.0 {
        return max_iters;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iters;
    }
    let n_iter = ((1.0 - confidence).ln() / denom).ceil() as usize;
    n_iter.clamp(iters_so_far, max_iters)
}

fn is_better<M>(count: usize, rms: f64, best: Option<&RansacResult<M>>) -> bool {
    match best {
        None => true,
        Some(b) => count > b.inliers.len() || (count == b.inliers.len() && rms < b.inlier_rms),
    }
}

/// Runs RANSAC. Returns `None` when no hypothesis reaches `min_inliers`
/// supporting points within the iteration budget.
pub(crate) fn ransac<E: Estimator>(
    estimator: &E,
    opts: &RansacOptions,
) -> Option<RansacResult<E::Model>> {
    let n = estimator.len();
    if n < E::MIN_SAMPLES {
        return None;
    }

    let all_indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut best: Option<RansacResult<E::Model>> = None;
    let mut dynamic_max_iters = opts.max_iters;
    let mut hypotheses = 0usize;

    let mut iters = 0;
    while iters < dynamic_max_iters {
        iters += 1;
        let sample: Vec<usize> = all_indices
            .as_slice()
            .choose_multiple(&mut rng, E::MIN_SAMPLES)
            .copied()
            .collect();

        for model in estimator.fit(&sample) {
            hypotheses += 1;
            let mut inliers = Vec::with_capacity(n);
            let mut residuals = Vec::with_capacity(n);
            for i in 0..n {
                let r = estimator.residual(&model, i);
                if r <= opts.thresh {
                    inliers.push(i);
                    residuals.push(r);
                }
            }
            if inliers.len() < opts.min_inliers {
                continue;
            }
            let inlier_rms = rms(&residuals);
            if is_better(inliers.len(), inlier_rms, best.as_ref()) {
                best = Some(RansacResult {
                    model,
                    inliers,
                    inlier_rms,
                    iters,
                });
            }
        }

        if let Some(b) = &best {
            dynamic_max_iters = calculate_iterations(
                opts.confidence,
                b.inliers.len() as f64 / n as f64,
                E::MIN_SAMPLES,
                iters,
                opts.max_iters,
            );
        }
    }

    debug!(
        "RANSAC: {} samples, {} hypotheses, best consensus {}",
        iters,
        hypotheses,
        best.as_ref().map_or(0, |b| b.inliers.len())
    );
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fits `y = m·x + b` through two points.
    struct LineEstimator {
        points: Vec<(f64, f64)>,
    }

    impl Estimator for LineEstimator {
        type Model = (f64, f64);
        const MIN_SAMPLES: usize = 2;

        fn len(&self) -> usize {
            self.points.len()
        }

        fn fit(&self, sample: &[usize]) -> Vec<Self::Model> {
            let (x0, y0) = self.points[sample[0]];
            let (x1, y1) = self.points[sample[1]];
            if (x1 - x0).abs() < 1e-9 {
                return Vec::new();
            }
            let m = (y1 - y0) / (x1 - x0);
            vec![(m, y0 - m * x0)]
        }

        fn residual(&self, model: &Self::Model, index: usize) -> f64 {
            let (x, y) = self.points[index];
            (model.0 * x + model.1 - y).abs()
        }
    }

    fn options() -> RansacOptions {
        RansacOptions {
            max_iters: 100,
            thresh: 0.1,
            min_inliers: 5,
            confidence: 0.99,
            seed: 7,
        }
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let mut points: Vec<(f64, f64)> =
            (0..20).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        points[3].1 += 40.0;
        points[11].1 -= 25.0;
        points[17].1 += 9.0;
        let estimator = LineEstimator { points };

        let result = ransac(&estimator, &options()).unwrap();
        assert_eq!(result.inliers.len(), 17);
        assert!(!result.inliers.contains(&3));
        assert!(!result.inliers.contains(&11));
        assert!((result.model.0 - 2.0).abs() < 1e-9);
        assert!((result.model.1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ransac_is_deterministic_for_seed() {
        let points: Vec<(f64, f64)> = (0..12)
            .map(|i| (i as f64, if i % 4 == 0 { 50.0 } else { -(i as f64) }))
            .collect();
        let estimator = LineEstimator { points };
        let a = ransac(&estimator, &options()).unwrap();
        let b = ransac(&estimator, &options()).unwrap();
        assert_eq!(a.inliers, b.inliers);
        assert_eq!(a.iters, b.iters);
    }

    #[test]
    fn test_ransac_fails_without_consensus() {
        let points = vec![(0.0, 0.0), (1.0, 5.0), (2.0, -3.0), (3.0, 8.0)];
        let estimator = LineEstimator { points };
        assert!(ransac(&estimator, &options()).is_none());
    }

    #[test]
    fn test_calculate_iterations_bounds() {
        assert_eq!(calculate_iterations(0.99, 1.0, 3, 1, 100), 1);
        assert_eq!(calculate_iterations(0.99, 0.0, 3, 1, 100), 100);
        // w = 0.5, m = 3: ln(0.01) / ln(0.875) = 34.5
        assert_eq!(calculate_iterations(0.99, 0.5, 3, 1, 100), 35);
        assert_eq!(calculate_iterations(0.99, 0.5, 3, 50, 100), 50);
    }
}
