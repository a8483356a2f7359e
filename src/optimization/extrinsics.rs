//! Camera pose from 3D-2D correspondences.
//!
//! Hypotheses come from P3P on random minimal samples; the one with the
//! largest consensus wins and is optionally polished with
//! Levenberg-Marquardt on its inliers.

use crate::camera::{CameraModel, ExtrinsicModel, IntrinsicModel, DISTORTION_COEFFICIENTS};
use crate::codec::{save_extrinsics, CodecError};
use crate::geometry::p3p;
use crate::optimization::intrinsics::project_point;
use crate::optimization::ransac::{ransac, Estimator, RansacOptions};
use crate::optimization::SolveError;
use crate::util;

use log::{debug, info, warn};
use nalgebra::{DVector, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Fewest correspondences that determine a unique pose.
const MIN_CORRESPONDENCES: usize = 4;

/// Matched world points and their pixel observations.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceSet {
    pub world: Vec<Vector3<f64>>,
    pub image: Vec<Vector2<f64>>,
}

impl CorrespondenceSet {
    /// # Errors
    ///
    /// [`SolveError::InvalidInput`] when the two lists differ in length.
    pub fn new(world: Vec<Vector3<f64>>, image: Vec<Vector2<f64>>) -> Result<Self, SolveError> {
        if world.len() != image.len() {
            return Err(SolveError::InvalidInput(format!(
                "{} world points for {} image points",
                world.len(),
                image.len()
            )));
        }
        Ok(CorrespondenceSet { world, image })
    }

    /// The four surveyed points of the fixed capture rig.
    pub fn reference() -> Self {
        CorrespondenceSet {
            world: vec![
                Vector3::new(-104.562, -103.861, 86.281),
                Vector3::new(76.7444, -98.59, 89.09),
                Vector3::new(85.2069, -423.835, 113.24),
                Vector3::new(-97.4618, -419.716, 115.433),
            ],
            image: vec![
                Vector2::new(112.25, 46.5),
                Vector2::new(460.25, 52.0),
                Vector2::new(511.25, 700.75),
                Vector2::new(126.5, 715.0),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.world.len()
    }

    pub fn is_empty(&self) -> bool {
        self.world.is_empty()
    }

    /// Reads `x,y,z,u,v` rows. Lines starting with `#` are comments and a
    /// leading non-numeric header row is skipped.
    ///
    /// # Errors
    ///
    /// [`CodecError::MalformedFile`] when the file cannot be opened, a row
    /// does not hold five numbers, or no rows are present.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, CodecError> {
        let path = path.as_ref();
        let malformed = |reason: String| CodecError::MalformedFile {
            path: path.display().to_string(),
            reason,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)
            .map_err(|e| malformed(e.to_string()))?;

        let mut world = Vec::new();
        let mut image = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(|e| malformed(e.to_string()))?;
            let values: Result<Vec<f64>, _> = record.iter().map(str::parse::<f64>).collect();
            let values = match values {
                Ok(values) => values,
                Err(_) if row == 0 && world.is_empty() => continue,
                Err(e) => return Err(malformed(format!("row {}: {}", row + 1, e))),
            };
            if values.len() != 5 {
                return Err(malformed(format!(
                    "row {}: expected 5 values, got {}",
                    row + 1,
                    values.len()
                )));
            }
            world.push(Vector3::new(values[0], values[1], values[2]));
            image.push(Vector2::new(values[3], values[4]));
        }

        if world.is_empty() {
            return Err(malformed("no correspondences".to_string()));
        }
        Ok(CorrespondenceSet { world, image })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtrinsicSolverOptions {
    /// Upper bound on RANSAC samples.
    pub iterations: usize,
    /// Inlier reprojection threshold, in pixels.
    pub threshold: f64,
    pub confidence: f64,
    /// Smallest consensus accepted. Never below four.
    pub min_inliers: usize,
    pub seed: u64,
    /// Polish the best hypothesis with Levenberg-Marquardt on its inliers.
    pub refine: bool,
}

impl Default for ExtrinsicSolverOptions {
    fn default() -> Self {
        ExtrinsicSolverOptions {
            iterations: 100,
            threshold: 2.0,
            confidence: 0.99,
            min_inliers: MIN_CORRESPONDENCES,
            seed: 0,
            refine: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtrinsicSolution {
    pub model: ExtrinsicModel,
    /// Indices into the correspondence set, ascending.
    pub inliers: Vec<usize>,
    /// RMS reprojection error over the inliers, in pixels.
    pub rms: f64,
}

struct PnpEstimator<'a> {
    set: &'a CorrespondenceSet,
    camera: &'a IntrinsicModel,
    bearings: Vec<Vector3<f64>>,
}

impl Estimator for PnpEstimator<'_> {
    type Model = ExtrinsicModel;
    const MIN_SAMPLES: usize = 3;

    fn len(&self) -> usize {
        self.set.len()
    }

    fn fit(&self, sample: &[usize]) -> Vec<ExtrinsicModel> {
        let world = [
            self.set.world[sample[0]],
            self.set.world[sample[1]],
            self.set.world[sample[2]],
        ];
        let bearings = [
            self.bearings[sample[0]],
            self.bearings[sample[1]],
            self.bearings[sample[2]],
        ];
        p3p(&world, &bearings)
            .into_iter()
            .map(|(r, t)| ExtrinsicModel::new(r, t))
            .collect()
    }

    fn residual(&self, model: &ExtrinsicModel, index: usize) -> f64 {
        self.camera
            .project_world(model, &self.set.world[index])
            .map(|p| (p - self.set.image[index]).norm())
            .unwrap_or(f64::INFINITY)
    }
}

/// Reprojection residuals of a fixed camera; the only parameter block is the
/// pose `[rx, ry, rz, tx, ty, tz]`.
#[derive(Debug, Clone)]
struct PoseReprojectionCost {
    world: Vec<Vector3<f64>>,
    image: Vec<Vector2<f64>>,
    camera: [f64; 4],
    distortion: [f64; DISTORTION_COEFFICIENTS],
}

impl<T: RealField> Factor<T> for PoseReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let camera: Vec<T> = self.camera.iter().map(|v| T::from_f64(*v).unwrap()).collect();
        let distortion: Vec<T> = self
            .distortion
            .iter()
            .map(|v| T::from_f64(*v).unwrap())
            .collect();
        let pose = params[0].as_slice();

        let mut residuals = DVector::zeros(self.image.len() * 2);
        for (i, (pw, observed)) in self.world.iter().zip(&self.image).enumerate() {
            let (u, v) = project_point(&camera, &distortion, pose, pw);
            residuals[i * 2] = u - T::from_f64(observed.x).unwrap();
            residuals[i * 2 + 1] = v - T::from_f64(observed.y).unwrap();
        }
        residuals
    }
}

/// Robust single-view pose estimation for a calibrated camera.
#[derive(Debug, Clone, Default)]
pub struct ExtrinsicSolver {
    pub options: ExtrinsicSolverOptions,
}

impl ExtrinsicSolver {
    pub fn new(options: ExtrinsicSolverOptions) -> Self {
        ExtrinsicSolver { options }
    }

    fn required_inliers(&self) -> usize {
        self.options.min_inliers.max(MIN_CORRESPONDENCES)
    }

    /// Estimates the world-to-camera pose.
    ///
    /// # Errors
    ///
    /// * [`SolveError::PoseNotFound`] with fewer than four correspondences or
    ///   when no hypothesis is supported by `min_inliers` of them.
    /// * [`SolveError::Camera`] when an observation cannot be undistorted.
    pub fn solve(
        &self,
        set: &CorrespondenceSet,
        camera: &IntrinsicModel,
    ) -> Result<ExtrinsicSolution, SolveError> {
        let required = self.required_inliers();
        if set.world.len() != set.image.len() {
            return Err(SolveError::InvalidInput(format!(
                "{} world points for {} image points",
                set.world.len(),
                set.image.len()
            )));
        }
        if set.len() < MIN_CORRESPONDENCES {
            warn!(
                "Pose needs at least {} correspondences, got {}",
                MIN_CORRESPONDENCES,
                set.len()
            );
            return Err(SolveError::PoseNotFound {
                inliers: 0,
                required,
            });
        }

        let bearings = set
            .image
            .iter()
            .map(|p| camera.unproject(p))
            .collect::<Result<Vec<_>, _>>()?;
        let estimator = PnpEstimator {
            set,
            camera,
            bearings,
        };
        let opts = RansacOptions {
            max_iters: self.options.iterations.max(1),
            thresh: self.options.threshold,
            min_inliers: PnpEstimator::MIN_SAMPLES,
            confidence: self.options.confidence,
            seed: self.options.seed,
        };

        let best = ransac(&estimator, &opts).ok_or(SolveError::PoseNotFound {
            inliers: 0,
            required,
        })?;
        if best.inliers.len() < required {
            warn!(
                "Best pose hypothesis is supported by {} of {} correspondences",
                best.inliers.len(),
                set.len()
            );
            return Err(SolveError::PoseNotFound {
                inliers: best.inliers.len(),
                required,
            });
        }
        debug!(
            "RANSAC pose after {} samples: {} inliers, RMS {:.4} px",
            best.iters,
            best.inliers.len(),
            best.inlier_rms
        );

        let mut solution = ExtrinsicSolution {
            model: best.model,
            inliers: best.inliers,
            rms: best.inlier_rms,
        };
        if self.options.refine {
            if let Some(refined) = self.refine(&estimator, &solution) {
                solution = refined;
            }
        }

        info!(
            "Pose from {} of {} correspondences, RMS {:.4} px",
            solution.inliers.len(),
            set.len(),
            solution.rms
        );
        Ok(solution)
    }

    /// Levenberg-Marquardt over the pose on the current inliers. The refined
    /// pose is kept only if it does not lose inliers or raise the RMS.
    fn refine(
        &self,
        estimator: &PnpEstimator<'_>,
        current: &ExtrinsicSolution,
    ) -> Option<ExtrinsicSolution> {
        let set = estimator.set;
        let intrinsics = &estimator.camera.intrinsics;
        let cost = PoseReprojectionCost {
            world: current.inliers.iter().map(|&i| set.world[i]).collect(),
            image: current.inliers.iter().map(|&i| set.image[i]).collect(),
            camera: [intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy],
            distortion: estimator.camera.distortions,
        };

        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(current.inliers.len() * 2, &["pose"], Box::new(cost), None);

        let r = current.model.rotation_vector();
        let t = current.model.translation;
        let mut initial_values = HashMap::new();
        initial_values.insert(
            "pose".to_string(),
            DVector::from_vec(vec![r.x, r.y, r.z, t.x, t.y, t.z]),
        );

        let options = tiny_solver::OptimizerOptions {
            max_iteration: 50,
            verbosity_level: 0,
            ..Default::default()
        };
        let result = LevenbergMarquardtOptimizer::default().optimize(
            &problem,
            &initial_values,
            Some(options),
        )?;
        let p = result.get("pose")?;
        if p.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let model = ExtrinsicModel::from_rotation_vector(
            &Vector3::new(p[0], p[1], p[2]),
            &Vector3::new(p[3], p[4], p[5]),
        );

        let mut inliers = Vec::new();
        let mut sum_sq = 0.0;
        for i in 0..set.len() {
            let r = estimator.residual(&model, i);
            if r <= self.options.threshold {
                inliers.push(i);
                sum_sq += r * r;
            }
        }
        if inliers.len() < current.inliers.len() {
            return None;
        }
        let rms = (sum_sq / inliers.len() as f64).sqrt();
        if inliers.len() == current.inliers.len() && rms > current.rms {
            return None;
        }
        debug!("Refined pose: RMS {:.6} -> {:.6} px", current.rms, rms);
        Some(ExtrinsicSolution {
            model,
            inliers,
            rms,
        })
    }
}

/// Writes `model` as `<root>/Extrinsics<timestamp>.csv` and returns the path.
pub fn persist_extrinsics<P: AsRef<Path>>(
    root: P,
    model: &ExtrinsicModel,
) -> Result<PathBuf, CodecError> {
    let path = root
        .as_ref()
        .join(format!("Extrinsics{}.csv", util::timestamp()));
    save_extrinsics(&path, model)?;
    info!("Extrinsics written to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use crate::codec::load_extrinsics;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn camera() -> IntrinsicModel {
        let mut model = IntrinsicModel::new(
            Intrinsics {
                fx: 700.0,
                fy: 705.0,
                cx: 330.0,
                cy: 250.0,
            },
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap();
        model.distortions[0] = -0.05;
        model.distortions[1] = 0.01;
        model
    }

    fn ground_truth() -> ExtrinsicModel {
        ExtrinsicModel::from_rotation_vector(
            &Vector3::new(0.15, -0.25, 0.05),
            &Vector3::new(0.05, -0.02, 1.5),
        )
    }

    fn correspondences(world: Vec<Vector3<f64>>) -> CorrespondenceSet {
        let camera = camera();
        let pose = ground_truth();
        let image = world
            .iter()
            .map(|p| camera.project_world(&pose, p).unwrap())
            .collect();
        CorrespondenceSet::new(world, image).unwrap()
    }

    fn scattered_points() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(-0.3, -0.2, 0.0),
            Vector3::new(0.25, -0.15, 0.1),
            Vector3::new(0.3, 0.25, -0.05),
            Vector3::new(-0.2, 0.3, 0.15),
            Vector3::new(0.0, 0.0, 0.2),
            Vector3::new(0.1, -0.3, -0.1),
            Vector3::new(-0.35, 0.05, 0.05),
            Vector3::new(0.2, 0.1, -0.15),
        ]
    }

    fn assert_pose_close(pose: &ExtrinsicModel) {
        let truth = ground_truth();
        assert_relative_eq!(pose.rotation, truth.rotation, epsilon = 1e-6);
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_four_exact_correspondences_give_subpixel_pose() {
        let set = correspondences(scattered_points()[..4].to_vec());
        let solution = ExtrinsicSolver::default().solve(&set, &camera()).unwrap();

        assert_eq!(solution.inliers, vec![0, 1, 2, 3]);
        assert!(solution.rms < 1e-3, "rms {}", solution.rms);
        assert_pose_close(&solution.model);

        let m = solution.model.to_matrix();
        assert_eq!(m.shape(), (3, 4));
        assert_relative_eq!(m[(2, 3)], 1.5, epsilon = 1e-6);
    }

    #[test]
    fn test_outlier_is_rejected() {
        let mut set = correspondences(scattered_points());
        set.image[5] += Vector2::new(200.0, -150.0);

        let solution = ExtrinsicSolver::default().solve(&set, &camera()).unwrap();
        assert_eq!(solution.inliers, vec![0, 1, 2, 3, 4, 6, 7]);
        assert!(solution.rms < 1e-3);
        assert_pose_close(&solution.model);
    }

    /// Three correct points leave up to four exact poses (the P3P
    /// ambiguity), so a four-point set with one corrupted point is rejected
    /// rather than fitted to the remaining three.
    #[test]
    fn test_four_points_with_outlier_find_no_pose() {
        let mut set = correspondences(scattered_points()[..4].to_vec());
        set.image[2] += Vector2::new(150.0, 120.0);

        let result = ExtrinsicSolver::default().solve(&set, &camera());
        assert!(matches!(
            result,
            Err(SolveError::PoseNotFound {
                inliers: 3,
                required: 4
            })
        ));
    }

    #[test]
    fn test_too_few_correspondences() {
        let set = correspondences(scattered_points()[..3].to_vec());
        let result = ExtrinsicSolver::default().solve(&set, &camera());
        assert!(matches!(result, Err(SolveError::PoseNotFound { .. })));
    }

    #[test]
    fn test_solve_is_deterministic() {
        let mut set = correspondences(scattered_points());
        set.image[1] += Vector2::new(-80.0, 40.0);
        let solver = ExtrinsicSolver::default();
        let a = solver.solve(&set, &camera()).unwrap();
        let b = solver.solve(&set, &camera()).unwrap();
        assert_eq!(a.inliers, b.inliers);
        assert_eq!(a.model, b.model);
    }

    #[test]
    fn test_reference_set() {
        let set = CorrespondenceSet::reference();
        assert_eq!(set.len(), 4);
        assert_eq!(set.world[2], Vector3::new(85.2069, -423.835, 113.24));
        assert_eq!(set.image[3], Vector2::new(126.5, 715.0));
    }

    #[test]
    fn test_csv_round_trip_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.csv");
        let set = correspondences(scattered_points());
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "x,y,z,u,v").unwrap();
        for (w, i) in set.world.iter().zip(&set.image) {
            writeln!(file, "{},{},{},{},{}", w.x, w.y, w.z, i.x, i.y).unwrap();
        }
        drop(file);
        let back = CorrespondenceSet::from_csv(&path).unwrap();
        assert_eq!(back, set);

        let commented = dir.path().join("commented.csv");
        let mut file = std::fs::File::create(&commented).unwrap();
        writeln!(file, "# Format: x3d,y3d,z3d,x2d,y2d").unwrap();
        writeln!(file, "1.0, 2.0, 3.0, 10.5, 20.25").unwrap();
        writeln!(file, "4,5,6,7,8").unwrap();
        drop(file);
        let parsed = CorrespondenceSet::from_csv(&commented).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.image[0], Vector2::new(10.5, 20.25));
    }

    #[test]
    fn test_csv_rejects_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "x,y,z,u,v\n1,2,3,4\n").unwrap();
        assert!(matches!(
            CorrespondenceSet::from_csv(&path),
            Err(CodecError::MalformedFile { .. })
        ));
        assert!(matches!(
            CorrespondenceSet::from_csv(dir.path().join("missing.csv")),
            Err(CodecError::MalformedFile { .. })
        ));
    }

    #[test]
    fn test_persist_extrinsics_names_file_by_time() {
        let dir = tempfile::tempdir().unwrap();
        let pose = ground_truth();
        let path = persist_extrinsics(dir.path(), &pose).unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Extrinsics") && name.ends_with(".csv"));
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("3"));
        assert_eq!(lines.next(), Some("4"));

        let back = load_extrinsics(&path).unwrap();
        assert_relative_eq!(back.rotation, pose.rotation, epsilon = 1e-12);
        assert_eq!(back.translation, pose.translation);
    }
}
