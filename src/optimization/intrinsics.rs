//! Intrinsic calibration from several views of a planar board.
//!
//! The camera matrix is first estimated in closed form from the view
//! homographies, assuming the principal point at the image centre. Every
//! parameter (camera matrix, leading distortion terms and one pose per view)
//! is then refined with the `tiny_solver` Levenberg-Marquardt optimizer.

use crate::camera::rational::distort_normalized;
use crate::camera::{
    CameraModel, ExtrinsicModel, IntrinsicModel, Intrinsics, Resolution, DISTORTION_COEFFICIENTS,
};
use crate::geometry::{find_homography, pose_from_homography, rotate_point};
use crate::optimization::{Optimizer, ProjectionError, SolveError};

use log::{debug, info};
use nalgebra::{DMatrix, DVector, Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Distortion terms refined by default: `k1, k2, p1, p2, k3`.
const BROWN_CONRADY_TERMS: usize = 5;

/// Board points further than this from the `z = 0` plane make the input
/// non-planar.
const PLANARITY_TOLERANCE: f64 = 1e-9;

/// Lower bound on the pixel noise assumed when propagating it into the
/// parameter covariance, so exact synthetic data still gets a finite spread.
const NOISE_FLOOR_PX: f64 = 0.1;

/// Relative central-difference step for the reprojection Jacobian.
const JACOBIAN_STEP: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrinsicSolverOptions {
    /// Refine all eight distortion coefficients instead of the first five.
    pub rational_model: bool,
    /// Levenberg-Marquardt iteration budget.
    pub max_iterations: usize,
    /// Largest acceptable RMS reprojection error, in pixels.
    pub max_rms: f64,
    /// Initial focal lengths above `max_focal_ratio × max(width, height)`
    /// are rejected.
    pub max_focal_ratio: f64,
    /// Smallest acceptable angle, in degrees, between the board normals of
    /// the two most differently oriented views.
    pub min_view_spread_deg: f64,
    /// Largest acceptable standard deviation of `fx` and `fy` relative to
    /// their value, propagated from the reprojection noise through the
    /// Gauss-Newton normal matrix of the refined problem.
    pub max_focal_uncertainty: f64,
}

impl Default for IntrinsicSolverOptions {
    fn default() -> Self {
        IntrinsicSolverOptions {
            rational_model: false,
            max_iterations: 100,
            max_rms: 2.0,
            max_focal_ratio: 50.0,
            min_view_spread_deg: 5.0,
            max_focal_uncertainty: 0.05,
        }
    }
}

/// Result of a successful intrinsic calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrinsicCalibration {
    pub model: IntrinsicModel,
    /// RMS reprojection error over every point of every view, in pixels.
    pub rms: f64,
    /// RMS reprojection error of each view, in input order.
    pub per_view_rms: Vec<f64>,
    /// Distribution of the per-point reprojection distances.
    pub reprojection: ProjectionError,
    /// Standard deviations of `fx` and `fy` divided by their values.
    pub focal_uncertainty: [f64; 2],
}

/// Projects a board point through a pose `[rx, ry, rz, tx, ty, tz]`, the
/// camera `[fx, fy, cx, cy]` and the distortion terms `d`.
pub(crate) fn project_point<T: RealField>(
    camera: &[T],
    d: &[T],
    pose: &[T],
    point: &Vector3<f64>,
) -> (T, T) {
    let w = [pose[0].clone(), pose[1].clone(), pose[2].clone()];
    let p = [
        T::from_f64(point.x).unwrap(),
        T::from_f64(point.y).unwrap(),
        T::from_f64(point.z).unwrap(),
    ];
    let [x, y, z] = rotate_point(&w, &p);
    let x = x + pose[3].clone();
    let y = y + pose[4].clone();
    let z = z + pose[5].clone();

    let (xd, yd) = distort_normalized(x / z.clone(), y / z, d);
    (
        camera[0].clone() * xd + camera[2].clone(),
        camera[1].clone() * yd + camera[3].clone(),
    )
}

fn pose_parameters(pose: &ExtrinsicModel) -> DVector<f64> {
    let r = pose.rotation_vector();
    let t = pose.translation;
    DVector::from_vec(vec![r.x, r.y, r.z, t.x, t.y, t.z])
}

/// Pixel positions of one view, stacked as `[u0, v0, u1, v1, ...]`, for
/// `params = [fx, fy, cx, cy, distortion.., pose (6)]`.
fn project_view(params: &[f64], shared: usize, world: &[Vector3<f64>]) -> DVector<f64> {
    let mut pixels = DVector::zeros(world.len() * 2);
    for (i, pw) in world.iter().enumerate() {
        let (u, v) = project_point(&params[..4], &params[4..shared], &params[shared..], pw);
        pixels[i * 2] = u;
        pixels[i * 2 + 1] = v;
    }
    pixels
}

/// Reprojection residuals of one view. Parameter blocks are
/// `[intrinsics (4), distortion (5 or 8), pose (6)]`.
#[derive(Debug, Clone)]
struct ViewReprojectionCost {
    world: Vec<Vector3<f64>>,
    image: Vec<Vector2<f64>>,
}

impl<T: RealField> Factor<T> for ViewReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let camera = params[0].as_slice();
        let distortion = params[1].as_slice();
        let pose = params[2].as_slice();

        let mut residuals = DVector::zeros(self.image.len() * 2);
        for (i, (pw, observed)) in self.world.iter().zip(&self.image).enumerate() {
            let (u, v) = project_point(camera, distortion, pose, pw);
            residuals[i * 2] = u - T::from_f64(observed.x).unwrap();
            residuals[i * 2 + 1] = v - T::from_f64(observed.y).unwrap();
        }
        residuals
    }
}

/// Calibration problem over a set of board views.
///
/// Holds the observations together with the current estimate of the camera
/// matrix, the refined distortion terms and the per-view poses. It
/// implements [`Optimizer`]: call [`Optimizer::linear_estimation`] first,
/// then [`Optimizer::optimize`].
#[derive(Clone)]
pub struct IntrinsicOptimizationCost {
    world: Vec<Vec<Vector3<f64>>>,
    image: Vec<Vec<Vector2<f64>>>,
    resolution: Resolution,
    options: IntrinsicSolverOptions,
    intrinsics: Intrinsics,
    /// The leading 5 or 8 distortion coefficients being refined.
    distortions: Vec<f64>,
    poses: Vec<ExtrinsicModel>,
}

impl IntrinsicOptimizationCost {
    /// Checks and stores the observations.
    ///
    /// # Arguments
    ///
    /// * `world` - Board points per view, all on the `z = 0` plane.
    /// * `image` - Observed pixel positions per view, index-aligned with
    ///   `world`.
    /// * `resolution` - Size of the images the points were detected in.
    /// * `options` - Solver settings.
    ///
    /// # Errors
    ///
    /// [`SolveError::InvalidInput`] for empty, mismatched, non-finite or
    /// non-planar input and for a zero resolution.
    pub fn new(
        world: &[Vec<Vector3<f64>>],
        image: &[Vec<Vector2<f64>>],
        resolution: Resolution,
        options: IntrinsicSolverOptions,
    ) -> Result<Self, SolveError> {
        if world.is_empty() {
            return Err(SolveError::InvalidInput("no views supplied".to_string()));
        }
        if world.len() != image.len() {
            return Err(SolveError::InvalidInput(format!(
                "{} world point sets for {} image point sets",
                world.len(),
                image.len()
            )));
        }
        if resolution.width == 0 || resolution.height == 0 {
            return Err(SolveError::InvalidInput(
                "image resolution must be non-zero".to_string(),
            ));
        }
        for (view, (w, i)) in world.iter().zip(image).enumerate() {
            if w.len() != i.len() {
                return Err(SolveError::InvalidInput(format!(
                    "view {}: {} world points for {} image points",
                    view,
                    w.len(),
                    i.len()
                )));
            }
            if w.len() < 4 {
                return Err(SolveError::InvalidInput(format!(
                    "view {}: at least 4 points are needed, got {}",
                    view,
                    w.len()
                )));
            }
            if w.iter().any(|p| p.z.abs() > PLANARITY_TOLERANCE) {
                return Err(SolveError::InvalidInput(format!(
                    "view {}: board points must lie on the z = 0 plane",
                    view
                )));
            }
            let finite = w.iter().all(|p| p.iter().all(|v| v.is_finite()))
                && i.iter().all(|p| p.iter().all(|v| v.is_finite()));
            if !finite {
                return Err(SolveError::InvalidInput(format!(
                    "view {}: non-finite coordinates",
                    view
                )));
            }
        }

        let terms = if options.rational_model {
            DISTORTION_COEFFICIENTS
        } else {
            BROWN_CONRADY_TERMS
        };

        Ok(IntrinsicOptimizationCost {
            world: world.to_vec(),
            image: image.to_vec(),
            resolution,
            options,
            intrinsics: Intrinsics {
                fx: 0.0,
                fy: 0.0,
                cx: 0.0,
                cy: 0.0,
            },
            distortions: vec![0.0; terms],
            poses: Vec::new(),
        })
    }

    /// The current estimate as a full eight-coefficient model.
    ///
    /// # Errors
    ///
    /// [`SolveError::PoorConditioning`] if the estimate is not a valid camera.
    pub fn model(&self) -> Result<IntrinsicModel, SolveError> {
        let mut model = IntrinsicModel::new(self.intrinsics.clone(), self.resolution)
            .map_err(|e| SolveError::PoorConditioning(format!("invalid camera estimate: {}", e)))?;
        model.distortions[..self.distortions.len()].copy_from_slice(&self.distortions);
        model
            .validate_params()
            .map_err(|e| SolveError::PoorConditioning(format!("invalid camera estimate: {}", e)))?;
        Ok(model)
    }

    /// Current per-view board poses.
    pub fn poses(&self) -> &[ExtrinsicModel] {
        &self.poses
    }

    /// Reprojection distances of every point, grouped by view.
    fn reprojection_distances(&self, model: &IntrinsicModel) -> Result<Vec<Vec<f64>>, SolveError> {
        if self.poses.len() != self.world.len() {
            return Err(SolveError::InvalidInput(
                "poses have not been estimated".to_string(),
            ));
        }
        self.poses
            .iter()
            .zip(self.world.iter().zip(&self.image))
            .map(|(pose, (world, image))| {
                world
                    .iter()
                    .zip(image)
                    .map(|(pw, observed)| {
                        model
                            .project_world(pose, pw)
                            .map(|p| (p - observed).norm())
                            .map_err(|_| {
                                SolveError::PoorConditioning(
                                    "board point projects behind the camera".to_string(),
                                )
                            })
                    })
                    .collect()
            })
            .collect()
    }

    /// Evaluates the current estimate.
    ///
    /// # Errors
    ///
    /// [`SolveError::PoorConditioning`] when the model is invalid, a point
    /// falls behind the camera, the overall RMS exceeds
    /// [`IntrinsicSolverOptions::max_rms`], or the focal lengths are less
    /// certain than [`IntrinsicSolverOptions::max_focal_uncertainty`].
    pub fn calibration(&self) -> Result<IntrinsicCalibration, SolveError> {
        let model = self.model()?;
        let distances = self.reprojection_distances(&model)?;

        let per_view_rms: Vec<f64> = distances
            .iter()
            .map(|view| (view.iter().map(|d| d * d).sum::<f64>() / view.len() as f64).sqrt())
            .collect();
        let all: Vec<f64> = distances.into_iter().flatten().collect();
        let reprojection = ProjectionError::from_distances(&all)
            .ok_or_else(|| SolveError::InvalidInput("no points".to_string()))?;
        let rms = reprojection.rmse;

        if !rms.is_finite() || rms > self.options.max_rms {
            return Err(SolveError::PoorConditioning(format!(
                "RMS reprojection error {:.4} px exceeds {:.4} px",
                rms, self.options.max_rms
            )));
        }

        let focal_uncertainty = self.focal_uncertainty(rms)?;
        let worst = focal_uncertainty[0].max(focal_uncertainty[1]);
        if !worst.is_finite() || worst > self.options.max_focal_uncertainty {
            return Err(SolveError::PoorConditioning(format!(
                "focal length is unconstrained by the views: relative deviation {:.4} exceeds {:.4}",
                worst, self.options.max_focal_uncertainty
            )));
        }

        Ok(IntrinsicCalibration {
            model,
            rms,
            per_view_rms,
            reprojection,
            focal_uncertainty,
        })
    }

    /// Gauss-Newton normal matrix `JᵀJ` of the reprojection residuals at the
    /// current estimate, over `[fx, fy, cx, cy, distortion.., pose_0, ...]`.
    ///
    /// Each view only touches the shared camera block and its own pose, so
    /// the Jacobian is differentiated view by view and scattered into place.
    fn normal_matrix(&self) -> DMatrix<f64> {
        let shared = 4 + self.distortions.len();
        let size = shared + 6 * self.poses.len();
        let mut normal = DMatrix::<f64>::zeros(size, size);
        let camera = [
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
        ];

        for (view, (world, pose)) in self.world.iter().zip(&self.poses).enumerate() {
            let mut params: Vec<f64> = camera
                .iter()
                .chain(&self.distortions)
                .copied()
                .chain(pose_parameters(pose).iter().copied())
                .collect();

            let mut jacobian = DMatrix::<f64>::zeros(world.len() * 2, params.len());
            for j in 0..params.len() {
                let value = params[j];
                let step = JACOBIAN_STEP * value.abs().max(1.0);
                params[j] = value + step;
                let forward = project_view(&params, shared, world);
                params[j] = value - step;
                let backward = project_view(&params, shared, world);
                params[j] = value;
                jacobian.set_column(j, &((forward - backward) / (2.0 * step)));
            }

            let block = jacobian.transpose() * &jacobian;
            let global = |k: usize| if k < shared { k } else { k + 6 * view };
            for a in 0..params.len() {
                for b in 0..params.len() {
                    normal[(global(a), global(b))] += block[(a, b)];
                }
            }
        }
        normal
    }

    /// Standard deviations of `fx` and `fy`, relative to their values, for
    /// pixel noise of `rms` (floored at [`NOISE_FLOOR_PX`]).
    fn focal_uncertainty(&self, rms: f64) -> Result<[f64; 2], SolveError> {
        let covariance = self
            .normal_matrix()
            .cholesky()
            .map(|c| c.inverse())
            .ok_or_else(|| {
                SolveError::PoorConditioning(
                    "normal matrix of the refined problem is singular".to_string(),
                )
            })?;
        let variance = rms.max(NOISE_FLOOR_PX).powi(2);
        let relative = [
            (variance * covariance[(0, 0)]).sqrt() / self.intrinsics.fx.abs(),
            (variance * covariance[(1, 1)]).sqrt() / self.intrinsics.fy.abs(),
        ];
        debug!(
            "Relative focal deviation: fx {:.5}, fy {:.5}",
            relative[0], relative[1]
        );
        Ok(relative)
    }

    fn max_view_spread_deg(&self) -> f64 {
        let normals: Vec<Vector3<f64>> = self
            .poses
            .iter()
            .map(|p| p.rotation.column(2).into_owned())
            .collect();
        let mut spread: f64 = 0.0;
        for (i, a) in normals.iter().enumerate() {
            for b in &normals[i + 1..] {
                // Board normals are lines: mirrored detections flip the sign.
                let angle = a.dot(b).abs().min(1.0).acos();
                spread = spread.max(angle);
            }
        }
        spread.to_degrees()
    }
}

impl Optimizer for IntrinsicOptimizationCost {
    /// Estimates `fx, fy` from the orthogonality constraints of every view
    /// homography, with the principal point fixed at the image centre, and
    /// recovers one board pose per view.
    ///
    /// With the principal point removed each homography is
    /// `H ∝ diag(fx, fy, 1)·[r1 r2 t]`, so its first two columns `h1, h2`
    /// satisfy, for `a = 1/fx²` and `b = 1/fy²`:
    ///
    /// ```text
    /// a·h1x·h2x + b·h1y·h2y = -h1z·h2z
    /// a·(h1x² - h2x²) + b·(h1y² - h2y²) = -(h1z² - h2z²)
    /// ```
    fn linear_estimation(&mut self) -> Result<(), SolveError> {
        let cx = (self.resolution.width as f64 - 1.0) / 2.0;
        let cy = (self.resolution.height as f64 - 1.0) / 2.0;
        let center = Matrix3::new(
            1.0, 0.0, -cx, //
            0.0, 1.0, -cy, //
            0.0, 0.0, 1.0,
        );

        let mut homographies = Vec::with_capacity(self.world.len());
        for (view, (world, image)) in self.world.iter().zip(&self.image).enumerate() {
            let board: Vec<Vector2<f64>> = world.iter().map(|p| p.xy()).collect();
            let h = find_homography(&board, image).ok_or_else(|| {
                SolveError::PoorConditioning(format!("view {}: degenerate homography", view))
            })?;
            homographies.push(h);
        }

        let rows = homographies.len() * 2;
        let mut a = DMatrix::zeros(rows, 2);
        let mut b = DVector::zeros(rows);
        for (i, h) in homographies.iter().enumerate() {
            let hc = center * h;
            let hc = hc / hc.norm();
            let h1 = hc.column(0).into_owned();
            let h2 = hc.column(1).into_owned();

            a[(2 * i, 0)] = h1.x * h2.x;
            a[(2 * i, 1)] = h1.y * h2.y;
            b[2 * i] = -h1.z * h2.z;

            a[(2 * i + 1, 0)] = h1.x * h1.x - h2.x * h2.x;
            a[(2 * i + 1, 1)] = h1.y * h1.y - h2.y * h2.y;
            b[2 * i + 1] = -(h1.z * h1.z - h2.z * h2.z);
        }

        let svd = a.svd(true, true);
        let max_sv = svd.singular_values.max();
        let min_sv = svd.singular_values.min();
        if !(max_sv > 0.0) || min_sv / max_sv < 1e-10 {
            return Err(SolveError::PoorConditioning(
                "view homographies do not constrain the focal lengths".to_string(),
            ));
        }
        let solution = svd
            .solve(&b, f64::EPSILON)
            .map_err(|e| SolveError::PoorConditioning(e.to_string()))?;
        let (inv_fx2, inv_fy2) = (solution[0], solution[1]);
        if !(inv_fx2 > 0.0 && inv_fy2 > 0.0) {
            return Err(SolveError::PoorConditioning(format!(
                "no positive focal length fits the views (1/fx² = {:e}, 1/fy² = {:e})",
                inv_fx2, inv_fy2
            )));
        }
        let fx = inv_fx2.sqrt().recip();
        let fy = inv_fy2.sqrt().recip();

        let max_focal = self.options.max_focal_ratio
            * self.resolution.width.max(self.resolution.height) as f64;
        if !fx.is_finite() || !fy.is_finite() || fx.max(fy) > max_focal {
            return Err(SolveError::PoorConditioning(format!(
                "initial focal length ({:.1}, {:.1}) exceeds {:.1}",
                fx, fy, max_focal
            )));
        }
        self.intrinsics = Intrinsics { fx, fy, cx, cy };
        debug!("Initial intrinsics: {:?}", self.intrinsics);

        let k = self.intrinsics.to_matrix();
        self.poses = homographies
            .iter()
            .enumerate()
            .map(|(view, h)| {
                pose_from_homography(&k, h)
                    .map(|(r, t)| ExtrinsicModel::new(r, t))
                    .ok_or_else(|| {
                        SolveError::PoorConditioning(format!("view {}: no pose from homography", view))
                    })
            })
            .collect::<Result<_, _>>()?;

        let spread = self.max_view_spread_deg();
        if self.poses.len() < 2 || spread < self.options.min_view_spread_deg {
            return Err(SolveError::PoorConditioning(format!(
                "views lack orientation diversity: board normals span {:.3}° (need {:.3}°)",
                spread, self.options.min_view_spread_deg
            )));
        }
        debug!("Board normals span {:.2}° over {} views", spread, self.poses.len());
        Ok(())
    }

    /// Jointly refines `[fx, fy, cx, cy]`, the leading distortion terms and
    /// every view pose by minimising the pixel reprojection error.
    fn optimize(&mut self, verbose: bool) -> Result<(), SolveError> {
        if self.poses.len() != self.world.len() {
            return Err(SolveError::InvalidInput(
                "linear_estimation must run before optimize".to_string(),
            ));
        }

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert(
            "intrinsics".to_string(),
            DVector::from_vec(vec![
                self.intrinsics.fx,
                self.intrinsics.fy,
                self.intrinsics.cx,
                self.intrinsics.cy,
            ]),
        );
        initial_values.insert(
            "distortion".to_string(),
            DVector::from_vec(self.distortions.clone()),
        );

        for (view, ((world, image), pose)) in self
            .world
            .iter()
            .zip(&self.image)
            .zip(&self.poses)
            .enumerate()
        {
            let key = format!("pose_{}", view);
            let cost = ViewReprojectionCost {
                world: world.clone(),
                image: image.clone(),
            };
            problem.add_residual_block(
                image.len() * 2,
                &["intrinsics", "distortion", key.as_str()],
                Box::new(cost),
                None,
            );
            initial_values.insert(key, pose_parameters(pose));
        }

        if verbose {
            info!(
                "Refining intrinsics over {} views with Levenberg-Marquardt",
                self.world.len()
            );
        }

        let options = tiny_solver::OptimizerOptions {
            max_iteration: self.options.max_iterations,
            verbosity_level: 0,
            ..Default::default()
        };
        let result = LevenbergMarquardtOptimizer::default()
            .optimize(&problem, &initial_values, Some(options))
            .ok_or_else(|| {
                SolveError::PoorConditioning("Levenberg-Marquardt did not converge".to_string())
            })?;

        let block = |name: &str| {
            result
                .get(name)
                .filter(|v| v.iter().all(|x| x.is_finite()))
                .cloned()
                .ok_or_else(|| {
                    SolveError::PoorConditioning(format!("optimizer produced no finite {}", name))
                })
        };

        let camera = block("intrinsics")?;
        self.intrinsics = Intrinsics {
            fx: camera[0],
            fy: camera[1],
            cx: camera[2],
            cy: camera[3],
        };
        self.distortions = block("distortion")?.iter().copied().collect();

        let mut poses = Vec::with_capacity(self.poses.len());
        for view in 0..self.poses.len() {
            let p = block(&format!("pose_{}", view))?;
            poses.push(ExtrinsicModel::from_rotation_vector(
                &Vector3::new(p[0], p[1], p[2]),
                &Vector3::new(p[3], p[4], p[5]),
            ));
        }
        self.poses = poses;

        if verbose {
            info!("Refined intrinsics: {:?}", self.intrinsics);
        }
        Ok(())
    }
}

/// Estimates the camera matrix and lens distortion from board views.
#[derive(Debug, Clone, Default)]
pub struct IntrinsicSolver {
    pub options: IntrinsicSolverOptions,
}

impl IntrinsicSolver {
    pub fn new(options: IntrinsicSolverOptions) -> Self {
        IntrinsicSolver { options }
    }

    /// Calibrates from per-view correspondences.
    ///
    /// `world[i]` and `image[i]` hold the board points and their observed
    /// pixels in view `i`. Distortion starts at zero; terms beyond the
    /// refined ones stay exactly zero in the result.
    ///
    /// # Errors
    ///
    /// * [`SolveError::InvalidInput`] for malformed input.
    /// * [`SolveError::PoorConditioning`] when the views are degenerate or
    ///   the refinement does not reach an acceptable reprojection error.
    pub fn solve(
        &self,
        world: &[Vec<Vector3<f64>>],
        image: &[Vec<Vector2<f64>>],
        resolution: Resolution,
    ) -> Result<IntrinsicCalibration, SolveError> {
        let mut cost = IntrinsicOptimizationCost::new(world, image, resolution, self.options.clone())?;
        cost.linear_estimation()?;
        cost.optimize(false)?;
        let calibration = cost.calibration()?;
        info!(
            "Intrinsic calibration over {} views: RMS {:.4} px, {:?}",
            world.len(),
            calibration.rms,
            calibration.model
        );
        Ok(calibration)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::WorldPatternModel;
    use crate::pattern::PatternSize;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    pub(crate) fn reference_camera() -> IntrinsicModel {
        IntrinsicModel::new(
            Intrinsics {
                fx: 800.0,
                fy: 790.0,
                cx: 322.0,
                cy: 236.0,
            },
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap()
    }

    /// Board poses with the board centre about 0.6 units in front of the
    /// camera, tilted in varied directions.
    pub(crate) fn reference_poses(board: &[Vector3<f64>], views: usize) -> Vec<ExtrinsicModel> {
        const TILTS: [[f64; 3]; 12] = [
            [0.30, 0.00, 0.00],
            [-0.30, 0.00, 0.05],
            [0.00, 0.30, -0.05],
            [0.00, -0.30, 0.00],
            [0.20, 0.20, 0.10],
            [-0.20, 0.25, -0.10],
            [0.25, -0.20, 0.20],
            [-0.25, -0.20, -0.20],
            [0.35, 0.10, 0.00],
            [0.10, -0.35, 0.05],
            [-0.15, 0.30, 0.30],
            [0.00, 0.00, 0.40],
        ];
        let centroid = board.iter().fold(Vector3::zeros(), |acc, p| acc + p) / board.len() as f64;
        (0..views)
            .map(|i| {
                let r = TILTS[i % TILTS.len()];
                let rotation = crate::geometry::rodrigues(&Vector3::new(r[0], r[1], r[2]));
                let offset = Vector3::new(0.01 * (i % 3) as f64, -0.01 * (i % 2) as f64, 0.6);
                ExtrinsicModel::new(rotation, offset - rotation * centroid)
            })
            .collect()
    }

    pub(crate) fn project_views(
        camera: &IntrinsicModel,
        board: &[Vector3<f64>],
        poses: &[ExtrinsicModel],
    ) -> Vec<Vec<Vector2<f64>>> {
        poses
            .iter()
            .map(|pose| {
                board
                    .iter()
                    .map(|p| camera.project_world(pose, p).unwrap())
                    .collect()
            })
            .collect()
    }

    fn board() -> Vec<Vector3<f64>> {
        WorldPatternModel::new(PatternSize::new(6, 9), 0.03).generate()
    }

    /// Views whose board normals trace a cone of half-angle `tilt` radians
    /// around the optical axis, board centre 0.6 units away.
    fn tilt_circle(board: &[Vector3<f64>], views: usize, tilt: f64) -> Vec<ExtrinsicModel> {
        let centroid = board.iter().fold(Vector3::zeros(), |acc, p| acc + p) / board.len() as f64;
        (0..views)
            .map(|i| {
                let angle = std::f64::consts::TAU * i as f64 / views as f64;
                let rotation = crate::geometry::rodrigues(&Vector3::new(
                    tilt * angle.cos(),
                    tilt * angle.sin(),
                    0.0,
                ));
                ExtrinsicModel::new(rotation, Vector3::new(0.0, 0.0, 0.6) - rotation * centroid)
            })
            .collect()
    }

    fn add_noise(image: &mut [Vec<Vector2<f64>>], amplitude: f64, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for p in image.iter_mut().flatten() {
            p.x += rng.random_range(-amplitude..amplitude);
            p.y += rng.random_range(-amplitude..amplitude);
        }
    }

    #[test]
    fn test_recovers_camera_from_synthetic_views() {
        let camera = reference_camera();
        let board = board();
        let poses = reference_poses(&board, 12);
        let image = project_views(&camera, &board, &poses);
        let world = vec![board; 12];

        let result = IntrinsicSolver::default()
            .solve(&world, &image, camera.resolution)
            .unwrap();

        assert!(result.rms < 0.05, "rms {}", result.rms);
        assert_eq!(result.per_view_rms.len(), 12);
        let k = result.model.intrinsics;
        assert!((k.fx - 800.0).abs() < 1.0, "fx {}", k.fx);
        assert!((k.fy - 790.0).abs() < 1.0, "fy {}", k.fy);
        assert!((k.cx - 322.0).abs() < 1.0, "cx {}", k.cx);
        assert!((k.cy - 236.0).abs() < 1.0, "cy {}", k.cy);
        // Terms outside the refined set are untouched.
        assert_eq!(&result.model.distortions[5..], &[0.0, 0.0, 0.0]);
        assert_eq!(result.model.resolution, camera.resolution);
    }

    #[test]
    fn test_recovers_radial_distortion() {
        let mut camera = reference_camera();
        camera.distortions[0] = -0.12;
        camera.distortions[1] = 0.05;
        camera.distortions[2] = 0.001;
        let board = board();
        let poses = reference_poses(&board, 12);
        let image = project_views(&camera, &board, &poses);
        let world = vec![board; 12];

        let result = IntrinsicSolver::default()
            .solve(&world, &image, camera.resolution)
            .unwrap();
        assert!(result.rms < 0.05, "rms {}", result.rms);
        assert!((result.model.distortions[0] + 0.12).abs() < 0.01);
        assert!((result.model.distortions[2] - 0.001).abs() < 1e-3);
    }

    #[test]
    fn test_single_view_is_poorly_conditioned() {
        let camera = reference_camera();
        let board = board();
        let poses = reference_poses(&board, 1);
        let image = project_views(&camera, &board, &poses);

        let result = IntrinsicSolver::default().solve(&[board], &image, camera.resolution);
        assert!(matches!(result, Err(SolveError::PoorConditioning(_))));
    }

    #[test]
    fn test_repeated_view_is_poorly_conditioned() {
        let camera = reference_camera();
        let board = board();
        let poses = vec![reference_poses(&board, 1)[0].clone(); 12];
        let image = project_views(&camera, &board, &poses);
        let world = vec![board; 12];

        let result = IntrinsicSolver::default().solve(&world, &image, camera.resolution);
        assert!(matches!(result, Err(SolveError::PoorConditioning(_))));
    }

    #[test]
    fn test_nearly_identical_noisy_views_are_poorly_conditioned() {
        let camera = reference_camera();
        let board = board();
        let poses = tilt_circle(&board, 12, 0.02);
        let mut image = project_views(&camera, &board, &poses);
        add_noise(&mut image, 0.3, 7);
        let world = vec![board; 12];

        let result = IntrinsicSolver::default().solve(&world, &image, camera.resolution);
        assert!(
            matches!(result, Err(SolveError::PoorConditioning(_))),
            "{:?}",
            result.map(|c| c.model)
        );
    }

    #[test]
    fn test_focal_uncertainty_rejects_small_tilts_without_spread_gate() {
        let camera = reference_camera();
        let board = board();
        let poses = tilt_circle(&board, 12, 0.02);
        let mut image = project_views(&camera, &board, &poses);
        add_noise(&mut image, 0.3, 11);
        let world = vec![board; 12];

        let solver = IntrinsicSolver::new(IntrinsicSolverOptions {
            min_view_spread_deg: 0.0,
            ..Default::default()
        });
        let result = solver.solve(&world, &image, camera.resolution);
        assert!(
            matches!(result, Err(SolveError::PoorConditioning(_))),
            "{:?}",
            result.map(|c| c.model)
        );
    }

    #[test]
    fn test_focal_uncertainty_of_varied_noisy_views() {
        let camera = reference_camera();
        let board = board();
        let poses = reference_poses(&board, 12);
        let mut image = project_views(&camera, &board, &poses);
        add_noise(&mut image, 0.3, 3);
        let world = vec![board; 12];

        let result = IntrinsicSolver::default()
            .solve(&world, &image, camera.resolution)
            .unwrap();
        assert!(result.focal_uncertainty[0] < 0.01, "{:?}", result.focal_uncertainty);
        assert!(result.focal_uncertainty[1] < 0.01, "{:?}", result.focal_uncertainty);
        assert!((result.model.intrinsics.fx - 800.0).abs() < 15.0);
    }

    #[test]
    fn test_rejects_malformed_input() {
        let board = board();
        let resolution = reference_camera().resolution;
        let solver = IntrinsicSolver::default();

        let short = vec![vec![Vector2::zeros(); board.len() - 1]];
        assert!(matches!(
            solver.solve(&[board.clone()], &short, resolution),
            Err(SolveError::InvalidInput(_))
        ));

        let mut lifted = board.clone();
        lifted[3].z = 0.01;
        let image = vec![vec![Vector2::zeros(); board.len()]];
        assert!(matches!(
            solver.solve(&[lifted], &image, resolution),
            Err(SolveError::InvalidInput(_))
        ));

        assert!(matches!(
            solver.solve(&[], &[], resolution),
            Err(SolveError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_optimize_requires_linear_estimation() {
        let camera = reference_camera();
        let board = board();
        let poses = reference_poses(&board, 3);
        let image = project_views(&camera, &board, &poses);
        let world = vec![board; 3];
        let mut cost = IntrinsicOptimizationCost::new(
            &world,
            &image,
            camera.resolution,
            IntrinsicSolverOptions::default(),
        )
        .unwrap();
        assert!(cost.optimize(false).is_err());
        cost.linear_estimation().unwrap();
        assert_eq!(cost.poses().len(), 3);
        let initial = cost.model().unwrap().intrinsics;
        assert!((initial.fx - 800.0).abs() < 40.0, "fx {}", initial.fx);
    }
}
