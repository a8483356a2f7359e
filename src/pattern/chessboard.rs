//! Chessboard inner-corner detector.
//!
//! The detector works in four stages:
//!
//! 1. Contrast normalisation of the grayscale image to `[0, 1]`.
//! 2. An X-corner response computed on a 16-sample ring of radius 5 around
//!    every pixel. Opposite ring samples agree at a chessboard corner while
//!    samples a quarter turn apart disagree, so the response is
//!    `sum − diff − 16·|ring mean − local mean|` where `sum` accumulates the
//!    quarter-turn contrasts and `diff` the opposite-sample differences.
//! 3. Non-maximum suppression, a threshold relative to the strongest
//!    response, and gradient-based sub-pixel refinement of the strongest
//!    `rows × cols` peaks.
//! 4. Grid ordering: the four outer corners are the vertices of the largest
//!    quadrilateral inscribed in the convex hull of the peaks, labelled so
//!    that the row direction runs along a hull edge holding `cols` corners.
//!    A homography from grid indices to those corners predicts every corner,
//!    and each prediction must be matched by a distinct peak.
//!
//! Any failure along the way yields [`Detection::not_found`].

use crate::geometry::find_homography;
use crate::pattern::{Detection, PatternDetector, PatternSize};
use image::GrayImage;
use log::debug;
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Ring sample offsets, clockwise starting straight up. Entry `n + 8` is
/// opposite entry `n`, entry `n + 4` is a quarter turn away.
const RING: [(i32, i32); 16] = [
    (0, -5),
    (2, -5),
    (3, -3),
    (5, -2),
    (5, 0),
    (5, 2),
    (3, 3),
    (2, 5),
    (0, 5),
    (-2, 5),
    (-3, 3),
    (-5, 2),
    (-5, 0),
    (-5, -2),
    (-3, -3),
    (-2, -5),
];
const RING_RADIUS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChessboardDetectorOptions {
    /// Peaks weaker than this fraction of the strongest response are ignored.
    pub relative_threshold: f32,
    /// Half-size of the non-maximum suppression window in pixels.
    pub nms_radius: usize,
    /// Half-size of the sub-pixel refinement window in pixels.
    pub subpixel_window: usize,
    pub subpixel_iterations: usize,
    /// Largest accepted distance between a predicted and a detected corner,
    /// as a fraction of the local grid spacing.
    pub match_tolerance: f64,
}

impl Default for ChessboardDetectorOptions {
    fn default() -> Self {
        ChessboardDetectorOptions {
            relative_threshold: 0.15,
            nms_radius: 3,
            subpixel_window: 4,
            subpixel_iterations: 10,
            match_tolerance: 0.4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChessboardDetector {
    pub options: ChessboardDetectorOptions,
}

impl ChessboardDetector {
    pub fn new(options: ChessboardDetectorOptions) -> Self {
        ChessboardDetector { options }
    }
}

impl PatternDetector for ChessboardDetector {
    fn detect(&self, image: &GrayImage, pattern: PatternSize) -> Detection {
        if pattern.rows < 2 || pattern.cols < 2 {
            debug!("Pattern {:?} is too small to order", pattern);
            return Detection::not_found();
        }
        let Some(plane) = Plane::normalized(image) else {
            return Detection::not_found();
        };

        let response = corner_response(&plane);
        let peaks = strongest_peaks(
            &response,
            plane.width,
            plane.height,
            self.options.nms_radius,
            self.options.relative_threshold,
        );
        let wanted = pattern.corner_count();
        if peaks.len() < wanted {
            debug!("Found {} corner candidates, need {}", peaks.len(), wanted);
            return Detection::not_found();
        }

        let corners: Vec<Vector2<f64>> = peaks[..wanted]
            .iter()
            .map(|p| {
                refine_corner(
                    &plane,
                    p,
                    self.options.subpixel_window,
                    self.options.subpixel_iterations,
                )
            })
            .collect();

        match order_grid(&corners, pattern, self.options.match_tolerance) {
            Some(ordered) => Detection::found(ordered),
            None => {
                debug!("Corner candidates do not form a {:?} grid", pattern);
                Detection::not_found()
            }
        }
    }
}

/// Grayscale image as `f32` in `[0, 1]`, stretched to its own range.
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn normalized(image: &GrayImage) -> Option<Plane> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        if width <= 2 * RING_RADIUS + 2 || height <= 2 * RING_RADIUS + 2 {
            return None;
        }
        let raw = image.as_raw();
        let (lo, hi) = raw
            .iter()
            .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if hi <= lo.saturating_add(8) {
            return None;
        }
        let scale = 1.0 / (hi - lo) as f32;
        let data = raw.iter().map(|&v| (v - lo) as f32 * scale).collect();
        Some(Plane {
            width,
            height,
            data,
        })
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Central-difference gradient at an interior pixel.
    fn gradient(&self, x: usize, y: usize) -> Vector2<f64> {
        let gx = 0.5 * (self.at(x + 1, y) - self.at(x - 1, y));
        let gy = 0.5 * (self.at(x, y + 1) - self.at(x, y - 1));
        Vector2::new(gx as f64, gy as f64)
    }
}

/// X-corner response for every pixel; zero within the ring radius of the
/// border.
fn corner_response(plane: &Plane) -> Vec<f32> {
    let (w, h) = (plane.width, plane.height);
    let mut response = vec![0.0f32; w * h];
    let mut samples = [0.0f32; 16];

    for y in RING_RADIUS..h - RING_RADIUS {
        for x in RING_RADIUS..w - RING_RADIUS {
            for (slot, (dx, dy)) in samples.iter_mut().zip(RING.iter()) {
                let sx = (x as i32 + dx) as usize;
                let sy = (y as i32 + dy) as usize;
                *slot = plane.at(sx, sy);
            }

            let mut sum = 0.0;
            for n in 0..4 {
                sum += (samples[n] + samples[n + 8] - samples[n + 4] - samples[n + 12]).abs();
            }
            let mut diff = 0.0;
            for n in 0..8 {
                diff += (samples[n] - samples[n + 8]).abs();
            }
            let ring_mean = samples.iter().sum::<f32>() / 16.0;
            let local_mean = (plane.at(x, y)
                + plane.at(x - 1, y)
                + plane.at(x + 1, y)
                + plane.at(x, y - 1)
                + plane.at(x, y + 1))
                / 5.0;

            response[y * w + x] = sum - diff - 16.0 * (ring_mean - local_mean).abs();
        }
    }
    response
}

#[derive(Debug, Clone, Copy)]
struct Peak {
    x: usize,
    y: usize,
    score: f32,
}

/// Local maxima above `relative_threshold × max`, strongest first.
///
/// Plateaus are resolved in favour of the first pixel in scan order, so each
/// maximum is reported once.
fn strongest_peaks(
    response: &[f32],
    width: usize,
    height: usize,
    radius: usize,
    relative_threshold: f32,
) -> Vec<Peak> {
    let max = response.iter().cloned().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return Vec::new();
    }
    let threshold = max * relative_threshold;

    let mut peaks = Vec::new();
    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            let score = response[idx];
            if score <= threshold {
                continue;
            }
            let y0 = y.saturating_sub(radius);
            let y1 = (y + radius).min(height - 1);
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius).min(width - 1);

            let mut is_max = true;
            'window: for ny in y0..=y1 {
                for nx in x0..=x1 {
                    let nidx = ny * width + nx;
                    if nidx == idx {
                        continue;
                    }
                    let other = response[nidx];
                    if other > score || (other == score && nidx < idx) {
                        is_max = false;
                        break 'window;
                    }
                }
            }
            if is_max {
                peaks.push(Peak { x, y, score });
            }
        }
    }

    peaks.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then((a.y, a.x).cmp(&(b.y, b.x)))
    });
    peaks
}

/// Sub-pixel corner position: the point `q` minimising
/// `Σ (∇I(p) · (p − q))²` over a Gaussian-weighted window, iterated until the
/// update falls below a hundredth of a pixel.
fn refine_corner(plane: &Plane, peak: &Peak, window: usize, iterations: usize) -> Vector2<f64> {
    let start = Vector2::new(peak.x as f64, peak.y as f64);
    let mut q = start;
    let sigma2 = (window as f64 * 0.5).powi(2).max(0.25);
    let lo = 1usize;

    for _ in 0..iterations {
        let cx = q.x.round() as isize;
        let cy = q.y.round() as isize;
        let mut a = Matrix2::<f64>::zeros();
        let mut b = Vector2::<f64>::zeros();

        for dy in -(window as isize)..=window as isize {
            for dx in -(window as isize)..=window as isize {
                let px = cx + dx;
                let py = cy + dy;
                if px < lo as isize
                    || py < lo as isize
                    || px >= (plane.width - 1) as isize
                    || py >= (plane.height - 1) as isize
                {
                    continue;
                }
                let g = plane.gradient(px as usize, py as usize);
                let weight = (-((dx * dx + dy * dy) as f64) / (2.0 * sigma2)).exp();
                let ggt = g * g.transpose() * weight;
                a += ggt;
                b += ggt * Vector2::new(px as f64, py as f64);
            }
        }

        let Some(next) = a.try_inverse().map(|inv| inv * b) else {
            break;
        };
        if !next.x.is_finite() || !next.y.is_finite() || (next - start).norm() > window as f64 {
            break;
        }
        let step = (next - q).norm();
        q = next;
        if step < 0.01 {
            break;
        }
    }
    q
}

/// Convex hull in counter-clockwise order, collinear points dropped.
fn convex_hull(points: &[Vector2<f64>]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..points.len()).collect();
    idx.sort_by(|&a, &b| {
        points[a]
            .x
            .total_cmp(&points[b].x)
            .then(points[a].y.total_cmp(&points[b].y))
    });
    let cross = |o: usize, a: usize, b: usize| {
        let (o, a, b) = (points[o], points[a], points[b]);
        (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
    };

    let mut hull: Vec<usize> = Vec::with_capacity(2 * points.len());
    for &i in &idx {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], i) <= 0.0 {
            hull.pop();
        }
        hull.push(i);
    }
    let lower_len = hull.len() + 1;
    for &i in idx.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(hull[hull.len() - 2], hull[hull.len() - 1], i) <= 0.0
        {
            hull.pop();
        }
        hull.push(i);
    }
    hull.pop();
    hull
}

fn quad_area(q: &[Vector2<f64>; 4]) -> f64 {
    let mut area = 0.0;
    for k in 0..4 {
        let (a, b) = (q[k], q[(k + 1) % 4]);
        area += a.x * b.y - b.x * a.y;
    }
    0.5 * area.abs()
}

fn distance_to_segment(p: &Vector2<f64>, a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 < f64::EPSILON {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

fn median_neighbour_distance(points: &[Vector2<f64>]) -> f64 {
    let mut nearest: Vec<f64> = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            points
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, q)| (p - q).norm())
                .fold(f64::INFINITY, f64::min)
        })
        .collect();
    nearest.sort_by(|a, b| a.total_cmp(b));
    nearest[nearest.len() / 2]
}

fn apply_homography(h: &Matrix3<f64>, j: f64, i: f64) -> Vector2<f64> {
    let p = h * Vector3::new(j, i, 1.0);
    Vector2::new(p.x / p.z, p.y / p.z)
}

/// Orders exactly `rows × cols` corner candidates row-major, or returns
/// `None` if they do not form the grid.
fn order_grid(
    points: &[Vector2<f64>],
    pattern: PatternSize,
    tolerance: f64,
) -> Option<Vec<Vector2<f64>>> {
    let (rows, cols) = (pattern.rows, pattern.cols);
    if points.len() != rows * cols {
        return None;
    }

    let hull = convex_hull(points);
    if hull.len() < 4 {
        return None;
    }

    // Largest quadrilateral on the hull; hull order keeps it convex.
    let mut best: Option<([usize; 4], f64)> = None;
    let n = hull.len();
    for a in 0..n {
        for b in a + 1..n {
            for c in b + 1..n {
                for d in c + 1..n {
                    let quad = [hull[a], hull[b], hull[c], hull[d]];
                    let area = quad_area(&quad.map(|k| points[k]));
                    if best.map_or(true, |(_, best_area)| area > best_area) {
                        best = Some((quad, area));
                    }
                }
            }
        }
    }
    let (quad, _) = best?;
    let corners = quad.map(|k| points[k]);

    let spacing = median_neighbour_distance(points);
    let edge_tol = 0.25 * spacing;
    let count_on_edge = |a: usize, b: usize| {
        points
            .iter()
            .filter(|p| distance_to_segment(p, &corners[a], &corners[b]) < edge_tol)
            .count()
    };

    // Every labelling (origin, row-direction neighbour, column-direction
    // neighbour) whose edges carry the expected number of corners.
    let mut labellings = Vec::new();
    for o in 0..4 {
        let next = (o + 1) % 4;
        let prev = (o + 3) % 4;
        for (along_row, along_col) in [(next, prev), (prev, next)] {
            if count_on_edge(o, along_row) == cols && count_on_edge(o, along_col) == rows {
                labellings.push((o, along_row, along_col));
            }
        }
    }
    // Start at the top-left-most corner; for square grids run rows rightwards.
    let (o, along_row, along_col) = labellings.into_iter().min_by(|l, r| {
        let key = |&(o, a, _): &(usize, usize, usize)| {
            (corners[o].x + corners[o].y, -(corners[a].x - corners[o].x))
        };
        let (kl, kr) = (key(l), key(r));
        kl.0.total_cmp(&kr.0).then(kl.1.total_cmp(&kr.1))
    })?;
    let opposite = (0..4).find(|k| ![o, along_row, along_col].contains(k))?;

    let last_col = (cols - 1) as f64;
    let last_row = (rows - 1) as f64;
    let grid = [
        Vector2::new(0.0, 0.0),
        Vector2::new(last_col, 0.0),
        Vector2::new(0.0, last_row),
        Vector2::new(last_col, last_row),
    ];
    let image = [
        corners[o],
        corners[along_row],
        corners[along_col],
        corners[opposite],
    ];
    let h = find_homography(&grid, &image)?;

    let mut used = vec![false; points.len()];
    let mut ordered = Vec::with_capacity(points.len());
    for i in 0..rows {
        for j in 0..cols {
            let (fi, fj) = (i as f64, j as f64);
            let predicted = apply_homography(&h, fj, fi);
            let step_j = if j + 1 < cols { fj + 1.0 } else { fj - 1.0 };
            let step_i = if i + 1 < rows { fi + 1.0 } else { fi - 1.0 };
            let local = (apply_homography(&h, step_j, fi) - predicted)
                .norm()
                .min((apply_homography(&h, fj, step_i) - predicted).norm());

            let (k, dist) = points
                .iter()
                .enumerate()
                .filter(|(k, _)| !used[*k])
                .map(|(k, p)| (k, (p - predicted).norm()))
                .min_by(|a, b| a.1.total_cmp(&b.1))?;
            if dist > tolerance * local {
                return None;
            }
            used[k] = true;
            ordered.push(points[k]);
        }
    }
    Some(ordered)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// Renders a chessboard whose inner corner `(i, j)` lands exactly on
    /// `H · (j, i, 1)`. Squares span one grid unit; the board has one extra
    /// square on every side of the inner-corner grid. Pixel centres sit on
    /// integer coordinates and each pixel is 4×4 supersampled.
    pub(crate) fn render_board(
        width: u32,
        height: u32,
        pattern: PatternSize,
        h: &Matrix3<f64>,
    ) -> GrayImage {
        let h_inv = h.try_inverse().unwrap();
        const SS: usize = 4;
        GrayImage::from_fn(width, height, |x, y| {
            let mut acc = 0.0;
            for sy in 0..SS {
                for sx in 0..SS {
                    let px = x as f64 - 0.5 + (sx as f64 + 0.5) / SS as f64;
                    let py = y as f64 - 0.5 + (sy as f64 + 0.5) / SS as f64;
                    let g = h_inv * Vector3::new(px, py, 1.0);
                    let (u, v) = (g.x / g.z, g.y / g.z);
                    let inside = u >= -1.0
                        && v >= -1.0
                        && u < pattern.cols as f64
                        && v < pattern.rows as f64;
                    let dark = inside && (u.floor() as i64 + v.floor() as i64).rem_euclid(2) == 0;
                    acc += if dark { 30.0 } else { 220.0 };
                }
            }
            Luma([(acc / (SS * SS) as f64).round() as u8])
        })
    }

    fn board_homography(scale: f64, origin: (f64, f64), tilt: f64) -> Matrix3<f64> {
        Matrix3::new(
            scale, 0.12 * scale, origin.0, //
            -0.05 * scale, scale, origin.1, //
            tilt, 0.0, 1.0,
        )
    }

    #[test]
    fn test_detects_and_orders_fronto_parallel_board() {
        let pattern = PatternSize::new(4, 5);
        let h = Matrix3::new(24.0, 0.0, 60.5, 0.0, 24.0, 50.5, 0.0, 0.0, 1.0);
        let image = render_board(240, 200, pattern, &h);

        let detection = ChessboardDetector::default().detect(&image, pattern);
        assert!(detection.found);
        assert!(detection.matches(pattern));

        for i in 0..pattern.rows {
            for j in 0..pattern.cols {
                let expected = apply_homography(&h, j as f64, i as f64);
                let got = detection.corners[i * pattern.cols + j];
                assert!(
                    (got - expected).norm() < 0.25,
                    "corner ({}, {}) at {:?}, expected {:?}",
                    i,
                    j,
                    got,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_detects_perspective_board() {
        let pattern = PatternSize::new(5, 7);
        let h = board_homography(22.0, (70.0, 60.0), 0.0015);
        let image = render_board(320, 260, pattern, &h);

        let detection = ChessboardDetector::default().detect(&image, pattern);
        assert!(detection.matches(pattern));

        // Row-major order: consecutive corners in a row step along the rows,
        // and every corner is close to its rendered position.
        for i in 0..pattern.rows {
            for j in 0..pattern.cols {
                let expected = apply_homography(&h, j as f64, i as f64);
                let got = detection.corners[i * pattern.cols + j];
                assert!((got - expected).norm() < 0.35, "corner ({}, {})", i, j);
            }
        }
    }

    #[test]
    fn test_detection_is_deterministic() {
        let pattern = PatternSize::new(4, 6);
        let h = board_homography(20.0, (50.0, 40.0), 0.001);
        let image = render_board(260, 200, pattern, &h);
        let detector = ChessboardDetector::default();
        assert_eq!(
            detector.detect(&image, pattern),
            detector.detect(&image, pattern)
        );
    }

    #[test]
    fn test_wrong_pattern_size_is_not_found() {
        let h = Matrix3::new(24.0, 0.0, 60.5, 0.0, 24.0, 50.5, 0.0, 0.0, 1.0);
        let image = render_board(240, 200, PatternSize::new(4, 5), &h);
        let detector = ChessboardDetector::default();

        let larger = detector.detect(&image, PatternSize::new(5, 6));
        assert!(!larger.found);
        assert!(larger.corners.is_empty());
    }

    #[test]
    fn test_blank_image_is_not_found() {
        let image = GrayImage::from_pixel(120, 90, Luma([128]));
        let detection = ChessboardDetector::default().detect(&image, PatternSize::new(4, 5));
        assert_eq!(detection, Detection::not_found());
    }

    #[test]
    fn test_convex_hull_drops_collinear_points() {
        let mut points = Vec::new();
        for i in 0..3 {
            for j in 0..4 {
                points.push(Vector2::new(j as f64, i as f64));
            }
        }
        let hull = convex_hull(&points);
        assert_eq!(hull.len(), 4);
    }
}
