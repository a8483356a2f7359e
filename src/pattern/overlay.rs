//! Diagnostic drawing of detected corners.

use crate::pattern::{Detection, PatternSize};
use image::{Rgb, RgbImage};
use nalgebra::Vector2;

const ROW_COLORS: [Rgb<u8>; 6] = [
    Rgb([255, 0, 0]),
    Rgb([255, 128, 0]),
    Rgb([200, 200, 0]),
    Rgb([0, 255, 0]),
    Rgb([0, 200, 255]),
    Rgb([255, 0, 255]),
];
const MISS_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const MARKER_RADIUS: i64 = 4;

/// Draws a detection onto `canvas`.
///
/// A complete detection is drawn as coloured crosses, one colour per row,
/// joined in detection order so the row-major ordering is visible. An
/// incomplete one only marks whatever corners it carries, in red.
pub fn draw_detection(canvas: &mut RgbImage, pattern: PatternSize, detection: &Detection) {
    if !detection.matches(pattern) {
        for corner in &detection.corners {
            draw_circle(canvas, corner, MARKER_RADIUS, MISS_COLOR);
        }
        return;
    }

    let mut previous: Option<&Vector2<f64>> = None;
    for (idx, corner) in detection.corners.iter().enumerate() {
        let color = ROW_COLORS[(idx / pattern.cols) % ROW_COLORS.len()];
        if let Some(prev) = previous {
            draw_line(canvas, prev, corner, color);
        }
        draw_cross(canvas, corner, MARKER_RADIUS, color);
        draw_circle(canvas, corner, MARKER_RADIUS, color);
        previous = Some(corner);
    }
}

fn put(canvas: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, color);
    }
}

/// Clips the segment to the pixel rectangle of `canvas` (Liang-Barsky).
/// `None` when nothing of it is visible or an endpoint is not finite.
fn clip_to_canvas(
    canvas: &RgbImage,
    from: &Vector2<f64>,
    to: &Vector2<f64>,
) -> Option<(Vector2<f64>, Vector2<f64>)> {
    if canvas.width() == 0 || canvas.height() == 0 {
        return None;
    }
    if !from.iter().chain(to.iter()).all(|v| v.is_finite()) {
        return None;
    }
    let max_x = canvas.width() as f64 - 1.0;
    let max_y = canvas.height() as f64 - 1.0;
    let d = to - from;
    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    for (p, q) in [
        (-d.x, from.x),
        (d.x, max_x - from.x),
        (-d.y, from.y),
        (d.y, max_y - from.y),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let t = q / p;
        if p < 0.0 {
            t0 = t0.max(t);
        } else {
            t1 = t1.min(t);
        }
        if t0 > t1 {
            return None;
        }
    }
    Some((from + d * t0, from + d * t1))
}

fn draw_line(canvas: &mut RgbImage, from: &Vector2<f64>, to: &Vector2<f64>, color: Rgb<u8>) {
    let Some((from, to)) = clip_to_canvas(canvas, from, to) else {
        return;
    };
    let (mut x0, mut y0) = (from.x.round() as i64, from.y.round() as i64);
    let (x1, y1) = (to.x.round() as i64, to.y.round() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put(canvas, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn draw_cross(canvas: &mut RgbImage, center: &Vector2<f64>, radius: i64, color: Rgb<u8>) {
    let (cx, cy) = (center.x.round() as i64, center.y.round() as i64);
    for d in -radius..=radius {
        put(canvas, cx + d, cy + d, color);
        put(canvas, cx + d, cy - d, color);
    }
}

fn draw_circle(canvas: &mut RgbImage, center: &Vector2<f64>, radius: i64, color: Rgb<u8>) {
    let (cx, cy) = (center.x.round() as i64, center.y.round() as i64);
    let (mut x, mut y) = (radius, 0i64);
    let mut err = 1 - radius;
    while x >= y {
        for (px, py) in [
            (x, y),
            (y, x),
            (-y, x),
            (-x, y),
            (-x, -y),
            (-y, -x),
            (y, -x),
            (x, -y),
        ] {
            put(canvas, cx + px, cy + py, color);
        }
        y += 1;
        if err < 0 {
            err += 2 * y + 1;
        } else {
            x -= 1;
            err += 2 * (y - x) + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_draw_found_detection_marks_corners() {
        let pattern = PatternSize::new(2, 2);
        let corners = vec![
            Vector2::new(10.0, 10.0),
            Vector2::new(30.0, 10.0),
            Vector2::new(10.0, 30.0),
            Vector2::new(30.0, 30.0),
        ];
        let mut canvas = RgbImage::new(40, 40);
        draw_detection(&mut canvas, pattern, &Detection::found(corners));

        assert_eq!(*canvas.get_pixel(10, 10), ROW_COLORS[0]);
        assert_eq!(*canvas.get_pixel(30, 30), ROW_COLORS[1]);
        // The first row is joined by a line.
        assert_eq!(*canvas.get_pixel(20, 10), ROW_COLORS[0]);
    }

    #[test]
    fn test_lines_to_far_corners_are_clipped() {
        let pattern = PatternSize::new(1, 3);
        let corners = vec![
            Vector2::new(-1.0e9, 20.0),
            Vector2::new(20.0, 20.0),
            Vector2::new(1.0e12, 1.0e12),
        ];
        let mut canvas = RgbImage::new(40, 40);
        draw_detection(&mut canvas, pattern, &Detection::found(corners));

        assert_eq!(*canvas.get_pixel(0, 20), ROW_COLORS[0]);
        assert_eq!(*canvas.get_pixel(35, 35), ROW_COLORS[0]);
        assert_eq!(*canvas.get_pixel(39, 39), ROW_COLORS[0]);
    }

    #[test]
    fn test_clip_to_canvas() {
        let canvas = RgbImage::new(10, 10);
        let (a, b) =
            clip_to_canvas(&canvas, &Vector2::new(-10.0, 5.0), &Vector2::new(20.0, 5.0)).unwrap();
        assert_relative_eq!(a, Vector2::new(0.0, 5.0), epsilon = 1e-9);
        assert_relative_eq!(b, Vector2::new(9.0, 5.0), epsilon = 1e-9);

        let outside = clip_to_canvas(&canvas, &Vector2::new(-5.0, -5.0), &Vector2::new(-1.0, 20.0));
        assert!(outside.is_none());
        let invalid = clip_to_canvas(&canvas, &Vector2::new(2.0, 2.0), &Vector2::new(f64::NAN, 3.0));
        assert!(invalid.is_none());
    }

    #[test]
    fn test_draw_partial_detection_uses_miss_color() {
        let pattern = PatternSize::new(2, 2);
        let detection = Detection {
            found: false,
            corners: vec![Vector2::new(20.0, 20.0), Vector2::new(-50.0, 500.0)],
        };
        let mut canvas = RgbImage::new(40, 40);
        draw_detection(&mut canvas, pattern, &detection);
        assert_eq!(*canvas.get_pixel(24, 20), MISS_COLOR);
        assert_eq!(*canvas.get_pixel(20, 20), Rgb([0, 0, 0]));
    }
}
