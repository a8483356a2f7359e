//! Plain-text matrix files.
//!
//! A matrix is stored as one token per line: the row count, the column
//! count, then `rows × cols` values in row-major order. Several matrices may
//! follow each other in one file; the intrinsic calibration file holds the
//! 3×3 camera matrix followed by the 8×1 distortion vector.
//!
//! # Precision
//!
//! Values are written with the shortest decimal representation that parses
//! back to the identical `f64` (at most 17 significant digits), switching to
//! scientific notation for very small or very large magnitudes. Decoding an
//! encoded matrix therefore reproduces every finite value bit for bit, and the
//! output does not depend on the host locale.

use crate::camera::{CameraModel, ExtrinsicModel, IntrinsicModel};
use log::debug;
use nalgebra::DMatrix;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Name of the intrinsic calibration file inside a session directory.
pub const INTRINSIC_FILE_NAME: &str = "IntrinsicMatrixOpenCV.txt";

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Malformed matrix file {path}: {reason}")]
    MalformedFile { path: String, reason: String },
    #[error("Cannot encode an empty {rows}x{cols} matrix")]
    EmptyMatrix { rows: usize, cols: usize },
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

const IN_MEMORY: &str = "<memory>";

fn malformed(path: &str, reason: impl Into<String>) -> CodecError {
    CodecError::MalformedFile {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Formats one value so that parsing it yields the same `f64`.
pub fn format_value(value: f64) -> String {
    let magnitude = value.abs();
    if value == 0.0 || !value.is_finite() || (1e-5..1e16).contains(&magnitude) {
        format!("{}", value)
    } else {
        format!("{:e}", value)
    }
}

/// Serialises one matrix.
pub fn encode(matrix: &DMatrix<f64>) -> Result<String, CodecError> {
    let (rows, cols) = matrix.shape();
    if rows == 0 || cols == 0 {
        return Err(CodecError::EmptyMatrix { rows, cols });
    }
    let mut out = String::with_capacity(16 * (rows * cols + 2));
    // Writing into a String cannot fail.
    let _ = writeln!(out, "{}", rows);
    let _ = writeln!(out, "{}", cols);
    for r in 0..rows {
        for c in 0..cols {
            let _ = writeln!(out, "{}", format_value(matrix[(r, c)]));
        }
    }
    Ok(out)
}

/// Parses text holding exactly one matrix.
pub fn decode(text: &str) -> Result<DMatrix<f64>, CodecError> {
    let mut reader = MatrixReader::new(text, IN_MEMORY);
    let matrix = reader.next_matrix()?;
    reader.finish()?;
    Ok(matrix)
}

/// Sequential reader over the tokens of a matrix file.
struct MatrixReader<'a> {
    tokens: std::iter::Enumerate<std::str::Lines<'a>>,
    path: &'a str,
}

impl<'a> MatrixReader<'a> {
    fn new(text: &'a str, path: &'a str) -> Self {
        MatrixReader {
            tokens: text.lines().enumerate(),
            path,
        }
    }

    /// Next non-blank line, with its 1-based line number.
    fn next_token(&mut self) -> Option<(usize, &'a str)> {
        self.tokens
            .by_ref()
            .map(|(i, line)| (i + 1, line.trim()))
            .find(|(_, line)| !line.is_empty())
    }

    fn dimension(&mut self, what: &str) -> Result<usize, CodecError> {
        let (line, token) = self
            .next_token()
            .ok_or_else(|| malformed(self.path, format!("missing {} count", what)))?;
        match token.parse::<usize>() {
            Ok(0) => Err(malformed(
                self.path,
                format!("line {}: {} count must be positive", line, what),
            )),
            Ok(n) => Ok(n),
            Err(_) => Err(malformed(
                self.path,
                format!("line {}: invalid {} count {:?}", line, what, token),
            )),
        }
    }

    fn next_matrix(&mut self) -> Result<DMatrix<f64>, CodecError> {
        let rows = self.dimension("row")?;
        let cols = self.dimension("column")?;
        let expected = rows
            .checked_mul(cols)
            .ok_or_else(|| malformed(self.path, format!("{}x{} is too large", rows, cols)))?;

        let mut values = Vec::with_capacity(expected.min(1 << 16));
        while values.len() < expected {
            let Some((line, token)) = self.next_token() else {
                return Err(malformed(
                    self.path,
                    format!(
                        "declared {}x{} ({} values) but found only {}",
                        rows,
                        cols,
                        expected,
                        values.len()
                    ),
                ));
            };
            let value = token.parse::<f64>().map_err(|_| {
                malformed(self.path, format!("line {}: invalid value {:?}", line, token))
            })?;
            values.push(value);
        }
        Ok(DMatrix::from_row_slice(rows, cols, &values))
    }

    fn finish(mut self) -> Result<(), CodecError> {
        match self.next_token() {
            None => Ok(()),
            Some((line, token)) => Err(malformed(
                self.path,
                format!("line {}: unexpected trailing value {:?}", line, token),
            )),
        }
    }
}

/// Writes `matrices` one after another to `path`, replacing the file.
pub fn write_matrices<P: AsRef<Path>>(
    path: P,
    matrices: &[&DMatrix<f64>],
) -> Result<(), CodecError> {
    let path = path.as_ref();
    let mut encoded = Vec::with_capacity(matrices.len());
    for matrix in matrices {
        encoded.push(encode(matrix)?);
    }

    let mut writer = BufWriter::new(File::create(path)?);
    for text in &encoded {
        writer.write_all(text.as_bytes())?;
    }
    writer.flush()?;
    debug!("Wrote {} matrices to {}", matrices.len(), path.display());
    Ok(())
}

/// Reads exactly `count` matrices from `path`.
///
/// A file that cannot be opened, holds fewer values than its headers
/// declare, or carries extra tokens is reported as
/// [`CodecError::MalformedFile`].
pub fn read_matrices<P: AsRef<Path>>(
    path: P,
    count: usize,
) -> Result<Vec<DMatrix<f64>>, CodecError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let text = fs::read_to_string(path)
        .map_err(|e| malformed(&display, format!("cannot open: {}", e)))?;

    let mut reader = MatrixReader::new(&text, &display);
    let mut matrices = Vec::with_capacity(count);
    for _ in 0..count {
        matrices.push(reader.next_matrix()?);
    }
    reader.finish()?;
    Ok(matrices)
}

/// Writes the camera matrix followed by the 8×1 distortion vector.
pub fn save_intrinsics<P: AsRef<Path>>(
    path: P,
    model: &IntrinsicModel,
) -> Result<(), CodecError> {
    write_matrices(path, &[&model.camera_dmatrix(), &model.distortion_dmatrix()])
}

/// Reads a file written by [`save_intrinsics`].
///
/// Files with a 4- or 5-coefficient distortion block are accepted as well.
pub fn load_intrinsics<P: AsRef<Path>>(path: P) -> Result<IntrinsicModel, CodecError> {
    let path = path.as_ref();
    let matrices = read_matrices(path, 2)?;
    let model = IntrinsicModel::from_matrices(&matrices[0], &matrices[1])
        .map_err(|e| malformed(&path.display().to_string(), e.to_string()))?;
    model
        .validate_params()
        .map_err(|e| malformed(&path.display().to_string(), e.to_string()))?;
    Ok(model)
}

/// Writes the 3×4 `[R | t]` matrix.
pub fn save_extrinsics<P: AsRef<Path>>(
    path: P,
    pose: &ExtrinsicModel,
) -> Result<(), CodecError> {
    write_matrices(path, &[&pose.to_dmatrix()])
}

pub fn load_extrinsics<P: AsRef<Path>>(path: P) -> Result<ExtrinsicModel, CodecError> {
    let path = path.as_ref();
    let mut matrices = read_matrices(path, 1)?;
    let matrix = matrices.remove(0);
    ExtrinsicModel::from_dmatrix(&matrix)
        .map_err(|e| malformed(&path.display().to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use nalgebra::Vector3;
    use tempfile::tempdir;

    #[test]
    fn test_encode_layout() {
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.5, -3.0, 0.0, 1e-9, 6.02e23]);
        let text = encode(&m).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["2", "3", "1", "2.5", "-3", "0", "1e-9", "6.02e23"]);
    }

    #[test]
    fn test_round_trip_is_exact() {
        let values = [
            0.1,
            1.0 / 3.0,
            -2.0_f64.sqrt(),
            std::f64::consts::PI * 1e-12,
            123456789.123456789,
            f64::MAX,
            f64::MIN_POSITIVE,
            -0.0,
        ];
        for (rows, cols) in [(1, 1), (2, 4), (4, 2), (8, 1)] {
            let m = DMatrix::from_fn(rows, cols, |r, c| values[(r * cols + c) % values.len()]);
            let back = decode(&encode(&m).unwrap()).unwrap();
            assert_eq!(back.shape(), (rows, cols));
            for (a, b) in m.iter().zip(back.iter()) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }

    #[test]
    fn test_decode_rejects_short_file() {
        let err = decode("3\n3\n1\n2\n3\n4\n").unwrap_err();
        assert!(matches!(err, CodecError::MalformedFile { .. }), "{:?}", err);
    }

    #[test]
    fn test_decode_rejects_bad_tokens() {
        for text in ["", "3\n", "0\n1\n", "x\n1\n1\n", "1\n1\nabc\n", "1\n1\n2\n3\n"] {
            assert!(
                matches!(decode(text), Err(CodecError::MalformedFile { .. })),
                "{:?} should be malformed",
                text
            );
        }
    }

    #[test]
    fn test_encode_rejects_empty() {
        let m = DMatrix::<f64>::zeros(0, 3);
        assert!(matches!(
            encode(&m),
            Err(CodecError::EmptyMatrix { rows: 0, cols: 3 })
        ));
    }

    #[test]
    fn test_read_missing_file_is_malformed() {
        let dir = tempdir().unwrap();
        let err = read_matrices(dir.path().join("absent.txt"), 1).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFile { .. }));
    }

    #[test]
    fn test_write_into_missing_directory_is_io_error() {
        let dir = tempdir().unwrap();
        let m = DMatrix::from_element(1, 1, 1.0);
        let err = write_matrices(dir.path().join("nope").join("m.txt"), &[&m]).unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }

    #[test]
    fn test_file_with_overstated_dimensions_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.txt");
        fs::write(&path, "4\n4\n1\n2\n3\n").unwrap();
        assert!(matches!(
            read_matrices(&path, 1),
            Err(CodecError::MalformedFile { .. })
        ));
    }

    #[test]
    fn test_intrinsics_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(INTRINSIC_FILE_NAME);
        let mut model = IntrinsicModel::new(
            Intrinsics {
                fx: 812.345678901,
                fy: 809.1,
                cx: 399.75,
                cy: 301.2,
            },
            Resolution {
                width: 800,
                height: 600,
            },
        )
        .unwrap();
        model.distortions = [-0.31, 0.12, 1e-4, -2e-4, -0.02, 0.0, 0.0, 0.0];

        save_intrinsics(&path, &model).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2 + 9 + 2 + 8);
        assert_eq!(&lines[..2], &["3", "3"]);
        assert_eq!(&lines[11..13], &["8", "1"]);

        let loaded = load_intrinsics(&path).unwrap();
        assert_eq!(loaded.intrinsics, model.intrinsics);
        assert_eq!(loaded.distortions, model.distortions);
    }

    #[test]
    fn test_extrinsics_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Extrinsics.csv");
        let pose = ExtrinsicModel::from_rotation_vector(
            &Vector3::new(0.3, 0.2, -0.1),
            &Vector3::new(12.0, -4.5, 310.0),
        );
        save_extrinsics(&path, &pose).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("3\n4\n"));
        let loaded = load_extrinsics(&path).unwrap();
        assert_eq!(loaded.translation, pose.translation);
        approx::assert_relative_eq!(loaded.rotation, pose.rotation, epsilon = 1e-12);
    }
}
