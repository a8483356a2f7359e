//! Calibration session: collects accepted frames and runs the intrinsic
//! solve once enough of them are available.
//!
//! ```text
//! Idle --accept--> Accumulating --accept (n >= min_frames)--> Ready --solve--> Solved
//! ```
//!
//! The session directory `<output_root>/<%b-%d-%Y-%H-%M-%S>` is created on
//! the first accepted frame. Frames are saved there as `1.png`, `2.png`, …
//! and a successful solve writes `IntrinsicMatrixOpenCV.txt` and
//! `calibration.json` next to them.

use crate::camera::Resolution;
use crate::codec::{self, CodecError, INTRINSIC_FILE_NAME};
use crate::config::CalibrationConfig;
use crate::geometry::WorldPatternModel;
use crate::optimization::{
    IntrinsicCalibration, IntrinsicSolver, IntrinsicSolverOptions, SolveError,
};
use crate::pattern::{Detection, PatternSize};
use crate::util;

use image::DynamicImage;
use log::{info, warn};
use nalgebra::Vector2;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the JSON calibration report.
pub const REPORT_FILE_NAME: &str = "calibration.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No frame accepted yet.
    Idle,
    /// Some frames accepted, fewer than the solve threshold.
    Accumulating,
    /// Enough frames to solve.
    Ready,
    /// Intrinsics computed and written.
    Solved,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Accumulating => "accumulating",
            SessionState::Ready => "ready",
            SessionState::Solved => "solved",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Cannot {operation} while the session is {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },
    #[error("Not enough frames: {accepted} accepted, {required} required")]
    InsufficientFrames { accepted: usize, required: usize },
    #[error("The pattern was not found in the frame")]
    DetectionFailed,
    #[error("Detection has {found} corners, the pattern has {expected}")]
    DetectionMismatch { expected: usize, found: usize },
    #[error("Frame is {found:?}, earlier frames are {expected:?}")]
    FrameSizeMismatch {
        expected: Resolution,
        found: Resolution,
    },
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Failed to write frame: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write calibration report: {0}")]
    Report(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pattern: PatternSize,
    /// Edge length of one board square, in world units.
    pub square_size: f64,
    /// Accepted frames needed before [`CalibrationSession::solve`] runs.
    pub min_frames: usize,
    /// Parent of the timestamped session directory.
    pub output_root: PathBuf,
    pub solver: IntrinsicSolverOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::from(&CalibrationConfig::default())
    }
}

impl From<&CalibrationConfig> for SessionConfig {
    fn from(config: &CalibrationConfig) -> Self {
        SessionConfig {
            pattern: config.pattern,
            square_size: config.square_size,
            min_frames: config.min_frames,
            output_root: config.output_root.clone(),
            solver: config.intrinsics.clone(),
        }
    }
}

/// An accepted frame and the corners detected in it.
#[derive(Debug, Clone)]
pub struct CalibrationFrame {
    /// 1-based acceptance order; also the PNG file stem.
    pub index: usize,
    pub image: DynamicImage,
    pub corners: Vec<Vector2<f64>>,
    pub path: PathBuf,
}

#[derive(Serialize)]
struct CalibrationReport<'a> {
    frames: usize,
    pattern: PatternSize,
    square_size: f64,
    calibration: &'a IntrinsicCalibration,
}

pub struct CalibrationSession {
    config: SessionConfig,
    board: WorldPatternModel,
    frames: Vec<CalibrationFrame>,
    directory: Option<PathBuf>,
    calibration: Option<IntrinsicCalibration>,
}

impl CalibrationSession {
    pub fn new(config: SessionConfig) -> Self {
        let board = WorldPatternModel::new(config.pattern, config.square_size);
        CalibrationSession {
            config,
            board,
            frames: Vec::new(),
            directory: None,
            calibration: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.calibration.is_some() {
            SessionState::Solved
        } else if self.frames.is_empty() {
            SessionState::Idle
        } else if self.frames.len() < self.config.min_frames {
            SessionState::Accumulating
        } else {
            SessionState::Ready
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[CalibrationFrame] {
        &self.frames
    }

    /// The session directory, once the first frame has been accepted.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn calibration(&self) -> Option<&IntrinsicCalibration> {
        self.calibration.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn resolution(&self) -> Option<Resolution> {
        self.frames.first().map(|f| Resolution {
            width: f.image.width(),
            height: f.image.height(),
        })
    }

    fn ensure_directory(&mut self) -> Result<PathBuf, SessionError> {
        if let Some(dir) = &self.directory {
            return Ok(dir.clone());
        }
        let dir = self.config.output_root.join(util::timestamp());
        util::ensure_dir(&dir)?;
        info!("Session directory {}", dir.display());
        self.directory = Some(dir.clone());
        Ok(dir)
    }

    /// Accepts a frame whose detection matched the full pattern and saves
    /// it as `<n>.png` in the session directory. Returns the new frame count.
    ///
    /// # Errors
    ///
    /// * [`SessionError::InvalidState`] after a successful solve.
    /// * [`SessionError::DetectionFailed`] / [`SessionError::DetectionMismatch`]
    ///   when `detection` does not cover the pattern.
    /// * [`SessionError::FrameSizeMismatch`] when the frame size differs from
    ///   the first accepted frame.
    /// * IO and image errors while saving. The frame is not counted then.
    pub fn accept(
        &mut self,
        image: &DynamicImage,
        detection: &Detection,
    ) -> Result<usize, SessionError> {
        let state = self.state();
        if state == SessionState::Solved {
            return Err(SessionError::InvalidState {
                state,
                operation: "accept a frame",
            });
        }
        if !detection.found {
            warn!("Frame rejected: pattern not found");
            return Err(SessionError::DetectionFailed);
        }
        let expected = self.config.pattern.corner_count();
        if detection.corners.len() != expected {
            warn!(
                "Frame rejected: {} corners detected, {} expected",
                detection.corners.len(),
                expected
            );
            return Err(SessionError::DetectionMismatch {
                expected,
                found: detection.corners.len(),
            });
        }
        let found = Resolution {
            width: image.width(),
            height: image.height(),
        };
        if let Some(expected) = self.resolution() {
            if expected != found {
                return Err(SessionError::FrameSizeMismatch { expected, found });
            }
        }

        let dir = self.ensure_directory()?;
        let index = self.frames.len() + 1;
        let path = dir.join(format!("{}.png", index));
        image.save(&path)?;
        info!("Frame {} saved to {}", index, path.display());

        self.frames.push(CalibrationFrame {
            index,
            image: image.clone(),
            corners: detection.corners.clone(),
            path,
        });
        Ok(self.frames.len())
    }

    /// Runs the intrinsic solve over all accepted frames, then writes
    /// `IntrinsicMatrixOpenCV.txt` and `calibration.json` into the session
    /// directory.
    ///
    /// # Errors
    ///
    /// * [`SessionError::InsufficientFrames`] before `min_frames` frames have
    ///   been accepted; nothing changes.
    /// * [`SessionError::InvalidState`] when already solved.
    /// * [`SessionError::Solve`] when the solver rejects the data; the
    ///   session stays `Ready`.
    pub fn solve(&mut self) -> Result<IntrinsicCalibration, SessionError> {
        let state = self.state();
        match state {
            SessionState::Idle | SessionState::Accumulating => {
                warn!(
                    "Not enough frames to calibrate: {} of {}",
                    self.frames.len(),
                    self.config.min_frames
                );
                return Err(SessionError::InsufficientFrames {
                    accepted: self.frames.len(),
                    required: self.config.min_frames,
                });
            }
            SessionState::Solved => {
                return Err(SessionError::InvalidState {
                    state,
                    operation: "solve",
                })
            }
            SessionState::Ready => {}
        }

        let resolution = self.resolution().unwrap_or_default();
        let world = self.board.replicate(self.frames.len());
        let image: Vec<Vec<Vector2<f64>>> =
            self.frames.iter().map(|f| f.corners.clone()).collect();

        info!("Calibrating from {} frames", self.frames.len());
        let calibration = IntrinsicSolver::new(self.config.solver.clone())
            .solve(&world, &image, resolution)?;

        let dir = self.ensure_directory()?;
        codec::save_intrinsics(dir.join(INTRINSIC_FILE_NAME), &calibration.model)?;
        let report = CalibrationReport {
            frames: self.frames.len(),
            pattern: self.config.pattern,
            square_size: self.config.square_size,
            calibration: &calibration,
        };
        fs::write(dir.join(REPORT_FILE_NAME), serde_json::to_string_pretty(&report)?)?;
        info!(
            "Calibration written to {} (RMS {:.4} px)",
            dir.join(INTRINSIC_FILE_NAME).display(),
            calibration.rms
        );

        self.calibration = Some(calibration.clone());
        Ok(calibration)
    }
}
