//! Camera Calibration Library
//!
//! Chessboard-based calibration of a single camera:
//! - Chessboard inner-corner detection and overlay drawing
//! - Planar world model of the calibration board
//! - Capture session that accumulates frames and solves the intrinsics
//! - Multi-view intrinsic solve with an eight-coefficient rational lens model
//! - RANSAC pose estimation from 3D-2D correspondences
//! - A plain-text matrix file format for the results
//!
//! Non-linear refinement uses the tiny-solver optimization framework.

pub mod camera;
pub mod capture;
pub mod codec;
pub mod config;
pub mod geometry;
pub mod optimization;
pub mod pattern;
pub mod session;
pub mod util;

// Re-export commonly used types
pub use camera::{
    CameraModel, CameraModelError, ExtrinsicModel, IntrinsicModel, Intrinsics, Resolution,
};

pub use capture::{CaptureLoop, Command, SessionEvent};
pub use codec::CodecError;
pub use config::CalibrationConfig;
pub use geometry::WorldPatternModel;
pub use optimization::{
    CorrespondenceSet, ExtrinsicSolver, IntrinsicCalibration, IntrinsicSolver, SolveError,
};
pub use pattern::{ChessboardDetector, Detection, PatternDetector, PatternSize};
pub use session::{CalibrationSession, SessionError, SessionState};
