//! Run configuration, loadable from YAML.
//!
//! Every field has a default, so a partial file only needs the keys it
//! changes:
//!
//! ```yaml
//! pattern:
//!   rows: 6
//!   cols: 9
//! square_size: 0.01908
//! intrinsics:
//!   rational_model: true
//! ```

use crate::optimization::{ExtrinsicSolverOptions, IntrinsicSolverOptions};
use crate::pattern::{ChessboardDetectorOptions, PatternSize};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config {path}: {source}")]
    IOError {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid YAML in {path}: {source}")]
    YamlError {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid configuration: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Inner-corner grid of the calibration board.
    pub pattern: PatternSize,
    /// Edge length of one board square, in world units.
    pub square_size: f64,
    /// Accepted frames needed before solving.
    pub min_frames: usize,
    /// Parent directory of session directories and extrinsic files.
    pub output_root: PathBuf,
    /// Rotate incoming frames 90° clockwise before detection.
    pub rotate_clockwise: bool,
    pub detector: ChessboardDetectorOptions,
    pub intrinsics: IntrinsicSolverOptions,
    pub extrinsics: ExtrinsicSolverOptions,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            pattern: PatternSize::default(),
            square_size: 0.01908,
            min_frames: 11,
            output_root: PathBuf::from("."),
            rotate_clockwise: false,
            detector: ChessboardDetectorOptions::default(),
            intrinsics: IntrinsicSolverOptions::default(),
            extrinsics: ExtrinsicSolverOptions::default(),
        }
    }
}

impl CalibrationConfig {
    /// Loads and validates a YAML config file.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::IOError`] if the file cannot be read.
    /// * [`ConfigError::YamlError`] if it is not valid YAML for this struct.
    /// * [`ConfigError::InvalidValue`] if a value is out of range.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::IOError {
            path: path.display().to_string(),
            source,
        })?;
        let config: CalibrationConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::YamlError {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self).map_err(|source| ConfigError::YamlError {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(path, yaml).map_err(|source| ConfigError::IOError {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pattern.rows < 2 || self.pattern.cols < 2 {
            return Err(ConfigError::InvalidValue(format!(
                "pattern must have at least 2x2 inner corners, got {}x{}",
                self.pattern.cols, self.pattern.rows
            )));
        }
        if !(self.square_size > 0.0 && self.square_size.is_finite()) {
            return Err(ConfigError::InvalidValue(format!(
                "square_size must be positive, got {}",
                self.square_size
            )));
        }
        if self.min_frames == 0 {
            return Err(ConfigError::InvalidValue(
                "min_frames must be at least 1".to_string(),
            ));
        }
        if !(self.extrinsics.threshold > 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "extrinsics.threshold must be positive, got {}",
                self.extrinsics.threshold
            )));
        }
        if !(0.0..1.0).contains(&self.extrinsics.confidence) {
            return Err(ConfigError::InvalidValue(format!(
                "extrinsics.confidence must be in [0, 1), got {}",
                self.extrinsics.confidence
            )));
        }
        Ok(())
    }
}
