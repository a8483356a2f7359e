//! Camera calibration command line.
//!
//! Usage:
//! ```bash
//! # Calibrate from a directory of frames, capturing every frame with a board
//! camcalib calibrate --images frames/ --output runs/
//!
//! # Replay operator key presses (32 capture, 13 solve, 27 exit), one per frame
//! camcalib calibrate --images frames/ --keys 32,0,32,13,27
//!
//! # Estimate a pose from a saved calibration and a correspondence CSV
//! camcalib extrinsics --intrinsics runs/Mar-07-2024-14-05-09/IntrinsicMatrixOpenCV.txt \
//!   --correspondences points.csv
//! ```

use camcalib::capture::{
    solve_event, AutoCapture, CaptureLoop, DirectoryFrameSource, DirectoryOverlay, NullOverlay,
    ScriptedCommands, SessionEvent,
};
use camcalib::codec::load_intrinsics;
use camcalib::config::CalibrationConfig;
use camcalib::optimization::{persist_extrinsics, CorrespondenceSet, ExtrinsicSolver};
use camcalib::pattern::ChessboardDetector;
use camcalib::session::{CalibrationSession, SessionConfig, SessionState};
use camcalib::util;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Chessboard camera calibration tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect the board in a frame sequence, capture frames and solve the intrinsics
    Calibrate {
        /// Directory of frames, read in file-name order
        #[arg(short = 'i', long)]
        images: PathBuf,

        /// YAML configuration file (defaults are used when omitted)
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Parent directory of the session directory (overrides the config)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Rotate frames 90 degrees clockwise before detection
        #[arg(long)]
        rotate: bool,

        /// Write annotated frames to this directory
        #[arg(long)]
        overlays: Option<PathBuf>,

        /// Key codes to replay, one per frame, instead of capturing every frame
        #[arg(long, value_delimiter = ',')]
        keys: Option<Vec<i32>>,
    },
    /// Estimate the camera pose from 3D-2D correspondences
    Extrinsics {
        /// Intrinsic matrix file written by `calibrate`
        #[arg(short = 'k', long)]
        intrinsics: PathBuf,

        /// CSV of `x,y,z,u,v` rows (the built-in four-point set when omitted)
        #[arg(short = 'p', long)]
        correspondences: Option<PathBuf>,

        /// YAML configuration file (defaults are used when omitted)
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Directory of the extrinsics file (overrides the config)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
    /// Write the default configuration as YAML
    DefaultConfig {
        #[arg(short = 'o', long, default_value = "camcalib.yaml")]
        output: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<CalibrationConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(CalibrationConfig::from_yaml_file(path)?)
        }
        None => Ok(CalibrationConfig::default()),
    }
}

fn calibrate(
    config: CalibrationConfig,
    images: &Path,
    overlays: Option<&Path>,
    keys: Option<Vec<i32>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = DirectoryFrameSource::new(images)?;
    let mut session = CalibrationSession::new(SessionConfig::from(&config));
    let capture = CaptureLoop::new(ChessboardDetector::new(config.detector.clone()), config.pattern)
        .rotate_clockwise(config.rotate_clockwise)
        .frame_interval(std::time::Duration::ZERO);

    let report = match (overlays, keys) {
        (Some(dir), Some(keys)) => capture.run(
            &mut session,
            source,
            &mut DirectoryOverlay::new(dir)?,
            &mut ScriptedCommands::from_key_codes(keys),
        )?,
        (Some(dir), None) => capture.run(
            &mut session,
            source,
            &mut DirectoryOverlay::new(dir)?,
            &mut AutoCapture,
        )?,
        (None, Some(keys)) => capture.run(
            &mut session,
            source,
            &mut NullOverlay,
            &mut ScriptedCommands::from_key_codes(keys),
        )?,
        (None, None) => capture.run(&mut session, source, &mut NullOverlay, &mut AutoCapture)?,
    };

    println!(
        "Processed {} frames, accepted {}",
        report.frames,
        session.frame_count()
    );

    // Frames run out before an explicit solve: solve once enough were captured.
    if session.state() == SessionState::Ready {
        if let SessionEvent::SolveFailed { reason } = solve_event(&mut session)? {
            return Err(reason.into());
        }
    }

    match session.calibration() {
        Some(calibration) => {
            println!("\nCalibration");
            println!("===========");
            println!("{:?}", calibration.model);
            println!("RMS reprojection error: {:.4} px", calibration.rms);
            for (view, rms) in calibration.per_view_rms.iter().enumerate() {
                println!("  view {:>3}: {:.4} px", view, rms);
            }
            println!(
                "Relative focal deviation: fx {:.4}, fy {:.4}",
                calibration.focal_uncertainty[0], calibration.focal_uncertainty[1]
            );
            if let Some(dir) = session.directory() {
                println!("Results written to {}", dir.display());
            }
            Ok(())
        }
        None => {
            warn!(
                "Session ended in state {} with {} of {} frames",
                session.state(),
                session.frame_count(),
                config.min_frames
            );
            Err(format!(
                "calibration not computed: {} of {} frames accepted",
                session.frame_count(),
                config.min_frames
            )
            .into())
        }
    }
}

fn extrinsics(
    config: CalibrationConfig,
    intrinsics: &Path,
    correspondences: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let camera = load_intrinsics(intrinsics)?;
    info!("Loaded intrinsics from: {}", intrinsics.display());
    let set = match correspondences {
        Some(path) => CorrespondenceSet::from_csv(path)?,
        None => CorrespondenceSet::reference(),
    };
    info!("Solving pose from {} correspondences", set.len());

    let solution = ExtrinsicSolver::new(config.extrinsics.clone()).solve(&set, &camera)?;
    util::ensure_dir(&config.output_root)?;
    let path = persist_extrinsics(&config.output_root, &solution.model)?;

    println!("\nExtrinsics [R|t]");
    println!("================");
    println!("{:?}", solution.model);
    println!(
        "Inliers: {} / {}, RMS {:.4} px",
        solution.inliers.len(),
        set.len(),
        solution.rms
    );
    match camera.reprojection_rms(&solution.model, &set.world, &set.image) {
        Ok(all) => println!("RMS over all correspondences: {:.4} px", all),
        Err(e) => warn!("Outliers could not be reprojected: {}", e),
    }
    println!("Written to {}", path.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Calibrate {
            images,
            config,
            output,
            rotate,
            overlays,
            keys,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(output) = output {
                config.output_root = output;
            }
            config.rotate_clockwise |= rotate;
            calibrate(config, &images, overlays.as_deref(), keys)
        }
        Commands::Extrinsics {
            intrinsics,
            correspondences,
            config,
            output,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(output) = output {
                config.output_root = output;
            }
            extrinsics(config, &intrinsics, correspondences.as_deref())
        }
        Commands::DefaultConfig { output } => {
            CalibrationConfig::default().to_yaml_file(&output)?;
            println!("Default configuration written to {}", output.display());
            Ok(())
        }
    }
}
