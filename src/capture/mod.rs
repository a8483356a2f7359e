//! Interactive capture loop.
//!
//! Each iteration reads one frame, runs the pattern detector, hands the
//! annotated frame to an [`OverlaySink`] and polls a [`CommandSource`] for at
//! most one frame interval:
//!
//! | key   | code | command              |
//! |-------|------|----------------------|
//! | space | 32   | [`Command::Capture`] |
//! | enter | 13   | [`Command::Solve`]   |
//! | esc   | 27   | [`Command::Exit`]    |
//!
//! Frame sources, overlay sinks and command sources are traits so a camera
//! and a window can be plugged in; this crate provides directory-backed and
//! scripted implementations.

use crate::pattern::{draw_detection, PatternDetector, PatternSize};
use crate::session::{CalibrationSession, SessionError};
use crate::util;

use image::{DynamicImage, RgbImage};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Poll interval for 20 frames per second.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(50);

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("Frame source unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Failed to write overlay: {0}")]
    Overlay(#[from] image::ImageError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Capture,
    Solve,
    Exit,
}

impl Command {
    /// Maps a key code to a command. Other keys are ignored.
    pub fn from_key_code(code: i32) -> Option<Self> {
        match code {
            32 => Some(Command::Capture),
            13 => Some(Command::Solve),
            27 => Some(Command::Exit),
            _ => None,
        }
    }
}

/// Produces frames in order. `Ok(None)` ends the stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, CaptureError>;
}

/// Receives the annotated frame of every iteration.
pub trait OverlaySink {
    fn show(&mut self, frame: usize, overlay: &RgbImage) -> Result<(), CaptureError>;
}

/// Delivers operator commands.
pub trait CommandSource {
    /// Waits at most `timeout` for a command.
    fn poll(&mut self, timeout: Duration) -> Option<Command>;
}

/// What happened during one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    FrameShown { frame: usize, found: bool },
    FrameAccepted { frame: usize, count: usize },
    FrameRejected { frame: usize, reason: String },
    Solved { rms: f64, directory: PathBuf },
    SolveFailed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// An [`Command::Exit`] was received.
    Exited,
    /// The frame source ran dry.
    SourceExhausted,
}

#[derive(Debug, Clone)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    pub frames: usize,
    pub events: Vec<SessionEvent>,
}

pub struct CaptureLoop<D: PatternDetector> {
    detector: D,
    pattern: PatternSize,
    rotate_clockwise: bool,
    frame_interval: Duration,
}

impl<D: PatternDetector> CaptureLoop<D> {
    pub fn new(detector: D, pattern: PatternSize) -> Self {
        CaptureLoop {
            detector,
            pattern,
            rotate_clockwise: false,
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }

    /// Rotate every frame 90° clockwise before detection and capture.
    pub fn rotate_clockwise(mut self, rotate: bool) -> Self {
        self.rotate_clockwise = rotate;
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Runs until [`Command::Exit`] or the end of `source`, which is dropped
    /// when the loop returns.
    ///
    /// Rejected captures and failed solves are recorded as events and the
    /// loop continues.
    ///
    /// # Errors
    ///
    /// Frame source and overlay failures, and session IO failures.
    pub fn run<S, O, C>(
        &self,
        session: &mut CalibrationSession,
        mut source: S,
        overlay: &mut O,
        commands: &mut C,
    ) -> Result<LoopReport, CaptureError>
    where
        S: FrameSource,
        O: OverlaySink,
        C: CommandSource,
    {
        let mut events = Vec::new();
        let mut frame_index = 0;

        let outcome = loop {
            let Some(frame) = source.next_frame()? else {
                break LoopOutcome::SourceExhausted;
            };
            frame_index += 1;
            let frame = if self.rotate_clockwise {
                frame.rotate90()
            } else {
                frame
            };

            let detection = self.detector.detect(&frame.to_luma8(), self.pattern);
            let mut canvas = frame.to_rgb8();
            draw_detection(&mut canvas, self.pattern, &detection);
            overlay.show(frame_index, &canvas)?;
            events.push(SessionEvent::FrameShown {
                frame: frame_index,
                found: detection.found,
            });

            match commands.poll(self.frame_interval) {
                Some(Command::Capture) => match session.accept(&frame, &detection) {
                    Ok(count) => events.push(SessionEvent::FrameAccepted {
                        frame: frame_index,
                        count,
                    }),
                    Err(
                        e @ (SessionError::DetectionFailed
                        | SessionError::DetectionMismatch { .. }
                        | SessionError::FrameSizeMismatch { .. }
                        | SessionError::InvalidState { .. }),
                    ) => {
                        debug!("Frame {} not captured: {}", frame_index, e);
                        events.push(SessionEvent::FrameRejected {
                            frame: frame_index,
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                },
                Some(Command::Solve) => events.push(solve_event(session)?),
                Some(Command::Exit) => break LoopOutcome::Exited,
                None => {}
            }
        };

        info!(
            "Capture loop finished after {} frames ({:?}), {} accepted",
            frame_index,
            outcome,
            session.frame_count()
        );
        Ok(LoopReport {
            outcome,
            frames: frame_index,
            events,
        })
    }
}

/// Runs a solve and turns operator-recoverable failures into an event.
pub fn solve_event(session: &mut CalibrationSession) -> Result<SessionEvent, CaptureError> {
    match session.solve() {
        Ok(calibration) => Ok(SessionEvent::Solved {
            rms: calibration.rms,
            directory: session
                .directory()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }),
        Err(
            e @ (SessionError::InsufficientFrames { .. }
            | SessionError::InvalidState { .. }
            | SessionError::Solve(_)),
        ) => {
            warn!("Calibration not computed: {}", e);
            Ok(SessionEvent::SolveFailed {
                reason: e.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Reads the image files of a directory in file-name order.
pub struct DirectoryFrameSource {
    paths: VecDeque<PathBuf>,
}

impl DirectoryFrameSource {
    /// # Errors
    ///
    /// [`CaptureError::DeviceUnavailable`] when the directory cannot be read
    /// or contains no image files.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, CaptureError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|e| {
            CaptureError::DeviceUnavailable(format!("cannot open {}: {}", dir.display(), e))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && util::is_image_file(p))
            .collect();
        if paths.is_empty() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "no images in {}",
                dir.display()
            )));
        }
        paths.sort();
        info!("Reading {} frames from {}", paths.len(), dir.display());
        Ok(DirectoryFrameSource {
            paths: paths.into(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

impl FrameSource for DirectoryFrameSource {
    /// Unreadable files are skipped like dropped camera frames.
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, CaptureError> {
        while let Some(path) = self.paths.pop_front() {
            match image::open(&path) {
                Ok(image) => return Ok(Some(image)),
                Err(e) => warn!("Skipping unreadable frame {}: {}", path.display(), e),
            }
        }
        Ok(None)
    }
}

/// Plays back a fixed command sequence, one entry per poll; `None` entries
/// are polls without a key press.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCommands {
    script: VecDeque<Option<Command>>,
}

impl ScriptedCommands {
    pub fn new<I: IntoIterator<Item = Option<Command>>>(script: I) -> Self {
        ScriptedCommands {
            script: script.into_iter().collect(),
        }
    }

    /// Builds a script from raw key codes; unknown codes become idle polls.
    pub fn from_key_codes<I: IntoIterator<Item = i32>>(codes: I) -> Self {
        ScriptedCommands::new(codes.into_iter().map(Command::from_key_code))
    }
}

impl CommandSource for ScriptedCommands {
    fn poll(&mut self, _timeout: Duration) -> Option<Command> {
        self.script.pop_front().flatten()
    }
}

/// Requests a capture on every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoCapture;

impl CommandSource for AutoCapture {
    fn poll(&mut self, _timeout: Duration) -> Option<Command> {
        Some(Command::Capture)
    }
}

/// Discards overlays.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOverlay;

impl OverlaySink for NullOverlay {
    fn show(&mut self, _frame: usize, _overlay: &RgbImage) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// Writes each overlay as `overlay_<frame>.png`.
pub struct DirectoryOverlay {
    dir: PathBuf,
}

impl DirectoryOverlay {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, CaptureError> {
        let dir = dir.as_ref().to_path_buf();
        util::ensure_dir(&dir).map_err(|e| {
            CaptureError::DeviceUnavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(DirectoryOverlay { dir })
    }
}

impl OverlaySink for DirectoryOverlay {
    fn show(&mut self, frame: usize, overlay: &RgbImage) -> Result<(), CaptureError> {
        overlay.save(self.dir.join(format!("overlay_{:04}.png", frame)))?;
        Ok(())
    }
}
