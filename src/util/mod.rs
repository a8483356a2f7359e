//! Small file-system and time helpers shared by the session, the pose
//! solver and the command line.

use chrono::{DateTime, Local, TimeZone};
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;

/// `strftime` layout of session directory names and extrinsic file stamps,
/// e.g. `Mar-07-2024-14-05-09`.
pub const TIMESTAMP_FORMAT: &str = "%b-%d-%Y-%H-%M-%S";

/// Image extensions picked up when reading frames from a directory.
const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff", "pgm"];

/// Formats `time` with [`TIMESTAMP_FORMAT`].
pub fn format_timestamp<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// The current local time formatted with [`TIMESTAMP_FORMAT`].
pub fn timestamp() -> String {
    format_timestamp(&Local::now())
}

/// Creates `path` and its parents if needed. Returns `true` when the
/// directory did not exist before.
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    let path = path.as_ref();
    if path.is_dir() {
        return Ok(false);
    }
    fs::create_dir_all(path)?;
    Ok(true)
}

/// True when the file extension names a supported image format.
pub fn is_image_file<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
