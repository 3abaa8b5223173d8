//! Startup preflight checks
//!
//! Verifies the external tools the pipeline shells out to before the loop
//! starts:
//! - ffprobe is available
//! - ffmpeg is available and at least version 4 (loudnorm, minterpolate)

use std::process::Command;
use thiserror::Error;

/// Oldest supported ffmpeg major version.
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("Failed to prepare work directory {path}: {source}")]
    WorkDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n6.0-... ..."
/// - Distribution suffixes: "ffmpeg version 4.4.2-0ubuntu0.22.04.1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that `ffprobe -version` runs
pub fn check_ffprobe_available() -> Result<(), StartupError> {
    let output = Command::new("ffprobe")
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfprobeUnavailable(format!(
                "ffprobe -version failed; is FFmpeg installed and in PATH? Error: {}",
                e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfprobeUnavailable(
            "ffprobe -version failed; is FFmpeg installed and in PATH?".to_string(),
        ));
    }

    Ok(())
}

/// Check that an ffmpeg version output satisfies [`MIN_FFMPEG_MAJOR`]
pub fn check_ffmpeg_version_output(version_output: &str) -> Result<u32, StartupError> {
    let major = parse_ffmpeg_version(version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        )));
    }

    Ok(major)
}

/// Run `ffmpeg -version` and check the major version
pub fn check_ffmpeg_version() -> Result<u32, StartupError> {
    let output = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfmpegVersion(format!("Failed to run ffmpeg -version: {}", e))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegVersion(
            "ffmpeg -version failed".to_string(),
        ));
    }

    check_ffmpeg_version_output(&String::from_utf8_lossy(&output.stdout))
}

/// Create the download and output directories if they are missing
pub fn prepare_work_dirs(dirs: &[&std::path::Path]) -> Result<(), StartupError> {
    for dir in dirs {
        std::fs::create_dir_all(dir).map_err(|source| StartupError::WorkDir {
            path: dir.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Run all tool checks in order
///
/// 1. ffprobe availability
/// 2. ffmpeg version
///
/// Returns the detected ffmpeg major version.
pub fn run_startup_checks() -> Result<u32, StartupError> {
    check_ffprobe_available()?;
    check_ffmpeg_version()
}
