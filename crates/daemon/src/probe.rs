//! Media probing via ffprobe and a decode-only integrity pass.
//!
//! A file is probed exactly once after retrieval; the resulting
//! [`MediaProbe`] is threaded through the gate and the normalizer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe or ffmpeg exited unsuccessfully.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The file has no video stream.
    #[error("no video stream")]
    NoVideo,

    /// IO error while spawning the tool.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Properties of a retrieved file as reported by the prober.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaProbe {
    /// Container duration in seconds.
    pub duration: f64,
    /// Display width in pixels (rotation applied).
    pub width: u32,
    /// Display height in pixels (rotation applied).
    pub height: u32,
    /// Codec of the first video stream.
    pub codec: String,
    /// Video bitrate in kbps, if reported.
    pub bitrate: Option<u64>,
    /// Average frame rate; 0.0 when unknown.
    pub fps: f64,
    pub has_audio: bool,
    /// Set by the integrity pass.
    pub is_corrupted: bool,
}

impl MediaProbe {
    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }

    pub fn is_landscape(&self) -> bool {
        self.width > self.height
    }
}

/// Something that can inspect a media file.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Reads stream and container metadata.
    async fn probe(&self, path: &Path) -> Result<MediaProbe, ProbeError>;

    /// Decodes the whole file and reports whether any decoder error occurred.
    async fn is_corrupted(&self, path: &Path) -> Result<bool, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        pub duration: Option<String>,
        pub tags: Option<Tags>,
        pub side_data_list: Option<Vec<SideData>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Tags {
        pub rotate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct SideData {
        pub rotation: Option<f64>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Parses an ffprobe frame-rate fraction such as `30000/1001`.
///
/// Returns `None` for `0/0` and other non-positive values.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

fn quarter_turned(stream: &ffprobe_json::Stream) -> bool {
    let from_tag = stream
        .tags
        .as_ref()
        .and_then(|t| t.rotate.as_deref())
        .and_then(|r| r.trim().parse::<f64>().ok());
    let from_side_data = stream
        .side_data_list
        .iter()
        .flatten()
        .find_map(|s| s.rotation);

    from_tag
        .or(from_side_data)
        .map(|deg| (deg.abs().round() as i64) % 180 == 90)
        .unwrap_or(false)
}

/// Parses ffprobe JSON output into a [`MediaProbe`].
///
/// `is_corrupted` is always false here; the integrity pass sets it.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaProbe, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format;

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideo)?;
    let has_audio = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let (mut width, mut height) = (video.width.unwrap_or(0), video.height.unwrap_or(0));
    if quarter_turned(video) {
        std::mem::swap(&mut width, &mut height);
    }

    let fps = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);

    let parse_f64 = |s: Option<&String>| s.and_then(|v| v.parse::<f64>().ok());

    let duration = parse_f64(format.as_ref().and_then(|f| f.duration.as_ref()))
        .or_else(|| parse_f64(video.duration.as_ref()))
        .unwrap_or(0.0);

    let bitrate = parse_f64(video.bit_rate.as_ref())
        .or_else(|| parse_f64(format.as_ref().and_then(|f| f.bit_rate.as_ref())))
        .map(|bps| (bps / 1000.0).round() as u64);

    Ok(MediaProbe {
        duration,
        width,
        height,
        codec: video.codec_name.clone().unwrap_or_default(),
        bitrate,
        fps,
        has_audio,
        is_corrupted: false,
    })
}

/// Prober backed by the `ffprobe` and `ffmpeg` binaries on PATH.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe: String,
    ffmpeg: String,
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self {
            ffprobe: "ffprobe".to_string(),
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

impl FfprobeProber {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaProbe, ProbeError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }

    async fn is_corrupted(&self, path: &Path) -> Result<bool, ProbeError> {
        let output = Command::new(&self.ffmpeg)
            .args(["-nostdin", "-v", "error", "-xerror", "-i"])
            .arg(path)
            .args(["-f", "null", "-"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let corrupted = !output.status.success() || !stderr.trim().is_empty();
        if corrupted {
            debug!(
                path = %path.display(),
                detail = %stderr.lines().next().unwrap_or(""),
                "Decode pass reported errors"
            );
        }
        Ok(corrupted)
    }
}
