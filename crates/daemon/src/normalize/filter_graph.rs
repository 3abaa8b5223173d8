//! Adaptive filter graph and timing plan for the vertical output format.

use crate::probe::MediaProbe;
use reelrelay_config::NormalizeConfig;

/// Output pad of the video branch.
pub const VIDEO_OUT: &str = "[v]";
/// Output pad of the audio branch.
pub const AUDIO_OUT: &str = "[a]";

/// How the scaled frame is fitted to the target aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// Scaled height is short of the target: letterbox.
    Pad,
    /// Scaled height exceeds the target: center crop.
    Crop,
    /// Already the target aspect, or source dimensions unknown.
    Exact,
}

/// Decides between padding and cropping by comparing the height after
/// scaling to the target width with the target height.
pub fn choose_fit(width: u32, height: u32, target_width: u32, target_height: u32) -> Fit {
    if width == 0 || height == 0 {
        return Fit::Exact;
    }
    let scaled = f64::from(height) * f64::from(target_width) / f64::from(width);
    // ffmpeg rounds `-2` to the nearest even value
    let scaled = ((scaled / 2.0).round() * 2.0) as u32;

    match scaled.cmp(&target_height) {
        std::cmp::Ordering::Less => Fit::Pad,
        std::cmp::Ordering::Greater => Fit::Crop,
        std::cmp::Ordering::Equal => Fit::Exact,
    }
}

/// Seek, loop and length decisions for one transcode.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    /// Input seek in seconds.
    pub seek: f64,
    /// Extra plays of the input (`-stream_loop`).
    pub loops: u32,
    /// Final output length in seconds.
    pub duration: f64,
}

/// Plans timing for a source of `source_duration` seconds.
///
/// Longer than the target: start at `offset` (clamped into range) and cap at
/// the target. Shorter than the floor: loop the fewest times that reach the
/// floor, capped at the target. Otherwise the source plays through once.
pub fn plan_timing(source_duration: f64, cfg: &NormalizeConfig, offset: f64) -> Timing {
    let target = cfg.target_duration;

    if source_duration <= 0.0 {
        return Timing {
            seek: 0.0,
            loops: 0,
            duration: target,
        };
    }

    if source_duration > target {
        let latest = source_duration - target;
        return Timing {
            seek: offset.clamp(0.0, latest),
            loops: 0,
            duration: target,
        };
    }

    if source_duration < cfg.min_output_duration {
        let plays = (cfg.min_output_duration / source_duration).ceil().max(1.0);
        return Timing {
            seek: 0.0,
            loops: plays as u32 - 1,
            duration: (source_duration * plays).min(target),
        };
    }

    Timing {
        seek: 0.0,
        loops: 0,
        duration: source_duration,
    }
}

/// Start offset that centers the target window in the source.
pub fn center_offset(source_duration: f64, target_duration: f64) -> f64 {
    ((source_duration - target_duration) / 2.0).max(0.0)
}

/// A rendered `-filter_complex` description plus bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterGraph {
    video: Vec<String>,
    audio: Vec<String>,
}

impl FilterGraph {
    /// True when the graph produces an audio stream.
    pub fn has_audio(&self) -> bool {
        !self.audio.is_empty()
    }

    /// Filter names in application order, video first.
    pub fn applied_filters(&self) -> Vec<String> {
        self.video
            .iter()
            .chain(self.audio.iter())
            .map(|f| f.split('=').next().unwrap_or(f).to_string())
            .collect()
    }

    /// The `-filter_complex` argument.
    pub fn render(&self) -> String {
        let mut graph = format!("[0:v]{}{}", self.video.join(","), VIDEO_OUT);
        if self.has_audio() {
            graph.push_str(&format!(";[0:a]{}{}", self.audio.join(","), AUDIO_OUT));
        }
        graph
    }
}

fn secs(value: f64) -> String {
    format!("{:.3}", value)
}

/// Builds the graph for one probed source and its timing plan.
pub fn build_filter_graph(
    probe: &MediaProbe,
    timing: &Timing,
    cfg: &NormalizeConfig,
) -> FilterGraph {
    let (w, h) = (cfg.target_width, cfg.target_height);
    let fade_out_start = (timing.duration - cfg.fade_secs).max(0.0);

    let mut video = Vec::new();
    match choose_fit(probe.width, probe.height, w, h) {
        Fit::Pad => {
            video.push(format!("scale={}:-2", w));
            video.push(format!("pad={}:{}:(ow-iw)/2:(oh-ih)/2:color=black", w, h));
        }
        Fit::Crop => {
            video.push(format!("scale={}:-2", w));
            video.push(format!("crop={}:{}:(iw-ow)/2:(ih-oh)/2", w, h));
        }
        Fit::Exact => video.push(format!("scale={}:{}", w, h)),
    }
    video.push("setsar=1".to_string());
    video.push(format!(
        "eq=contrast={}:brightness={}",
        cfg.contrast, cfg.brightness
    ));
    video.push("unsharp=5:5:1.0".to_string());

    if probe.fps > 0.0 && probe.fps < f64::from(cfg.target_fps) {
        video.push(format!("minterpolate=fps={}:mi_mode=mci", cfg.target_fps));
    }

    video.push(format!("fade=t=in:st=0:d={}", secs(cfg.fade_secs)));
    video.push(format!(
        "fade=t=out:st={}:d={}",
        secs(fade_out_start),
        secs(cfg.fade_secs)
    ));
    video.push("format=yuv420p".to_string());

    let mut audio = Vec::new();
    if probe.has_audio {
        audio.push(format!("atrim=duration={}", secs(timing.duration)));
        audio.push("asetpts=PTS-STARTPTS".to_string());
        audio.push(format!(
            "loudnorm=I={}:TP=-1.5:LRA=11",
            cfg.loudness_target
        ));
        audio.push(format!("afade=t=in:st=0:d={}", secs(cfg.fade_secs)));
        audio.push(format!(
            "afade=t=out:st={}:d={}",
            secs(fade_out_start),
            secs(cfg.fade_secs)
        ));
    }

    FilterGraph { video, audio }
}
