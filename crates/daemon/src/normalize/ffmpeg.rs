//! ffmpeg-backed transcoder.

use super::filter_graph::{AUDIO_OUT, VIDEO_OUT};
use super::scene::{parse_showinfo, scene_filter};
use super::{NormalizeError, TranscodeJob, Transcoder};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Build an ffmpeg command for a transcode job
///
/// Creates a Command configured with:
/// - Optional input loop and seek ahead of the input
/// - Output length cap
/// - The job's filter graph with explicit stream mapping
/// - Audio encoding when the graph has an audio branch, `-an` otherwise
/// - Encoder, preset, CRF, frame rate and thread count
pub fn build_ffmpeg_command(program: &str, job: &TranscodeJob) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(["-hide_banner", "-nostdin", "-y", "-v", "error"]);

    if job.timing.loops > 0 {
        cmd.arg("-stream_loop").arg(job.timing.loops.to_string());
    }
    if job.timing.seek > 0.0 {
        cmd.arg("-ss").arg(format!("{:.3}", job.timing.seek));
    }
    cmd.arg("-i").arg(&job.input);
    cmd.arg("-t").arg(format!("{:.3}", job.timing.duration));

    cmd.arg("-filter_complex").arg(job.graph.render());
    cmd.arg("-map").arg(VIDEO_OUT);

    if job.graph.has_audio() {
        cmd.arg("-map").arg(AUDIO_OUT);
        cmd.arg("-c:a").arg("aac");
        cmd.arg("-b:a").arg(&job.audio_bitrate);
    } else {
        cmd.arg("-an");
    }

    cmd.arg("-c:v").arg(&job.video_codec);
    cmd.arg("-preset").arg(&job.preset);
    cmd.arg("-crf").arg(job.crf.to_string());
    cmd.arg("-r").arg(job.fps.to_string());
    cmd.arg("-threads").arg(job.threads.to_string());
    cmd.arg("-movflags").arg("+faststart");
    cmd.arg(&job.output);

    cmd
}

/// Build the scene-detection command for `input`.
pub fn build_scene_command(program: &str, input: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(["-hide_banner", "-nostdin", "-i"]);
    cmd.arg(input);
    cmd.arg("-vf").arg(scene_filter());
    cmd.args(["-f", "null", "-"]);
    cmd
}

/// Runs jobs through the `ffmpeg` binary on PATH.
///
/// The child is killed when its future is dropped, so a timed-out job stops
/// writing output immediately.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
        }
    }
}

impl FfmpegTranscoder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, job: &TranscodeJob) -> Result<(), NormalizeError> {
        let mut cmd = build_ffmpeg_command(&self.program, job);
        debug!(input = %job.input.display(), graph = %job.graph.render(), "Starting ffmpeg");

        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("").trim().to_string();
        match output.status.code() {
            Some(code) => Err(NormalizeError::TranscoderFailed { code, detail }),
            None => Err(NormalizeError::TranscoderTerminated),
        }
    }

    async fn scene_cuts(&self, input: &Path) -> Result<Vec<f64>, NormalizeError> {
        let output = build_scene_command(&self.program, input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return match output.status.code() {
                Some(code) => Err(NormalizeError::TranscoderFailed {
                    code,
                    detail: "scene detection failed".to_string(),
                }),
                None => Err(NormalizeError::TranscoderTerminated),
            };
        }

        Ok(parse_showinfo(&String::from_utf8_lossy(&output.stderr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::filter_graph::{build_filter_graph, Timing};
    use crate::probe::MediaProbe;
    use proptest::prelude::*;
    use reelrelay_config::NormalizeConfig;
    use std::path::PathBuf;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    fn make_job(has_audio: bool, timing: Timing) -> TranscodeJob {
        let cfg = NormalizeConfig::default();
        let probe = MediaProbe {
            duration: 95.0,
            width: 1920,
            height: 1080,
            codec: "h264".to_string(),
            bitrate: Some(4000),
            fps: 30.0,
            has_audio,
            is_corrupted: false,
        };
        let graph = build_filter_graph(&probe, &timing, &cfg);
        TranscodeJob::new(
            PathBuf::from("/work/in.mp4"),
            PathBuf::from("/work/in_vertical.mp4"),
            graph,
            timing,
            &cfg,
            6,
        )
    }

    #[test]
    fn test_command_seeks_and_caps_length() {
        let job = make_job(
            true,
            Timing {
                seek: 17.5,
                loops: 0,
                duration: 60.0,
            },
        );
        let args = get_command_args(&build_ffmpeg_command("ffmpeg", &job));

        assert!(has_flag_with_value(&args, "-ss", "17.500"));
        assert!(has_flag_with_value(&args, "-t", "60.000"));
        assert!(has_flag_with_value(&args, "-map", "[v]"));
        assert!(has_flag_with_value(&args, "-map", "[a]"));
        assert!(has_flag_with_value(&args, "-threads", "6"));
        assert!(!has_flag(&args, "-stream_loop"));
        assert!(!has_flag(&args, "-an"));

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input, "seek must be an input option");
    }

    #[test]
    fn test_command_without_audio_disables_audio() {
        let job = make_job(
            false,
            Timing {
                seek: 0.0,
                loops: 2,
                duration: 18.0,
            },
        );
        let args = get_command_args(&build_ffmpeg_command("ffmpeg", &job));

        assert!(has_flag(&args, "-an"));
        assert!(!has_flag_with_value(&args, "-map", "[a]"));
        assert!(!has_flag(&args, "-c:a"));
        assert!(has_flag_with_value(&args, "-stream_loop", "2"));
        assert!(!has_flag(&args, "-ss"));
    }

    #[test]
    fn test_scene_command_uses_select_filter() {
        let args = get_command_args(&build_scene_command("ffmpeg", Path::new("/work/in.mp4")));
        assert!(has_flag_with_value(&args, "-vf", "select='gt(scene,0.3)',showinfo"));
        assert!(has_flag_with_value(&args, "-f", "null"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_output_is_last_argument(
            seek in 0.0f64..100.0,
            loops in 0u32..5,
            duration in 1.0f64..60.0,
            has_audio in any::<bool>(),
        ) {
            let job = make_job(has_audio, Timing { seek, loops, duration });
            let args = get_command_args(&build_ffmpeg_command("ffmpeg", &job));

            prop_assert_eq!(args.last().map(String::as_str), Some("/work/in_vertical.mp4"));
            prop_assert!(has_flag_with_value(&args, "-c:v", "libx264"));
            prop_assert_eq!(has_flag(&args, "-an"), !has_audio);
        }
    }
}
