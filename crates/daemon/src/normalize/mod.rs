//! Normalizer: transforms accepted media into the fixed vertical format.
//!
//! At most one transcode runs at a time. Each job is bounded by a wall-clock
//! timeout, and any partial output is removed before an error is returned.

pub mod ffmpeg;
pub mod filter_graph;
pub mod scene;

pub use ffmpeg::FfmpegTranscoder;
pub use filter_graph::{build_filter_graph, plan_timing, FilterGraph, Timing};

use crate::probe::MediaProbe;
use async_trait::async_trait;
use reelrelay_config::{NormalizeConfig, OffsetStrategy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Why a normalization failed.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The job exceeded its wall-clock limit and was killed.
    #[error("Transcode timed out after {0:?}")]
    Timeout(Duration),

    /// The transcoder exited with a non-zero status.
    #[error("Transcoder failed with exit code {code}: {detail}")]
    TranscoderFailed { code: i32, detail: String },

    /// The transcoder was terminated by a signal.
    #[error("Transcoder was terminated by signal")]
    TranscoderTerminated,

    /// The transcoder reported success but wrote nothing.
    #[error("Transcoder produced no output")]
    EmptyOutput,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A finished output file.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedOutput {
    pub path: PathBuf,
    /// Planned output length in seconds.
    pub duration: f64,
    /// Filter names in application order.
    pub applied_filters: Vec<String>,
}

/// Everything a transcoder needs for one run.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub graph: FilterGraph,
    pub timing: Timing,
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub audio_bitrate: String,
    pub fps: u32,
    pub threads: u32,
}

impl TranscodeJob {
    pub fn new(
        input: PathBuf,
        output: PathBuf,
        graph: FilterGraph,
        timing: Timing,
        cfg: &NormalizeConfig,
        threads: u32,
    ) -> Self {
        Self {
            input,
            output,
            graph,
            timing,
            video_codec: cfg.video_codec.clone(),
            preset: cfg.preset.clone(),
            crf: cfg.crf,
            audio_bitrate: cfg.audio_bitrate.clone(),
            fps: cfg.target_fps,
            threads: threads.max(1),
        }
    }
}

/// External transcoding backend.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Runs one job to completion.
    async fn transcode(&self, job: &TranscodeJob) -> Result<(), NormalizeError>;

    /// Timestamps (seconds) of detected scene cuts in `input`.
    async fn scene_cuts(&self, input: &Path) -> Result<Vec<f64>, NormalizeError>;
}

/// Single-slot normalizer.
pub struct Normalizer {
    transcoder: Arc<dyn Transcoder>,
    config: NormalizeConfig,
    threads: u32,
    slot: Arc<Semaphore>,
}

impl Normalizer {
    /// Create a normalizer that hands `threads` to each transcode.
    pub fn new(transcoder: Arc<dyn Transcoder>, config: NormalizeConfig, threads: u32) -> Self {
        Self {
            transcoder,
            config,
            threads,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Number of free job slots (0 while a transcode runs).
    pub fn available_slots(&self) -> usize {
        self.slot.available_permits()
    }

    /// Start offset for a source longer than the target.
    ///
    /// The scene pass may use at most `scene_budget`; when it runs out the
    /// centered window is used.
    async fn choose_offset(
        &self,
        input: &Path,
        probe: &MediaProbe,
        scene_budget: Duration,
    ) -> f64 {
        let center = filter_graph::center_offset(probe.duration, self.config.target_duration);
        if probe.duration <= self.config.target_duration {
            return 0.0;
        }

        match self.config.offset_strategy {
            OffsetStrategy::Center => center,
            OffsetStrategy::Scene => {
                let cuts = self.transcoder.scene_cuts(input);
                match tokio::time::timeout(scene_budget, cuts).await {
                    Ok(Ok(cuts)) => {
                        scene::densest_window(&cuts, probe.duration, self.config.target_duration)
                            .unwrap_or(center)
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Scene detection failed, using centered window");
                        center
                    }
                    Err(_) => {
                        warn!(
                            budget = ?scene_budget,
                            "Scene detection timed out, using centered window"
                        );
                        center
                    }
                }
            }
        }
    }

    /// Normalizes `input` into `output` using the probe taken at the gate.
    ///
    /// Waits for the single job slot. Scene detection and the transcode then
    /// share one `timeout_secs` deadline. On any failure the output file is
    /// removed before the error is returned.
    pub async fn normalize(
        &self,
        input: &Path,
        output: &Path,
        probe: &MediaProbe,
    ) -> Result<NormalizedOutput, NormalizeError> {
        let _permit = self
            .slot
            .acquire()
            .await
            .map_err(|_| NormalizeError::TranscoderTerminated)?;

        let limit = Duration::from_secs(self.config.timeout_secs);
        let deadline = tokio::time::Instant::now() + limit;

        let offset = self.choose_offset(input, probe, limit / 2).await;
        let timing = plan_timing(probe.duration, &self.config, offset);
        let graph = build_filter_graph(probe, &timing, &self.config);
        let applied_filters = graph.applied_filters();

        debug!(
            input = %input.display(),
            seek = timing.seek,
            loops = timing.loops,
            duration = timing.duration,
            "Planned transcode"
        );

        let job = TranscodeJob::new(
            input.to_path_buf(),
            output.to_path_buf(),
            graph,
            timing.clone(),
            &self.config,
            self.threads,
        );

        let transcode = self.transcoder.transcode(&job);
        let result = match tokio::time::timeout_at(deadline, transcode).await {
            Ok(result) => result,
            Err(_) => Err(NormalizeError::Timeout(limit)),
        };

        let result = match result {
            Ok(()) => match tokio::fs::metadata(output).await {
                Ok(meta) if meta.len() > 0 => Ok(()),
                _ => Err(NormalizeError::EmptyOutput),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            remove_partial(output).await;
            return Err(e);
        }

        info!(
            output = %output.display(),
            duration = timing.duration,
            filters = applied_filters.len(),
            "Normalized"
        );

        Ok(NormalizedOutput {
            path: output.to_path_buf(),
            duration: timing.duration,
            applied_filters,
        })
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial output"),
    }
}
