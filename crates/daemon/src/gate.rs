//! Suitability gate for retrieved media.
//!
//! Checks run in a fixed, short-circuiting order with the cheapest and most
//! decisive first. Optional metadata that is missing never rejects a file; it
//! only produces a warning.

use crate::probe::{MediaProbe, MediaProber};
use reelrelay_config::{GateConfig, Orientation};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Gate decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Passed every check; the probe is carried forward.
    Accepted(MediaProbe),
    /// Failed a check.
    Rejected(String),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }
}

/// Checks a probe against the gate thresholds.
///
/// Order:
/// 1. corruption
/// 2. duration range
/// 3. audio presence (only when `require_audio` is set)
/// 4. resolution bounds (long side against `max_width`, short side against `max_height`)
/// 5. orientation, codec allow-list, minimum bitrate, minimum frame rate
///
/// Pure: the same probe and config always yield the same verdict.
pub fn check_suitability(probe: &MediaProbe, cfg: &GateConfig) -> Verdict {
    if probe.is_corrupted {
        return Verdict::Rejected("decode errors detected".to_string());
    }

    if probe.duration < cfg.min_duration || probe.duration > cfg.max_duration {
        return Verdict::Rejected(format!(
            "duration {:.1}s outside [{}, {}]",
            probe.duration, cfg.min_duration, cfg.max_duration
        ));
    }

    if cfg.require_audio && !probe.has_audio {
        return Verdict::Rejected("no audio stream".to_string());
    }

    let (long, short) = if probe.width >= probe.height {
        (probe.width, probe.height)
    } else {
        (probe.height, probe.width)
    };
    if probe.width < cfg.min_width || probe.height < cfg.min_height {
        return Verdict::Rejected(format!(
            "resolution {}x{} below minimum {}x{}",
            probe.width, probe.height, cfg.min_width, cfg.min_height
        ));
    }
    if long > cfg.max_width || short > cfg.max_height {
        return Verdict::Rejected(format!(
            "resolution {}x{} above maximum {}x{}",
            probe.width, probe.height, cfg.max_width, cfg.max_height
        ));
    }

    let orientation_ok = match cfg.orientation {
        Orientation::Any => true,
        Orientation::Portrait => probe.is_portrait(),
        Orientation::Landscape => probe.is_landscape(),
        Orientation::Square => probe.width == probe.height,
    };
    if !orientation_ok {
        return Verdict::Rejected(format!(
            "orientation {}x{} does not match {:?}",
            probe.width, probe.height, cfg.orientation
        ));
    }

    if !cfg.allowed_codecs.is_empty() {
        if probe.codec.is_empty() {
            warn!("Codec unknown, skipping codec allow-list");
        } else if !cfg
            .allowed_codecs
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&probe.codec))
        {
            return Verdict::Rejected(format!("codec {} not allowed", probe.codec));
        }
    }

    if cfg.min_bitrate_kbps > 0 {
        match probe.bitrate {
            Some(kbps) if kbps < u64::from(cfg.min_bitrate_kbps) => {
                return Verdict::Rejected(format!(
                    "bitrate {} kbps below {} kbps",
                    kbps, cfg.min_bitrate_kbps
                ));
            }
            Some(_) => {}
            None => warn!("Bitrate unknown, skipping bitrate floor"),
        }
    }

    if cfg.min_fps > 0.0 {
        if probe.fps <= 0.0 {
            warn!("Frame rate unknown, skipping frame rate floor");
        } else if probe.fps < cfg.min_fps {
            return Verdict::Rejected(format!(
                "frame rate {:.2} below {}",
                probe.fps, cfg.min_fps
            ));
        }
    }

    Verdict::Accepted(probe.clone())
}

/// Gate bound to a prober.
pub struct SuitabilityGate {
    prober: Arc<dyn MediaProber>,
    config: GateConfig,
}

impl SuitabilityGate {
    pub fn new(prober: Arc<dyn MediaProber>, config: GateConfig) -> Self {
        Self { prober, config }
    }

    /// Evaluates a retrieved file.
    ///
    /// The integrity pass runs before metadata probing so a broken file costs
    /// one tool invocation. A file the prober cannot read is rejected. Each
    /// prober call is limited to `probe_timeout_secs`.
    pub async fn evaluate(&self, path: &Path) -> Verdict {
        let limit = Duration::from_secs(self.config.probe_timeout_secs);

        if self.config.check_corruption {
            let integrity = self.prober.is_corrupted(path);
            match tokio::time::timeout(limit, integrity).await {
                Err(_) => {
                    info!(path = %path.display(), ?limit, "Rejected: integrity pass timed out");
                    return Verdict::Rejected("integrity pass timed out".to_string());
                }
                Ok(Ok(true)) => {
                    info!(path = %path.display(), "Rejected: decode errors detected");
                    return Verdict::Rejected("decode errors detected".to_string());
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    info!(path = %path.display(), error = %e, "Rejected: integrity pass failed");
                    return Verdict::Rejected(format!("integrity pass failed: {}", e));
                }
            }
        }

        let probe = match tokio::time::timeout(limit, self.prober.probe(path)).await {
            Err(_) => {
                info!(path = %path.display(), ?limit, "Rejected: probe timed out");
                return Verdict::Rejected("probe timed out".to_string());
            }
            Ok(Ok(probe)) => probe,
            Ok(Err(e)) => {
                info!(path = %path.display(), error = %e, "Rejected: unreadable media");
                return Verdict::Rejected(format!("unreadable media: {}", e));
            }
        };

        let verdict = check_suitability(&probe, &self.config);
        match &verdict {
            Verdict::Accepted(p) => info!(
                path = %path.display(),
                duration = p.duration,
                width = p.width,
                height = p.height,
                fps = p.fps,
                has_audio = p.has_audio,
                "Accepted"
            ),
            Verdict::Rejected(reason) => info!(path = %path.display(), %reason, "Rejected"),
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_probe(duration: f64, width: u32, height: u32) -> MediaProbe {
        MediaProbe {
            duration,
            width,
            height,
            codec: "h264".to_string(),
            bitrate: Some(2500),
            fps: 30.0,
            has_audio: true,
            is_corrupted: false,
        }
    }

    struct StubProber {
        probe: Option<MediaProbe>,
        corrupted: bool,
        hang_integrity: bool,
        hang_probe: bool,
        probe_calls: AtomicUsize,
    }

    impl StubProber {
        fn new(probe: Option<MediaProbe>, corrupted: bool) -> Self {
            Self {
                probe,
                corrupted,
                hang_integrity: false,
                hang_probe: false,
                probe_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MediaProber for StubProber {
        async fn probe(&self, _path: &Path) -> Result<MediaProbe, ProbeError> {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_probe {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.probe.clone().ok_or(ProbeError::NoVideo)
        }

        async fn is_corrupted(&self, _path: &Path) -> Result<bool, ProbeError> {
            if self.hang_integrity {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(self.corrupted)
        }
    }

    #[test]
    fn test_accepts_typical_clip() {
        let verdict = check_suitability(&make_probe(45.0, 1080, 1920), &GateConfig::default());
        assert!(verdict.is_accepted());
    }

    #[test]
    fn test_rejects_corruption_before_anything_else() {
        let mut probe = make_probe(500.0, 10, 10);
        probe.is_corrupted = true;

        match check_suitability(&probe, &GateConfig::default()) {
            Verdict::Rejected(reason) => assert!(reason.contains("decode")),
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_out_of_range_duration() {
        let cfg = GateConfig::default();
        assert!(!check_suitability(&make_probe(10.0, 1080, 1920), &cfg).is_accepted());
        assert!(!check_suitability(&make_probe(95.0, 1080, 1920), &cfg).is_accepted());
        assert!(check_suitability(&make_probe(90.0, 1080, 1920), &cfg).is_accepted());
    }

    #[test]
    fn test_missing_audio_is_a_property_unless_required() {
        let mut probe = make_probe(30.0, 1080, 1920);
        probe.has_audio = false;

        assert!(check_suitability(&probe, &GateConfig::default()).is_accepted());

        let strict = GateConfig {
            require_audio: true,
            ..Default::default()
        };
        assert_eq!(
            check_suitability(&probe, &strict),
            Verdict::Rejected("no audio stream".to_string())
        );
    }

    #[test]
    fn test_resolution_bounds_are_orientation_independent() {
        let cfg = GateConfig::default();
        assert!(check_suitability(&make_probe(30.0, 2160, 3840), &cfg).is_accepted());
        assert!(check_suitability(&make_probe(30.0, 3840, 2160), &cfg).is_accepted());
        assert!(!check_suitability(&make_probe(30.0, 4096, 2160), &cfg).is_accepted());
        assert!(!check_suitability(&make_probe(30.0, 160, 120), &cfg).is_accepted());
    }

    #[test]
    fn test_orientation_filter() {
        let cfg = GateConfig {
            orientation: Orientation::Portrait,
            ..Default::default()
        };
        assert!(check_suitability(&make_probe(30.0, 1080, 1920), &cfg).is_accepted());
        assert!(!check_suitability(&make_probe(30.0, 1920, 1080), &cfg).is_accepted());
    }

    #[test]
    fn test_codec_allow_list_is_case_insensitive() {
        let cfg = GateConfig {
            allowed_codecs: vec!["H264".to_string(), "hevc".to_string()],
            ..Default::default()
        };
        assert!(check_suitability(&make_probe(30.0, 1080, 1920), &cfg).is_accepted());

        let mut vp9 = make_probe(30.0, 1080, 1920);
        vp9.codec = "vp9".to_string();
        assert!(!check_suitability(&vp9, &cfg).is_accepted());
    }

    #[test]
    fn test_absent_optional_metadata_does_not_reject() {
        let cfg = GateConfig {
            allowed_codecs: vec!["h264".to_string()],
            min_bitrate_kbps: 1000,
            min_fps: 24.0,
            ..Default::default()
        };
        let mut probe = make_probe(30.0, 1080, 1920);
        probe.codec = String::new();
        probe.bitrate = None;
        probe.fps = 0.0;

        assert!(check_suitability(&probe, &cfg).is_accepted());
    }

    #[test]
    fn test_bitrate_and_fps_floors() {
        let cfg = GateConfig {
            min_bitrate_kbps: 3000,
            ..Default::default()
        };
        assert!(!check_suitability(&make_probe(30.0, 1080, 1920), &cfg).is_accepted());

        let cfg = GateConfig {
            min_fps: 50.0,
            ..Default::default()
        };
        assert!(!check_suitability(&make_probe(30.0, 1080, 1920), &cfg).is_accepted());
    }

    #[tokio::test]
    async fn test_evaluate_short_circuits_on_corruption() {
        let prober = Arc::new(StubProber::new(Some(make_probe(30.0, 1080, 1920)), true));
        let gate = SuitabilityGate::new(prober.clone(), GateConfig::default());

        let verdict = gate.evaluate(Path::new("/tmp/x.mp4")).await;
        assert!(!verdict.is_accepted());
        assert_eq!(prober.probe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_evaluate_rejects_unreadable_media() {
        let gate = SuitabilityGate::new(Arc::new(StubProber::new(None, false)), GateConfig::default());

        match gate.evaluate(Path::new("/tmp/x.mp4")).await {
            Verdict::Rejected(reason) => assert!(reason.contains("unreadable")),
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_evaluate_skips_integrity_when_disabled() {
        let cfg = GateConfig {
            check_corruption: false,
            ..Default::default()
        };
        let prober = Arc::new(StubProber::new(Some(make_probe(30.0, 1080, 1920)), true));
        let gate = SuitabilityGate::new(prober, cfg);

        assert!(gate.evaluate(Path::new("/tmp/x.mp4")).await.is_accepted());
    }

    #[tokio::test]
    async fn test_hung_integrity_pass_is_rejected_after_timeout() {
        let mut prober = StubProber::new(Some(make_probe(30.0, 1080, 1920)), false);
        prober.hang_integrity = true;
        let prober = Arc::new(prober);
        let cfg = GateConfig {
            probe_timeout_secs: 1,
            ..Default::default()
        };
        let gate = SuitabilityGate::new(prober.clone(), cfg);

        let verdict = tokio::time::timeout(
            Duration::from_secs(5),
            gate.evaluate(Path::new("/tmp/x.mp4")),
        )
        .await
        .expect("evaluate should give up on a hung integrity pass");

        assert_eq!(
            verdict,
            Verdict::Rejected("integrity pass timed out".to_string())
        );
        assert_eq!(prober.probe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hung_probe_is_rejected_after_timeout() {
        let mut prober = StubProber::new(Some(make_probe(30.0, 1080, 1920)), false);
        prober.hang_probe = true;
        let cfg = GateConfig {
            probe_timeout_secs: 1,
            ..Default::default()
        };
        let gate = SuitabilityGate::new(Arc::new(prober), cfg);

        let verdict = tokio::time::timeout(
            Duration::from_secs(5),
            gate.evaluate(Path::new("/tmp/x.mp4")),
        )
        .await
        .expect("evaluate should give up on a hung probe");

        assert_eq!(verdict, Verdict::Rejected("probe timed out".to_string()));
    }

    fn probe_strategy() -> impl Strategy<Value = MediaProbe> {
        (
            0.0f64..200.0,
            1u32..5000,
            1u32..5000,
            prop_oneof![Just("h264"), Just("hevc"), Just("vp9"), Just("")],
            proptest::option::of(0u64..20_000),
            0.0f64..120.0,
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(
                |(duration, width, height, codec, bitrate, fps, has_audio, is_corrupted)| {
                    MediaProbe {
                        duration,
                        width,
                        height,
                        codec: codec.to_string(),
                        bitrate,
                        fps,
                        has_audio,
                        is_corrupted,
                    }
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_verdict_is_deterministic(probe in probe_strategy(), require_audio in any::<bool>()) {
            let cfg = GateConfig {
                require_audio,
                allowed_codecs: vec!["h264".to_string()],
                min_bitrate_kbps: 500,
                min_fps: 20.0,
                ..Default::default()
            };
            let first = check_suitability(&probe, &cfg);
            for _ in 0..3 {
                prop_assert_eq!(&check_suitability(&probe, &cfg), &first);
            }
        }

        #[test]
        fn prop_accepted_duration_is_within_bounds(probe in probe_strategy()) {
            let cfg = GateConfig::default();
            if let Verdict::Accepted(p) = check_suitability(&probe, &cfg) {
                prop_assert!(p.duration >= cfg.min_duration && p.duration <= cfg.max_duration);
                prop_assert!(!p.is_corrupted);
            }
        }
    }
}
