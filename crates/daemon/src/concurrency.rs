//! Transcoder resource planning.
//!
//! Derives the thread count handed to each transcode from the core count and
//! the configured utilization target. The job slot count is not configurable.

use reelrelay_config::CpuConfig;

/// Transcodes allowed to run at once.
pub const MAX_CONCURRENT_TRANSCODES: u32 = 1;

/// Resource plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// `-threads` value for each transcode
    pub transcoder_threads: u32,
    /// Maximum number of concurrent transcodes
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a plan from the CPU section
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Clamps target_cpu_utilization to [0.5, 1.0]
    /// - transcoder_threads = round(cores * utilization), at least 1
    pub fn derive(cfg: &CpuConfig) -> Self {
        let total_cores = cfg
            .logical_cores
            .filter(|&c| c > 0)
            .unwrap_or_else(|| num_cpus::get() as u32);

        let utilization = clamp_utilization(cfg.target_cpu_utilization);
        let transcoder_threads = ((total_cores as f32) * utilization).round().max(1.0) as u32;

        Self {
            total_cores,
            transcoder_threads,
            max_concurrent_jobs: MAX_CONCURRENT_TRANSCODES,
        }
    }
}

/// Clamp utilization to valid range [0.5, 1.0]
fn clamp_utilization(util: f32) -> f32 {
    if util.is_nan() {
        return 1.0;
    }
    util.clamp(0.5, 1.0)
}

pub fn derive_plan(cfg: &CpuConfig) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
