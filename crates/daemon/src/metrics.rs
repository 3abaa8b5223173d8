//! Status snapshot for reelrelay
//!
//! Counters and orchestrator state shared between the pipeline and the
//! status endpoint, plus host resource sampling.

use crate::shutdown::Shutdown;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Running totals since process start
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counters {
    pub iterations: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub retrieval_failures: u64,
    pub normalization_failures: u64,
    pub delivery_failures: u64,
}

/// Sizes of the persisted sets
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSizes {
    pub seen_ids: usize,
    pub blacklisted_urls: usize,
    pub failed_urls: usize,
}

/// Complete status snapshot served at `/status`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub started_unix_ms: i64,
    pub uptime_secs: u64,
    /// Current orchestrator state, e.g. `normalizing`
    pub state: String,
    pub counters: Counters,
    pub consecutive_failures: u32,
    pub backoff_secs: u64,
    pub last_delivered_id: Option<String>,
    pub store: StoreSizes,
    pub system: SystemMetrics,
}

/// Shared status for concurrent access across components
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Creates a status handle stamped with the current time as start time
pub fn new_shared_status() -> SharedStatus {
    let now = now_unix_ms();
    Arc::new(RwLock::new(StatusSnapshot {
        timestamp_unix_ms: now,
        started_unix_ms: now,
        state: "idle".to_string(),
        ..Default::default()
    }))
}

/// Copy of the status with time fields brought up to date
pub async fn current_snapshot(status: &SharedStatus) -> StatusSnapshot {
    let mut snapshot = status.read().await.clone();
    let now = now_unix_ms();
    snapshot.timestamp_unix_ms = now;
    snapshot.uptime_secs = (now.saturating_sub(snapshot.started_unix_ms).max(0) / 1000) as u64;
    snapshot
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics(sys: &mut sysinfo::System) -> SystemMetrics {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = sysinfo::System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Periodically refreshes the host metrics until shutdown
pub fn spawn_system_sampler(
    status: SharedStatus,
    interval: Duration,
    shutdown: Shutdown,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sys = sysinfo::System::new();
        loop {
            let system = collect_system_metrics(&mut sys);
            status.write().await.system = system;
            if !shutdown.sleep(interval).await {
                break;
            }
        }
    })
}

/// Milliseconds since the Unix epoch
pub fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
