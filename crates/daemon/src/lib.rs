//! reelrelay
//!
//! Discovers short videos on a content platform, screens and downloads them,
//! reformats them into vertical clips and posts them to a chat channel.

pub mod cleanup;
pub mod concurrency;
pub mod delivery;
pub mod discovery;
pub mod gate;
pub mod metrics;
pub mod metrics_server;
pub mod normalize;
pub mod pipeline;
pub mod probe;
pub mod retrieve;
pub mod shutdown;
pub mod source;
pub mod startup;
pub mod state;

pub use reelrelay_config as config;
pub use reelrelay_config::Config;
pub use cleanup::{sweep_stale_media, WorkFiles};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use delivery::{build_caption, DeliveryChannel, DeliveryError, TelegramChannel};
pub use discovery::{discover, Candidate, Thresholds};
pub use gate::{check_suitability, SuitabilityGate, Verdict};
pub use metrics::{
    collect_system_metrics, new_shared_status, spawn_system_sampler, SharedStatus,
    StatusSnapshot, SystemMetrics,
};
pub use metrics_server::{create_status_router, run_status_server, ServerError};
pub use normalize::{FfmpegTranscoder, NormalizeError, NormalizedOutput, Normalizer, Transcoder};
pub use pipeline::{
    Backoff, Components, ErrorClass, IterationOutcome, Pipeline, PipelineError, PipelineState,
};
pub use probe::{FfprobeProber, MediaProbe, MediaProber, ProbeError};
pub use retrieve::{Retrieval, RetryPolicy, Retriever};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use source::{ContentSource, RedditSource, SourceError, SourceItem};
pub use startup::{prepare_work_dirs, run_startup_checks, StartupError};
pub use state::{SeenState, StateError, StateStore};
