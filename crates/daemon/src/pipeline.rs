//! Pipeline orchestrator.
//!
//! One iteration runs discover, retrieve, gate, normalize and deliver for a
//! shuffled batch of candidates and stops at the first delivery. Between
//! iterations the loop cools down, escalating the pause after failed rounds.
//! Every candidate's work files are removed on every exit path.

use crate::cleanup::WorkFiles;
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::delivery::{build_caption, DeliveryChannel, DeliveryError, TelegramChannel};
use crate::discovery::{discover, shuffle, Candidate, Thresholds};
use crate::gate::{SuitabilityGate, Verdict};
use crate::metrics::{new_shared_status, SharedStatus, StatusSnapshot};
use crate::normalize::{FfmpegTranscoder, NormalizeError, Normalizer, Transcoder};
use crate::probe::{FfprobeProber, MediaProber};
use crate::retrieve::{Retrieval, RetryPolicy, Retriever};
use crate::shutdown::Shutdown;
use crate::source::{ContentSource, RedditSource, SourceError};
use crate::startup::StartupError;
use crate::state::{StateError, StateStore};
use rand::Rng;
use reelrelay_config::{Config, ConfigError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Orchestrator state, reported on the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Discovering,
    Retrieving,
    Gating,
    Normalizing,
    Delivering,
    Cooldown,
    ShuttingDown,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Discovering => "discovering",
            PipelineState::Retrieving => "retrieving",
            PipelineState::Gating => "gating",
            PipelineState::Normalizing => "normalizing",
            PipelineState::Delivering => "delivering",
            PipelineState::Cooldown => "cooldown",
            PipelineState::ShuttingDown => "shutting_down",
        }
    }
}

/// Whether an error is absorbed by the loop or stops the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("State store error: {0}")]
    State(#[from] StateError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Normalization failed: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Config(_) | PipelineError::Startup(_) => ErrorClass::Fatal,
            // A delivery channel that cannot be built at all is missing credentials.
            PipelineError::Delivery(DeliveryError::NotConfigured(_)) => ErrorClass::Fatal,
            PipelineError::State(_)
            | PipelineError::Source(_)
            | PipelineError::Normalize(_)
            | PipelineError::Delivery(_)
            | PipelineError::Http(_) => ErrorClass::Transient,
        }
    }
}

/// Escalating pause after failed iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    consecutive: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            consecutive: 0,
        }
    }

    /// `min(max, base * 2^consecutive)`.
    pub fn delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.consecutive.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Returns the delay for this failure, then escalates.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.delay();
        self.consecutive = self.consecutive.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Result of processing one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Delivered,
    RetrievalFailed(String),
    Rejected(String),
    NormalizationFailed(String),
    DeliveryFailed(String),
    Cancelled,
}

/// Result of one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// Discovery returned nothing usable.
    NoCandidates,
    Delivered { source_id: String },
    /// Every candidate in the batch was rejected or failed retrieval.
    Exhausted { attempted: usize },
    NormalizationFailed { source_id: String, reason: String },
    DeliveryFailed { source_id: String, reason: String },
    ShutDown,
}

impl IterationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, IterationOutcome::Delivered { .. })
    }
}

/// Replaceable collaborators.
pub struct Components {
    pub sources: Vec<Arc<dyn ContentSource>>,
    pub prober: Arc<dyn MediaProber>,
    pub transcoder: Arc<dyn Transcoder>,
    pub delivery: Arc<dyn DeliveryChannel>,
}

impl Components {
    /// Reddit listings, ffprobe, ffmpeg and Telegram, built from `config`.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let sources = config
            .discovery
            .subreddits
            .iter()
            .map(|sub| {
                RedditSource::new(sub, &config.discovery)
                    .map(|s| Arc::new(s) as Arc<dyn ContentSource>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            sources,
            prober: Arc::new(FfprobeProber::new()),
            transcoder: Arc::new(FfmpegTranscoder::new()),
            delivery: Arc::new(TelegramChannel::new(&config.delivery)?),
        })
    }
}

/// The control loop and everything it owns.
pub struct Pipeline {
    config: Config,
    plan: ConcurrencyPlan,
    sources: Vec<Arc<dyn ContentSource>>,
    thresholds: Thresholds,
    state: StateStore,
    retriever: Retriever,
    gate: SuitabilityGate,
    normalizer: Normalizer,
    delivery: Arc<dyn DeliveryChannel>,
    backoff: Backoff,
    status: SharedStatus,
    shutdown: Shutdown,
}

impl Pipeline {
    /// Builds a pipeline with the production collaborators.
    pub fn from_config(config: Config, shutdown: Shutdown) -> Result<Self, PipelineError> {
        let components = Components::from_config(&config)?;
        Self::with_components(config, components, shutdown)
    }

    /// Builds a pipeline around the given collaborators.
    ///
    /// Loads the state store from `paths.state_file`.
    pub fn with_components(
        config: Config,
        components: Components,
        shutdown: Shutdown,
    ) -> Result<Self, PipelineError> {
        let plan = derive_plan(&config.cpu);
        let state = StateStore::load(&config.paths.state_file);
        let retriever = Retriever::new(
            RetryPolicy::from(&config.retrieval),
            &config.discovery.user_agent,
        )?;
        let gate = SuitabilityGate::new(components.prober, config.gate.clone());
        let normalizer = Normalizer::new(
            components.transcoder,
            config.normalize.clone(),
            plan.transcoder_threads,
        );
        let backoff = Backoff::new(
            Duration::from_secs(config.pipeline.empty_cooldown_secs),
            Duration::from_secs(config.pipeline.max_backoff_secs),
        );

        let pipeline = Self {
            thresholds: Thresholds::from(&config.discovery),
            plan,
            sources: components.sources,
            state,
            retriever,
            gate,
            normalizer,
            delivery: components.delivery,
            backoff,
            status: new_shared_status(),
            shutdown,
            config,
        };

        info!(
            sources = pipeline.sources.len(),
            threads = pipeline.plan.transcoder_threads,
            known = pipeline.state.snapshot().len(),
            "Pipeline ready"
        );
        Ok(pipeline)
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn plan(&self) -> &ConcurrencyPlan {
        &self.plan
    }

    async fn update_status(&self, update: impl FnOnce(&mut StatusSnapshot)) {
        let mut snapshot = self.status.write().await;
        update(&mut snapshot);
    }

    async fn enter(&self, state: PipelineState) {
        self.update_status(|s| s.state = state.as_str().to_string()).await;
    }

    async fn alert(&self, text: &str) {
        if let Err(e) = self.delivery.send_alert(text).await {
            warn!(error = %e, "Could not deliver operator alert");
        }
    }

    /// Runs a single iteration and updates backoff, counters and alerts.
    pub async fn run_once(&mut self) -> IterationOutcome {
        let outcome = self.iterate().await;

        match &outcome {
            IterationOutcome::Delivered { .. } => self.backoff.reset(),
            IterationOutcome::ShutDown => {}
            _ => {
                self.backoff.record_failure();
            }
        }

        let consecutive = self.backoff.consecutive();
        let backoff_secs = self.backoff.delay().as_secs();
        let sizes = {
            let s = self.state.snapshot();
            (s.seen_ids.len(), s.blacklisted_urls.len(), s.failed_urls.len())
        };
        self.update_status(|s| {
            s.counters.iterations += 1;
            s.consecutive_failures = consecutive;
            s.backoff_secs = backoff_secs;
            s.store.seen_ids = sizes.0;
            s.store.blacklisted_urls = sizes.1;
            s.store.failed_urls = sizes.2;
        })
        .await;

        let threshold = self.config.pipeline.alert_after_failures;
        if threshold > 0 && consecutive > 0 && consecutive % threshold == 0 {
            self.alert(&format!(
                "reelrelay: {} consecutive iterations without a delivery (last: {:?})",
                consecutive, outcome
            ))
            .await;
        }

        outcome
    }

    async fn iterate(&mut self) -> IterationOutcome {
        if self.shutdown.is_triggered() {
            return IterationOutcome::ShutDown;
        }

        self.enter(PipelineState::Discovering).await;
        let mut candidates = discover(&self.sources, &self.thresholds, &self.state).await;
        if candidates.is_empty() {
            info!("No fresh candidates this round");
            return IterationOutcome::NoCandidates;
        }

        shuffle(&mut candidates);
        candidates.truncate(self.config.pipeline.batch_limit.max(1));
        let attempted = candidates.len();

        for candidate in &candidates {
            if self.shutdown.is_triggered() {
                return IterationOutcome::ShutDown;
            }

            match self.process(candidate).await {
                StepOutcome::Delivered => {
                    return IterationOutcome::Delivered {
                        source_id: candidate.source_id.clone(),
                    }
                }
                StepOutcome::RetrievalFailed(_) | StepOutcome::Rejected(_) => continue,
                StepOutcome::NormalizationFailed(reason) => {
                    return IterationOutcome::NormalizationFailed {
                        source_id: candidate.source_id.clone(),
                        reason,
                    }
                }
                StepOutcome::DeliveryFailed(reason) => {
                    return IterationOutcome::DeliveryFailed {
                        source_id: candidate.source_id.clone(),
                        reason,
                    }
                }
                StepOutcome::Cancelled => return IterationOutcome::ShutDown,
            }
        }

        info!(attempted, "Batch exhausted without a delivery");
        IterationOutcome::Exhausted { attempted }
    }

    /// Moves one candidate through the stages. Work files are removed when
    /// `files` goes out of scope, whatever the outcome.
    async fn process(&mut self, candidate: &Candidate) -> StepOutcome {
        let files = WorkFiles::new(
            &self.config.paths.download_dir,
            &self.config.paths.output_dir,
        );
        info!(
            candidate = %candidate.source_id,
            source = %candidate.source_name,
            score = candidate.engagement_score,
            "Processing candidate"
        );

        self.enter(PipelineState::Retrieving).await;
        let retrieval = self
            .retriever
            .retrieve(
                &candidate.source_url,
                &files.source,
                &mut self.state,
                &self.shutdown,
            )
            .await;
        if let Retrieval::Failed(reason) = retrieval {
            if self.shutdown.is_triggered() {
                return StepOutcome::Cancelled;
            }
            warn!(candidate = %candidate.source_id, %reason, "Retrieval failed");
            self.update_status(|s| s.counters.retrieval_failures += 1).await;
            return StepOutcome::RetrievalFailed(reason);
        }
        if self.shutdown.is_triggered() {
            return StepOutcome::Cancelled;
        }

        self.enter(PipelineState::Gating).await;
        let probe = match self.gate.evaluate(&files.source).await {
            Verdict::Accepted(probe) => probe,
            Verdict::Rejected(reason) => {
                self.update_status(|s| s.counters.rejected += 1).await;
                return StepOutcome::Rejected(reason);
            }
        };
        if self.shutdown.is_triggered() {
            return StepOutcome::Cancelled;
        }

        self.enter(PipelineState::Normalizing).await;
        let output = match self
            .normalizer
            .normalize(&files.source, &files.output, &probe)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!(candidate = %candidate.source_id, error = %e, "Normalization failed");
                self.update_status(|s| s.counters.normalization_failures += 1).await;
                self.alert(&format!(
                    "reelrelay: normalization failed for {}: {}",
                    candidate.source_id, e
                ))
                .await;
                return StepOutcome::NormalizationFailed(e.to_string());
            }
        };
        if self.shutdown.is_triggered() {
            return StepOutcome::Cancelled;
        }

        self.enter(PipelineState::Delivering).await;
        let caption = build_caption(
            &candidate.title,
            &self.config.delivery.hashtags,
            &candidate.source_name,
            self.config.delivery.caption_max_chars,
        );
        if let Err(e) = self.delivery.send_video(&output.path, &caption).await {
            warn!(candidate = %candidate.source_id, error = %e, "Delivery failed");
            self.update_status(|s| s.counters.delivery_failures += 1).await;
            return StepOutcome::DeliveryFailed(e.to_string());
        }

        if let Err(e) = self.state.add_seen(&candidate.source_id) {
            error!(
                candidate = %candidate.source_id,
                error = %e,
                "Delivered but could not persist seen id"
            );
        }
        let id = candidate.source_id.clone();
        self.update_status(|s| {
            s.counters.delivered += 1;
            s.last_delivered_id = Some(id);
        })
        .await;
        info!(
            candidate = %candidate.source_id,
            duration = output.duration,
            filters = ?output.applied_filters,
            "Delivered"
        );

        StepOutcome::Delivered
    }

    /// Pause before the next iteration, jitter included.
    pub fn cooldown_for(&self, outcome: &IterationOutcome) -> Duration {
        let base = match outcome {
            IterationOutcome::ShutDown => return Duration::ZERO,
            IterationOutcome::Delivered { .. } => {
                Duration::from_secs(self.config.pipeline.cooldown_secs)
            }
            // `run_once` already escalated; the pause is the previous step.
            _ => {
                let mut previous = self.backoff.clone();
                previous.consecutive = previous.consecutive.saturating_sub(1);
                previous.delay()
            }
        };
        base + jitter(self.config.pipeline.cooldown_jitter_secs)
    }

    /// Runs iterations until shutdown is requested.
    pub async fn run(&mut self) {
        info!("Pipeline loop started");

        loop {
            let outcome = self.run_once().await;
            if outcome == IterationOutcome::ShutDown {
                break;
            }

            let pause = self.cooldown_for(&outcome);
            info!(?outcome, pause_secs = pause.as_secs(), "Iteration finished");

            self.enter(PipelineState::Cooldown).await;
            if !self.shutdown.sleep(pause).await {
                break;
            }
        }

        self.enter(PipelineState::ShuttingDown).await;
        info!("Pipeline loop stopped");
    }

    /// Base directory paths for the startup sweep.
    pub fn work_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.config.paths.download_dir.clone(),
            self.config.paths.output_dir.clone(),
        ]
    }
}

fn jitter(max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_secs * 1000))
}
