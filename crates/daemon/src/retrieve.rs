//! Resilient media retrieval.
//!
//! Streams a candidate's media to disk with bounded retries and exponential
//! backoff. Exhausting every attempt is an expected outcome: the url is
//! recorded as failed in the state store and `Retrieval::Failed` is returned.

use crate::shutdown::Shutdown;
use crate::state::StateStore;
use rand::Rng;
use reelrelay_config::RetrievalConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned status {0}")]
    Status(u16),

    #[error("No response or data within {0:?}")]
    Stalled(Duration),

    #[error("Attempt exceeded {0:?}")]
    AttemptTimeout(Duration),

    #[error("Download exceeded {0} bytes")]
    TooLarge(u64),

    #[error("Server returned an empty body")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of [`Retriever::retrieve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieval {
    /// Complete file on disk.
    Retrieved(PathBuf),
    /// Nothing on disk; the reason of the last attempt.
    Failed(String),
}

/// Retry and timeout settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Limit for receiving headers and for each body chunk.
    pub request_timeout: Duration,
    /// Limit for a whole attempt.
    pub attempt_timeout: Duration,
    pub max_bytes: u64,
}

impl From<&RetrievalConfig> for RetryPolicy {
    fn from(cfg: &RetrievalConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            attempt_timeout: Duration::from_secs(cfg.attempt_timeout_secs),
            max_bytes: cfg.max_bytes,
        }
    }
}

/// Delay before retry number `attempt + 1`: `base * 2^attempt + jitter`.
///
/// `jitter` is expected in `[0, base)`.
pub fn backoff_delay(base: Duration, attempt: u32, jitter: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)) + jitter
}

fn random_jitter(base: Duration) -> Duration {
    let ceiling = base.as_millis() as u64;
    if ceiling == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..ceiling))
}

/// Streaming downloader.
pub struct Retriever {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl Retriever {
    /// Builds a retriever with a client that does not reuse connections,
    /// so every attempt starts from a fresh connection.
    pub fn new(policy: RetryPolicy, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .connect_timeout(policy.request_timeout)
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self { client, policy })
    }

    /// Downloads `url` to `destination`.
    ///
    /// Partial files are removed after every failed attempt. On final failure
    /// the url is added to the state store's failed set. A shutdown request
    /// abandons the download without recording the url.
    pub async fn retrieve(
        &self,
        url: &str,
        destination: &Path,
        state: &mut StateStore,
        shutdown: &Shutdown,
    ) -> Retrieval {
        let mut last_error = String::from("no attempt made");

        for attempt in 0..self.policy.max_attempts {
            if shutdown.is_triggered() {
                remove_partial(destination).await;
                return Retrieval::Failed("shutdown requested".to_string());
            }

            let result = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.attempt(url, destination),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AttemptError::AttemptTimeout(self.policy.attempt_timeout)),
            };

            match result {
                Ok(bytes) => {
                    info!(url, bytes, attempt = attempt + 1, "Retrieved media");
                    return Retrieval::Retrieved(destination.to_path_buf());
                }
                Err(e) => {
                    warn!(url, attempt = attempt + 1, error = %e, "Retrieval attempt failed");
                    last_error = e.to_string();
                }
            }

            remove_partial(destination).await;

            if attempt + 1 < self.policy.max_attempts {
                let delay = backoff_delay(
                    self.policy.backoff_base,
                    attempt,
                    random_jitter(self.policy.backoff_base),
                );
                debug!(url, ?delay, "Backing off before next attempt");
                if !shutdown.sleep(delay).await {
                    return Retrieval::Failed("shutdown requested".to_string());
                }
            }
        }

        if let Err(e) = state.add_failed(url) {
            warn!(url, error = %e, "Could not record failed url");
        }

        Retrieval::Failed(last_error)
    }

    async fn attempt(&self, url: &str, destination: &Path) -> Result<u64, AttemptError> {
        let stall = self.policy.request_timeout;

        let mut response = tokio::time::timeout(stall, self.client.get(url).send())
            .await
            .map_err(|_| AttemptError::Stalled(stall))??;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Status(status.as_u16()));
        }

        if let Some(length) = response.content_length() {
            if length > self.policy.max_bytes {
                return Err(AttemptError::TooLarge(self.policy.max_bytes));
            }
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(destination).await?;
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::time::timeout(stall, response.chunk())
                .await
                .map_err(|_| AttemptError::Stalled(stall))??;

            let Some(bytes) = chunk else { break };

            written += bytes.len() as u64;
            if written > self.policy.max_bytes {
                return Err(AttemptError::TooLarge(self.policy.max_bytes));
            }
            file.write_all(&bytes).await?;
        }

        file.flush().await?;
        file.sync_all().await?;

        if written == 0 {
            return Err(AttemptError::Empty);
        }

        Ok(written)
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial download"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(10),
            max_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn test_retrieve_writes_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut state = StateStore::load(dir.path().join("seen.json"));
        let dest = dir.path().join("dl").join("clip.mp4");
        let retriever = Retriever::new(fast_policy(3), "test").unwrap();

        let url = format!("{}/clip.mp4", server.uri());
        let outcome = retriever
            .retrieve(&url, &dest, &mut state, &Shutdown::never())
            .await;

        assert_eq!(outcome, Retrieval::Retrieved(dest.clone()));
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 4096);
        assert!(!state.is_blocked(&url));
    }

    #[tokio::test]
    async fn test_persistent_failure_records_url_and_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut state = StateStore::load(dir.path().join("seen.json"));
        let dest = dir.path().join("clip.mp4");
        let retriever = Retriever::new(fast_policy(3), "test").unwrap();

        let url = format!("{}/broken.mp4", server.uri());
        let outcome = retriever
            .retrieve(&url, &dest, &mut state, &Shutdown::never())
            .await;

        assert!(matches!(outcome, Retrieval::Failed(reason) if reason.contains("503")));
        assert!(state.snapshot().failed_urls.contains(&url));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_recovers_after_transient_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 128]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut state = StateStore::load(dir.path().join("seen.json"));
        let dest = dir.path().join("clip.mp4");
        let retriever = Retriever::new(fast_policy(3), "test").unwrap();

        let url = format!("{}/flaky.mp4", server.uri());
        let outcome = retriever
            .retrieve(&url, &dest, &mut state, &Shutdown::never())
            .await;

        assert_eq!(outcome, Retrieval::Retrieved(dest.clone()));
        assert!(state.snapshot().failed_urls.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_download_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2048]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut state = StateStore::load(dir.path().join("seen.json"));
        let dest = dir.path().join("big.mp4");
        let policy = RetryPolicy {
            max_bytes: 1000,
            ..fast_policy(1)
        };
        let retriever = Retriever::new(policy, "test").unwrap();

        let url = format!("{}/big.mp4", server.uri());
        let outcome = retriever
            .retrieve(&url, &dest, &mut state, &Shutdown::never())
            .await;

        assert!(matches!(outcome, Retrieval::Failed(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_shutdown_abandons_without_recording() {
        let dir = TempDir::new().unwrap();
        let mut state = StateStore::load(dir.path().join("seen.json"));
        let dest = dir.path().join("clip.mp4");
        let retriever = Retriever::new(fast_policy(3), "test").unwrap();

        let (trigger, shutdown) = crate::shutdown::channel();
        trigger.trigger();

        let outcome = retriever
            .retrieve("http://127.0.0.1:9/never.mp4", &dest, &mut state, &shutdown)
            .await;

        assert!(matches!(outcome, Retrieval::Failed(_)));
        assert!(state.snapshot().failed_urls.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_backoff_doubles_and_stays_within_jitter(
            base_ms in 1u64..5_000,
            attempt in 0u32..8,
            jitter_frac in 0.0f64..1.0,
        ) {
            let base = Duration::from_millis(base_ms);
            let jitter = Duration::from_millis((base_ms as f64 * jitter_frac) as u64);

            let delay = backoff_delay(base, attempt, jitter);
            let floor = base * 2u32.pow(attempt);

            prop_assert!(delay >= floor);
            prop_assert!(delay < floor + base);
        }
    }
}
