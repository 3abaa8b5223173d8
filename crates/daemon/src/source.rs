//! Content source clients.
//!
//! A source returns a bounded page of recent items with engagement metrics.
//! The only concrete source is a Reddit subreddit listing.

use async_trait::async_trait;
use reelrelay_config::DiscoveryConfig;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default public API host for subreddit listings.
pub const REDDIT_BASE_URL: &str = "https://www.reddit.com";

/// Errors returned by a content source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited by {0}")]
    RateLimited(String),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Failed to parse listing: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One item as reported by a source. Optional fields may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceItem {
    pub id: String,
    pub url: String,
    pub title: String,
    pub score: i64,
    pub comment_count: i64,
    pub declared_duration: Option<f64>,
    pub declared_has_audio: Option<bool>,
}

/// A platform that can list candidate media.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Short label used in logs and captions.
    fn name(&self) -> &str;

    /// Fetch up to `limit` recent or top items.
    async fn search(&self, limit: u32) -> Result<Vec<SourceItem>, SourceError>;
}

/// Raw listing JSON structures for parsing.
mod listing_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct Listing {
        pub data: ListingData,
    }

    #[derive(Debug, Deserialize)]
    pub struct ListingData {
        #[serde(default)]
        pub children: Vec<Child>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Child {
        pub data: Post,
    }

    #[derive(Debug, Deserialize)]
    pub struct Post {
        pub id: String,
        #[serde(default)]
        pub title: String,
        #[serde(default)]
        pub score: Option<i64>,
        #[serde(default)]
        pub num_comments: Option<i64>,
        #[serde(default)]
        pub url: Option<String>,
        #[serde(default)]
        pub over_18: Option<bool>,
        #[serde(default)]
        pub media: Option<Media>,
        #[serde(default)]
        pub secure_media: Option<Media>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Media {
        #[serde(default)]
        pub reddit_video: Option<RedditVideo>,
    }

    #[derive(Debug, Deserialize)]
    pub struct RedditVideo {
        #[serde(default)]
        pub fallback_url: Option<String>,
        #[serde(default)]
        pub duration: Option<f64>,
        #[serde(default)]
        pub has_audio: Option<bool>,
    }
}

/// Parses a subreddit listing into items, skipping posts without playable video.
pub fn parse_listing(json_str: &str) -> Result<Vec<SourceItem>, SourceError> {
    let listing: listing_json::Listing = serde_json::from_str(json_str)?;

    let items = listing
        .data
        .children
        .into_iter()
        .filter_map(|child| {
            let post = child.data;

            if post.over_18.unwrap_or(false) {
                return None;
            }

            let video = post
                .secure_media
                .and_then(|m| m.reddit_video)
                .or_else(|| post.media.and_then(|m| m.reddit_video));

            let (url, declared_duration, declared_has_audio) = match video {
                Some(v) => match v.fallback_url {
                    Some(url) => (url, v.duration, v.has_audio),
                    None => return None,
                },
                None => {
                    let url = post.url?;
                    if !is_direct_video_url(&url) {
                        return None;
                    }
                    (url, None, None)
                }
            };

            Some(SourceItem {
                id: post.id,
                url,
                title: post.title,
                score: post.score.unwrap_or(0),
                comment_count: post.num_comments.unwrap_or(0),
                declared_duration,
                declared_has_audio,
            })
        })
        .collect();

    Ok(items)
}

fn is_direct_video_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    path.ends_with(".mp4") || path.ends_with(".mov") || path.ends_with(".webm")
}

/// Subreddit listing source.
pub struct RedditSource {
    client: reqwest::Client,
    base_url: String,
    subreddit: String,
    label: String,
    listing: String,
    time_filter: String,
}

impl RedditSource {
    /// Build a source for one subreddit using the discovery settings.
    pub fn new(subreddit: &str, cfg: &DiscoveryConfig) -> Result<Self, SourceError> {
        Self::with_base_url(subreddit, cfg, REDDIT_BASE_URL)
    }

    /// Same as [`RedditSource::new`] against a different API host.
    pub fn with_base_url(
        subreddit: &str,
        cfg: &DiscoveryConfig,
        base_url: &str,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            subreddit: subreddit.to_string(),
            label: format!("r/{}", subreddit),
            listing: cfg.listing.clone(),
            time_filter: cfg.time_filter.clone(),
        })
    }

    /// Listing url for a page of `limit` items.
    pub fn listing_url(&self, limit: u32) -> String {
        let mut url = format!(
            "{}/r/{}/{}.json?limit={}&raw_json=1",
            self.base_url, self.subreddit, self.listing, limit
        );
        if self.listing == "top" {
            url.push_str("&t=");
            url.push_str(&self.time_filter);
        }
        url
    }
}

#[async_trait]
impl ContentSource for RedditSource {
    fn name(&self) -> &str {
        &self.label
    }

    async fn search(&self, limit: u32) -> Result<Vec<SourceItem>, SourceError> {
        let url = self.listing_url(limit);
        debug!(source = %self.label, url = %url, "Fetching listing");

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            return Err(SourceError::RateLimited(self.label.clone()));
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.text().await?;
        parse_listing(&body)
    }
}
