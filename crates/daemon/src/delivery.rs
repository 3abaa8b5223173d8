//! Delivery channel and caption formatting.
//!
//! The concrete channel is a Telegram bot. Failures are returned as
//! [`DeliveryError`] and never escape the orchestrator.

use async_trait::async_trait;
use reelrelay_config::DeliveryConfig;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bot API rejected request ({status}): {description}")]
    Api { status: u16, description: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Delivery not configured: missing {0}")]
    NotConfigured(&'static str),
}

/// Where finished videos and operator alerts go.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send_video(&self, path: &Path, caption: &str) -> Result<(), DeliveryError>;

    async fn send_alert(&self, text: &str) -> Result<(), DeliveryError>;
}

/// Turns a source label such as `r/Unexpected` into a hashtag `#r_Unexpected`.
pub fn source_tag(source_name: &str) -> Option<String> {
    let mut tag = String::with_capacity(source_name.len() + 1);
    let mut last_was_sep = true;
    for c in source_name.chars() {
        if c.is_alphanumeric() {
            tag.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            tag.push('_');
            last_was_sep = true;
        }
    }
    let tag = tag.trim_end_matches('_');
    (!tag.is_empty()).then(|| format!("#{}", tag))
}

/// Title followed by a blank line, the configured hashtags and the source tag.
///
/// The title is shortened with `...` so the caption fits in `max_chars`
/// characters; the hashtag line is kept whole.
pub fn build_caption(
    title: &str,
    hashtags: &[String],
    source_name: &str,
    max_chars: usize,
) -> String {
    let mut tags: Vec<String> = hashtags.iter().map(|t| t.trim().to_string()).collect();
    tags.retain(|t| !t.is_empty());
    if let Some(tag) = source_tag(source_name) {
        tags.push(tag);
    }
    let tail = tags.join(" ");

    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if tail.is_empty() {
        return truncate_chars(&title, max_chars);
    }
    if title.is_empty() {
        return truncate_chars(&tail, max_chars);
    }

    let tail_len = tail.chars().count() + 2;
    if tail_len >= max_chars {
        return truncate_chars(&tail, max_chars);
    }

    format!("{}\n\n{}", truncate_chars(&title, max_chars - tail_len), tail)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= 3 {
        return text.chars().take(max_chars).collect();
    }
    let kept: String = text.chars().take(max_chars - 3).collect();
    format!("{}...", kept.trim_end())
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API channel.
pub struct TelegramChannel {
    http: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
    alert_chat_id: String,
}

impl TelegramChannel {
    pub fn new(cfg: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let token = cfg
            .bot_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(DeliveryError::NotConfigured("delivery.bot_token"))?;
        let chat_id = cfg
            .chat_id
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or(DeliveryError::NotConfigured("delivery.chat_id"))?;
        let alert_chat_id = cfg.alert_chat().unwrap_or(&chat_id).to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            token,
            chat_id,
            alert_chat_id,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn check(response: reqwest::Response) -> Result<(), DeliveryError> {
        let status = response.status();
        let body = response.text().await?;
        let parsed: Option<ApiResponse> = serde_json::from_str(&body).ok();

        match parsed {
            Some(api) if status.is_success() && api.ok => Ok(()),
            Some(api) => Err(DeliveryError::Api {
                status: status.as_u16(),
                description: api.description.unwrap_or_else(|| "no description".to_string()),
            }),
            None => Err(DeliveryError::Api {
                status: status.as_u16(),
                description: body.chars().take(200).collect(),
            }),
        }
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    async fn send_video(&self, path: &Path, caption: &str) -> Result<(), DeliveryError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "video.mp4".to_string());
        debug!(path = %path.display(), bytes = bytes.len(), "Uploading video");

        let video = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("video/mp4")?;
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption.to_string())
            .text("supports_streaming", "true")
            .part("video", video);

        let response = self
            .http
            .post(self.method_url("sendVideo"))
            .multipart(form)
            .send()
            .await?;

        Self::check(response).await
    }

    async fn send_alert(&self, text: &str) -> Result<(), DeliveryError> {
        let payload = serde_json::json!({
            "chat_id": self.alert_chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });

        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&payload)
            .send()
            .await?;

        Self::check(response).await
    }
}
