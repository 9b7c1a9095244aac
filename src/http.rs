//! Rate-limit aware client for the Discord REST API.
//!
//! Every outbound call goes through [`DiscordHttpClient::execute`] so auth
//! headers, bucket tracking, and 429 back-off live in one place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_lock::Mutex;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatcher::{ReplySink, SendError};
use crate::types::{CreateMessage, Message, RateLimitInfo};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const BASE_URL: &str = "https://discord.com/api/v10";
const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/media-drop-bot, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);
const MAX_RETRIES: u32 = 5;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Rate-limit tracker (per-bucket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BucketState {
    remaining: u32,
    resets_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct RateLimiter {
    /// Route-key → bucket id mapping.
    route_buckets: HashMap<String, String>,
    /// Bucket id → state.
    buckets: HashMap<String, BucketState>,
    /// No request may be sent before this instant.
    global_until: Option<Instant>,
}

impl RateLimiter {
    /// How long to wait before sending on `route_key`, if at all.
    fn delay_for(&self, route_key: &str, now: Instant) -> Option<Duration> {
        if let Some(until) = self.global_until.filter(|until| *until > now) {
            return Some(until - now);
        }

        let bucket_id = self.route_buckets.get(route_key)?;
        let state = self.buckets.get(bucket_id)?;
        (state.remaining == 0 && state.resets_at > now).then(|| state.resets_at - now)
    }

    fn update(&mut self, route_key: &str, info: &RateLimitInfo, now: Instant) {
        let reset_after = info
            .reset_after
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)));

        if info.is_global {
            if let Some(after) = reset_after {
                self.global_until = Some(now + after);
            }
        }

        if let Some(bucket) = &info.bucket {
            self.route_buckets
                .insert(route_key.to_string(), bucket.clone());
            self.buckets.insert(
                bucket.clone(),
                BucketState {
                    remaining: info.remaining.unwrap_or(1),
                    resets_at: now + reset_after.unwrap_or(Duration::from_secs(1)),
                },
            );
        }
    }
}

fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitInfo {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    RateLimitInfo {
        remaining: header("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
        reset_after: header("x-ratelimit-reset-after").and_then(|s| s.parse().ok()),
        bucket: header("x-ratelimit-bucket").map(str::to_string),
        is_global: header("x-ratelimit-global") == Some("true"),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HttpError {
    /// Non-success status from Discord.
    #[error("Discord API error {status} on {route}: {body}")]
    Api {
        status: u16,
        body: String,
        route: String,
    },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("failed to read {}: {source}", path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// Cheap to clone; the connection pool and limiter are shared.
#[derive(Clone)]
pub struct DiscordHttpClient {
    client: reqwest::Client,
    token: String,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl DiscordHttpClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
        }
    }

    fn url(path: &str) -> String {
        format!("{}/{}", BASE_URL, path.trim_start_matches('/'))
    }

    /// Send the request produced by `build`, honouring rate limits.
    ///
    /// `build` is called once per attempt since multipart bodies can't be
    /// replayed. `route_key` groups requests into limiter buckets, e.g.
    /// `POST /channels/{channel_id}/messages`.
    async fn execute<B>(&self, route_key: &str, build: B) -> Result<Vec<u8>, HttpError>
    where
        B: Fn() -> Result<RequestBuilder, HttpError>,
    {
        for attempt in 0..=MAX_RETRIES {
            let delay = self.limiter.lock().await.delay_for(route_key, Instant::now());
            if let Some(delay) = delay {
                let delay = delay.min(MAX_BACKOFF);
                debug!(
                    route = route_key,
                    delay_ms = delay.as_millis() as u64,
                    "rate-limit pre-emptive backoff"
                );
                tokio::time::sleep(delay).await;
            }

            let resp = build()?
                .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .send()
                .await?;

            let status = resp.status();
            let rl_info = parse_rate_limit_headers(resp.headers());
            self.limiter
                .lock()
                .await
                .update(route_key, &rl_info, Instant::now());

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RETRIES {
                let retry_after = rl_info.reset_after.unwrap_or(1.0).clamp(0.0, 60.0);
                warn!(
                    route = route_key,
                    attempt,
                    retry_after_s = retry_after,
                    global = rl_info.is_global,
                    "rate-limited by Discord, backing off"
                );
                tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                continue;
            }

            let body = resp.bytes().await?;
            if status.is_success() {
                return Ok(body.to_vec());
            }
            return Err(HttpError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
                route: route_key.to_string(),
            });
        }

        Err(HttpError::Api {
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            body: "rate-limited after max retries".to_string(),
            route: route_key.to_string(),
        })
    }

    /// Post a message body to a channel.
    pub async fn create_message(
        &self,
        channel_id: &str,
        msg: &CreateMessage,
    ) -> Result<Message, HttpError> {
        let url = Self::url(&format!("channels/{}/messages", channel_id));
        let route_key = format!("POST /channels/{}/messages", channel_id);
        let bytes = self
            .execute(&route_key, || Ok(self.client.post(&url).json(msg)))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Send a simple text message to a channel.
    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<Message, HttpError> {
        self.create_message(channel_id, &CreateMessage::new().content(content))
            .await
    }

    /// Upload a local file to a channel as `files[0]`.
    pub async fn send_file(
        &self,
        channel_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<Message, HttpError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| HttpError::File {
                path: path.to_path_buf(),
                source,
            })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let mut body = CreateMessage::new().attachment(0, filename.clone());
        if let Some(text) = caption {
            body = body.content(text);
        }
        let payload_json = serde_json::to_string(&body)?;

        let url = Self::url(&format!("channels/{}/messages", channel_id));
        let route_key = format!("POST /channels/{}/messages", channel_id);
        let bytes = self
            .execute(&route_key, || {
                let form = upload_form(&payload_json, &filename, data.clone())?;
                Ok(self.client.post(&url).multipart(form))
            })
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Multipart body with a `payload_json` part and the file as `files[0]`.
fn upload_form(payload_json: &str, filename: &str, data: Vec<u8>) -> Result<Form, HttpError> {
    let payload = Part::text(payload_json.to_string()).mime_str("application/json")?;
    let file = Part::bytes(data)
        .file_name(filename.to_string())
        .mime_str("application/octet-stream")?;
    Ok(Form::new().part("payload_json", payload).part("files[0]", file))
}

impl std::fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl ReplySink for DiscordHttpClient {
    async fn reply(&self, to: &Message, text: &str) -> Result<(), SendError> {
        let body = CreateMessage::new().content(text).reply_to(to.id.clone());
        self.create_message(&to.channel_id, &body).await?;
        Ok(())
    }

    async fn send_text(&self, channel_id: &str, text: &str) -> Result<(), SendError> {
        self.send_message(channel_id, text).await?;
        Ok(())
    }

    async fn send_file(
        &self,
        channel_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), SendError> {
        DiscordHttpClient::send_file(self, channel_id, path, caption).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn parses_rate_limit_headers() {
        let info = parse_rate_limit_headers(&headers(&[
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset-after", "1.5"),
            ("x-ratelimit-bucket", "abcd"),
            ("x-ratelimit-global", "true"),
        ]));
        assert_eq!(info.remaining, Some(0));
        assert_eq!(info.reset_after, Some(1.5));
        assert_eq!(info.bucket.as_deref(), Some("abcd"));
        assert!(info.is_global);
    }

    #[test]
    fn missing_headers_parse_to_defaults() {
        let info = parse_rate_limit_headers(&HeaderMap::new());
        assert!(info.remaining.is_none());
        assert!(info.bucket.is_none());
        assert!(!info.is_global);
    }

    #[test]
    fn unknown_route_has_no_delay() {
        let limiter = RateLimiter::default();
        assert!(limiter.delay_for("POST /x", Instant::now()).is_none());
    }

    #[test]
    fn exhausted_bucket_delays_until_reset() {
        let now = Instant::now();
        let mut limiter = RateLimiter::default();
        limiter.update(
            "POST /channels/1/messages",
            &RateLimitInfo {
                remaining: Some(0),
                reset_after: Some(2.0),
                bucket: Some("b1".into()),
                is_global: false,
            },
            now,
        );

        let delay = limiter
            .delay_for("POST /channels/1/messages", now)
            .expect("bucket exhausted");
        assert_eq!(delay, Duration::from_secs(2));
        assert!(limiter
            .delay_for("POST /channels/1/messages", now + Duration::from_secs(3))
            .is_none());
        assert!(limiter.delay_for("POST /channels/2/messages", now).is_none());
    }

    #[test]
    fn bucket_with_remaining_budget_is_free() {
        let now = Instant::now();
        let mut limiter = RateLimiter::default();
        limiter.update(
            "GET /x",
            &RateLimitInfo {
                remaining: Some(4),
                reset_after: Some(5.0),
                bucket: Some("b2".into()),
                is_global: false,
            },
            now,
        );
        assert!(limiter.delay_for("GET /x", now).is_none());
    }

    #[test]
    fn global_limit_applies_to_every_route() {
        let now = Instant::now();
        let mut limiter = RateLimiter::default();
        limiter.update(
            "POST /a",
            &RateLimitInfo {
                reset_after: Some(1.0),
                is_global: true,
                ..Default::default()
            },
            now,
        );
        assert_eq!(
            limiter.delay_for("GET /anything", now),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn debug_output_redacts_token() {
        let client = DiscordHttpClient::new("super-secret");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn upload_form_builds() {
        let body = CreateMessage::new().attachment(0, "image1.png").content("hi");
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"filename\":\"image1.png\""));
        assert!(upload_form(&json, "image1.png", vec![1, 2, 3]).is_ok());
    }

    #[test]
    fn user_agent_follows_discord_format() {
        assert!(USER_AGENT.starts_with("DiscordBot ("));
        assert!(USER_AGENT.ends_with(')'));
    }
}
