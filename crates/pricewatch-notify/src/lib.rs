//! Messaging collaborators for pricewatch: Telegram delivery with bounded retry,
//! plus a log-only notifier for runs without credentials.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use pricewatch_core::NotificationPayload;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "pricewatch-notify";

/// Telegram limits; captions longer than this are rejected outright.
const CAPTION_LIMIT: usize = 1024;
const MESSAGE_LIMIT: usize = 4096;
const MEDIA_GROUP_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("still rate limited after {attempts} attempts")]
    RateLimited { attempts: usize },
    #[error("message rejected with http {status}: {description}")]
    Rejected { status: u16, description: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notifier misconfigured: {0}")]
    Config(String),
}

/// Receives composed payloads. Retrying is the notifier's business; callers
/// treat a returned error as final for this payload.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, payload: &NotificationPayload) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        info!(
            market = %payload.market,
            images = payload.images.len(),
            "price drop notification (log only)\n{}",
            payload.text
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Server hint (`retry_after`) wins over the exponential schedule, capped
    /// at `max_delay` like everything else.
    pub fn delay_with_hint(&self, attempt_index: usize, hint: Option<Duration>) -> Duration {
        hint.map_or_else(|| self.delay_for_attempt(attempt_index), |h| h.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
    /// Forum thread per market; markets without an entry go to the main chat.
    pub threads: HashMap<String, i64>,
    pub api_base: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between two sends to the same chat.
    pub min_interval: Duration,
}

impl TelegramConfig {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            chat_id: chat_id.into(),
            threads: HashMap::new(),
            api_base: "https://api.telegram.org".to_string(),
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
            min_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelegramRequest {
    pub method: &'static str,
    pub body: JsonValue,
}

/// Picks the Bot API method for the payload: plain message, single photo, or
/// media group with the caption on the first item.
pub fn telegram_request(chat_id: &str, thread_id: Option<i64>, payload: &NotificationPayload) -> TelegramRequest {
    let images = payload
        .images
        .iter()
        .take(MEDIA_GROUP_LIMIT)
        .collect::<Vec<_>>();

    let (method, mut body) = match images.as_slice() {
        [] => (
            "sendMessage",
            json!({
                "chat_id": chat_id,
                "text": truncate_chars(&payload.text, MESSAGE_LIMIT),
                "parse_mode": "Markdown",
            }),
        ),
        [single] => (
            "sendPhoto",
            json!({
                "chat_id": chat_id,
                "photo": single,
                "caption": truncate_chars(&payload.text, CAPTION_LIMIT),
                "parse_mode": "Markdown",
            }),
        ),
        many => {
            let media = many
                .iter()
                .enumerate()
                .map(|(i, url)| {
                    if i == 0 {
                        json!({
                            "type": "photo",
                            "media": url,
                            "caption": truncate_chars(&payload.text, CAPTION_LIMIT),
                            "parse_mode": "Markdown",
                        })
                    } else {
                        json!({"type": "photo", "media": url})
                    }
                })
                .collect::<Vec<_>>();
            ("sendMediaGroup", json!({"chat_id": chat_id, "media": media}))
        }
    };

    if let (Some(thread_id), Some(obj)) = (thread_id, body.as_object_mut()) {
        obj.insert("message_thread_id".to_string(), json!(thread_id));
    }
    TelegramRequest { method, body }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out = text.chars().take(limit.saturating_sub(1)).collect::<String>();
    out.push('…');
    out
}

#[derive(Debug, Default, Deserialize)]
struct TelegramResponse {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug)]
struct SendPacer {
    min_interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl SendPacer {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        let mut last = self.last_sent.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    config: TelegramConfig,
    pacer: SendPacer,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self, NotifyError> {
        if config.token.trim().is_empty() || config.chat_id.trim().is_empty() {
            return Err(NotifyError::Config("telegram token and chat id are required".into()));
        }
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            pacer: SendPacer::new(config.min_interval),
            config,
        })
    }

    pub fn thread_for(&self, market: &str) -> Option<i64> {
        self.config.threads.get(market).copied()
    }

    async fn send_with_retry(&self, request: &TelegramRequest) -> Result<(), NotifyError> {
        let url = format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.token,
            request.method
        );
        let backoff = self.config.backoff;

        for attempt in 0..=backoff.max_retries {
            self.pacer.wait_turn().await;

            match self.client.post(&url).json(&request.body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    let body = resp.json::<TelegramResponse>().await.unwrap_or_default();
                    let can_retry = attempt < backoff.max_retries;

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        let hint = body
                            .parameters
                            .and_then(|p| p.retry_after)
                            .map(Duration::from_secs);
                        let delay = backoff.delay_with_hint(attempt, hint);
                        warn!(status = status.as_u16(), ?delay, attempt, "telegram send failed, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(NotifyError::RateLimited { attempts: attempt + 1 });
                    }
                    return Err(NotifyError::Rejected {
                        status: status.as_u16(),
                        description: body.description.unwrap_or_default(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        let delay = backoff.delay_for_attempt(attempt);
                        warn!(error = %err, ?delay, attempt, "telegram request error, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(NotifyError::Request(err));
                }
            }
        }

        Err(NotifyError::RateLimited {
            attempts: backoff.max_retries + 1,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let request = telegram_request(&self.config.chat_id, self.thread_for(&payload.market), payload);
        let span = info_span!("telegram_send", market = %payload.market, method = request.method);
        async {
            self.send_with_retry(&request).await?;
            info!("notification delivered");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
