//! Anthropic Messages client used by the `llm` scorer backend.
//!
//! Scorers go through `call_json`; nothing else talks to the API. Model and
//! temperature are per call because every screening task may pick its own.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod prompts;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_OUTPUT_TOKENS: u32 = 1024;

/// Model used when neither the task nor the service config names one.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("LLM returned empty content")]
    EmptyContent,

    #[error("LLM returned malformed JSON: {source}")]
    Malformed {
        source: serde_json::Error,
        usage: Usage,
    },
}

impl LlmError {
    /// Tokens billed for a call that still failed.
    pub fn usage(&self) -> Option<Usage> {
        match self {
            LlmError::Malformed { usage, .. } => Some(*usage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Which model to call and how.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOptions {
    pub model: String,
    pub temperature: Option<f32>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
        }
    }
}

/// Backoff between attempts: `base`, `2 * base`, `4 * base`, ...
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before `attempt` (0-based). The first attempt never waits.
    fn delay_before(&self, attempt: u32) -> Duration {
        match attempt {
            0 => Duration::ZERO,
            n => self.base_delay.saturating_mul(1 << (n - 1).min(16)),
        }
    }
}

// Wire types

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl MessagesResponse {
    fn first_text(&self) -> Option<&str> {
        self.content
            .iter()
            .filter(|block| block.kind == "text")
            .find_map(|block| block.text.as_deref())
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Result of one HTTP round trip.
enum Attempt {
    Done(MessagesResponse),
    Retry(LlmError),
    Fatal(LlmError),
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    api_key: String,
    retry: RetryPolicy,
}

impl LlmClient {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_key,
            retry: RetryPolicy::default(),
        })
    }

    /// Sends one prompt and parses the first text block as `T`.
    ///
    /// Rate limits, server errors and transport failures are retried per the
    /// client's `RetryPolicy`. Tokens spent on an unparseable answer are
    /// reported in `LlmError::Malformed`.
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        options: &CallOptions,
        prompt: &str,
        system: &str,
    ) -> Result<(T, Usage), LlmError> {
        let response = self.send(options, prompt, system).await?;
        let usage = response.usage;
        let text = response.first_text().ok_or(LlmError::EmptyContent)?;

        serde_json::from_str(json_body(text))
            .map(|value| (value, usage))
            .map_err(|source| LlmError::Malformed { source, usage })
    }

    async fn send(
        &self,
        options: &CallOptions,
        prompt: &str,
        system: &str,
    ) -> Result<MessagesResponse, LlmError> {
        let body = MessagesRequest {
            model: &options.model,
            max_tokens: MAX_OUTPUT_TOKENS,
            temperature: options.temperature,
            system,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };

        let mut last = None;
        for attempt in 0..self.retry.max_attempts {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.attempt(&body).await {
                Attempt::Done(response) => {
                    debug!(
                        model = %options.model,
                        attempt,
                        input_tokens = response.usage.input_tokens,
                        output_tokens = response.usage.output_tokens,
                        "LLM call succeeded"
                    );
                    return Ok(response);
                }
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retry(e) => {
                    warn!(model = %options.model, attempt, "LLM call failed, will retry: {e}");
                    last = Some(e);
                }
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn attempt(&self, body: &MessagesRequest<'_>) -> Attempt {
        let response = match self
            .http
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(LlmError::Http(e)),
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<MessagesResponse>().await {
                Ok(parsed) => Attempt::Done(parsed),
                Err(e) => Attempt::Fatal(LlmError::Http(e)),
            };
        }

        let raw = response.text().await.unwrap_or_default();
        let error = LlmError::Api {
            status: status.as_u16(),
            message: api_message(&raw),
        };
        if is_retryable(status) {
            Attempt::Retry(error)
        } else {
            Attempt::Fatal(error)
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// The `error.message` of an API error body, or the raw body.
fn api_message(raw: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(raw)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| raw.to_string())
}

/// Narrows model output to the JSON object it contains: drops code fences
/// and any prose around the outermost braces.
fn json_body(text: &str) -> &str {
    let text = text.trim();
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}
