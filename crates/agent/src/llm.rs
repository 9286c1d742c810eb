use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use kopi_core::config::LlmConfig;
use kopi_core::{ConfigError, ToolError};

/// The one capability the orchestrator and the SQL gate depend on. A
/// production implementation talks to a remote chat-completions service, a
/// test implementation returns scripted replies.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ToolError>;
}

/// Token bucket in front of the remote model. Waiters queue up to a bounded
/// wait and then fail fast so a traffic burst degrades to 503s instead of an
/// unbounded backlog.
pub struct RateLimit {
    refill_per_sec: f64,
    capacity: f64,
    max_wait: Duration,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimit {
    pub fn per_minute(requests: u32, max_wait: Duration) -> Self {
        let capacity = f64::from(requests.max(1));
        Self {
            refill_per_sec: capacity / 60.0,
            capacity,
            max_wait,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    pub async fn acquire(&self) -> Result<(), ToolError> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            let wait_needed = {
                let mut state = self.state.lock().expect("rate limit lock should not be poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };

            let now = Instant::now();
            if now + wait_needed > deadline {
                let retry_after_ms = wait_needed.as_millis() as u64;
                return Err(ToolError::RateLimited { retry_after_ms });
            }
            tokio::time::sleep(wait_needed).await;
        }
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint (the hosted
/// deployment points it at Groq).
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
    timeout: Duration,
    rate_limit: RateLimit,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            ConfigError::Validation("llm.api_key is required for the HTTP client".to_string())
        })?;

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|error| {
            ConfigError::Validation(format!("could not build llm http client: {error}"))
        })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            timeout,
            rate_limit: RateLimit::per_minute(
                config.rate_limit_per_minute,
                Duration::from_secs(config.rate_limit_max_wait_secs),
            ),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, ToolError> {
        self.rate_limit.acquire().await?;

        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ToolError::DeadlineExceeded {
                        tool: "llm",
                        deadline_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    ToolError::Llm(error.to_string())
                }
            })?;

        if response.status().as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(|secs| secs * 1_000)
                .unwrap_or(1_000);
            return Err(ToolError::RateLimited { retry_after_ms });
        }
        if !response.status().is_success() {
            return Err(ToolError::Llm(format!("upstream returned {}", response.status())));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|error| ToolError::Llm(format!("malformed completion payload: {error}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ToolError::Llm("completion contained no choices".to_string()))
    }
}

/// Deterministic replacement for tests: hands back queued replies and
/// records every prompt it saw.
#[derive(Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, ToolError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn with_replies(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(
                replies.into_iter().map(|reply| Ok(reply.to_string())).collect(),
            ),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(replies: Vec<Result<String, ToolError>>) -> Self {
        Self { replies: Mutex::new(replies.into()), prompts: Mutex::new(Vec::new()) }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompt lock should not be poisoned").clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, ToolError> {
        self.prompts.lock().expect("prompt lock should not be poisoned").push(prompt.to_string());
        self.replies
            .lock()
            .expect("reply lock should not be poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(ToolError::Llm("scripted replies exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kopi_core::ToolError;

    use super::{LlmClient, RateLimit, ScriptedLlmClient};

    #[tokio::test]
    async fn rate_limit_fails_fast_when_wait_exceeds_budget() {
        let limit = RateLimit::per_minute(1, Duration::ZERO);
        limit.acquire().await.expect("first acquire should pass");

        let denied = limit.acquire().await.expect_err("second acquire should be limited");
        assert!(matches!(denied, ToolError::RateLimited { retry_after_ms } if retry_after_ms > 0));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_queues_within_budget() {
        // One request a minute: the second acquire must wait a full refill,
        // which fits inside the two-minute budget.
        let limit = RateLimit::per_minute(1, Duration::from_secs(120));
        limit.acquire().await.expect("first");
        limit.acquire().await.expect("queued acquire should succeed after refill");
    }

    #[tokio::test]
    async fn scripted_client_replays_and_records() {
        let client = ScriptedLlmClient::with_replies(vec!["first", "second"]);

        assert_eq!(client.complete("p1").await.expect("first"), "first");
        assert_eq!(client.complete("p2").await.expect("second"), "second");
        assert!(client.complete("p3").await.is_err(), "exhausted script should error");
        assert_eq!(client.prompts(), vec!["p1", "p2", "p3"]);
    }
}
