// switchyard/src/api.rs

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::errors::ApiError;
use crate::models::chat::ApiResponse;

const MAX_RETRIES: u32 = 3;
const STATUS_RATE_LIMIT_DELAY: Duration = Duration::from_secs(5);
const STATUS_DELAY: Duration = Duration::from_secs(2);
const TRANSPORT_DELAY: Duration = Duration::from_secs(1);

/// Sleep seam for the retry loop, injectable so tests observe delays
/// instead of waiting them out.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Chat-completion client with retry, backoff, and normalization of
/// provider errors embedded in 2xx bodies.
pub struct CompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    user_agent: String,
    app_title: Option<String>,
    sleeper: Arc<dyn Sleeper>,
}

impl CompletionClient {
    pub fn new(config: ClientConfig, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client for completions")?;
        Ok(Self {
            http,
            base_url: config.base_url,
            api_key,
            user_agent: config.user_agent,
            app_title: config.app_title,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Replaces the sleeper used between retry attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// POSTs one completion request, retrying transient failures.
    ///
    /// Up to three retries. The delay before attempt `n + 1` is the
    /// error's base delay times `2^(n-1)`. Once retries are exhausted
    /// the final error is returned verbatim.
    pub async fn chat_completion(&self, body: &Value) -> Result<ApiResponse, ApiError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.post_once(body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt <= MAX_RETRIES => {
                    let delay = backoff_delay(&e, attempt);
                    warn!(
                        error = %e,
                        attempt,
                        max_retries = MAX_RETRIES,
                        delay_ms = delay.as_millis() as u64,
                        "Completion request failed, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(&self, body: &Value) -> Result<ApiResponse, ApiError> {
        let mut request = self
            .http
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("User-Agent", &self.user_agent);
        if let Some(title) = &self.app_title {
            request = request.header("X-Title", title);
        }

        let response = request.json(body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
            debug!(status = status.as_u16(), body = %body, "Completion endpoint returned error status");
            return Err(ApiError::Status { status: status.as_u16(), body });
        }

        let value: Value = response.json().await?;
        if let Some(embedded) = embedded_error(&value) {
            debug!(error = %embedded, "Provider error embedded in 2xx body");
            return Err(embedded);
        }

        serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

/// Scans a 2xx body for an error the provider reported in-band, first
/// under `choices[0].error`, then at the top level. Upstream rate
/// limits are often misreported as bad-gateway, so a 502 code is
/// re-tagged 429 before the retry classification sees it.
fn embedded_error(value: &Value) -> Option<ApiError> {
    let error = value
        .pointer("/choices/0/error")
        .filter(|e| e.is_object())
        .or_else(|| value.get("error").filter(|e| e.is_object()))?;

    let provider: crate::models::chat::ProviderError =
        serde_json::from_value(error.clone()).ok()?;
    let code = provider.status_code().unwrap_or(500);
    let status = if code == 502 { 429 } else { code };
    Some(ApiError::Status {
        status,
        body: json!({ "error": { "message": provider.message } }),
    })
}

/// Deterministic backoff for the delay before the next attempt:
/// 429 waits from a 5 s base, other retryable statuses from 2 s,
/// transport errors from 1 s, doubling per attempt.
fn backoff_delay(error: &ApiError, attempt: u32) -> Duration {
    let base = match error {
        ApiError::Status { status: 429, .. } => STATUS_RATE_LIMIT_DELAY,
        ApiError::Status { .. } => STATUS_DELAY,
        _ => TRANSPORT_DELAY,
    };
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records requested delays and advances a shared attempt counter
    /// so mocks can switch behavior between attempts.
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
        attempts: Arc<AtomicUsize>,
    }

    impl RecordingSleeper {
        fn new(attempts: Arc<AtomicUsize>) -> Self {
            Self { delays: Mutex::new(Vec::new()), attempts }
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
            self.attempts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn client_for(server: &MockServer) -> CompletionClient {
        CompletionClient::new(
            ClientConfig {
                base_url: format!("{}/v1/chat/completions", server.base_url()),
                user_agent: "switchyard-test".to_string(),
                app_title: Some("switchyard".to_string()),
            },
            "test-key".to_string(),
        )
        .unwrap()
    }

    fn success_body() -> Value {
        json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "Pong" },
                "finish_reason": "stop"
            }]
        })
    }

    #[tokio::test]
    async fn sends_required_headers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("Authorization", "Bearer test-key")
                    .header("User-Agent", "switchyard-test")
                    .header("X-Title", "switchyard");
                then.status(200).json_body(success_body());
            })
            .await;

        let client = client_for(&server);
        let response = client
            .chat_completion(&json!({ "model": "m", "messages": [] }))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(response.first_message().unwrap().content_text(), "Pong");
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(400).json_body(json!({ "error": { "message": "bad request" } }));
            })
            .await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let sleeper = Arc::new(RecordingSleeper::new(attempts));
        let client = client_for(&server).with_sleeper(sleeper.clone());

        let result = client.chat_completion(&json!({ "model": "m" })).await;
        mock.assert_hits_async(1).await;
        assert!(sleeper.delays.lock().unwrap().is_empty());
        match result {
            Err(ApiError::Status { status: 400, .. }) => {}
            other => panic!("expected 400 status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retries_server_errors_with_doubling_backoff() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(500).body("Server error");
            })
            .await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let sleeper = Arc::new(RecordingSleeper::new(attempts));
        let client = client_for(&server).with_sleeper(sleeper.clone());

        let result = client.chat_completion(&json!({ "model": "m" })).await;
        mock.assert_hits_async(4).await;
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
        assert!(matches!(result, Err(ApiError::Status { status: 500, .. })));
    }

    #[tokio::test]
    async fn rate_limit_resolved_on_third_attempt() {
        let server = MockServer::start_async().await;
        let attempts = Arc::new(AtomicUsize::new(0));

        let limited = {
            let attempts = attempts.clone();
            server
                .mock_async(move |when, then| {
                    when.method(POST)
                        .path("/v1/chat/completions")
                        .matches(move |_| attempts.load(Ordering::SeqCst) < 2);
                    then.status(429).body("slow down");
                })
                .await
        };
        let ok = {
            let attempts = attempts.clone();
            server
                .mock_async(move |when, then| {
                    when.method(POST)
                        .path("/v1/chat/completions")
                        .matches(move |_| attempts.load(Ordering::SeqCst) >= 2);
                    then.status(200).json_body(success_body());
                })
                .await
        };

        let sleeper = Arc::new(RecordingSleeper::new(attempts));
        let client = client_for(&server).with_sleeper(sleeper.clone());

        let response = client.chat_completion(&json!({ "model": "m" })).await.unwrap();
        limited.assert_hits_async(2).await;
        ok.assert_hits_async(1).await;
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
        assert_eq!(response.first_message().unwrap().content_text(), "Pong");
    }

    #[tokio::test]
    async fn embedded_choice_error_is_normalized_and_retried() {
        let server = MockServer::start_async().await;
        let attempts = Arc::new(AtomicUsize::new(0));

        // A 200 whose first choice carries an upstream 502; the client
        // re-tags it 429 and retries once.
        let embedded = {
            let attempts = attempts.clone();
            server
                .mock_async(move |when, then| {
                    when.method(POST)
                        .path("/v1/chat/completions")
                        .matches(move |_| attempts.load(Ordering::SeqCst) == 0);
                    then.status(200).json_body(json!({
                        "id": "chatcmpl-err",
                        "choices": [{ "error": { "code": 502, "message": "rate" } }]
                    }));
                })
                .await
        };
        let ok = {
            let attempts = attempts.clone();
            server
                .mock_async(move |when, then| {
                    when.method(POST)
                        .path("/v1/chat/completions")
                        .matches(move |_| attempts.load(Ordering::SeqCst) >= 1);
                    then.status(200).json_body(success_body());
                })
                .await
        };

        let sleeper = Arc::new(RecordingSleeper::new(attempts));
        let client = client_for(&server).with_sleeper(sleeper.clone());

        let response = client.chat_completion(&json!({ "model": "m" })).await.unwrap();
        embedded.assert_hits_async(1).await;
        ok.assert_hits_async(1).await;
        // 502 was re-tagged 429, so the single delay uses the 5 s base.
        assert_eq!(*sleeper.delays.lock().unwrap(), vec![Duration::from_secs(5)]);
        assert_eq!(response.first_message().unwrap().content_text(), "Pong");
    }

    #[tokio::test]
    async fn embedded_top_level_error_is_normalized() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(json!({
                    "error": { "code": 403, "message": "forbidden" }
                }));
            })
            .await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let sleeper = Arc::new(RecordingSleeper::new(attempts));
        let client = client_for(&server).with_sleeper(sleeper.clone());

        let result = client.chat_completion(&json!({ "model": "m" })).await;
        match result {
            Err(ApiError::Status { status: 403, body }) => {
                assert_eq!(body["error"]["message"], json!("forbidden"));
            }
            other => panic!("expected normalized 403, got {other:?}"),
        }
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[test]
    fn backoff_is_deterministic_from_error_and_attempt() {
        let rate = ApiError::Status { status: 429, body: json!({}) };
        let server = ApiError::Status { status: 503, body: json!({}) };
        assert_eq!(backoff_delay(&rate, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(&rate, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(&rate, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(&server, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&server, 3), Duration::from_secs(8));
    }
}
