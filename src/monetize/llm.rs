use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::OpenAiSection;
use crate::errors::LlmError;

/// A single prompt to the language model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    /// Image attached to the user turn, as an https or `data:` URL.
    pub image_url: Option<String>,
    /// Ask the provider to return a JSON object.
    pub json_output: bool,
}

/// Abstraction over the language model provider for testability.
/// Real implementation: `OpenAiClient`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;

    fn model(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Map an unsuccessful OpenAI HTTP response onto `LlmError`.
///
/// 429 is split by error code: `insufficient_quota` means billing is
/// exhausted and retrying is pointless, anything else is rate limiting.
pub fn classify_openai_error(status: u16, body: &str) -> LlmError {
    let code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("code").or_else(|| e.get("type")))
                .and_then(|c| c.as_str())
                .map(str::to_string)
        });
    match status {
        401 => LlmError::Unauthorized,
        429 if code.as_deref() == Some("insufficient_quota") => {
            LlmError::QuotaExceeded("insufficient_quota".to_string())
        }
        _ => LlmError::Http {
            status,
            body: body.chars().take(500).collect(),
        },
    }
}

/// Whether a failed attempt is worth retrying.
pub fn is_retryable(err: &LlmError) -> bool {
    match err {
        LlmError::Http { status, .. } => *status == 429 || *status >= 500,
        LlmError::Transport(_) => true,
        _ => false,
    }
}

/// Longest single wait between retries.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Wait before retry number `attempt` (0-based): `base`, 2×`base`, 4×`base`,
/// and so on, never more than `MAX_BACKOFF`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// OpenAI Chat Completions client.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_retries: u32,
    retry_base: Duration,
}

impl OpenAiClient {
    pub fn new(api_key: String, config: &OpenAiSection) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_retries: config.max_retries,
            retry_base: Duration::from_secs(1),
        })
    }

    /// Override the first retry delay (1s by default).
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    fn build_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let user_content = match &request.image_url {
            Some(url) => serde_json::json!([
                {"type": "text", "text": request.user},
                {"type": "image_url", "image_url": {"url": url, "detail": "high"}}
            ]),
            None => serde_json::Value::String(request.user.clone()),
        };
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                serde_json::json!({"role": "system", "content": request.system}),
                serde_json::json!({"role": "user", "content": user_content}),
            ],
            temperature: 0.2,
            response_format: request
                .json_output
                .then(|| serde_json::json!({"type": "json_object"})),
        };
        serde_json::to_value(body).unwrap_or_default()
    }

    async fn try_request(&self, body: &serde_json::Value) -> Result<String, LlmError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(LlmError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_openai_error(status.as_u16(), &text));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(LlmError::Transport)?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyCompletion)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let body = self.build_body(&request);
        let mut attempt = 0;

        loop {
            match self.try_request(&body).await {
                Ok(content) => return Ok(content),
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    let delay = backoff_delay(self.retry_base, attempt);
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        max_retries = self.max_retries,
                        "OpenAI request failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(LlmError::Http { status: 429, body }) => {
                    // Still rate limited after every retry: treat as exhausted quota.
                    return Err(LlmError::QuotaExceeded(format!("rate limited: {}", body)));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}
