//! LLM client trait and the OpenAI-compatible HTTP implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::thinking::ThinkingFilter;
use super::types::{
    ChatRole, CompletionRequest, CompletionResponse, FinishReason, TokenSink, TokenUsage,
};

/// Configuration for the LLM transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Endpoint base URL, e.g. `http://localhost:1234`.
    pub base_url: String,
    /// Model id sent with each request.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Max output tokens per request.
    pub max_tokens: u32,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Reasoning-block truncation threshold (streamed tokens).
    pub thinking_max_tokens: usize,
    /// Retry policy for transient transport failures.
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234".to_string(),
            model: "local-model".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            timeout_secs: 120,
            thinking_max_tokens: 4096,
            retry: RetryConfig::default(),
        }
    }
}

impl LlmConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_thinking_max_tokens(mut self, n: usize) -> Self {
        self.thinking_max_tokens = n;
        self
    }
}

/// Retry policy: exponential backoff on transient failures only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial try.
    pub max_retries: u32,
    /// Base delay used for exponential backoff.
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per retry attempt.
    pub backoff_factor: f64,
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            backoff_factor: 2.0,
        }
    }
}

/// LLM client trait for chat completions and model probing.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a request, blocking until the full response is available.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Complete a request while streaming tokens into `sink`.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<CompletionResponse>;

    /// List model ids loaded at the endpoint.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Whether the configured model id is present at the endpoint.
    async fn has_model(&self, model: &str) -> Result<bool> {
        Ok(self.list_models().await?.iter().any(|m| m == model))
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs);

    // Some sandboxed macOS environments can panic during proxy auto-detection
    // in reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| {
        Client::builder().timeout(timeout).build()
    })) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client"),
    }
}

/// Client for an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct HttpLlmClient {
    config: LlmConfig,
    http: Client,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn models_url(&self) -> String {
        format!("{}/v1/models", self.config.base_url.trim_end_matches('/'))
    }

    fn api_request(&self, request: &CompletionRequest, stream: bool) -> ApiRequest {
        ApiRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages: request
                .messages
                .iter()
                .map(|m| ApiMessage {
                    role: match m.role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    }
                    .to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: request.temperature.unwrap_or(self.config.temperature),
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            stream,
        }
    }

    fn classify_send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            return Error::timeout(self.config.timeout_secs * 1000);
        }
        if e.is_connect() || e.is_request() {
            return Error::transport(format!("connection failed: {e}"));
        }
        Error::transport(format!("network error: {e}"))
    }

    /// Send the request, retrying transient failures with backoff.
    ///
    /// Timeouts surface immediately (the caller already waited); 4xx bodies
    /// are terminal; 5xx and connection failures retry up to the configured
    /// attempt count.
    async fn send_with_retry(&self, api_request: &ApiRequest) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let result = self
                .http
                .post(self.completions_url())
                .header("content-type", "application/json")
                .json(api_request)
                .send()
                .await;

            let err = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let body = response.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        Error::transport(format!("server error ({status}): {body}"))
                    } else {
                        return Err(Error::transport_fatal(format!(
                            "endpoint rejected request ({status}): {body}"
                        )));
                    }
                }
                Err(e) => self.classify_send_error(e),
            };

            if !err.is_retryable() || attempt >= self.config.retry.max_retries {
                return Err(err);
            }
            let delay = self.config.retry.delay_for_attempt(attempt);
            warn!(attempt, ?delay, "transient LLM transport failure, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

// OpenAI-compatible wire types.
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Accumulates one streamed completion from SSE `data:` lines.
struct StreamState {
    content: String,
    reasoning: String,
    model: String,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    filter: ThinkingFilter,
    done: bool,
}

impl StreamState {
    fn new(model: String, thinking_max_tokens: usize) -> Self {
        Self {
            content: String::new(),
            reasoning: String::new(),
            model,
            finish_reason: None,
            usage: None,
            filter: ThinkingFilter::new(thinking_max_tokens),
            done: false,
        }
    }

    /// Absorb one SSE line, forwarding deltas into `sink`.
    fn absorb_line(&mut self, line: &str, sink: &mut dyn TokenSink) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            return;
        };
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
            return;
        };

        if let Some(model) = json.get("model").and_then(|v| v.as_str()) {
            self.model = model.to_string();
        }
        if let Some(usage) = json.get("usage") {
            let input = usage.get("prompt_tokens").and_then(|v| v.as_u64());
            let output = usage.get("completion_tokens").and_then(|v| v.as_u64());
            if let (Some(input_tokens), Some(output_tokens)) = (input, output) {
                self.usage = Some(TokenUsage {
                    input_tokens,
                    output_tokens,
                });
            }
        }

        let Some(choice) = json.get("choices").and_then(|c| c.get(0)) else {
            return;
        };
        if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.finish_reason = Some(FinishReason::parse(fr));
        }
        let Some(delta) = choice.get("delta") else {
            return;
        };

        if let Some(token) = delta.get("content").and_then(|v| v.as_str()) {
            if !token.is_empty() {
                let emitted = self.filter.feed(token);
                if !emitted.is_empty() {
                    self.content.push_str(&emitted);
                    sink.on_token(&emitted);
                }
            }
        }

        let reasoning_delta = delta
            .get("reasoning")
            .or_else(|| delta.get("reasoning_content"))
            .and_then(|v| v.as_str());
        if let Some(token) = reasoning_delta {
            if !token.is_empty() {
                self.reasoning.push_str(token);
                sink.on_reasoning(token);
            }
        }
    }

    fn into_response(self) -> Result<CompletionResponse> {
        let finish_reason = self.finish_reason.unwrap_or(FinishReason::Stop);
        if !finish_reason.is_stop() {
            return Err(Error::Incomplete {
                finish_reason: finish_reason.to_string(),
            });
        }
        Ok(CompletionResponse {
            content: self.content,
            reasoning: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
            model: self.model,
            finish_reason,
            usage: self.usage,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let api_request = self.api_request(&request, false);
        let response = self.send_with_retry(&api_request).await?;

        let body = response
            .text()
            .await
            .map_err(|e| Error::transport_fatal(format!("failed to read response: {e}")))?;
        let api_response: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::transport_fatal(format!("malformed response body: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::transport_fatal("no choices in response"))?;

        let finish_reason = choice
            .finish_reason
            .as_deref()
            .map(FinishReason::parse)
            .unwrap_or(FinishReason::Stop);
        if !finish_reason.is_stop() {
            return Err(Error::Incomplete {
                finish_reason: finish_reason.to_string(),
            });
        }

        let reasoning = choice
            .message
            .reasoning
            .or(choice.message.reasoning_content)
            .filter(|r| !r.is_empty());

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            reasoning,
            model: api_response.model.unwrap_or_else(|| api_request.model),
            finish_reason,
            usage: api_response.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
        })
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<CompletionResponse> {
        let api_request = self.api_request(&request, true);
        let mut response = self.send_with_retry(&api_request).await?;

        let mut state = StreamState::new(api_request.model.clone(), self.config.thinking_max_tokens);
        let mut buffer = String::new();

        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    if e.is_timeout() {
                        return Err(Error::timeout(self.config.timeout_secs * 1000));
                    }
                    return Err(Error::transport(format!("stream read failed: {e}")));
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events may split across chunks; only consume full lines.
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                state.absorb_line(&line, sink);
            }
            if state.done {
                break;
            }
        }
        if !buffer.is_empty() {
            state.absorb_line(&buffer, sink);
        }

        debug!(
            content_len = state.content.len(),
            reasoning_len = state.reasoning.len(),
            "stream complete"
        );
        state.into_response()
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.models_url())
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transport_fatal(format!(
                "model list failed ({status})"
            )));
        }
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| Error::transport_fatal(format!("malformed model list: {e}")))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::NullSink;
    use pretty_assertions::assert_eq;

    struct Collect {
        tokens: Vec<String>,
        reasoning: Vec<String>,
    }

    impl Collect {
        fn new() -> Self {
            Self {
                tokens: Vec::new(),
                reasoning: Vec::new(),
            }
        }
    }

    impl TokenSink for Collect {
        fn on_token(&mut self, token: &str) {
            self.tokens.push(token.to_string());
        }
        fn on_reasoning(&mut self, token: &str) {
            self.reasoning.push(token.to_string());
        }
    }

    fn delta_line(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}",
            serde_json::to_string(content).unwrap()
        )
    }

    #[test]
    fn test_retry_delay_growth() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(800));
    }

    #[test]
    fn test_stream_state_accumulates_content_and_reasoning() {
        let mut state = StreamState::new("m".into(), 64);
        let mut sink = Collect::new();

        state.absorb_line(&delta_line("ROW: 1\n"), &mut sink);
        state.absorb_line(
            "data: {\"choices\":[{\"delta\":{\"reasoning\":\"because\"}}]}",
            &mut sink,
        );
        state.absorb_line(
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}",
            &mut sink,
        );
        state.absorb_line("data: [DONE]", &mut sink);

        assert!(state.done);
        assert_eq!(sink.tokens, vec!["ROW: 1\n"]);
        assert_eq!(sink.reasoning, vec!["because"]);
        let response = state.into_response().unwrap();
        assert_eq!(response.content, "ROW: 1\n");
        assert_eq!(response.reasoning.as_deref(), Some("because"));
    }

    #[test]
    fn test_stream_state_accepts_reasoning_content_field() {
        let mut state = StreamState::new("m".into(), 64);
        let mut sink = Collect::new();
        state.absorb_line(
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"trace\"}}]}",
            &mut sink,
        );
        assert_eq!(sink.reasoning, vec!["trace"]);
    }

    #[test]
    fn test_stream_truncates_overlong_thinking() {
        let mut state = StreamState::new("m".into(), 2);
        let mut sink = Collect::new();

        state.absorb_line(&delta_line("<think>"), &mut sink);
        for token in ["alpha ", "beta ", "gamma ", "delta "] {
            state.absorb_line(&delta_line(token), &mut sink);
        }
        state.absorb_line(&delta_line("</think>"), &mut sink);
        state.absorb_line(&delta_line("ROW: 2"), &mut sink);
        state.absorb_line("data: [DONE]", &mut sink);

        let response = state.into_response().unwrap();
        assert_eq!(
            response.content,
            "<think>alpha beta </think>\n[Thinking truncated]\nROW: 2"
        );
    }

    #[test]
    fn test_non_stop_finish_is_incomplete() {
        let mut state = StreamState::new("m".into(), 64);
        state.absorb_line(&delta_line("partial"), &mut NullSink);
        state.absorb_line(
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}",
            &mut NullSink,
        );
        match state.into_response() {
            Err(Error::Incomplete { finish_reason }) => assert_eq!(finish_reason, "length"),
            other => panic!("expected incomplete error, got {other:?}"),
        }
    }

    #[test]
    fn test_ignores_malformed_and_non_data_lines() {
        let mut state = StreamState::new("m".into(), 64);
        let mut sink = Collect::new();
        state.absorb_line(": keep-alive comment", &mut sink);
        state.absorb_line("data: {not json", &mut sink);
        state.absorb_line(&delta_line("ok"), &mut sink);
        assert_eq!(sink.tokens, vec!["ok"]);
    }

    #[test]
    fn test_config_builders() {
        let config = LlmConfig::new("http://host:8000", "qwen")
            .with_temperature(0.1)
            .with_max_tokens(256)
            .with_timeout(30)
            .with_thinking_max_tokens(1024);
        assert_eq!(config.base_url, "http://host:8000");
        assert_eq!(config.model, "qwen");
        assert_eq!(config.temperature, 0.1);
        assert_eq!(config.max_tokens, 256);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.thinking_max_tokens, 1024);
    }
}
