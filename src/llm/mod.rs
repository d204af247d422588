//! LLM transport: client trait, OpenAI-compatible HTTP implementation, and
//! the reasoning-block truncation filter.

pub mod client;
pub mod thinking;
pub mod types;

pub use client::{HttpLlmClient, LlmClient, LlmConfig, RetryConfig};
pub use thinking::ThinkingFilter;
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, FinishReason, NullSink,
    TokenSink, TokenUsage,
};

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted client for tests: pops canned responses in order, repeating
    /// the last one once the script is exhausted.
    pub(crate) struct ScriptedClient {
        responses: Mutex<Vec<ScriptStep>>,
        pub calls: Mutex<Vec<String>>,
    }

    pub(crate) enum ScriptStep {
        Reply(String),
        Fail(String),
    }

    impl ScriptedClient {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .rev()
                        .map(|r| ScriptStep::Reply(r.to_string()))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_steps(steps: Vec<ScriptStep>) -> Self {
            Self {
                responses: Mutex::new(steps.into_iter().rev().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn next(&self, prompt: &str) -> Result<String> {
            self.calls.lock().unwrap().push(prompt.to_string());
            let mut responses = self.responses.lock().unwrap();
            let step = if responses.len() > 1 {
                responses.pop().unwrap()
            } else {
                match responses.last() {
                    Some(ScriptStep::Reply(r)) => ScriptStep::Reply(r.clone()),
                    Some(ScriptStep::Fail(m)) => ScriptStep::Fail(m.clone()),
                    None => ScriptStep::Fail("script exhausted".to_string()),
                }
            };
            match step {
                ScriptStep::Reply(r) => Ok(r),
                ScriptStep::Fail(m) => Err(Error::transport_fatal(m)),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let prompt = request
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let content = self.next(&prompt)?;
            Ok(CompletionResponse {
                content,
                reasoning: None,
                model: "scripted".to_string(),
                finish_reason: FinishReason::Stop,
                usage: None,
            })
        }

        async fn complete_streaming(
            &self,
            request: CompletionRequest,
            sink: &mut dyn TokenSink,
        ) -> Result<CompletionResponse> {
            let response = self.complete(request).await?;
            sink.on_token(&response.content);
            Ok(response)
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(vec!["scripted".to_string()])
        }
    }
}
