//! LLM completion client. A capability interface the core invokes and never
//! implements the model side of — only `usage` token counts are read back;
//! `choices`/prompt text never cross into anything this crate persists.

use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    pub usage: Usage,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub text: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, endpoint: &str, request: &CompletionRequest) -> anyhow::Result<CompletionResponse>;
}

/// Real implementation: POSTs `/completions` against an OpenAI/vLLM-compatible
/// endpoint with a bounded timeout and reads back only `usage`.
pub struct RemoteLlmClient {
    client: reqwest::Client,
    timeout: std::time::Duration,
}

impl RemoteLlmClient {
    pub fn new(timeout: std::time::Duration) -> Self {
        RemoteLlmClient {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for RemoteLlmClient {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(30))
    }
}

#[async_trait]
impl LlmClient for RemoteLlmClient {
    async fn complete(&self, endpoint: &str, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let url = format!("{}/completions", endpoint.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": request.model,
            "prompt": request.prompt,
            "max_tokens": request.max_tokens,
            "temperature": 0.7,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<CompletionResponse>().await?)
    }
}

/// Test double returning a fixed token count without any network I/O.
pub struct NullLlmClient {
    pub fixed_usage: Usage,
}

impl Default for NullLlmClient {
    fn default() -> Self {
        NullLlmClient {
            fixed_usage: Usage {
                prompt_tokens: 150,
                completion_tokens: 50,
                total_tokens: 200,
            },
        }
    }
}

#[async_trait]
impl LlmClient for NullLlmClient {
    async fn complete(&self, _endpoint: &str, _request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        Ok(CompletionResponse {
            usage: self.fixed_usage.clone(),
            choices: vec![Choice {
                text: "Analysis completed".to_string(),
            }],
        })
    }
}
