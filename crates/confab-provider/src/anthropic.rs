use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::budget::completion_budget;
use crate::{BackendError, BackendErrorKind, LlmBackend};

const REQUEST_TIMEOUT_SECS: u64 = 60;
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self::with_model(api_key, api_base, DEFAULT_MODEL)
    }

    pub fn with_model(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: usize,
    messages: Vec<ApiMessage>,
}

#[derive(Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    async fn query(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/v1/messages", self.api_base);
        let payload = ApiRequest {
            model: self.model.clone(),
            max_tokens: completion_budget(&self.model, prompt),
            messages: vec![ApiMessage {
                role: "user",
                content: prompt.to_string(),
            }],
        };

        let resp = match self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(BackendError::new(
                    "anthropic",
                    BackendErrorKind::Timeout,
                    format!("request timed out after {REQUEST_TIMEOUT_SECS}s"),
                )
                .into());
            }
            Err(e) if e.is_connect() => {
                return Err(
                    BackendError::new("anthropic", BackendErrorKind::Connect, e.to_string())
                        .into(),
                );
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::new(
                "anthropic",
                BackendErrorKind::from_status(status),
                format!("{status}: {text}"),
            )
            .into());
        }

        let body: ApiResponse = resp.json().await?;
        let text = body
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            return Err(anyhow!("anthropic response contained no text content"));
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}
