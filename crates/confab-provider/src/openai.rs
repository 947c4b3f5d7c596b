use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::budget::completion_budget;
use crate::{BackendError, BackendErrorKind, LlmBackend};

const REQUEST_TIMEOUT_SECS: u64 = 60;
const TEMPERATURE: f32 = 0.2;

/// Chat-completions adapter. Also serves every OpenAI-compatible endpoint
/// (DeepSeek, Qwen, GLM, Ollama) via the constructors in `compat`.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
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
    messages: Vec<ApiMessage>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct ApiChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn query(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = ApiRequest {
            model: self.model.clone(),
            messages: vec![
                ApiMessage {
                    role: "system",
                    content: String::new(),
                },
                ApiMessage {
                    role: "user",
                    content: prompt.to_string(),
                },
            ],
            max_tokens: completion_budget(&self.model, prompt),
            temperature: TEMPERATURE,
        };

        let resp = match self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(BackendError::new(
                    "openai",
                    BackendErrorKind::Timeout,
                    format!("request timed out after {REQUEST_TIMEOUT_SECS}s"),
                )
                .into());
            }
            Err(e) if e.is_connect() => {
                return Err(
                    BackendError::new("openai", BackendErrorKind::Connect, e.to_string()).into(),
                );
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::new(
                "openai",
                BackendErrorKind::from_status(status),
                format!("{status}: {text}"),
            )
            .into());
        }

        let body: ApiResponse = resp.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("openai response contained no message content"))
    }

    fn name(&self) -> &str {
        "openai"
    }
}
