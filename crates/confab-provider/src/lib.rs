pub mod anthropic;
pub mod budget;
pub mod compat;
pub mod openai;
pub mod retry;
pub mod stub;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use confab_schema::BackendConfig;
use thiserror::Error;

pub use anthropic::AnthropicBackend;
pub use budget::{completion_budget, estimate_tokens};
pub use compat::{custom, deepseek, glm, ollama, qwen};
pub use openai::OpenAiBackend;
pub use retry::{Retrying, RetryPolicy};
pub use stub::StubBackend;

/// The single capability the engine needs from a language model.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn query(&self, prompt: &str) -> Result<String>;

    fn name(&self) -> &str {
        "backend"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    RateLimit,
    ServerError,
    Timeout,
    Connect,
    AuthError,
    InvalidRequest,
    Unknown,
}

impl BackendErrorKind {
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::RateLimit,
            401 | 403 => Self::AuthError,
            400 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::ServerError | Self::Timeout | Self::Connect
        )
    }
}

#[derive(Debug, Error)]
#[error("{backend} api error ({detail})")]
pub struct BackendError {
    pub backend: &'static str,
    pub kind: BackendErrorKind,
    pub detail: String,
}

impl BackendError {
    pub fn new(backend: &'static str, kind: BackendErrorKind, detail: impl Into<String>) -> Self {
        Self {
            backend,
            kind,
            detail: detail.into(),
        }
    }
}

/// True when the error chain contains a retryable backend error.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BackendError>()
        .map(|e| e.kind.is_retryable())
        .unwrap_or(false)
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn LlmBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, backend: Arc<dyn LlmBackend>) {
        self.backends.insert(id.into(), backend);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmBackend>> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("backend not found: {id}"))
    }

    pub fn list(&self) -> Vec<&str> {
        self.backends.keys().map(|s| s.as_str()).collect()
    }
}

/// Build the configured backend, wrapped in the retry policy. Adapter
/// selection is purely by the config string; an unknown key is a startup
/// error.
pub fn create_backend(
    config: &BackendConfig,
    max_query_retry_times: usize,
) -> Result<Arc<dyn LlmBackend>> {
    let policy = RetryPolicy::new(max_query_retry_times);
    let backend: Arc<dyn LlmBackend> = match config.provider.as_str() {
        "openai" => Arc::new(Retrying::new(
            OpenAiBackend::new(
                config.api_key.clone(),
                config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                config.model.clone(),
            ),
            policy,
        )),
        "gpt" => Arc::new(Retrying::new(
            OpenAiBackend::new(
                config.api_key.clone(),
                config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                "gpt-3.5-turbo-16k",
            ),
            policy,
        )),
        "gpt4" => Arc::new(Retrying::new(
            OpenAiBackend::new(
                config.api_key.clone(),
                config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                "gpt-4o-mini",
            ),
            policy,
        )),
        "claude" => {
            let key = config
                .anthropic_api_key
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| anyhow!("claude backend requires anthropic_api_key"))?;
            Arc::new(Retrying::new(
                AnthropicBackend::new(key, "https://api.anthropic.com"),
                policy,
            ))
        }
        "ollama" => {
            let model = config
                .ollama_model_name
                .clone()
                .ok_or_else(|| anyhow!("ollama backend requires ollama_model_name"))?;
            Arc::new(Retrying::new(
                ollama(&config.ollama_base_url, model),
                policy,
            ))
        }
        "deepseek" => Arc::new(Retrying::new(
            deepseek(config.api_key.clone(), config.model.clone()),
            policy,
        )),
        "qwen" => Arc::new(Retrying::new(
            qwen(config.api_key.clone(), config.model.clone()),
            policy,
        )),
        "glm" => Arc::new(Retrying::new(
            glm(config.api_key.clone(), config.model.clone()),
            policy,
        )),
        "stub" => Arc::new(StubBackend::echo()),
        other => return Err(anyhow!("{other} backend not implemented")),
    };
    Ok(backend)
}
