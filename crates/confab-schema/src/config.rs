use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Settings for the external web UI. The engine itself never binds a socket;
/// the section is carried so one config file serves both processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsiteConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> usize {
    256
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Registry key selecting the adapter. Unknown keys abort startup.
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,
    #[serde(default)]
    pub ollama_model_name: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
}

fn default_query_retries() -> usize {
    10
}

fn default_tool_retries() -> usize {
    5
}

fn default_turns() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_query_retries")]
    pub max_query_retry_times: usize,
    #[serde(default = "default_tool_retries")]
    pub max_tool_retry_times: usize,
    #[serde(default = "default_turns")]
    pub max_communication_turns: usize,
    #[serde(default)]
    pub use_document_index: bool,
    #[serde(default)]
    pub rewrite_prompt: bool,
    #[serde(default)]
    pub multi_party: bool,
    #[serde(default)]
    pub stopwords_path: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_query_retry_times: default_query_retries(),
            max_tool_retry_times: default_tool_retries(),
            max_communication_turns: default_turns(),
            use_document_index: false,
            rewrite_prompt: false,
            multi_party: false,
            stopwords_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeName {
    Base,
    #[serde(rename = "RAG")]
    Rag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    pub mode: ModeName,
}

fn default_logname() -> String {
    "confab".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logname")]
    pub logname: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logname: default_logname(),
            level: default_log_level(),
        }
    }
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from("prompts")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "default_prompts_dir")]
    pub dir: PathBuf,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            dir: default_prompts_dir(),
        }
    }
}

fn default_memory_dir() -> PathBuf {
    PathBuf::from("memory")
}

/// Fuzzy-memory TSV root. A master's table lives at `<dir>/<name>/<master>.tsv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enable_fuzzy: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dir: default_memory_dir(),
            name: String::new(),
            enable_fuzzy: false,
        }
    }
}

fn default_documents_dir() -> PathBuf {
    PathBuf::from("userfiles")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsConfig {
    #[serde(default = "default_documents_dir")]
    pub dir: PathBuf,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            dir: default_documents_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfabConfig {
    pub website: WebsiteConfig,
    pub database: DatabaseConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    pub mode: ModeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
}

/// Replace `${VAR}` placeholders with environment values. Unknown variables
/// resolve to the empty string; an unclosed placeholder is left as-is.
pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

pub fn load_config(path: &Path) -> Result<ConfabConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: ConfabConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))?;

    resolve_config_env(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn resolve_config_env(config: &mut ConfabConfig) {
    config.database.path = resolve_env_var(&config.database.path);
    config.backend.provider = resolve_env_var(&config.backend.provider);
    config.backend.api_key = resolve_env_var(&config.backend.api_key);
    config.backend.model = resolve_env_var(&config.backend.model);
    config.backend.embedding_model = resolve_env_var(&config.backend.embedding_model);
    config.backend.ollama_base_url = resolve_env_var(&config.backend.ollama_base_url);
    if let Some(base_url) = &mut config.backend.base_url {
        *base_url = resolve_env_var(base_url);
    }
    if let Some(key) = &mut config.backend.anthropic_api_key {
        *key = resolve_env_var(key);
    }
    if let Some(model) = &mut config.backend.ollama_model_name {
        *model = resolve_env_var(model);
    }
    config.website.secret = resolve_env_var(&config.website.secret);
}

pub fn validate_config(config: &ConfabConfig) -> Result<()> {
    if config.backend.provider.trim().is_empty() {
        return Err(anyhow!("backend.provider must not be empty"));
    }
    if config.agent.max_query_retry_times == 0 {
        return Err(anyhow!("agent.max_query_retry_times must be at least 1"));
    }
    if config.agent.max_tool_retry_times == 0 {
        return Err(anyhow!("agent.max_tool_retry_times must be at least 1"));
    }
    if config.agent.max_communication_turns == 0 {
        return Err(anyhow!("agent.max_communication_turns must be at least 1"));
    }
    if config.backend.embedding_dimensions == 0 {
        return Err(anyhow!("backend.embedding_dimensions must be at least 1"));
    }

    let known_providers: HashSet<&str> = [
        "openai", "gpt", "gpt4", "claude", "ollama", "deepseek", "qwen", "glm", "stub",
    ]
    .into_iter()
    .collect();
    if !known_providers.contains(config.backend.provider.as_str()) {
        return Err(anyhow!(
            "unknown backend provider: {}",
            config.backend.provider
        ));
    }
    Ok(())
}
