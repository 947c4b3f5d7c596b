//! OpenAI-compatible endpoints (DeepSeek, Qwen, GLM, Ollama).
//!
//! Same request format as OpenAI, different base URLs.

use crate::OpenAiBackend;

/// DeepSeek API - OpenAI compatible
/// https://platform.deepseek.com/api-docs
pub fn deepseek(api_key: impl Into<String>, model: impl Into<String>) -> OpenAiBackend {
    OpenAiBackend::new(api_key, "https://api.deepseek.com/v1", model)
}

/// Qwen (DashScope compatible mode) - OpenAI compatible
/// https://help.aliyun.com/zh/model-studio/compatibility-of-openai-with-dashscope
pub fn qwen(api_key: impl Into<String>, model: impl Into<String>) -> OpenAiBackend {
    OpenAiBackend::new(
        api_key,
        "https://dashscope.aliyuncs.com/compatible-mode/v1",
        model,
    )
}

/// Zhipu GLM - OpenAI compatible
/// https://open.bigmodel.cn/dev/api
pub fn glm(api_key: impl Into<String>, model: impl Into<String>) -> OpenAiBackend {
    OpenAiBackend::new(api_key, "https://open.bigmodel.cn/api/paas/v4", model)
}

/// Ollama local API - OpenAI compatible, no API key required
pub fn ollama(base_url: impl Into<String>, model: impl Into<String>) -> OpenAiBackend {
    OpenAiBackend::new("ollama", base_url, model)
}

/// Any other OpenAI-compatible endpoint
pub fn custom(
    api_key: impl Into<String>,
    base_url: impl Into<String>,
    model: impl Into<String>,
) -> OpenAiBackend {
    OpenAiBackend::new(api_key, base_url, model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_model() {
        assert_eq!(deepseek("k", "deepseek-chat").model(), "deepseek-chat");
        assert_eq!(qwen("k", "qwen-plus").model(), "qwen-plus");
        assert_eq!(glm("k", "glm-4").model(), "glm-4");
        assert_eq!(ollama("http://localhost:11434/v1", "llama3").model(), "llama3");
        assert_eq!(custom("k", "https://llm.example.com/v1", "m").model(), "m");
    }
}
