//! Completion-budget computation.
//!
//! The completion budget is the model's context window minus the estimated
//! prompt tokens minus a fixed per-message overhead, clamped to the model's
//! completion ceiling.

/// Approximate token count from text (chars / 4). Actual tokenization varies
/// by model; the estimate only has to keep requests inside the window.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Overhead tokens charged per chat message by the serving side.
const PER_MESSAGE_OVERHEAD: usize = 15;

/// Messages in a single-turn query: one system, one user.
const MESSAGES_PER_QUERY: usize = 2;

fn context_window(model: &str) -> usize {
    match model {
        "gpt-3.5-turbo" | "gpt-3.5-turbo-0613" => 4_096,
        "gpt-3.5-turbo-16k" | "gpt-3.5-turbo-16k-0613" => 16_384,
        "gpt-4" => 8_192,
        "gpt-4-0125-preview" | "gpt-4-turbo" | "gpt-4o-mini" | "gpt-4o" => 128_000,
        m if m.starts_with("claude") => 200_000,
        _ => 8_192,
    }
}

fn completion_ceiling(model: &str) -> Option<usize> {
    match model {
        "gpt-4-0125-preview" | "gpt-4-turbo" | "gpt-4o-mini" | "gpt-4o" => Some(4_096),
        m if m.starts_with("claude") => Some(8_192),
        _ => None,
    }
}

/// Tokens available for the completion of a single-prompt query.
pub fn completion_budget(model: &str, prompt: &str) -> usize {
    let prompt_tokens =
        estimate_tokens(prompt) + PER_MESSAGE_OVERHEAD * MESSAGES_PER_QUERY;
    let window = context_window(model);
    let budget = window.saturating_sub(prompt_tokens);
    match completion_ceiling(model) {
        Some(ceiling) => budget.min(ceiling),
        None => budget,
    }
    .max(1)
}
