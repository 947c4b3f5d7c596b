use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::LlmBackend;

type Handler = Box<dyn Fn(&str) -> String + Send + Sync>;

enum Behavior {
    Echo,
    Scripted(Mutex<VecDeque<String>>),
    Handler(Handler),
}

/// Deterministic in-process backend for tests and dry runs.
pub struct StubBackend {
    behavior: Behavior,
    fallback: String,
}

impl StubBackend {
    /// Echo the last line of the prompt back, stub-tagged.
    pub fn echo() -> Self {
        Self {
            behavior: Behavior::Echo,
            fallback: "OK".to_string(),
        }
    }

    /// Return the scripted replies in order; once exhausted, return the
    /// fallback reply.
    pub fn scripted(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            behavior: Behavior::Scripted(Mutex::new(
                replies.into_iter().map(Into::into).collect(),
            )),
            fallback: "OK".to_string(),
        }
    }

    /// Compute each reply from the prompt.
    pub fn with_handler(handler: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            behavior: Behavior::Handler(Box::new(handler)),
            fallback: "OK".to_string(),
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }
}

#[async_trait]
impl LlmBackend for StubBackend {
    async fn query(&self, prompt: &str) -> Result<String> {
        let reply = match &self.behavior {
            Behavior::Echo => {
                let last_line = prompt.lines().last().unwrap_or_default();
                format!("[stub] {last_line}")
            }
            Behavior::Scripted(queue) => match queue.lock() {
                Ok(mut queue) => queue.pop_front().unwrap_or_else(|| self.fallback.clone()),
                Err(_) => self.fallback.clone(),
            },
            Behavior::Handler(handler) => handler(prompt),
        };
        Ok(reply)
    }

    fn name(&self) -> &str {
        "stub"
    }
}
