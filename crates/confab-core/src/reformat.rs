//! Coerce free-form model output into a required JSON shape.
//!
//! The repair ladder: strip code fences and null literals, strict parse,
//! relaxed normalization (quoting bare identifiers), then a bounded number of
//! LLM reformat rounds. On exhaustion the schema example itself is returned,
//! so callers always receive a mapping with the schema's keys and types.

use std::sync::Arc;
use std::time::Duration;

use confab_provider::LlmBackend;
use confab_trace::EventLog;
use regex::Regex;
use serde_json::{Map, Value};

use crate::prompts::{fill, ToolPrompts};

const RETRY_PAUSE: Duration = Duration::from_secs(1);

pub struct JsonReformatter {
    backend: Arc<dyn LlmBackend>,
    prompts: Arc<ToolPrompts>,
    log: EventLog,
    max_retries: usize,
}

impl JsonReformatter {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        prompts: Arc<ToolPrompts>,
        log: EventLog,
        max_retries: usize,
    ) -> Self {
        Self {
            backend,
            prompts,
            log,
            max_retries: max_retries.max(1),
        }
    }

    /// Return text that parses to a mapping with exactly the schema's keys
    /// and the schema's runtime value types. Never fails: degrades to the
    /// schema itself.
    pub async fn reform(&self, text: &str, schema: &Map<String, Value>) -> String {
        let fallback = Value::Object(schema.clone()).to_string();
        if text.trim().is_empty() {
            return fallback;
        }

        let mut text = text.to_string();
        for trial in 1..=self.max_retries {
            text = sanitize(&text);
            if let Some(parsed) = parse_matching(&text, schema) {
                return prune(parsed, schema);
            }
            if let Some(relaxed) = normalize_relaxed(&text) {
                if let Some(parsed) = parse_matching(&relaxed, schema) {
                    return prune(parsed, schema);
                }
            }

            let prompt = fill(
                &self.prompts.json_reformat,
                &[("text", &text), ("json_format", &fallback)],
            );
            match self.backend.query(&prompt).await {
                Ok(reply) => {
                    self.log.log(
                        &format!("Trial {trial} on reformatting json text"),
                        Some(&prompt),
                        Some(&reply),
                    );
                    text = reply;
                }
                Err(err) => {
                    self.log
                        .note(&format!("Trial {trial} on reformatting json failed: {err:#}"));
                }
            }
            tokio::time::sleep(RETRY_PAUSE).await;
        }

        text = sanitize(&text);
        if let Some(parsed) = parse_matching(&text, schema) {
            return prune(parsed, schema);
        }
        fallback
    }

    /// Reference-free variant: any JSON object is accepted.
    pub async fn reform_free(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return "{}".to_string();
        }

        let mut text = text.to_string();
        for trial in 1..=self.max_retries {
            text = sanitize(&text);
            if let Some(object) = parse_object(&text) {
                return Value::Object(object).to_string();
            }
            if let Some(relaxed) = normalize_relaxed(&text) {
                if let Some(object) = parse_object(&relaxed) {
                    return Value::Object(object).to_string();
                }
            }

            let prompt = fill(&self.prompts.json_reformat_woreference, &[("text", &text)]);
            match self.backend.query(&prompt).await {
                Ok(reply) => {
                    self.log.log(
                        &format!("Trial {trial} on reformatting json text"),
                        Some(&prompt),
                        Some(&reply),
                    );
                    text = reply;
                }
                Err(err) => {
                    self.log
                        .note(&format!("Trial {trial} on reformatting json failed: {err:#}"));
                }
            }
            tokio::time::sleep(RETRY_PAUSE).await;
        }

        text = sanitize(&text);
        match parse_object(&text) {
            Some(object) => Value::Object(object).to_string(),
            None => "{}".to_string(),
        }
    }
}

fn sanitize(text: &str) -> String {
    text.replace("```json", "")
        .replace("```", "")
        .replace("null", "\"Error\"")
        .replace("None", "\"Error\"")
        .trim()
        .to_string()
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// Parse and verify every schema key is present with the schema's runtime
/// type.
fn parse_matching(text: &str, schema: &Map<String, Value>) -> Option<Map<String, Value>> {
    let object = parse_object(text)?;
    for (key, example) in schema {
        let value = object.get(key)?;
        if !same_runtime_type(value, example) {
            return None;
        }
    }
    Some(object)
}

fn same_runtime_type(value: &Value, example: &Value) -> bool {
    matches!(
        (value, example),
        (Value::String(_), Value::String(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

/// Keep exactly the schema's keys, dropping any extras the model added.
fn prune(object: Map<String, Value>, schema: &Map<String, Value>) -> String {
    let mut pruned = Map::new();
    for key in schema.keys() {
        if let Some(value) = object.get(key) {
            pruned.insert(key.clone(), value.clone());
        }
    }
    Value::Object(pruned).to_string()
}

/// Quote bare identifier keys and bare word values so near-JSON like
/// `{keyword: ring, window: 3}` parses. Returns None when the input has no
/// object braces at all.
fn normalize_relaxed(text: &str) -> Option<String> {
    if !text.contains('{') {
        return None;
    }
    let key_re = Regex::new(r#"([{,]\s*)([A-Za-z_][\w\-]*)\s*:"#).ok()?;
    let text = key_re.replace_all(text, "$1\"$2\":");

    let value_re = Regex::new(r#":\s*([A-Za-z_][^,\}\]"\n]*)"#).ok()?;
    let text = value_re.replace_all(&text, |caps: &regex::Captures<'_>| {
        let raw = caps[1].trim_end();
        if raw == "true" || raw == "false" {
            format!(": {raw}")
        } else {
            format!(": \"{raw}\"")
        }
    });
    Some(text.into_owned())
}
