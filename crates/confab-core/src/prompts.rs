//! Prompt templates are data, not code. Each template file is a JSON object
//! whose values are arrays of lines; the loader joins them with newlines and
//! interpolates `{name}` placeholders at call sites. Tests point the loader
//! at their own directories to exercise edge cases.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

/// Role-specific prompt segments, one set per file
/// (`instructor_system_prompt.json` / `assistant_system_prompt.json`).
#[derive(Debug, Clone)]
pub struct SystemPrompts {
    pub role: String,
    pub chat_history: String,
    pub task: String,
    pub agent_chat_history: String,
    pub return_format: String,
    pub return_format_withinfonav: String,
}

/// Shared tool templates from `tool_prompt.json`.
#[derive(Debug, Clone)]
pub struct ToolPrompts {
    pub infonav_init: String,
    pub infonav_mark: String,
    pub infonav_update: String,
    pub conclusion: String,
    pub consensus_conclusion: String,
    pub sql_react: String,
    pub faiss_react: String,
    pub json_reformat: String,
    pub json_reformat_woreference: String,
    pub raise_new_communication: String,
    pub rewrite_task: String,
}

#[derive(Debug, Clone)]
pub struct PromptSet {
    pub instructor: SystemPrompts,
    pub assistant: SystemPrompts,
    pub tools: ToolPrompts,
}

impl PromptSet {
    pub fn load(dir: &Path) -> Result<Self> {
        let instructor = load_system_prompts(&dir.join("instructor_system_prompt.json"))?;
        let assistant = load_system_prompts(&dir.join("assistant_system_prompt.json"))?;
        let tools = load_tool_prompts(&dir.join("tool_prompt.json"))?;
        Ok(Self {
            instructor,
            assistant,
            tools,
        })
    }

    pub fn for_role(&self, is_assistant: bool) -> &SystemPrompts {
        if is_assistant {
            &self.assistant
        } else {
            &self.instructor
        }
    }
}

fn load_template_file(path: &Path) -> Result<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read prompt file: {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse prompt file: {}", path.display()))?;
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("prompt file is not an object: {}", path.display()))?;

    let mut templates = HashMap::new();
    for (key, value) in object {
        let text = match value {
            serde_json::Value::String(line) => line.clone(),
            serde_json::Value::Array(lines) => lines
                .iter()
                .map(|line| {
                    line.as_str()
                        .ok_or_else(|| anyhow!("non-string line in template {key}"))
                })
                .collect::<Result<Vec<_>>>()?
                .join("\n"),
            _ => return Err(anyhow!("template {key} must be a string or array of lines")),
        };
        templates.insert(key.clone(), text);
    }
    Ok(templates)
}

fn take(templates: &mut HashMap<String, String>, key: &str, path: &Path) -> Result<String> {
    templates
        .remove(key)
        .ok_or_else(|| anyhow!("missing template '{key}' in {}", path.display()))
}

fn load_system_prompts(path: &Path) -> Result<SystemPrompts> {
    let mut templates = load_template_file(path)?;
    Ok(SystemPrompts {
        role: take(&mut templates, "role", path)?,
        chat_history: take(&mut templates, "chat_history", path)?,
        task: take(&mut templates, "task", path)?,
        agent_chat_history: take(&mut templates, "agent_chat_history", path)?,
        return_format: take(&mut templates, "return_format", path)?,
        return_format_withinfonav: take(&mut templates, "return_format_withinfonav", path)?,
    })
}

fn load_tool_prompts(path: &Path) -> Result<ToolPrompts> {
    let mut templates = load_template_file(path)?;
    Ok(ToolPrompts {
        infonav_init: take(&mut templates, "infonav_init", path)?,
        infonav_mark: take(&mut templates, "infonav_mark", path)?,
        infonav_update: take(&mut templates, "infonav_update", path)?,
        conclusion: take(&mut templates, "conclusion", path)?,
        consensus_conclusion: take(&mut templates, "consensus_conclusion", path)?,
        sql_react: take(&mut templates, "sql_react", path)?,
        faiss_react: take(&mut templates, "faiss_react", path)?,
        json_reformat: take(&mut templates, "json_reformat", path)?,
        json_reformat_woreference: take(&mut templates, "json_reformat_woreference", path)?,
        raise_new_communication: take(&mut templates, "raise_new_communication", path)?,
        rewrite_task: take(&mut templates, "rewrite_task", path)?,
    })
}

/// Interpolate `{name}` placeholders. Unlisted placeholders are left
/// untouched, so literal braces in templates survive.
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut text = template.to_string();
    for (key, value) in values {
        text = text.replace(&format!("{{{key}}}"), value);
    }
    text
}
