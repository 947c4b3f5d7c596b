//! Tracks the known/unknown rationale slots extracted from a plan.
//!
//! A slot is a bracket token `[name]` inside the plan text. Resolving a slot
//! rewrites it in place to `[name](Solved, which is VALUE)`. `known` and
//! `unknown` stay disjoint: a value that still contains "unknown" keeps the
//! slot open and is only recorded as tentative.

use std::collections::{BTreeMap, BTreeSet};

use confab_trace::EventLog;
use regex::Regex;
use serde_json::{Map, Value};

#[derive(Debug, Default)]
pub struct FactRegistry {
    known: BTreeMap<String, String>,
    unknown: BTreeSet<String>,
    tentative: BTreeMap<String, String>,
}

impl FactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the unknown set from every non-nested bracket token in the
    /// marked plan.
    pub fn set_unknown_from_plan(&mut self, plan: &str) {
        self.unknown = extract_slots(plan).into_iter().collect();
    }

    pub fn known(&self) -> &BTreeMap<String, String> {
        &self.known
    }

    pub fn unknown(&self) -> &BTreeSet<String> {
        &self.unknown
    }

    /// Merge a `{slot: value}` update into the plan. Each accepted slot is
    /// rewritten in place; slots whose value still reads as unknown stay in
    /// the unknown set with the value recorded as tentative.
    pub fn merge_updates(
        &mut self,
        plan: &mut String,
        updates: &Map<String, Value>,
        log: &EventLog,
    ) {
        for (key, value) in updates {
            let token = format!("[{key}]");
            if !plan.contains(&token) || !self.unknown.contains(key) {
                continue;
            }
            let rendered = render_value(value);
            *plan = plan.replace(&token, &format!("[{key}](Solved, which is {rendered})"));
            log.note(&format!("[update pinned facts]: {key} --> {rendered}"));

            if rendered.to_lowercase().contains("unknown") {
                self.tentative.insert(key.clone(), rendered);
            } else {
                self.unknown.remove(key);
                self.tentative.remove(key);
                self.known.insert(key.clone(), rendered);
            }
        }
    }

    /// Deterministic enumeration used verbatim inside prompts.
    pub fn render_known(&self) -> String {
        self.known
            .iter()
            .map(|(fact, value)| format!("known fact: {fact} --> {value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Deterministic enumeration used verbatim inside prompts. Tentative
    /// values ride along with their open slot.
    pub fn render_unknown(&self) -> String {
        self.unknown
            .iter()
            .map(|fact| match self.tentative.get(fact) {
                Some(value) => format!("unknown fact: {fact} (tentative: {value})"),
                None => format!("unknown fact: {fact}"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Non-nested bracket tokens, in order of appearance.
pub fn extract_slots(plan: &str) -> Vec<String> {
    // The pattern is shared with the marking prompt: no nested brackets.
    let re = Regex::new(r"\[([^\[\]]+)\]").expect("valid slot pattern");
    re.captures_iter(plan)
        .map(|caps| caps[1].to_string())
        .collect()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
