//! Per-turn agent behavior: retrieve context, maintain the plan, emit the
//! next utterance.
//!
//! The three variants compose by refinement: a vanilla agent only retrieves
//! by direct history queries; a think agent adds the plan lifecycle and fact
//! registry; a memory agent swaps retrieval for keyword-windowed search with
//! model-chosen parameters, plus the optional fuzzy and document memories.

use std::sync::Arc;

use anyhow::Result;
use confab_memory::{ChatStore, DocumentIndex, FuzzyMemory};
use confab_provider::LlmBackend;
use confab_schema::{ChatRow, DialogueHistory};
use confab_trace::EventLog;
use serde_json::{Map, Value};

use crate::mindfill::FactRegistry;
use crate::plan::{PlanState, PlanStatus};
use crate::prompts::{fill, PromptSet};
use crate::reformat::JsonReformatter;
use crate::retrieval::{keyword_set, RetrievalMemo, Stopwords};

/// Hard cap on rendered rows per retrieval channel per turn.
const MAX_RENDERED_ROWS: usize = 30;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const DEFAULT_CROSS_LIMIT: usize = 30;

const DEFAULT_KEYWORD_WINDOW: usize = 3;
const DEFAULT_KEYWORD_LIMIT: usize = 10;
const DEFAULT_TOPK: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentVariant {
    Vanilla,
    Think,
    Memory,
}

/// Shared handles every agent needs; cheap to clone for nested communications.
#[derive(Clone)]
pub struct AgentDeps {
    pub backend: Arc<dyn LlmBackend>,
    pub prompts: Arc<PromptSet>,
    pub store: ChatStore,
    pub log: EventLog,
    pub max_tool_retry_times: usize,
}

/// Memory-variant state: retrieval memos per channel plus the optional
/// per-master fuzzy and document memories.
pub struct MemoryState {
    pub stopwords: Arc<Stopwords>,
    pub fuzzy: Option<FuzzyMemory>,
    pub docs: Option<DocumentIndex>,
    memo_current: RetrievalMemo,
    memo_cross: RetrievalMemo,
    memo_fuzzy: RetrievalMemo,
}

impl MemoryState {
    pub fn new(
        stopwords: Arc<Stopwords>,
        fuzzy: Option<FuzzyMemory>,
        docs: Option<DocumentIndex>,
    ) -> Self {
        Self {
            stopwords,
            fuzzy,
            docs,
            memo_current: RetrievalMemo::default(),
            memo_cross: RetrievalMemo::default(),
            memo_fuzzy: RetrievalMemo::default(),
        }
    }
}

pub struct Agent {
    master: String,
    is_assistant: bool,
    task: String,
    deps: AgentDeps,
    plan: Option<PlanState>,
    memory: Option<MemoryState>,
    reformatter: Option<JsonReformatter>,
}

impl Agent {
    pub fn vanilla(master: &str, is_assistant: bool, task: &str, deps: AgentDeps) -> Self {
        Self {
            master: master.to_string(),
            is_assistant,
            task: task.to_string(),
            deps,
            plan: None,
            memory: None,
            reformatter: None,
        }
    }

    pub fn think(master: &str, is_assistant: bool, task: &str, deps: AgentDeps) -> Self {
        let mut agent = Self::vanilla(master, is_assistant, task, deps);
        agent.plan = Some(PlanState::new());
        agent
    }

    pub fn memory(
        master: &str,
        is_assistant: bool,
        task: &str,
        deps: AgentDeps,
        memory: MemoryState,
    ) -> Self {
        let reformatter = JsonReformatter::new(
            deps.backend.clone(),
            Arc::new(deps.prompts.tools.clone()),
            deps.log.clone(),
            deps.max_tool_retry_times,
        );
        let mut agent = Self::think(master, is_assistant, task, deps);
        agent.memory = Some(memory);
        agent.reformatter = Some(reformatter);
        agent
    }

    pub fn variant(&self) -> AgentVariant {
        match (&self.plan, &self.memory) {
            (None, _) => AgentVariant::Vanilla,
            (Some(_), None) => AgentVariant::Think,
            (Some(_), Some(_)) => AgentVariant::Memory,
        }
    }

    pub fn master(&self) -> &str {
        &self.master
    }

    pub fn is_assistant(&self) -> bool {
        self.is_assistant
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Final plan text, for the consensus conclusion. Empty until drafted.
    pub fn plan_text(&self) -> Option<&str> {
        self.plan.as_ref().map(|p| p.text.as_str())
    }

    pub fn fact_registry(&self) -> Option<&FactRegistry> {
        self.plan.as_ref().map(|p| &p.facts)
    }

    /// Direct pass-through to the backend, for communication-level prompts
    /// (consensus, third-party choice, task rewrite).
    pub async fn backend_query(&self, prompt: &str) -> Result<String> {
        self.deps.backend.query(prompt).await
    }

    pub async fn friends(&self) -> Result<Vec<String>> {
        self.deps.store.friends_of(&self.master).await
    }

    /// One full turn: retrieve context, maintain the plan, emit the next
    /// utterance addressed to `contact`'s agent.
    pub async fn utterance(
        &mut self,
        contact: &str,
        history: &DialogueHistory,
    ) -> Result<String> {
        let current_context = self.current_context(contact, history).await?;
        let other_context = self.other_context(contact, history).await?;

        if self.plan.is_some() {
            self.plan_step(contact, history).await?;
        }

        let prompt = self
            .assemble_utterance_prompt(contact, history, &current_context, &other_context)
            .await?;
        let response = self.deps.backend.query(&prompt).await?;
        self.deps.log.log(
            &format!(
                "[Query to generate message from {} to {}]",
                self.master, contact
            ),
            Some(&prompt),
            Some(&response),
        );
        Ok(response)
    }

    /// Final answer from the dialogue alone (non-consensus path).
    pub async fn conclusion(&self, history: &DialogueHistory) -> Result<String> {
        let prompt = fill(
            &self.deps.prompts.tools.conclusion,
            &[
                ("agent_communication", &history.render()),
                ("task", &self.task),
            ],
        );
        let response = self.deps.backend.query(&prompt).await?;
        self.deps
            .log
            .log("[Conclusion]", Some(&prompt), Some(&response));
        Ok(response)
    }

    // ------------------------------------------------------------------
    // Context retrieval
    // ------------------------------------------------------------------

    async fn current_context(
        &mut self,
        contact: &str,
        history: &DialogueHistory,
    ) -> Result<String> {
        if self.memory.is_some() {
            return self.distinct_context(contact, history, Channel::CurrentPair).await;
        }
        let rows = self
            .deps
            .store
            .current_pair_history(&self.master, contact, DEFAULT_HISTORY_LIMIT)
            .await?;
        Ok(render_rows(&rows))
    }

    async fn other_context(
        &mut self,
        contact: &str,
        history: &DialogueHistory,
    ) -> Result<String> {
        if self.memory.is_none() {
            let rows = self
                .deps
                .store
                .cross_contact_history(&self.master, contact, DEFAULT_CROSS_LIMIT)
                .await?;
            return Ok(render_rows(&rows));
        }

        let mut result = self
            .distinct_context(contact, history, Channel::CrossContact)
            .await?;

        if let Some(fuzzy_section) = self.fuzzy_context(contact, history).await? {
            result.push_str(&fuzzy_section);
        }
        if let Some(docs_section) = self.document_context().await? {
            result.push_str(&docs_section);
        }
        Ok(result)
    }

    /// Keyword-windowed retrieval with model-chosen parameters. The previous
    /// memo steers the next parameterization.
    async fn distinct_context(
        &mut self,
        contact: &str,
        history: &DialogueHistory,
        channel: Channel,
    ) -> Result<String> {
        let condition = match channel {
            Channel::CurrentPair => {
                format!("current session (between {} and {})", self.master, contact)
            }
            Channel::CrossContact => format!(
                "sessions among {} and {}'s other friends (except {})",
                self.master, self.master, contact
            ),
        };
        let schema = sql_schema();
        let example = Value::Object(schema.clone()).to_string();

        let memo = match channel {
            Channel::CurrentPair => self.memory.as_ref().map(|m| m.memo_current.clone()),
            Channel::CrossContact => self.memory.as_ref().map(|m| m.memo_cross.clone()),
        }
        .unwrap_or_default();

        let prompt = format!(
            "{}\n{}",
            self.system_preamble(contact),
            fill(
                &self.deps.prompts.tools.sql_react,
                &[
                    ("condition", &condition),
                    ("example_json", &example),
                    ("previous_params", &memo.params),
                    ("previous_sql_result", &memo.result),
                    ("agent_communication", &history.render()),
                ],
            )
        );
        let response = self.deps.backend.query(&prompt).await?;
        self.deps.log.log(
            &format!("[generate sql query by {}:]", self.master),
            Some(&prompt),
            Some(&response),
        );

        let reformatter = self
            .reformatter
            .as_ref()
            .expect("memory agent carries a reformatter");
        let params_text = reformatter.reform(&response, &schema).await;
        let params: Map<String, Value> =
            serde_json::from_str(&params_text).unwrap_or_else(|_| schema.clone());
        let keyword_raw = params
            .get("keyword")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let window = params
            .get("window")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_KEYWORD_WINDOW as u64) as usize;
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_KEYWORD_LIMIT as u64) as usize;

        let stopwords = self
            .memory
            .as_ref()
            .expect("memory state present")
            .stopwords
            .clone();
        let keywords = keyword_set(keyword_raw, &stopwords);
        self.deps
            .log
            .note(&format!("[SQL Keywords Set:] {keywords:?}"));

        let mut rows: Vec<ChatRow> = Vec::new();
        for keyword in &keywords {
            let found = match channel {
                Channel::CurrentPair => {
                    self.deps
                        .store
                        .keyword_context_current(keyword, &self.master, contact, limit, window)
                        .await?
                }
                Channel::CrossContact => {
                    self.deps
                        .store
                        .keyword_context_cross(keyword, &self.master, contact, limit, window)
                        .await?
                }
            };
            rows.extend(found);
        }
        rows.truncate(MAX_RENDERED_ROWS);

        let result = match channel {
            Channel::CurrentPair => {
                let mut text = String::from("\n\n");
                for row in &rows {
                    text.push_str(&row.render());
                    text.push('\n');
                }
                text
            }
            Channel::CrossContact => {
                let mut text = String::from("<context messages related to task starts>\n");
                for row in &rows {
                    text.push_str(&row.render());
                    text.push('\n');
                }
                text.push_str("<context messages related to task ends>\n");
                text
            }
        };

        let memory = self.memory.as_mut().expect("memory state present");
        let label = match channel {
            Channel::CurrentPair => {
                memory.memo_current.record(&params_text, &result);
                "[Distinct Memory (with current contact) Retrieved results of"
            }
            Channel::CrossContact => {
                memory.memo_cross.record(&params_text, &result);
                "[Distinct Memory Retrieved results of"
            }
        };
        self.deps
            .log
            .note(&format!("{label} {}:] \n{result}", self.master));
        Ok(result)
    }

    /// Fuzzy (vector) memory over the master's summary table, when present.
    async fn fuzzy_context(
        &mut self,
        contact: &str,
        history: &DialogueHistory,
    ) -> Result<Option<String>> {
        let memo = {
            let memory = self.memory.as_ref().expect("memory state present");
            if memory.fuzzy.is_none() {
                return Ok(None);
            }
            memory.memo_fuzzy.clone()
        };

        let schema = fuzzy_schema(&self.task);
        let example = Value::Object(schema.clone()).to_string();
        let prompt = format!(
            "{}\n{}",
            self.system_preamble(contact),
            fill(
                &self.deps.prompts.tools.faiss_react,
                &[
                    ("example_json", &example),
                    ("task", &self.task),
                    ("previous_params", &memo.params),
                    ("previous_faiss_result", &memo.result),
                    ("agent_communication", &history.render()),
                ],
            )
        );
        let response = self.deps.backend.query(&prompt).await?;
        self.deps.log.log(
            &format!("[generate memory query by {}:]", self.master),
            Some(&prompt),
            Some(&response),
        );

        let reformatter = self
            .reformatter
            .as_ref()
            .expect("memory agent carries a reformatter");
        let params_text = reformatter.reform(&response, &schema).await;
        let params: Map<String, Value> =
            serde_json::from_str(&params_text).unwrap_or_else(|_| schema.clone());
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or(&self.task)
            .to_string();
        let topk = params
            .get("topk")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TOPK as u64) as usize;

        let memory = self.memory.as_mut().expect("memory state present");
        let fuzzy = memory.fuzzy.as_ref().expect("fuzzy memory present");
        let hits = fuzzy.query(&query, topk).await?;
        let rendered: Vec<String> = hits.into_iter().map(|(_, _, text)| text).collect();
        let body = rendered.join("\n");

        let section = format!(
            "<context summary related to task starts>\n\n{body}\n<context summary related to task ends>\n"
        );
        memory.memo_fuzzy.record(&params_text, &body);
        self.deps.log.note(&format!(
            "[Fuzzy Memory Retrieved results of {}:] \n{body}",
            self.master
        ));
        Ok(Some(section))
    }

    /// Document memory over the master's uploaded files, when enabled.
    async fn document_context(&self) -> Result<Option<String>> {
        let memory = self.memory.as_ref().expect("memory state present");
        let Some(docs) = memory.docs.as_ref() else {
            return Ok(None);
        };
        let passage = docs.query(&self.task).await?;
        self.deps.log.note(&format!(
            "[Document Memory Retrieved results of {}:] \n{passage}",
            self.master
        ));
        Ok(Some(format!(
            "<file information related to task starts>\n\n{passage}\n<file information related to task ends>\n"
        )))
    }

    // ------------------------------------------------------------------
    // Plan lifecycle
    // ------------------------------------------------------------------

    /// Draft and mark the plan on the first turn; merge newly learned facts
    /// on every later turn.
    async fn plan_step(&mut self, contact: &str, history: &DialogueHistory) -> Result<()> {
        let role_seg = self.role_segment(contact);
        let task_seg = self.task_segment(contact);
        let dialogue_seg = self.dialogue_segment(contact, history);

        let status = self.plan.as_ref().map(|p| p.status);
        match status {
            Some(PlanStatus::Draft) => {
                let init_prompt = format!(
                    "{role_seg}\n{task_seg}\n{}",
                    self.deps.prompts.tools.infonav_init
                );
                let draft = self.deps.backend.query(&init_prompt).await?;
                self.deps.log.log(
                    &format!("[Init infonav from {} to {contact}:]", self.master),
                    Some(&init_prompt),
                    Some(&draft),
                );

                let mark_prompt = format!(
                    "{role_seg}\n{}",
                    fill(
                        &self.deps.prompts.tools.infonav_mark,
                        &[("task", &self.task), ("infonav", &draft)],
                    )
                );
                let marked = self.deps.backend.query(&mark_prompt).await?;
                self.deps.log.log(
                    &format!("[Mark infonav from {} to {contact}:]", self.master),
                    Some(&mark_prompt),
                    Some(&marked),
                );

                let plan = self.plan.as_mut().expect("plan state present");
                plan.text = marked;
                plan.status = PlanStatus::Updating;
                plan.facts.set_unknown_from_plan(&plan.text);
            }
            Some(PlanStatus::Marked) | Some(PlanStatus::Updating) => {
                let (plan_text, known, unknown) = {
                    let plan = self.plan.as_ref().expect("plan state present");
                    (
                        plan.text.clone(),
                        plan.facts.render_known(),
                        plan.facts.render_unknown(),
                    )
                };
                let update_prompt = format!(
                    "{role_seg}\n{task_seg}\n{dialogue_seg}\n{}",
                    fill(
                        &self.deps.prompts.tools.infonav_update,
                        &[
                            ("infonav", &plan_text),
                            ("known_facts", &known),
                            ("unknown_facts", &unknown),
                        ],
                    )
                );
                let response = self.deps.backend.query(&update_prompt).await?;
                self.deps.log.log(
                    &format!("[Updated facts from {} to {contact}:]", self.master),
                    Some(&update_prompt),
                    Some(&response),
                );

                // A response with no usable JSON keeps the plan and the
                // current unknown set.
                let updates = self.parse_updates(&response).await;
                if !updates.is_empty() {
                    let log = self.deps.log.clone();
                    let plan = self.plan.as_mut().expect("plan state present");
                    plan.facts.merge_updates(&mut plan.text, &updates, &log);
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn parse_updates(&self, response: &str) -> Map<String, Value> {
        let parsed = match &self.reformatter {
            Some(reformatter) => reformatter.reform_free(response).await,
            None => {
                // Think agents reformat locally: fence-stripping plus a
                // strict parse covers well-behaved models.
                response
                    .replace("```json", "")
                    .replace("```", "")
                    .trim()
                    .to_string()
            }
        };
        match serde_json::from_str::<Value>(&parsed) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    // ------------------------------------------------------------------
    // Prompt assembly
    // ------------------------------------------------------------------

    fn role_segment(&self, contact: &str) -> String {
        fill(
            &self.deps.prompts.for_role(self.is_assistant).role,
            &[("master", &self.master), ("contact", contact)],
        )
    }

    fn task_segment(&self, contact: &str) -> String {
        fill(
            &self.deps.prompts.for_role(self.is_assistant).task,
            &[("contact", contact), ("task", &self.task)],
        )
    }

    fn dialogue_segment(&self, contact: &str, history: &DialogueHistory) -> String {
        fill(
            &self.deps.prompts.for_role(self.is_assistant).agent_chat_history,
            &[
                ("master", &self.master),
                ("contact", contact),
                ("agent_chat_history", &history.render()),
            ],
        )
    }

    /// Role + task preamble shared by the retrieval-parameterization prompts.
    fn system_preamble(&self, contact: &str) -> String {
        format!("{}\n{}", self.role_segment(contact), self.task_segment(contact))
    }

    async fn assemble_utterance_prompt(
        &self,
        contact: &str,
        history: &DialogueHistory,
        current_context: &str,
        other_context: &str,
    ) -> Result<String> {
        let prompts = self.deps.prompts.for_role(self.is_assistant);
        let chat_history_seg = fill(
            &prompts.chat_history,
            &[
                ("master", &self.master),
                ("contact", contact),
                ("current_chat_history", current_context),
                ("other_chat_history", other_context),
            ],
        );
        let return_seg = match &self.plan {
            Some(plan) => fill(
                &prompts.return_format_withinfonav,
                &[
                    ("infonav", &plan.text),
                    ("unknown_facts", &plan.facts.render_unknown()),
                ],
            ),
            None => prompts.return_format.clone(),
        };

        let mut segments = Vec::new();
        if let Some(profile) = self.deps.store.agent_profile(&self.master).await? {
            segments.push(profile);
        }
        segments.push(self.role_segment(contact));
        segments.push(chat_history_seg);
        segments.push(self.task_segment(contact));
        segments.push(self.dialogue_segment(contact, history));
        segments.push(return_seg);
        Ok(segments.join("\n"))
    }
}

#[derive(Clone, Copy)]
enum Channel {
    CurrentPair,
    CrossContact,
}

fn render_rows(rows: &[ChatRow]) -> String {
    let mut text = String::from("\n");
    for row in rows.iter().take(MAX_RENDERED_ROWS) {
        text.push_str(&row.render());
        text.push('\n');
    }
    text
}

fn sql_schema() -> Map<String, Value> {
    let mut schema = Map::new();
    schema.insert(
        "keyword".to_string(),
        Value::String("ring/alice/steal".to_string()),
    );
    schema.insert("window".to_string(), Value::Number(3.into()));
    schema.insert("limit".to_string(), Value::Number(10.into()));
    schema
}

fn fuzzy_schema(task: &str) -> Map<String, Value> {
    let mut schema = Map::new();
    schema.insert("query".to_string(), Value::String(task.to_string()));
    schema.insert("topk".to_string(), Value::Number(3.into()));
    schema
}
