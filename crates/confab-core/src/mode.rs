//! Constructs agents and communications for the configured mode.
//!
//! `Base` builds plan-keeping agents over direct history retrieval; `RAG`
//! builds memory agents with keyword-windowed retrieval, the fuzzy memory
//! when a table exists, and the document index when enabled. Consensus
//! conclusion is on by default in both modes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use confab_memory::{ChatStore, DocumentIndex, EmbeddingBackend, FuzzyMemory};
use confab_provider::LlmBackend;
use confab_schema::{ConfabConfig, ModeName};
use confab_trace::EventLog;

use crate::agent::{Agent, AgentDeps, MemoryState};
use crate::communication::{
    AgentBuilder, Communication, CommunicationSettings, MessageSink,
};
use crate::prompts::{fill, PromptSet};
use crate::retrieval::Stopwords;

/// Everything needed to build one agent; cloneable so the nested-communication
/// spawner can own a copy.
#[derive(Clone)]
struct ModeContext {
    mode: ModeName,
    deps: AgentDeps,
    stopwords: Arc<Stopwords>,
    embedder: Arc<dyn EmbeddingBackend>,
    use_document_index: bool,
    memory_root: PathBuf,
    memory_name: String,
    enable_fuzzy: bool,
    documents_root: PathBuf,
}

impl ModeContext {
    fn build_agent(&self, master: &str, is_assistant: bool, task: &str) -> Result<Agent> {
        match self.mode {
            ModeName::Base => Ok(Agent::think(master, is_assistant, task, self.deps.clone())),
            ModeName::Rag => {
                let fuzzy = if self.enable_fuzzy {
                    let table = self
                        .memory_root
                        .join(&self.memory_name)
                        .join(format!("{master}.tsv"));
                    Some(FuzzyMemory::load(&table, self.embedder.clone())?)
                } else {
                    None
                };
                let docs = if self.use_document_index {
                    Some(DocumentIndex::open(
                        &self.documents_root,
                        master,
                        self.embedder.clone(),
                    )?)
                } else {
                    None
                };
                let memory = MemoryState::new(self.stopwords.clone(), fuzzy, docs);
                Ok(Agent::memory(
                    master,
                    is_assistant,
                    task,
                    self.deps.clone(),
                    memory,
                ))
            }
        }
    }
}

pub struct Mode {
    context: ModeContext,
    settings: CommunicationSettings,
    rewrite_prompt: bool,
    prompts: Arc<PromptSet>,
    log: EventLog,
    store: ChatStore,
}

impl Mode {
    pub fn new(
        config: &ConfabConfig,
        store: ChatStore,
        backend: Arc<dyn LlmBackend>,
        embedder: Arc<dyn EmbeddingBackend>,
        log: EventLog,
    ) -> Result<Self> {
        let prompts = Arc::new(PromptSet::load(&config.prompts.dir)?);
        let stopwords = Arc::new(Stopwords::from_config(
            config.agent.stopwords_path.as_deref(),
        )?);

        log.note(&format!(
            "Global LLM Config: {}\nGlobal Mode Config: {:?}\nGlobal Agent Config: turns={} multi_party={} rewrite={}",
            config.backend.provider,
            config.mode.mode,
            config.agent.max_communication_turns,
            config.agent.multi_party,
            config.agent.rewrite_prompt,
        ));

        let deps = AgentDeps {
            backend,
            prompts: Arc::clone(&prompts),
            store: store.clone(),
            log: log.clone(),
            max_tool_retry_times: config.agent.max_tool_retry_times,
        };

        Ok(Self {
            context: ModeContext {
                mode: config.mode.mode,
                deps,
                stopwords,
                embedder,
                use_document_index: config.agent.use_document_index,
                memory_root: config.memory.dir.clone(),
                memory_name: config.memory.name.clone(),
                enable_fuzzy: config.memory.enable_fuzzy,
                documents_root: config.documents.dir.clone(),
            },
            settings: CommunicationSettings {
                max_rounds: config.agent.max_communication_turns,
                consensus: true,
                multi_party: config.agent.multi_party,
            },
            rewrite_prompt: config.agent.rewrite_prompt,
            prompts,
            log,
            store,
        })
    }

    /// Rewrite the raw task once for the sender/receiver pair; the rewritten
    /// text replaces the task for the whole session.
    async fn resolve_task(&self, sender: &str, receiver: &str, raw_task: &str) -> Result<String> {
        if !self.rewrite_prompt {
            return Ok(raw_task.to_string());
        }
        let prompt = fill(
            &self.prompts.tools.rewrite_task,
            &[("sender", sender), ("receiver", receiver), ("task", raw_task)],
        );
        let rewritten = self.context.deps.backend.query(&prompt).await?;
        self.log
            .log("[rewrite task]", Some(&prompt), Some(&rewritten));
        Ok(rewritten)
    }

    /// Build the communication for one task between two masters. Offline
    /// communications record messages in the event log instead of the chat
    /// store.
    pub async fn build_communication(
        &self,
        sender: &str,
        receiver: &str,
        raw_task: &str,
        offline: bool,
    ) -> Result<Communication> {
        let task = self.resolve_task(sender, receiver, raw_task).await?;

        let instructor = self.context.build_agent(sender, false, &task)?;
        let assistant = self.context.build_agent(receiver, true, &task)?;

        let sink = if offline {
            MessageSink::LogOnly
        } else {
            MessageSink::Store(self.store.clone())
        };

        let mut communication = Communication::new(
            instructor,
            assistant,
            self.settings,
            Arc::clone(&self.prompts),
            self.log.clone(),
            sink,
        )?;

        if self.settings.multi_party {
            let context = self.context.clone();
            let task = task.clone();
            let spawner: Arc<AgentBuilder> = Arc::new(move |master, is_assistant| {
                context.build_agent(master, is_assistant, &task)
            });
            communication = communication.with_spawner(spawner);
        }

        Ok(communication)
    }
}
