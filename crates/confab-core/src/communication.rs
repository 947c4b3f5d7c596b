//! The bounded dialogue session between two agents.
//!
//! State machine: broadcast the task, then `max_rounds` strictly serial
//! rounds of one instructor utterance followed by one assistant utterance,
//! then a conclusion. With multi-party enabled, each agent may open one
//! nested communication with a third party at round 0; nesting depth never
//! exceeds one because nested sessions are built with multi-party off.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use confab_memory::ChatStore;
use confab_schema::{agent_name, DialogueHistory};
use confab_trace::EventLog;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::Agent;
use crate::prompts::{fill, PromptSet};

const PARTIAL_CONCLUSION: &str = "unable to conclude";

/// Where agent messages are delivered as a side effect. Offline runs record
/// them in the event log only.
#[derive(Clone)]
pub enum MessageSink {
    Store(ChatStore),
    LogOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct CommunicationSettings {
    pub max_rounds: usize,
    pub consensus: bool,
    pub multi_party: bool,
}

/// Builds a fresh agent of the session's variant for `(master, is_assistant)`.
/// Used to spawn the participants of nested third-party communications.
pub type AgentBuilder = dyn Fn(&str, bool) -> Result<Agent> + Send + Sync;

pub struct Communication {
    id: Uuid,
    instructor: Agent,
    assistant: Agent,
    settings: CommunicationSettings,
    history: DialogueHistory,
    sink: MessageSink,
    prompts: Arc<PromptSet>,
    log: EventLog,
    spawner: Option<Arc<AgentBuilder>>,
    cancel: CancellationToken,
    task: String,
}

impl Communication {
    pub fn new(
        instructor: Agent,
        assistant: Agent,
        settings: CommunicationSettings,
        prompts: Arc<PromptSet>,
        log: EventLog,
        sink: MessageSink,
    ) -> Result<Self> {
        if instructor.task() != assistant.task() {
            return Err(anyhow!("instructor and assistant must share the task"));
        }
        if settings.consensus
            && (instructor.plan_text().is_none() || assistant.plan_text().is_none())
        {
            return Err(anyhow!(
                "consensus conclusion requires plan-keeping agents"
            ));
        }
        let task = instructor.task().to_string();
        Ok(Self {
            id: Uuid::new_v4(),
            instructor,
            assistant,
            settings,
            history: DialogueHistory::new(),
            sink,
            prompts,
            log,
            spawner: None,
            cancel: CancellationToken::new(),
            task,
        })
    }

    /// Trace id tying this session's event-log rows together. Nested
    /// sessions carry their own id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Seed the dialogue with messages carried over from an earlier session
    /// (e.g. preloaded multi-party conclusions).
    pub fn with_preloaded_history(mut self, entries: Vec<String>) -> Self {
        self.history = DialogueHistory::with_preloaded(entries);
        self
    }

    /// Required when multi-party is enabled: how to build the participants
    /// of a nested communication.
    pub fn with_spawner(mut self, spawner: Arc<AgentBuilder>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn history(&self) -> &DialogueHistory {
        &self.history
    }

    pub fn instructor(&self) -> &Agent {
        &self.instructor
    }

    pub fn assistant(&self) -> &Agent {
        &self.assistant
    }

    /// Drive the dialogue to its conclusion.
    pub async fn run(&mut self) -> Result<String> {
        self.log.note(&format!(
            "[Communication {} between {} and {}]",
            self.id,
            self.instructor.master(),
            self.assistant.master()
        ));
        for round in 0..self.settings.max_rounds {
            self.log.note(&format!("[Comm Round: {round}]"));

            if round == 0 {
                let broadcast = format!(
                    "[Trigger Agents Communication for Task Solving, Task Prompt]: {}",
                    self.task
                );
                self.history.push(
                    self.instructor.master(),
                    self.assistant.master(),
                    &broadcast,
                );
                self.deliver(
                    &self.instructor.master().to_string(),
                    &self.assistant.master().to_string(),
                    &broadcast,
                )
                .await;

                if self.settings.multi_party {
                    self.raise_new_comm(false).await?;
                    self.raise_new_comm(true).await?;
                }
            }

            if self.cancel.is_cancelled() {
                return self.partial_conclusion("cancelled before instructor turn");
            }
            let instructor_response = match self
                .instructor
                .utterance(&self.assistant.master().to_string(), &self.history)
                .await
            {
                Ok(text) => text,
                Err(err) => return self.partial_conclusion(&format!("instructor turn failed: {err:#}")),
            };
            let (from, to) = (
                self.instructor.master().to_string(),
                self.assistant.master().to_string(),
            );
            self.history.push(&from, &to, &instructor_response);
            self.deliver(&from, &to, &instructor_response).await;

            if self.cancel.is_cancelled() {
                return self.partial_conclusion("cancelled before assistant turn");
            }
            let assistant_response = match self
                .assistant
                .utterance(&self.instructor.master().to_string(), &self.history)
                .await
            {
                Ok(text) => text,
                Err(err) => return self.partial_conclusion(&format!("assistant turn failed: {err:#}")),
            };
            let (from, to) = (
                self.assistant.master().to_string(),
                self.instructor.master().to_string(),
            );
            self.history.push(&from, &to, &assistant_response);
            self.deliver(&from, &to, &assistant_response).await;
        }

        let conclusion = if self.settings.consensus {
            self.consensus_conclusion().await?
        } else {
            self.instructor.conclusion(&self.history).await?
        };
        self.log.note(&format!("[conclusion]:\n{conclusion}"));
        Ok(conclusion)
    }

    fn partial_conclusion(&self, reason: &str) -> Result<String> {
        self.log
            .note(&format!("[conclusion]:\n{PARTIAL_CONCLUSION} ({reason})"));
        Ok(PARTIAL_CONCLUSION.to_string())
    }

    /// One agent picks a third party from its friend list and runs a nested
    /// communication with it; the nested conclusion joins the outer dialogue
    /// as a single utterance attributed to the escalating agent.
    async fn raise_new_comm(&mut self, escalator_is_assistant: bool) -> Result<()> {
        let (escalator_master, other_master) = if escalator_is_assistant {
            (
                self.assistant.master().to_string(),
                self.instructor.master().to_string(),
            )
        } else {
            (
                self.instructor.master().to_string(),
                self.assistant.master().to_string(),
            )
        };
        let escalator = if escalator_is_assistant {
            &self.assistant
        } else {
            &self.instructor
        };

        let friends = escalator.friends().await?;
        // Validation is case-insensitive; the original casing is what the
        // chat store knows the friend by.
        let mut candidates: BTreeMap<String, String> = friends
            .into_iter()
            .map(|name| (name.to_lowercase(), name))
            .collect();
        candidates.remove(&other_master.to_lowercase());
        candidates.remove(&escalator_master.to_lowercase());
        let friends_joined = candidates
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(",");

        let prompt = fill(
            &self.prompts.tools.raise_new_communication,
            &[
                ("task", &self.task),
                ("friends", &friends_joined),
                ("yourself", &escalator_master),
                ("contact", &other_master),
            ],
        );
        let chosen_raw = escalator.backend_query(&prompt).await.unwrap_or_default();
        let chosen = if chosen_raw.trim().is_empty() {
            "None".to_string()
        } else {
            chosen_raw.trim().to_lowercase()
        };
        self.log.log(
            &format!("choose third-party friends from {escalator_master}"),
            Some(&prompt),
            Some(&chosen),
        );

        let Some(chosen_friend) = candidates.get(&chosen).cloned() else {
            self.log
                .note(&format!("Failed to find third-party for {escalator_master}"));
            self.deliver(
                &escalator_master,
                &other_master,
                &format!(
                    "[Trigger {escalator_master}'s Agents Raising New Communication with None]"
                ),
            )
            .await;
            return Ok(());
        };

        self.log.note(&format!(
            "Found third-party for {escalator_master}, {chosen_friend}"
        ));
        self.deliver(
            &escalator_master,
            &other_master,
            &format!(
                "[Trigger {escalator_master}'s Agents Raising New Communication with {chosen_friend}]"
            ),
        )
        .await;

        let conclusion = match self.run_nested(&escalator_master, &chosen_friend).await {
            Ok(conclusion) => conclusion,
            Err(err) => {
                // The parent dialogue continues without the nested result.
                self.log.note(&format!(
                    "Nested communication of {escalator_master} with {chosen_friend} failed: {err:#}"
                ));
                "None".to_string()
            }
        };

        let summary = format!("Discussion with {chosen_friend}'s Agents: {conclusion} ");
        self.history
            .push(&escalator_master, &other_master, &summary);
        self.deliver(
            &escalator_master,
            &other_master,
            &format!("[Discussion with {chosen_friend}'s Agents]: {conclusion} "),
        )
        .await;
        Ok(())
    }

    /// Nested sessions reuse the same agent construction and parameters but
    /// always conclude by consensus and never escalate further.
    async fn run_nested(&self, escalator_master: &str, friend: &str) -> Result<String> {
        let spawner = self
            .spawner
            .as_ref()
            .ok_or_else(|| anyhow!("multi-party requires an agent spawner"))?;
        let nested_instructor = (**spawner)(escalator_master, false)?;
        let nested_assistant = (**spawner)(friend, true)?;

        let mut nested = Communication::new(
            nested_instructor,
            nested_assistant,
            CommunicationSettings {
                max_rounds: self.settings.max_rounds,
                consensus: true,
                multi_party: false,
            },
            Arc::clone(&self.prompts),
            self.log.clone(),
            self.sink.clone(),
        )?
        .with_cancellation(self.cancel.clone());

        Box::pin(nested.run()).await
    }

    /// Reconcile the two final plans: rationales solved identically in both
    /// are the consensus; conflicts are ignored by instruction.
    async fn consensus_conclusion(&self) -> Result<String> {
        let prompt = fill(
            &self.prompts.tools.consensus_conclusion,
            &[
                ("task", &self.task),
                ("agent_communication", &self.history.render()),
                ("infonav_instructor", self.instructor.plan_text().unwrap_or("")),
                ("infonav_assistant", self.assistant.plan_text().unwrap_or("")),
            ],
        );
        let response = self.instructor.backend_query(&prompt).await?;
        self.log
            .log("[consensus_conclusion]", Some(&prompt), Some(&response));
        Ok(response)
    }

    async fn deliver(&self, sender_master: &str, receiver_master: &str, text: &str) {
        match &self.sink {
            MessageSink::Store(store) => {
                if let Err(err) = store
                    .insert_chat(&agent_name(sender_master), &agent_name(receiver_master), text, "")
                    .await
                {
                    tracing::warn!("failed to record agent message: {err:#}");
                }
            }
            MessageSink::LogOnly => {
                self.log.note(&format!(
                    "from {} to {}: {text}",
                    agent_name(sender_master),
                    agent_name(receiver_master)
                ));
            }
        }
    }
}
