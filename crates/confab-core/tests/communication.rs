//! End-to-end communication scenarios against the stub backend and an
//! in-memory chat store.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use confab_core::{Communication, CommunicationSettings, MessageSink, Mode, PromptSet};
use confab_memory::{ChatStore, StubEmbedding};
use confab_provider::{LlmBackend, StubBackend};
use confab_schema::ConfabConfig;
use confab_trace::EventLog;
use tokio_util::sync::CancellationToken;

fn prompts_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../prompts")
}

fn test_config(max_rounds: usize, multi_party: bool) -> ConfabConfig {
    let yaml = format!(
        r#"
website: {{ host: "127.0.0.1", port: 8080 }}
database: {{ path: ":memory:" }}
backend: {{ provider: "stub" }}
agent:
  max_communication_turns: {max_rounds}
  multi_party: {multi_party}
mode: {{ mode: "Base" }}
prompts: {{ dir: "{}" }}
"#,
        prompts_dir().display()
    );
    serde_yaml::from_str(&yaml).unwrap()
}

async fn seeded_store(log: EventLog, users: &[&str]) -> ChatStore {
    let store = ChatStore::open_in_memory(log).unwrap();
    for user in users {
        store.create_user(user, "pw", None).await.unwrap();
    }
    store
}

/// Records every prompt the backend sees while delegating to a handler.
fn capturing_backend(
    captured: Arc<Mutex<Vec<String>>>,
    handler: impl Fn(&str) -> String + Send + Sync + 'static,
) -> StubBackend {
    StubBackend::with_handler(move |prompt| {
        captured.lock().unwrap().push(prompt.to_string());
        handler(prompt)
    })
}

fn mode_with(
    config: &ConfabConfig,
    store: ChatStore,
    backend: StubBackend,
    log: EventLog,
) -> Mode {
    Mode::new(
        config,
        store,
        Arc::new(backend),
        Arc::new(StubEmbedding::new(16)),
        log,
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// S1: single-pair baseline
// ---------------------------------------------------------------------------

fn s1_handler(prompt: &str) -> String {
    if prompt.contains("Write a short step-by-step plan") {
        "1. learn the favorite book of Bob".to_string()
    } else if prompt.contains("Rewrite the plan, enclosing") {
        "1. learn [favorite_book_of_bob]".to_string()
    } else if prompt.contains("mapping each newly resolved") {
        if prompt.contains("Dune") {
            r#"{"favorite_book_of_bob": "Dune"}"#.to_string()
        } else {
            "{}".to_string()
        }
    } else if prompt.contains("Prefer rationales") {
        "Bob's favorite book is Dune.".to_string()
    } else if prompt.contains("You are Bob's Agent") {
        if prompt.contains("I love Dune") {
            "My records show Bob telling Carol: I love Dune. His favorite book is Dune.".to_string()
        } else {
            "Let me check my records.".to_string()
        }
    } else {
        "Bob, what is your favorite book?".to_string()
    }
}

#[tokio::test]
async fn s1_single_pair_baseline() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob", "Carol"]).await;
    store
        .insert_chat("Bob", "Carol", "I love Dune", "")
        .await
        .unwrap();

    let captured = Arc::new(Mutex::new(Vec::new()));
    let backend = capturing_backend(Arc::clone(&captured), s1_handler);
    let config = test_config(2, false);
    let mode = mode_with(&config, store.clone(), backend, log);

    let mut communication = mode
        .build_communication("Alice", "Bob", "What is Bob's favorite book?", false)
        .await
        .unwrap();
    let conclusion = communication.run().await.unwrap();

    // Broadcast plus two utterances per round.
    assert_eq!(communication.history().len(), 5);
    assert!(conclusion.contains("Dune"));
    assert!(communication
        .instructor()
        .plan_text()
        .unwrap()
        .contains("(Solved, which is Dune)"));

    // Every prompt carries the task text verbatim.
    let prompts = captured.lock().unwrap();
    assert!(!prompts.is_empty());
    for prompt in prompts.iter() {
        assert!(
            prompt.contains("What is Bob's favorite book?"),
            "prompt missing task: {prompt}"
        );
    }

    // Recorded agent messages carry the agent suffix on both endpoints.
    let agent_rows = store
        .current_pair_history("Alice's Agent", "Bob's Agent", 10)
        .await
        .unwrap();
    assert!(!agent_rows.is_empty());
}

#[tokio::test]
async fn known_and_unknown_disjoint_after_run() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob", "Carol"]).await;
    store
        .insert_chat("Bob", "Carol", "I love Dune", "")
        .await
        .unwrap();

    let backend = StubBackend::with_handler(s1_handler);
    let config = test_config(2, false);
    let mode = mode_with(&config, store, backend, log);

    let mut communication = mode
        .build_communication("Alice", "Bob", "What is Bob's favorite book?", true)
        .await
        .unwrap();
    communication.run().await.unwrap();

    for agent in [communication.instructor(), communication.assistant()] {
        let registry = agent.fact_registry().unwrap();
        let plan = agent.plan_text().unwrap();
        for known in registry.known().keys() {
            assert!(!registry.unknown().contains(known));
            assert!(plan.contains(&format!("[{known}]")));
        }
        for unknown in registry.unknown() {
            assert!(plan.contains(&format!("[{unknown}]")));
        }
    }
}

#[tokio::test]
async fn plan_prompts_after_marking_contain_the_plan() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob"]).await;

    let captured = Arc::new(Mutex::new(Vec::new()));
    let backend = capturing_backend(Arc::clone(&captured), |prompt| {
        if prompt.contains("Write a short step-by-step plan") {
            "draft plan".to_string()
        } else if prompt.contains("Rewrite the plan, enclosing") {
            "1. learn [needed_info]".to_string()
        } else if prompt.contains("mapping each newly resolved") {
            "{}".to_string()
        } else if prompt.contains("Prefer rationales") {
            "no conclusion".to_string()
        } else {
            "a message".to_string()
        }
    });
    let config = test_config(2, false);
    let mode = mode_with(&config, store, backend, log);

    let mut communication = mode
        .build_communication("Alice", "Bob", "the task", true)
        .await
        .unwrap();
    communication.run().await.unwrap();

    // Once a plan is marked, every utterance and update prompt embeds it.
    let prompts = captured.lock().unwrap();
    let with_plan: Vec<&String> = prompts
        .iter()
        .filter(|p| {
            p.contains("Your current plan for solving the task is")
                || p.contains("Your current plan is")
        })
        .collect();
    assert!(!with_plan.is_empty());
    for prompt in with_plan {
        assert!(prompt.contains("1. learn [needed_info]"));
    }
}

// ---------------------------------------------------------------------------
// S2: reformat recovery inside retrieval parameterization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_reformat_recovery_drives_retrieval() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob"]).await;
    store
        .insert_chat("Alice", "Bob", "the ring is in the drawer", "")
        .await
        .unwrap();

    let yaml = format!(
        r#"
website: {{ host: "127.0.0.1", port: 8080 }}
database: {{ path: ":memory:" }}
backend: {{ provider: "stub" }}
agent: {{ max_communication_turns: 1 }}
mode: {{ mode: "RAG" }}
prompts: {{ dir: "{}" }}
"#,
        prompts_dir().display()
    );
    let config: ConfabConfig = serde_yaml::from_str(&yaml).unwrap();

    let backend = StubBackend::with_handler(|prompt| {
        if prompt.contains("by keyword") {
            // Missing quotes around keys and values.
            "```json\n{keyword: ring, window: 3, limit: 10}\n```".to_string()
        } else if prompt.contains("Rewrite the plan, enclosing") {
            "find [ring_location]".to_string()
        } else if prompt.contains("mapping each newly resolved") {
            "{}".to_string()
        } else {
            "ok".to_string()
        }
    });
    let mode = mode_with(&config, store, backend, log.clone());

    let mut communication = mode
        .build_communication("Alice", "Bob", "where is the ring", true)
        .await
        .unwrap();
    communication.run().await.unwrap();

    // The malformed parameters were repaired and the keyword search ran.
    let instructions = log.instructions().unwrap();
    assert!(instructions.iter().any(|i| i.contains("[SQL Keywords Set:]") && i.contains("ring")));
    let retrieved = instructions
        .iter()
        .any(|i| i.contains("Distinct Memory") && i.contains("ring is in the drawer"));
    assert!(retrieved, "windowed retrieval should surface the ring row");
}

// ---------------------------------------------------------------------------
// S3: empty retrieval
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_empty_store_still_completes() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob"]).await;

    let captured = Arc::new(Mutex::new(Vec::new()));
    let backend = capturing_backend(Arc::clone(&captured), |prompt| {
        if prompt.contains("Write a short step-by-step plan") {
            "draft".to_string()
        } else if prompt.contains("Rewrite the plan, enclosing") {
            "learn [something]".to_string()
        } else if prompt.contains("mapping each newly resolved") {
            "{}".to_string()
        } else if prompt.contains("Prefer rationales") {
            "nothing was learned".to_string()
        } else {
            "I have no records about that.".to_string()
        }
    });
    let config = test_config(2, false);
    let mode = mode_with(&config, store, backend, log);

    let mut communication = mode
        .build_communication("Alice", "Bob", "the task", true)
        .await
        .unwrap();
    communication.run().await.unwrap();

    assert_eq!(communication.history().len(), 1 + 2 * 2);

    // Context sections are present but hold only their delimiter tags.
    let prompts = captured.lock().unwrap();
    let utterance_prompt = prompts
        .iter()
        .find(|p| p.contains("<chat history between Alice and Bob starts>"))
        .expect("utterance prompt present");
    assert!(utterance_prompt.contains("<chat history between Alice and Bob ends>"));
    assert!(utterance_prompt.contains("<chat history between Alice and other friends starts>"));
}

// ---------------------------------------------------------------------------
// S4: multi-party escalation with an invalid friend
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_invalid_third_party_is_skipped() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob", "Carol"]).await;
    store.add_friendship("Alice", "Carol").await.unwrap();
    store.add_friendship("Bob", "Carol").await.unwrap();

    let backend = StubBackend::with_handler(|prompt| {
        if prompt.contains("one extra conversation") {
            "Zed".to_string()
        } else if prompt.contains("Write a short step-by-step plan") {
            "draft".to_string()
        } else if prompt.contains("Rewrite the plan, enclosing") {
            "learn [fact]".to_string()
        } else if prompt.contains("mapping each newly resolved") {
            "{}".to_string()
        } else if prompt.contains("Prefer rationales") {
            "done".to_string()
        } else {
            "a message".to_string()
        }
    });
    let config = test_config(1, true);
    let mode = mode_with(&config, store, backend, log.clone());

    let mut communication = mode
        .build_communication("Alice", "Bob", "the task", true)
        .await
        .unwrap();
    communication.run().await.unwrap();

    let instructions = log.instructions().unwrap();
    assert!(instructions
        .iter()
        .any(|i| i == "Failed to find third-party for Alice"));
    assert!(instructions
        .iter()
        .any(|i| i == "Failed to find third-party for Bob"));

    // No nested history contribution: broadcast + one round only.
    assert_eq!(communication.history().len(), 3);
    assert!(!communication
        .history()
        .iter()
        .any(|entry| entry.contains("Discussion with")));
}

// ---------------------------------------------------------------------------
// S5: recursive boundary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_two_nested_communications_at_round_zero() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob", "Carol", "Dave"]).await;
    store.add_friendship("Alice", "Carol").await.unwrap();
    store.add_friendship("Bob", "Dave").await.unwrap();

    let backend = StubBackend::with_handler(|prompt| {
        if prompt.contains("one extra conversation") {
            if prompt.contains("You are Alice's Agent working") {
                "Carol".to_string()
            } else {
                "Dave".to_string()
            }
        } else if prompt.contains("Write a short step-by-step plan") {
            "draft".to_string()
        } else if prompt.contains("Rewrite the plan, enclosing") {
            "learn [fact]".to_string()
        } else if prompt.contains("mapping each newly resolved") {
            "{}".to_string()
        } else if prompt.contains("Prefer rationales") {
            "a nested or outer conclusion".to_string()
        } else {
            "a message".to_string()
        }
    });
    let config = test_config(1, true);
    let mode = mode_with(&config, store, backend, log.clone());

    let mut communication = mode
        .build_communication("Alice", "Bob", "the task", true)
        .await
        .unwrap();
    communication.run().await.unwrap();

    // Broadcast + two escalation summaries + the round's two utterances.
    assert_eq!(communication.history().len(), 5);
    let entries: Vec<&str> = communication.history().iter().collect();
    assert!(entries[1].contains("Discussion with Carol's Agents"));
    assert!(entries[2].contains("Discussion with Dave's Agents"));

    let instructions = log.instructions().unwrap();
    // One outer session plus exactly two nested ones, each with its own id.
    let round_zero_count = instructions
        .iter()
        .filter(|i| *i == "[Comm Round: 0]")
        .count();
    assert_eq!(round_zero_count, 3);
    let session_rows: std::collections::BTreeSet<&String> = instructions
        .iter()
        .filter(|i| i.starts_with("[Communication "))
        .collect();
    assert_eq!(session_rows.len(), 3);

    // Depth stays at one: only the outer session chose third parties.
    let choose_count = instructions
        .iter()
        .filter(|i| i.starts_with("choose third-party friends from"))
        .count();
    assert_eq!(choose_count, 2);
}

// ---------------------------------------------------------------------------
// S6: consensus conclusion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_consensus_reconciles_both_plans() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob"]).await;

    let captured = Arc::new(Mutex::new(Vec::new()));
    let backend = capturing_backend(Arc::clone(&captured), |prompt| {
        if prompt.contains("Write a short step-by-step plan") {
            "draft".to_string()
        } else if prompt.contains("Rewrite the plan, enclosing") {
            if prompt.contains("You are Alice's Agent") {
                "find [book_title]".to_string()
            } else {
                "find [book_title] and [year]".to_string()
            }
        } else if prompt.contains("mapping each newly resolved") {
            if prompt.contains("Your current plan is:\nfind [book_title] and [year]")
                || prompt.contains("[year]")
            {
                r#"{"book_title": "Dune", "year": "1965"}"#.to_string()
            } else {
                r#"{"book_title": "Dune"}"#.to_string()
            }
        } else if prompt.contains("Prefer rationales") {
            "Both agents agree: the book is Dune, published in 1965.".to_string()
        } else {
            "a message".to_string()
        }
    });
    let config = test_config(2, false);
    let mode = mode_with(&config, store, backend, log);

    let mut communication = mode
        .build_communication("Alice", "Bob", "name the book", true)
        .await
        .unwrap();
    let conclusion = communication.run().await.unwrap();

    assert!(conclusion.contains("Dune"));
    assert!(communication
        .instructor()
        .plan_text()
        .unwrap()
        .contains("(Solved, which is Dune)"));
    assert!(communication
        .assistant()
        .plan_text()
        .unwrap()
        .contains("(Solved, which is 1965)"));

    // The consensus prompt embeds both final plans.
    let prompts = captured.lock().unwrap();
    let consensus_prompt = prompts
        .iter()
        .find(|p| p.contains("Prefer rationales"))
        .expect("consensus prompt present");
    assert!(consensus_prompt.contains("(Solved, which is Dune)"));
    assert!(consensus_prompt.contains("(Solved, which is 1965)"));
}

// ---------------------------------------------------------------------------
// Cancellation and failure
// ---------------------------------------------------------------------------

fn think_pair(store: &ChatStore, log: &EventLog, backend: Arc<dyn LlmBackend>) -> Communication {
    use confab_core::{Agent, AgentDeps};

    let prompts = Arc::new(PromptSet::load(&prompts_dir()).unwrap());
    let deps = AgentDeps {
        backend,
        prompts: Arc::clone(&prompts),
        store: store.clone(),
        log: log.clone(),
        max_tool_retry_times: 2,
    };
    let instructor = Agent::think("Alice", false, "the task", deps.clone());
    let assistant = Agent::think("Bob", true, "the task", deps);
    Communication::new(
        instructor,
        assistant,
        CommunicationSettings {
            max_rounds: 2,
            consensus: false,
            multi_party: false,
        },
        prompts,
        log.clone(),
        MessageSink::LogOnly,
    )
    .unwrap()
}

#[tokio::test]
async fn cancelled_communication_concludes_partially() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob"]).await;
    let token = CancellationToken::new();
    token.cancel();

    let mut communication = think_pair(&store, &log, Arc::new(StubBackend::echo()))
        .with_cancellation(token);
    let conclusion = communication.run().await.unwrap();

    assert_eq!(conclusion, "unable to conclude");
    // The broadcast landed before the cancellation took effect.
    assert_eq!(communication.history().len(), 1);
}

struct FailingBackend;

#[async_trait::async_trait]
impl LlmBackend for FailingBackend {
    async fn query(&self, _prompt: &str) -> anyhow::Result<String> {
        Err(anyhow::anyhow!("backend unavailable"))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[tokio::test]
async fn backend_failure_terminates_with_partial_conclusion() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob"]).await;

    let mut communication = think_pair(&store, &log, Arc::new(FailingBackend));
    let conclusion = communication.run().await.unwrap();

    assert_eq!(conclusion, "unable to conclude");
    let instructions = log.instructions().unwrap();
    assert!(instructions
        .iter()
        .any(|i| i.contains("unable to conclude") && i.contains("instructor turn failed")));
}

// ---------------------------------------------------------------------------
// Retrieval idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_retrievals_render_identically() {
    let log = EventLog::in_memory();
    let store = seeded_store(log, &["Alice", "Bob"]).await;
    store.insert_chat("Alice", "Bob", "the ring is safe", "").await.unwrap();
    store.insert_chat("Bob", "Alice", "good to hear", "").await.unwrap();

    let first = store
        .keyword_context_current("ring", "Alice", "Bob", 10, 2)
        .await
        .unwrap();
    let second = store
        .keyword_context_current("ring", "Alice", "Bob", 10, 2)
        .await
        .unwrap();

    let render = |rows: &[confab_schema::ChatRow]| {
        rows.iter().map(|r| r.render()).collect::<Vec<_>>().join("\n")
    };
    assert_eq!(render(&first), render(&second));
}

// ---------------------------------------------------------------------------
// Preloaded history
// ---------------------------------------------------------------------------

#[tokio::test]
async fn preloaded_history_prepends_entries() {
    let log = EventLog::in_memory();
    let store = seeded_store(log.clone(), &["Alice", "Bob"]).await;

    let backend = StubBackend::with_handler(|prompt| {
        if prompt.contains("Write a short step-by-step plan") {
            "draft".to_string()
        } else if prompt.contains("Rewrite the plan, enclosing") {
            "learn [fact]".to_string()
        } else if prompt.contains("mapping each newly resolved") {
            "{}".to_string()
        } else {
            "a message".to_string()
        }
    });

    let mut communication = think_pair(&store, &log, Arc::new(backend))
        .with_preloaded_history(vec![
            "from Alice's Agent to Bob's Agent: Discussion with Carol's Agents: it is Dune".to_string(),
        ]);
    communication.run().await.unwrap();

    let entries: Vec<&str> = communication.history().iter().collect();
    assert!(entries[0].contains("Discussion with Carol's Agents"));
    // Preloaded entry + broadcast + two rounds.
    assert_eq!(entries.len(), 1 + 1 + 4);
}
