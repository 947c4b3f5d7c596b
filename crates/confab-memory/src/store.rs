use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use confab_schema::ChatRow;
use confab_trace::EventLog;
use rusqlite::{params, Connection, Row};
use tokio::task;

/// Relational chat store. `chats.id` provides the total order used by
/// windowed retrieval; endpoints may be a human name or `"<name>'s Agent"`.
#[derive(Clone)]
pub struct ChatStore {
    db: Arc<Mutex<Connection>>,
    log: EventLog,
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            password TEXT NOT NULL,
            system_prompt TEXT,
            profile_image_path TEXT,
            agent_profile_image_path TEXT,
            guide_seen INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS friendships (
            user_id INTEGER NOT NULL,
            friend_id INTEGER NOT NULL,
            PRIMARY KEY (user_id, friend_id),
            CHECK (user_id != friend_id)
        );
        CREATE TABLE IF NOT EXISTS chats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender TEXT NOT NULL,
            receiver TEXT NOT NULL,
            message TEXT NOT NULL,
            communication_history TEXT NOT NULL DEFAULT '',
            timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S', 'now'))
        );
        CREATE TABLE IF NOT EXISTS feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender TEXT NOT NULL,
            receiver TEXT NOT NULL,
            conclusion TEXT NOT NULL,
            communication_history TEXT NOT NULL DEFAULT '',
            feedback TEXT NOT NULL,
            timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S', 'now'))
        );
        "#,
    )?;
    Ok(())
}

impl ChatStore {
    pub fn open(path: &str, log: EventLog) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            log,
        })
    }

    pub fn open_in_memory(log: EventLog) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            log,
        })
    }

    pub async fn create_user(
        &self,
        name: &str,
        password: &str,
        system_prompt: Option<&str>,
    ) -> Result<i64> {
        let db = Arc::clone(&self.db);
        let name = name.to_owned();
        let password = password.to_owned();
        let system_prompt = system_prompt.map(str::to_owned);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                "INSERT INTO users (name, password, system_prompt) VALUES (?1, ?2, ?3)",
                params![name, password, system_prompt],
            )?;
            Ok::<i64, anyhow::Error>(conn.last_insert_rowid())
        })
        .await?
    }

    /// The master's agent-profile prompt (`users.system_prompt`), when set.
    pub async fn agent_profile(&self, master: &str) -> Result<Option<String>> {
        let db = Arc::clone(&self.db);
        let master = master.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare("SELECT system_prompt FROM users WHERE name = ?1")?;
            let mut rows = stmt.query(params![master])?;
            if let Some(row) = rows.next()? {
                let prompt: Option<String> = row.get(0)?;
                return Ok::<Option<String>, anyhow::Error>(
                    prompt.filter(|p| !p.trim().is_empty()),
                );
            }
            Ok(None)
        })
        .await?
    }

    /// Friendships are stored symmetrically, one row per direction.
    pub async fn add_friendship(&self, a: &str, b: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let a = a.to_owned();
        let b = b.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let id_a: i64 = conn.query_row(
                "SELECT id FROM users WHERE name = ?1",
                params![a],
                |row| row.get(0),
            )?;
            let id_b: i64 = conn.query_row(
                "SELECT id FROM users WHERE name = ?1",
                params![b],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO friendships (user_id, friend_id) VALUES (?1, ?2)",
                params![id_a, id_b],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO friendships (user_id, friend_id) VALUES (?1, ?2)",
                params![id_b, id_a],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }

    /// Names of all users in a bidirectional friendship with `master`.
    pub async fn friends_of(&self, master: &str) -> Result<Vec<String>> {
        let sql = r#"
            SELECT users.name
            FROM friendships
            JOIN users ON friendships.friend_id = users.id
            WHERE friendships.user_id = (
                SELECT id FROM users WHERE name = ?1
            )
            ORDER BY users.name
        "#;
        let db = Arc::clone(&self.db);
        let log = self.log.clone();
        let master = master.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![master], |row| row.get::<_, String>(0))?;
            let mut friends = Vec::new();
            for row in rows {
                friends.push(row?);
            }
            log_sql(&log, sql, &format!("({master})"), friends.len());
            Ok::<Vec<String>, anyhow::Error>(friends)
        })
        .await?
    }

    pub async fn insert_chat(
        &self,
        sender: &str,
        receiver: &str,
        message: &str,
        communication_history: &str,
    ) -> Result<i64> {
        let sql = "INSERT INTO chats (sender, receiver, message, communication_history) \
                   VALUES (?1, ?2, ?3, ?4)";
        let db = Arc::clone(&self.db);
        let log = self.log.clone();
        let sender = sender.to_owned();
        let receiver = receiver.to_owned();
        let message = message.to_owned();
        let communication_history = communication_history.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(sql, params![sender, receiver, message, communication_history])?;
            log_sql(&log, sql, &format!("({sender}, {receiver})"), 1);
            Ok::<i64, anyhow::Error>(conn.last_insert_rowid())
        })
        .await?
    }

    /// Family 1: last `limit` rows between the pair, rendered oldest-first.
    pub async fn current_pair_history(
        &self,
        master: &str,
        contact: &str,
        limit: usize,
    ) -> Result<Vec<ChatRow>> {
        let sql = r#"
            SELECT id, timestamp, sender, receiver, message
            FROM chats
            WHERE (sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1)
            ORDER BY id DESC
            LIMIT ?3
        "#;
        let limit = limit.max(10) as i64;
        let db = Arc::clone(&self.db);
        let log = self.log.clone();
        let master = master.to_owned();
        let contact = contact.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![master, contact, limit], row_to_chat)?;
            let mut chats = Vec::new();
            for row in rows {
                chats.push(row?);
            }
            chats.reverse();
            log_sql(&log, sql, &format!("({master}, {contact}, {limit})"), chats.len());
            Ok::<Vec<ChatRow>, anyhow::Error>(chats)
        })
        .await?
    }

    /// Family 2: last `limit` human-human rows with exactly one endpoint equal
    /// to `master` and the other endpoint different from `contact`.
    pub async fn cross_contact_history(
        &self,
        master: &str,
        contact: &str,
        limit: usize,
    ) -> Result<Vec<ChatRow>> {
        let sql = r#"
            SELECT id, timestamp, sender, receiver, message
            FROM chats
            WHERE ((sender = ?1 AND receiver != ?2) OR (sender != ?2 AND receiver = ?1))
              AND sender NOT LIKE '%Agent%' AND receiver NOT LIKE '%Agent%'
            ORDER BY id DESC
            LIMIT ?3
        "#;
        let limit = limit.max(10) as i64;
        let db = Arc::clone(&self.db);
        let log = self.log.clone();
        let master = master.to_owned();
        let contact = contact.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![master, contact, limit], row_to_chat)?;
            let mut chats = Vec::new();
            for row in rows {
                chats.push(row?);
            }
            chats.reverse();
            log_sql(&log, sql, &format!("({master}, {contact}, {limit})"), chats.len());
            Ok::<Vec<ChatRow>, anyhow::Error>(chats)
        })
        .await?
    }

    /// Family 3: keyword-windowed retrieval constrained to the current
    /// human-human pair.
    pub async fn keyword_context_current(
        &self,
        keyword: &str,
        master: &str,
        contact: &str,
        limit: usize,
        window: usize,
    ) -> Result<Vec<ChatRow>> {
        let context_filter = "((sender = ?2 AND receiver = ?3) OR (sender = ?3 AND receiver = ?2))";
        self.keyword_context(keyword, master, contact, limit, window, context_filter)
            .await
    }

    /// Family 4: keyword-windowed retrieval over the master's sessions with
    /// any human contact other than `contact`.
    pub async fn keyword_context_cross(
        &self,
        keyword: &str,
        master: &str,
        contact: &str,
        limit: usize,
        window: usize,
    ) -> Result<Vec<ChatRow>> {
        let context_filter = "((sender = ?2 AND receiver != ?3) OR (sender != ?3 AND receiver = ?2))";
        self.keyword_context(keyword, master, contact, limit, window, context_filter)
            .await
    }

    /// Shared windowed query: anchor rows match `%keyword%`, context rows lie
    /// within ±window row-ids inside the channel's candidate set, deduplicated
    /// and ordered by anchor id. Window and limit are clamped integers
    /// formatted into the statement; sqlite requires constant lag/lead
    /// offsets.
    async fn keyword_context(
        &self,
        keyword: &str,
        master: &str,
        contact: &str,
        limit: usize,
        window: usize,
        context_filter: &str,
    ) -> Result<Vec<ChatRow>> {
        let window = window.max(1);
        let limit = limit.max(10);
        let sql = format!(
            r#"
            WITH relevant_messages AS (
                SELECT id, timestamp, sender, receiver, message
                FROM chats
                WHERE message LIKE ?1
            ),
            context AS (
                SELECT id, timestamp, sender, receiver, message
                FROM chats
                WHERE {context_filter}
                  AND sender NOT LIKE '%Agent%' AND receiver NOT LIKE '%Agent%'
            ),
            relevant_ids AS (
                SELECT id,
                    LAG(id, {window}, id) OVER (ORDER BY id) AS prev_id,
                    LEAD(id, {window}, id) OVER (ORDER BY id) AS next_id
                FROM context
            )
            SELECT c.id, c.timestamp, c.sender, c.receiver, c.message
            FROM relevant_messages r
            JOIN relevant_ids ri ON r.id = ri.id
            JOIN context c ON c.id BETWEEN ri.prev_id AND ri.next_id
            GROUP BY c.id
            ORDER BY MIN(r.id)
            LIMIT {limit}
        "#
        );
        let pattern = format!("%{keyword}%");
        let db = Arc::clone(&self.db);
        let log = self.log.clone();
        let master = master.to_owned();
        let contact = contact.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![pattern, master, contact], row_to_chat)?;
            let mut chats = Vec::new();
            for row in rows {
                chats.push(row?);
            }
            log_sql(
                &log,
                &sql,
                &format!("({pattern}, {master}, {contact})"),
                chats.len(),
            );
            Ok::<Vec<ChatRow>, anyhow::Error>(chats)
        })
        .await?
    }
}

fn log_sql(log: &EventLog, sql: &str, sql_params: &str, result_rows: usize) {
    log.log(
        "Executing SQL",
        Some(&format!("SQL COMMAND:\n{sql}\nPARAMS:\n{sql_params}")),
        Some(&format!("{result_rows} rows")),
    );
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_chat(row: &Row<'_>) -> rusqlite::Result<ChatRow> {
    let timestamp_raw: String = row.get(1)?;
    Ok(ChatRow {
        id: row.get(0)?,
        timestamp: parse_timestamp(&timestamp_raw),
        sender: row.get(2)?,
        receiver: row.get(3)?,
        message: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_store() -> ChatStore {
        let store = ChatStore::open_in_memory(EventLog::in_memory()).unwrap();
        for name in ["Alice", "Bob", "Carol", "Dave"] {
            store.create_user(name, "pw", None).await.unwrap();
        }
        store.add_friendship("Alice", "Bob").await.unwrap();
        store.add_friendship("Alice", "Carol").await.unwrap();
        store
    }

    #[tokio::test]
    async fn friendships_are_symmetric() {
        let store = seeded_store().await;
        assert_eq!(store.friends_of("Alice").await.unwrap(), vec!["Bob", "Carol"]);
        assert_eq!(store.friends_of("Bob").await.unwrap(), vec!["Alice"]);
        assert_eq!(store.friends_of("Carol").await.unwrap(), vec!["Alice"]);
        assert!(store.friends_of("Dave").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn current_pair_history_is_oldest_first() {
        let store = seeded_store().await;
        store.insert_chat("Alice", "Bob", "first", "").await.unwrap();
        store.insert_chat("Bob", "Alice", "second", "").await.unwrap();
        store.insert_chat("Alice", "Carol", "elsewhere", "").await.unwrap();

        let rows = store.current_pair_history("Alice", "Bob", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message, "first");
        assert_eq!(rows[1].message, "second");
    }

    #[tokio::test]
    async fn current_pair_history_respects_limit_keeping_latest() {
        let store = seeded_store().await;
        for i in 0..15 {
            store
                .insert_chat("Alice", "Bob", &format!("msg {i}"), "")
                .await
                .unwrap();
        }
        let rows = store.current_pair_history("Alice", "Bob", 10).await.unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].message, "msg 5");
        assert_eq!(rows[9].message, "msg 14");
    }

    #[tokio::test]
    async fn cross_contact_excludes_pair_and_agents() {
        let store = seeded_store().await;
        store.insert_chat("Alice", "Bob", "with bob", "").await.unwrap();
        store.insert_chat("Alice", "Carol", "with carol", "").await.unwrap();
        store.insert_chat("Dave", "Alice", "from dave", "").await.unwrap();
        store
            .insert_chat("Alice's Agent", "Carol", "agent row", "")
            .await
            .unwrap();
        store
            .insert_chat("Carol", "Alice's Agent", "to agent", "")
            .await
            .unwrap();

        let rows = store.cross_contact_history("Alice", "Bob", 10).await.unwrap();
        let messages: Vec<&str> = rows.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["with carol", "from dave"]);
        assert!(rows.iter().all(|r| !r.involves_agent()));
    }

    #[tokio::test]
    async fn keyword_context_current_returns_window() {
        let store = seeded_store().await;
        for i in 0..5 {
            store
                .insert_chat("Alice", "Bob", &format!("filler {i}"), "")
                .await
                .unwrap();
        }
        store.insert_chat("Bob", "Alice", "I love Dune", "").await.unwrap();
        for i in 5..8 {
            store
                .insert_chat("Alice", "Bob", &format!("filler {i}"), "")
                .await
                .unwrap();
        }

        let rows = store
            .keyword_context_current("dune", "Alice", "Bob", 10, 2)
            .await
            .unwrap();
        let anchor_id = rows
            .iter()
            .find(|r| r.message.contains("Dune"))
            .map(|r| r.id)
            .expect("anchor row present");
        assert!(rows.iter().all(|r| (r.id - anchor_id).abs() <= 2));
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn keyword_context_is_case_insensitive_and_deduplicated() {
        let store = seeded_store().await;
        store.insert_chat("Alice", "Bob", "the RING is here", "").await.unwrap();
        store.insert_chat("Bob", "Alice", "which ring?", "").await.unwrap();

        let rows = store
            .keyword_context_current("ring", "Alice", "Bob", 10, 3)
            .await
            .unwrap();
        let mut ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn keyword_context_cross_skips_current_pair() {
        let store = seeded_store().await;
        store.insert_chat("Alice", "Bob", "secret word", "").await.unwrap();
        store.insert_chat("Alice", "Carol", "secret plan", "").await.unwrap();

        let rows = store
            .keyword_context_cross("secret", "Alice", "Bob", 10, 1)
            .await
            .unwrap();
        assert!(rows.iter().all(|r| r.receiver != "Bob" && r.sender != "Bob"));
        assert!(rows.iter().any(|r| r.message == "secret plan"));
    }

    #[tokio::test]
    async fn empty_store_yields_empty_results() {
        let store = ChatStore::open_in_memory(EventLog::in_memory()).unwrap();
        store.create_user("Alice", "pw", None).await.unwrap();
        store.create_user("Bob", "pw", None).await.unwrap();

        assert!(store
            .current_pair_history("Alice", "Bob", 10)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .keyword_context_current("ring", "Alice", "Bob", 10, 3)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn agent_profile_filters_blank() {
        let store = ChatStore::open_in_memory(EventLog::in_memory()).unwrap();
        store
            .create_user("Alice", "pw", Some("Alice collects first editions."))
            .await
            .unwrap();
        store.create_user("Bob", "pw", Some("   ")).await.unwrap();

        assert_eq!(
            store.agent_profile("Alice").await.unwrap().as_deref(),
            Some("Alice collects first editions.")
        );
        assert!(store.agent_profile("Bob").await.unwrap().is_none());
        assert!(store.agent_profile("Nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sql_executions_are_traced() {
        let log = EventLog::in_memory();
        let store = ChatStore::open_in_memory(log.clone()).unwrap();
        store.create_user("Alice", "pw", None).await.unwrap();
        store.create_user("Bob", "pw", None).await.unwrap();
        store.insert_chat("Alice", "Bob", "hello", "").await.unwrap();
        store.current_pair_history("Alice", "Bob", 10).await.unwrap();

        let instructions = log.instructions().unwrap();
        assert!(instructions.iter().filter(|i| *i == "Executing SQL").count() >= 2);
    }
}
