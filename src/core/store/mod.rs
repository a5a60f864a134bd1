//! Session and message persistence for the gateway.
//!
//! Only touched after a result has been claimed, never on the correlation path.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::core::messages::{ChatTurn, UserInfo};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
    pub prompt: String,
    pub reply: String,
    pub no_answer: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: Uuid,
    pub user: UserInfo,
    pub prompt: String,
    pub reply: String,
    pub no_answer: bool,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self) -> Result<SessionSummary>;

    /// Create the session row if it does not exist yet.
    async fn ensure_session(&self, id: Uuid) -> Result<()>;

    /// Most recently updated first.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>>;

    /// Oldest first. `None` when the session does not exist.
    async fn session_messages(&self, id: Uuid) -> Result<Option<Vec<StoredMessage>>>;

    /// The last `limit` exchanges with a non-empty reply, as alternating
    /// user/assistant turns in chronological order.
    async fn recent_exchanges(&self, id: Uuid, limit: usize) -> Result<Vec<ChatTurn>>;

    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage>;

    /// Returns false when there was no such session.
    async fn delete_session(&self, id: Uuid) -> Result<bool>;
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_uuid(raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        let store = Self::init(db)?;
        info!(path = %path.display(), "Chat store ready");
        Ok(store)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                user_name TEXT NOT NULL,
                user_email TEXT NOT NULL,
                prompt TEXT NOT NULL,
                reply TEXT NOT NULL,
                no_answer INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_session
                ON chat_messages(session_id, created_at);",
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| anyhow!("database task failed: {e}"))?
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_session(&self) -> Result<SessionSummary> {
        self.with_conn(|conn| {
            let id = Uuid::new_v4();
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?1, NULL, ?2, ?2)",
                params![id.to_string(), now],
            )?;
            Ok(SessionSummary {
                id,
                title: None,
                created_at: now.clone(),
                updated_at: now,
                message_count: 0,
            })
        })
        .await
    }

    async fn ensure_session(&self, id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            let now = now_rfc3339();
            conn.execute(
                "INSERT OR IGNORE INTO sessions (id, title, created_at, updated_at) VALUES (?1, NULL, ?2, ?2)",
                params![id.to_string(), now],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.title, s.created_at, s.updated_at, COUNT(m.id)
                 FROM sessions s
                 LEFT JOIN chat_messages m ON m.session_id = s.id
                 GROUP BY s.id
                 ORDER BY s.updated_at DESC, s.rowid DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SessionSummary {
                    id: parse_uuid(row.get(0)?)?,
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                    message_count: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn session_messages(&self, id: Uuid) -> Result<Option<Vec<StoredMessage>>> {
        self.with_conn(move |conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    params![id.to_string()],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(None);
            }

            let mut stmt = conn.prepare(
                "SELECT id, session_id, user_id, user_name, user_email, prompt, reply, no_answer, created_at
                 FROM chat_messages WHERE session_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![id.to_string()], |row| {
                Ok(StoredMessage {
                    id: parse_uuid(row.get(0)?)?,
                    session_id: parse_uuid(row.get(1)?)?,
                    user_id: row.get(2)?,
                    user_name: row.get(3)?,
                    user_email: row.get(4)?,
                    prompt: row.get(5)?,
                    reply: row.get(6)?,
                    no_answer: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?;
            Ok(Some(rows.collect::<rusqlite::Result<Vec<_>>>()?))
        })
        .await
    }

    async fn recent_exchanges(&self, id: Uuid, limit: usize) -> Result<Vec<ChatTurn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT prompt, reply FROM chat_messages
                 WHERE session_id = ?1 AND reply <> ''
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![id.to_string(), limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut exchanges = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            exchanges.reverse();
            Ok(exchanges
                .into_iter()
                .flat_map(|(prompt, reply)| [ChatTurn::user(prompt), ChatTurn::assistant(reply)])
                .collect())
        })
        .await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage> {
        self.with_conn(move |conn| {
            let id = Uuid::new_v4();
            let now = now_rfc3339();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chat_messages
                 (id, session_id, user_id, user_name, user_email, prompt, reply, no_answer, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    message.session_id.to_string(),
                    message.user.id,
                    message.user.name,
                    message.user.email,
                    message.prompt,
                    message.reply,
                    message.no_answer,
                    now,
                ],
            )?;
            tx.execute(
                "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
                params![message.session_id.to_string(), now],
            )?;
            tx.commit()?;
            Ok(StoredMessage {
                id,
                session_id: message.session_id,
                user_id: message.user.id,
                user_name: message.user.name,
                user_email: message.user.email,
                prompt: message.prompt,
                reply: message.reply,
                no_answer: message.no_answer,
                created_at: now,
            })
        })
        .await
    }

    async fn delete_session(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id.to_string()])?;
            Ok(removed > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_user() -> UserInfo {
        UserInfo {
            id: "demo-user-123".to_string(),
            name: "Demo User".to_string(),
            email: "demo@example.com".to_string(),
        }
    }

    fn message(session_id: Uuid, prompt: &str, reply: &str) -> NewMessage {
        NewMessage {
            session_id,
            user: demo_user(),
            prompt: prompt.to_string(),
            reply: reply.to_string(),
            no_answer: reply.is_empty(),
        }
    }

    #[tokio::test]
    async fn messages_are_listed_oldest_first_with_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("data").join("chat.db")).unwrap();

        let quiet = store.create_session().await.unwrap();
        let busy = store.create_session().await.unwrap();
        store.insert_message(message(busy.id, "one", "1")).await.unwrap();
        store.insert_message(message(busy.id, "two", "2")).await.unwrap();

        let sessions = store.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, busy.id);
        assert_eq!(sessions[0].message_count, 2);
        assert_eq!(sessions[1].id, quiet.id);
        assert_eq!(sessions[1].message_count, 0);

        let msgs = store.session_messages(busy.id).await.unwrap().unwrap();
        let prompts: Vec<_> = msgs.iter().map(|m| m.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["one", "two"]);
        assert_eq!(msgs[0].user_email, "demo@example.com");
    }

    #[tokio::test]
    async fn unknown_session_has_no_messages() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.session_messages(Uuid::new_v4()).await.unwrap().is_none());
        assert!(!store.delete_session(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn ensure_session_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let id = Uuid::new_v4();
        store.ensure_session(id).await.unwrap();
        store.ensure_session(id).await.unwrap();
        store.insert_message(message(id, "hi", "hello")).await.unwrap();

        let sessions = store.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].message_count, 1);
    }

    #[tokio::test]
    async fn deleting_a_session_removes_its_messages() {
        let store = SqliteStore::in_memory().unwrap();
        let session = store.create_session().await.unwrap();
        store.insert_message(message(session.id, "hi", "hello")).await.unwrap();

        assert!(store.delete_session(session.id).await.unwrap());
        assert!(store.session_messages(session.id).await.unwrap().is_none());

        let orphans: i64 = store
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM chat_messages", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn recent_exchanges_skip_blank_replies_and_keep_order() {
        let store = SqliteStore::in_memory().unwrap();
        let id = Uuid::new_v4();
        store.ensure_session(id).await.unwrap();
        for (prompt, reply) in [("a", "A"), ("b", ""), ("c", "C"), ("d", "D")] {
            store.insert_message(message(id, prompt, reply)).await.unwrap();
        }

        let turns = store.recent_exchanges(id, 2).await.unwrap();
        assert_eq!(
            turns,
            vec![
                ChatTurn::user("c"),
                ChatTurn::assistant("C"),
                ChatTurn::user("d"),
                ChatTurn::assistant("D"),
            ]
        );
        assert!(store.recent_exchanges(id, 0).await.unwrap().is_empty());
    }
}
