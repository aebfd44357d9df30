//! Persistence Gateway (C11) — durable storage of session metadata,
//! messages, tool executions, permissions, and previews.
//!
//! The core depends only on the six operations named in spec §4.11; file
//! layout and atomicity are this module's business, not the core's. The
//! sqlite-backed implementation stores each session as a row of JSON
//! columns — the same "blob plus relational columns for what needs
//! indexing" shape the teacher codebase uses for conversation state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::adapter::RepositoryInfo;
use crate::tool_execution::{PermissionRequest, ToolExecution};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        id: String,
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        aborted: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionData {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub messages: Vec<ConversationEntry>,
    pub tool_executions: Vec<ToolExecution>,
    pub permission_requests: Vec<PermissionRequest>,
    pub previews: Vec<crate::preview::Preview>,
    pub session_state: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_info: Option<RepositoryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoints: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: usize,
}

/// The six operations the core depends on. Implementation (file layout,
/// atomicity) is out of scope for callers: the only contract is that a
/// successful `save_session` returned before a subsequent `load_session`
/// yields the same data.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn load_session(&self, id: &str) -> DbResult<Option<SessionData>>;
    async fn save_session(&self, data: SessionData) -> DbResult<()>;
    async fn delete_session(&self, id: &str) -> DbResult<()>;
    async fn list_sessions(&self) -> DbResult<Vec<SessionSummary>>;
    async fn persist_messages(&self, id: &str, messages: Vec<ConversationEntry>) -> DbResult<()>;
    async fn load_messages(&self, id: &str) -> DbResult<Vec<ConversationEntry>>;

    /// Merges `executions`/`permissions` into the persisted record for
    /// `id`, preserving unrelated fields (messages, previews, ...).
    async fn merge_tool_data(
        &self,
        id: &str,
        executions: Vec<ToolExecution>,
        permissions: Vec<PermissionRequest>,
    ) -> DbResult<()>;

    /// Merges the Preview Manager's in-memory previews for `id` into the
    /// persisted record, preserving unrelated fields. Mirrors
    /// `merge_tool_data`'s merge-not-replace contract (spec §4.4/§4.5).
    async fn merge_previews(&self, id: &str, previews: Vec<crate::preview::Preview>) -> DbResult<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    messages TEXT NOT NULL DEFAULT '[]',
    tool_executions TEXT NOT NULL DEFAULT '[]',
    permission_requests TEXT NOT NULL DEFAULT '[]',
    previews TEXT NOT NULL DEFAULT '[]',
    session_state TEXT NOT NULL DEFAULT 'null',
    repository_info TEXT,
    checkpoints TEXT
);
";

/// Sqlite-backed gateway. Every operation hops onto a blocking task so a
/// slow disk never stalls the async runtime driving the agent loop.
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn read_row(conn: &Connection, id: &str) -> DbResult<Option<SessionData>> {
        conn.query_row(
            "SELECT id, name, created_at, updated_at, messages, tool_executions,
                    permission_requests, previews, session_state, repository_info, checkpoints
             FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            },
        )
        .optional()?
        .map(
            |(id, name, created_at, updated_at, messages, tool_executions, permission_requests,
              previews, session_state, repository_info, checkpoints)| {
                Ok(SessionData {
                    id,
                    name,
                    created_at,
                    updated_at,
                    messages: serde_json::from_str(&messages)?,
                    tool_executions: serde_json::from_str(&tool_executions)?,
                    permission_requests: serde_json::from_str(&permission_requests)?,
                    previews: serde_json::from_str(&previews)?,
                    session_state: serde_json::from_str(&session_state)?,
                    repository_info: repository_info
                        .map(|s| serde_json::from_str(&s))
                        .transpose()?,
                    checkpoints: checkpoints.map(|s| serde_json::from_str(&s)).transpose()?,
                })
            },
        )
        .transpose()
    }

    fn write_row(conn: &Connection, data: &SessionData) -> DbResult<()> {
        conn.execute(
            "INSERT INTO sessions (id, name, created_at, updated_at, messages, tool_executions,
                                    permission_requests, previews, session_state, repository_info, checkpoints)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                updated_at = excluded.updated_at,
                messages = excluded.messages,
                tool_executions = excluded.tool_executions,
                permission_requests = excluded.permission_requests,
                previews = excluded.previews,
                session_state = excluded.session_state,
                repository_info = excluded.repository_info,
                checkpoints = excluded.checkpoints",
            params![
                data.id,
                data.name,
                data.created_at,
                data.updated_at,
                serde_json::to_string(&data.messages)?,
                serde_json::to_string(&data.tool_executions)?,
                serde_json::to_string(&data.permission_requests)?,
                serde_json::to_string(&data.previews)?,
                serde_json::to_string(&data.session_state)?,
                data.repository_info
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                data.checkpoints.as_ref().map(serde_json::to_string).transpose()?,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for SqlitePersistence {
    async fn load_session(&self, id: &str) -> DbResult<Option<SessionData>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection poisoned");
            Self::read_row(&conn, &id)
        })
        .await
        .expect("blocking task panicked")
    }

    async fn save_session(&self, data: SessionData) -> DbResult<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection poisoned");
            Self::write_row(&conn, &data)
        })
        .await
        .expect("blocking task panicked")
    }

    async fn delete_session(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection poisoned");
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
        .expect("blocking task panicked")
    }

    async fn list_sessions(&self) -> DbResult<Vec<SessionSummary>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection poisoned");
            let mut stmt = conn.prepare(
                "SELECT id, name, created_at, updated_at, messages FROM sessions ORDER BY updated_at DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut summaries = Vec::new();
            for row in rows {
                let (id, name, created_at, updated_at, messages) = row?;
                let message_count: usize = serde_json::from_str::<Vec<Value>>(&messages)
                    .map(|v| v.len())
                    .unwrap_or(0);
                summaries.push(SessionSummary {
                    id,
                    name,
                    created_at,
                    updated_at,
                    message_count,
                });
            }
            Ok(summaries)
        })
        .await
        .expect("blocking task panicked")
    }

    async fn persist_messages(&self, id: &str, messages: Vec<ConversationEntry>) -> DbResult<()> {
        let existing = self.load_session(id).await?;
        let now = Utc::now().to_rfc3339();
        let data = match existing {
            Some(mut data) => {
                data.messages = messages;
                data.updated_at = now;
                data
            }
            None => SessionData {
                id: id.to_string(),
                created_at: now.clone(),
                updated_at: now,
                messages,
                ..Default::default()
            },
        };
        self.save_session(data).await
    }

    async fn load_messages(&self, id: &str) -> DbResult<Vec<ConversationEntry>> {
        Ok(self
            .load_session(id)
            .await?
            .map(|d| d.messages)
            .unwrap_or_default())
    }

    async fn merge_tool_data(
        &self,
        id: &str,
        executions: Vec<ToolExecution>,
        permissions: Vec<PermissionRequest>,
    ) -> DbResult<()> {
        let existing = self.load_session(id).await?;
        let now = Utc::now().to_rfc3339();
        let data = match existing {
            Some(mut data) => {
                data.tool_executions = executions;
                data.permission_requests = permissions;
                data.updated_at = now;
                data
            }
            None => SessionData {
                id: id.to_string(),
                created_at: now.clone(),
                updated_at: now,
                tool_executions: executions,
                permission_requests: permissions,
                ..Default::default()
            },
        };
        self.save_session(data).await
    }

    async fn merge_previews(&self, id: &str, previews: Vec<crate::preview::Preview>) -> DbResult<()> {
        let existing = self.load_session(id).await?;
        let now = Utc::now().to_rfc3339();
        let data = match existing {
            Some(mut data) => {
                data.previews = previews;
                data.updated_at = now;
                data
            }
            None => SessionData {
                id: id.to_string(),
                created_at: now.clone(),
                updated_at: now,
                previews,
                ..Default::default()
            },
        };
        self.save_session(data).await
    }
}

/// In-memory gateway used by tests and by `Config::default`'s `:memory:`
/// convenience path; avoids spinning up sqlite for unit tests that don't
/// care about durability.
pub struct InMemoryPersistence {
    sessions: Mutex<HashMap<String, SessionData>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryPersistence {
    async fn load_session(&self, id: &str) -> DbResult<Option<SessionData>> {
        Ok(self
            .sessions
            .lock()
            .expect("in-memory persistence poisoned")
            .get(id)
            .cloned())
    }

    async fn save_session(&self, data: SessionData) -> DbResult<()> {
        self.sessions
            .lock()
            .expect("in-memory persistence poisoned")
            .insert(data.id.clone(), data);
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> DbResult<()> {
        self.sessions
            .lock()
            .expect("in-memory persistence poisoned")
            .remove(id);
        Ok(())
    }

    async fn list_sessions(&self) -> DbResult<Vec<SessionSummary>> {
        Ok(self
            .sessions
            .lock()
            .expect("in-memory persistence poisoned")
            .values()
            .map(|d| SessionSummary {
                id: d.id.clone(),
                name: d.name.clone(),
                created_at: d.created_at.clone(),
                updated_at: d.updated_at.clone(),
                message_count: d.messages.len(),
            })
            .collect())
    }

    async fn persist_messages(&self, id: &str, messages: Vec<ConversationEntry>) -> DbResult<()> {
        let mut sessions = self.sessions.lock().expect("in-memory persistence poisoned");
        let now = Utc::now().to_rfc3339();
        let entry = sessions.entry(id.to_string()).or_insert_with(|| SessionData {
            id: id.to_string(),
            created_at: now.clone(),
            updated_at: now.clone(),
            ..Default::default()
        });
        entry.messages = messages;
        entry.updated_at = now;
        Ok(())
    }

    async fn load_messages(&self, id: &str) -> DbResult<Vec<ConversationEntry>> {
        Ok(self
            .sessions
            .lock()
            .expect("in-memory persistence poisoned")
            .get(id)
            .map(|d| d.messages.clone())
            .unwrap_or_default())
    }

    async fn merge_tool_data(
        &self,
        id: &str,
        executions: Vec<ToolExecution>,
        permissions: Vec<PermissionRequest>,
    ) -> DbResult<()> {
        let mut sessions = self.sessions.lock().expect("in-memory persistence poisoned");
        let now = Utc::now().to_rfc3339();
        let entry = sessions.entry(id.to_string()).or_insert_with(|| SessionData {
            id: id.to_string(),
            created_at: now.clone(),
            updated_at: now.clone(),
            ..Default::default()
        });
        entry.tool_executions = executions;
        entry.permission_requests = permissions;
        entry.updated_at = now;
        Ok(())
    }

    async fn merge_previews(&self, id: &str, previews: Vec<crate::preview::Preview>) -> DbResult<()> {
        let mut sessions = self.sessions.lock().expect("in-memory persistence poisoned");
        let now = Utc::now().to_rfc3339();
        let entry = sessions.entry(id.to_string()).or_insert_with(|| SessionData {
            id: id.to_string(),
            created_at: now.clone(),
            updated_at: now.clone(),
            ..Default::default()
        });
        entry.previews = previews;
        entry.updated_at = now;
        Ok(())
    }
}
