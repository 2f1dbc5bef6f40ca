//! Session persistence layer
//!
//! Pluggable storage for sessions and their message history via the
//! [`SessionStore`] trait.
//!
//! `FileSessionStore` keeps one directory per session:
//! ```text
//! sessions/
//!   <id>/
//!     session.json     # metadata, rewritten atomically
//!     messages.jsonl   # append-only history, one message per line
//! ```
//!
//! `MemorySessionStore` backs tests and throwaway sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{CodeError, Result};
use crate::llm::{Message, TokenUsage};
use crate::todo::TodoItem;

const SESSION_FILE: &str = "session.json";
const MESSAGES_FILE: &str = "messages.jsonl";

/// Persisted session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Cumulative token usage
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub continuation_count: u32,
    #[serde(default)]
    pub todos: Vec<TodoItem>,
}

impl Session {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            auto_approve: false,
            continuation_count: 0,
            todos: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Session storage trait
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create and persist a new, empty session
    async fn create_session(&self, title: &str) -> Result<Session>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// Overwrite an existing session record
    async fn update_session(&self, session: &Session) -> Result<()>;

    /// All sessions, most recently updated first
    async fn list_sessions(&self) -> Result<Vec<Session>>;

    /// Delete a session and its messages. Returns `false` if it did not exist.
    async fn delete_session(&self, id: &str) -> Result<bool>;

    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()>;

    /// Messages in append order
    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>>;

    async fn delete_session_messages(&self, session_id: &str) -> Result<()>;

    /// Backend name for diagnostics
    fn backend_name(&self) -> &str {
        "unknown"
    }
}

// ============================================================================
// File-based Session Store
// ============================================================================

/// File-based session store
pub struct FileSessionStore {
    dir: PathBuf,
    /// Serializes appends so concurrent writers never interleave lines
    append_lock: Mutex<()>,
}

impl FileSessionStore {
    /// Create the store, creating `dir` if needed
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            CodeError::Store(format!(
                "failed to create session directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            append_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_dir(&self, id: &str) -> Result<PathBuf> {
        // Validate to prevent path traversal
        let is_safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !id.starts_with('.');
        if !is_safe {
            return Err(CodeError::Store(format!("invalid session id: {:?}", id)));
        }
        Ok(self.dir.join(id))
    }

    async fn write_session(&self, session: &Session) -> Result<()> {
        let dir = self.session_dir(&session.id)?;
        fs::create_dir_all(&dir).await?;

        let path = dir.join(SESSION_FILE);
        let temp_path = dir.join(format!("{}.tmp", SESSION_FILE));
        let json = serde_json::to_string_pretty(session)?;

        // Write atomically: temp file, sync, rename
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &path).await?;

        tracing::debug!("Saved session {} to {}", session.id, path.display());
        Ok(())
    }

    async fn read_session(&self, dir: &Path) -> Result<Option<Session>> {
        let path = dir.join(SESSION_FILE);
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let session = serde_json::from_str(&json).map_err(|e| {
            CodeError::Store(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(session))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create_session(&self, title: &str) -> Result<Session> {
        let session = Session::new(title);
        self.write_session(&session).await?;
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let dir = self.session_dir(id)?;
        self.read_session(&dir).await
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let dir = self.session_dir(&session.id)?;
        if !fs::try_exists(dir.join(SESSION_FILE)).await? {
            return Err(CodeError::SessionNotFound(session.id.clone()));
        }
        self.write_session(session).await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match self.read_session(&entry.path()).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Skipping unreadable session {}: {}", entry.path().display(), e)
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        let dir = self.session_dir(id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!("Deleted session {} from {}", id, dir.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let dir = self.session_dir(session_id)?;
        if !fs::try_exists(dir.join(SESSION_FILE)).await? {
            return Err(CodeError::SessionNotFound(session_id.to_string()));
        }

        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let path = dir.join(MESSAGES_FILE);
        let _guard = self.append_lock.lock().await;
        truncate_torn_tail(&path, session_id).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let path = self.session_dir(session_id)?.join(MESSAGES_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        parse_message_log(&content, session_id)
    }

    async fn delete_session_messages(&self, session_id: &str) -> Result<()> {
        let path = self.session_dir(session_id)?.join(MESSAGES_FILE);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}

/// Cut a partial trailing line left by a crash mid-append so the next
/// append starts on a fresh line. Caller must hold the append lock.
async fn truncate_torn_tail(path: &Path, session_id: &str) -> Result<()> {
    let mut file = match fs::OpenOptions::new().read(true).write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }

    file.seek(std::io::SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let content = fs::read(path).await?;
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0) as u64;
    tracing::warn!(
        session_id,
        dropped = len - keep,
        "Truncating torn trailing message line before append"
    );
    file.set_len(keep).await?;
    file.sync_all().await?;
    Ok(())
}

/// Parse a JSONL message log. A torn final line (crash mid-append) is
/// dropped; corruption anywhere else is an error.
fn parse_message_log(content: &str, session_id: &str) -> Result<Vec<Message>> {
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut messages = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        match serde_json::from_str::<Message>(line) {
            Ok(message) => messages.push(message),
            Err(e) if idx + 1 == lines.len() => {
                tracing::warn!(session_id, "Skipping torn trailing message line: {}", e);
            }
            Err(e) => {
                return Err(CodeError::Store(format!(
                    "corrupt message log for session {} at line {}: {}",
                    session_id,
                    idx + 1,
                    e
                )))
            }
        }
    }
    Ok(messages)
}

/// Open the configured backend
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemorySessionStore::new()),
        StorageBackend::File => Arc::new(FileSessionStore::new(config.resolved_sessions_dir()).await?),
    };
    tracing::debug!(backend = store.backend_name(), "Opened session store");
    Ok(store)
}

// ============================================================================
// In-Memory Session Store
// ============================================================================

#[derive(Default)]
struct MemoryEntry {
    session: Option<Session>,
    messages: Vec<Message>,
}

/// In-memory session store
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, title: &str) -> Result<Session> {
        let session = Session::new(title);
        self.sessions.write().await.insert(
            session.id.clone(),
            MemoryEntry {
                session: Some(session.clone()),
                messages: Vec::new(),
            },
        );
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(id)
            .and_then(|e| e.session.clone()))
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        match self.sessions.write().await.get_mut(&session.id) {
            Some(entry) => {
                entry.session = Some(session.clone());
                Ok(())
            }
            None => Err(CodeError::SessionNotFound(session.id.clone())),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(|e| e.session.clone())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        match self.sessions.write().await.get_mut(session_id) {
            Some(entry) => {
                entry.messages.push(message.clone());
                Ok(())
            }
            None => Err(CodeError::SessionNotFound(session_id.to_string())),
        }
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.messages.clone())
            .unwrap_or_default())
    }

    async fn delete_session_messages(&self, session_id: &str) -> Result<()> {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.messages.clear();
        }
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Part;
    use crate::todo::TodoStatus;

    async fn exercise_store(store: &dyn SessionStore) {
        let mut session = store.create_session("first").await.unwrap();
        assert_eq!(store.get_session(&session.id).await.unwrap().unwrap(), session);

        session.title = "renamed".to_string();
        session.usage = TokenUsage::new(10, 5);
        session.todos = vec![TodoItem::new("1", "x").with_status(TodoStatus::InProgress)];
        session.continuation_count = 2;
        session.touch();
        store.update_session(&session).await.unwrap();
        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "renamed");
        assert_eq!(loaded.usage.total_tokens, 15);
        assert_eq!(loaded.todos[0].status, TodoStatus::InProgress);
        assert_eq!(loaded.continuation_count, 2);

        let first = Message::user("hello");
        let mut second = Message::assistant();
        second.push_text("hi there");
        store.append_message(&session.id, &first).await.unwrap();
        store.append_message(&session.id, &second).await.unwrap();
        let messages = store.list_messages(&session.id).await.unwrap();
        assert_eq!(messages, vec![first, second]);

        let other = store.create_session("second").await.unwrap();
        let listed = store.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, other.id);

        store.delete_session_messages(&session.id).await.unwrap();
        assert!(store.list_messages(&session.id).await.unwrap().is_empty());

        assert!(store.delete_session(&session.id).await.unwrap());
        assert!(!store.delete_session(&session.id).await.unwrap());
        assert!(store.get_session(&session.id).await.unwrap().is_none());
        assert!(store.list_messages(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        assert_eq!(store.backend_name(), "memory");
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("sessions")).await.unwrap();
        assert_eq!(store.backend_name(), "file");
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_missing_session_errors() {
        let store = MemorySessionStore::new();
        let ghost = Session::new("ghost");
        assert!(matches!(
            store.update_session(&ghost).await,
            Err(CodeError::SessionNotFound(_))
        ));
        assert!(matches!(
            store.append_message(&ghost.id, &Message::user("x")).await,
            Err(CodeError::SessionNotFound(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).await.unwrap();
        assert!(matches!(
            store.append_message(&ghost.id, &Message::user("x")).await,
            Err(CodeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_rejects_traversal_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).await.unwrap();
        for id in ["../evil", "a/b", "", ".hidden"] {
            assert!(matches!(store.get_session(id).await, Err(CodeError::Store(_))), "{}", id);
        }
    }

    #[tokio::test]
    async fn test_file_store_skips_torn_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).await.unwrap();
        let session = store.create_session("t").await.unwrap();
        let msg = Message::user("kept");
        store.append_message(&session.id, &msg).await.unwrap();

        let log = dir.path().join(&session.id).join(MESSAGES_FILE);
        let mut content = std::fs::read_to_string(&log).unwrap();
        content.push_str("{\"id\":\"torn\",\"role\":\"assis");
        std::fs::write(&log, content).unwrap();

        assert_eq!(store.list_messages(&session.id).await.unwrap(), vec![msg]);
    }

    #[tokio::test]
    async fn test_file_store_append_after_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).await.unwrap();
        let session = store.create_session("t").await.unwrap();
        let kept = Message::user("kept");
        store.append_message(&session.id, &kept).await.unwrap();

        let log = dir.path().join(&session.id).join(MESSAGES_FILE);
        let mut content = std::fs::read_to_string(&log).unwrap();
        content.push_str("{\"id\":\"torn\",\"role\":\"assis");
        std::fs::write(&log, content).unwrap();

        let first = Message::user("after-resume-1");
        let second = Message::user("after-resume-2");
        store.append_message(&session.id, &first).await.unwrap();
        assert_eq!(
            store.list_messages(&session.id).await.unwrap(),
            vec![kept.clone(), first.clone()]
        );
        store.append_message(&session.id, &second).await.unwrap();
        assert_eq!(
            store.list_messages(&session.id).await.unwrap(),
            vec![kept, first, second]
        );
        assert!(std::fs::read_to_string(&log).unwrap().ends_with('\n'));
    }

    #[test]
    fn test_parse_message_log_mid_file_corruption() {
        let good = serde_json::to_string(&Message::user("a")).unwrap();
        let log = format!("{}\nnot json\n{}\n", good, good);
        assert!(matches!(parse_message_log(&log, "s"), Err(CodeError::Store(_))));
    }

    #[tokio::test]
    async fn test_message_parts_survive_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).await.unwrap();
        let session = store.create_session("parts").await.unwrap();
        let msg = Message::tool_results(vec![Part::ToolResult {
            call_id: "c1".to_string(),
            content: "Operation cancelled".to_string(),
            is_error: true,
        }]);
        store.append_message(&session.id, &msg).await.unwrap();
        assert_eq!(store.list_messages(&session.id).await.unwrap(), vec![msg]);
    }

    #[tokio::test]
    async fn test_open_store_by_backend() {
        let memory = open_store(&StorageConfig {
            backend: StorageBackend::Memory,
            sessions_dir: None,
        })
        .await
        .unwrap();
        assert_eq!(memory.backend_name(), "memory");

        let dir = tempfile::tempdir().unwrap();
        let file = open_store(&StorageConfig {
            backend: StorageBackend::File,
            sessions_dir: Some(dir.path().join("sessions")),
        })
        .await
        .unwrap();
        assert_eq!(file.backend_name(), "file");
        file.create_session("x").await.unwrap();
        assert!(dir.path().join("sessions").is_dir());
    }
}
