//! Session management
//!
//! Owns the shared pieces (provider client, tool registry, permission gate,
//! store) and starts runs against them. At most one run is active per
//! session; each run gets its own task, event channel and cancel token.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentConfig, AgentEvent, AgentLoop, Attachment, RunContext, RunOutcome, RunState};
use crate::config::CodeConfig;
use crate::error::{CodeError, Result};
use crate::llm::{self, LlmClient, Message};
use crate::permission::PermissionGate;
use crate::store::{self, Session, SessionStore};
use crate::todo::{TodoItem, TodoState};
use crate::tools::{ToolContext, ToolRegistry};

/// Capacity of a run's event channel
const EVENT_BUFFER: usize = 256;

/// Session titles derived from the first prompt are cut to this many chars
const MAX_TITLE_CHARS: usize = 60;

struct ActiveRun {
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
}

/// Handle to a run in progress
pub struct RunHandle {
    pub session_id: String,
    events: mpsc::Receiver<AgentEvent>,
    handle: JoinHandle<Result<RunOutcome>>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Next event, or `None` once the run has finished emitting
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish. Undelivered events are discarded.
    pub async fn wait(self) -> Result<RunOutcome> {
        drop(self.events);
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(CodeError::Cancelled),
            Err(e) => Err(CodeError::Internal(format!("run task failed: {}", e))),
        }
    }
}

/// Session manager
pub struct SessionManager {
    agent: Arc<AgentLoop>,
    store: Arc<dyn SessionStore>,
    gate: Arc<PermissionGate>,
    workspace: PathBuf,
    /// Live todo state per session, seeded from the session record
    todos: RwLock<HashMap<String, TodoState>>,
    active: Arc<RwLock<HashMap<String, ActiveRun>>>,
}

impl SessionManager {
    pub fn new(
        client: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        store: Arc<dyn SessionStore>,
        config: AgentConfig,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        let agent = AgentLoop::new(client, registry, gate.clone(), store.clone(), config);
        let workspace = workspace.into();
        let workspace = workspace.canonicalize().unwrap_or(workspace);
        Self {
            agent: Arc::new(agent),
            store,
            gate,
            workspace,
            todos: RwLock::new(HashMap::new()),
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Wire everything from a loaded configuration
    pub async fn from_config(
        config: &CodeConfig,
        provider: Option<&str>,
        model: Option<&str>,
        workspace: &Path,
    ) -> Result<Self> {
        let provider = config.select_provider(provider)?;
        let llm_config = config.to_llm_config(&provider, model)?;
        tracing::info!(
            provider = %llm_config.provider,
            model = %llm_config.model,
            "Using LLM provider"
        );
        let client = llm::create_client(llm_config);

        let store = store::open_store(&config.storage).await?;

        let agent_config = AgentConfig::from_settings(&config.agent, &config.continuation)
            .with_pricing(provider.pricing);
        Ok(Self::new(
            client,
            Arc::new(ToolRegistry::builtin()),
            Arc::new(PermissionGate::new(config.permissions.clone())),
            store,
            agent_config,
            workspace,
        ))
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn model(&self) -> &str {
        self.agent.client().model()
    }

    pub async fn create_session(&self, title: &str) -> Result<Session> {
        let session = self.store.create_session(title).await?;
        tracing::info!(session_id = %session.id, "Created session");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| CodeError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.store.list_sessions().await
    }

    pub async fn messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.get_session(session_id).await?;
        self.store.list_messages(session_id).await
    }

    /// Current todo list, live if the session has run in this process
    pub async fn todos(&self, session_id: &str) -> Result<Vec<TodoItem>> {
        let session = self.get_session(session_id).await?;
        Ok(self.todo_state(&session).await.todos().await)
    }

    /// Delete a session, cancelling its run first
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.cancel(session_id).await;
        self.gate.clear_session(session_id).await;
        self.todos.write().await.remove(session_id);
        let deleted = self.store.delete_session(session_id).await?;
        if deleted {
            tracing::info!(session_id, "Deleted session");
        }
        Ok(deleted)
    }

    /// Toggle auto-approve for gated tools, persisted on the session
    pub async fn set_auto_approve(&self, session_id: &str, enabled: bool) -> Result<()> {
        let mut session = self.get_session(session_id).await?;
        session.auto_approve = enabled;
        session.touch();
        self.store.update_session(&session).await?;
        self.gate.set_auto_approve(session_id, enabled).await;
        Ok(())
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.active.read().await.contains_key(session_id)
    }

    /// State of the session's run; `Idle` when nothing is running
    pub async fn run_state(&self, session_id: &str) -> RunState {
        self.active
            .read()
            .await
            .get(session_id)
            .map(|run| *run.state.borrow())
            .unwrap_or_default()
    }

    /// Start a run for `prompt`. Fails with [`CodeError::AgentBusy`] while
    /// another run of the same session is active.
    pub async fn run(
        &self,
        session_id: &str,
        prompt: &str,
        attachments: Vec<Attachment>,
    ) -> Result<RunHandle> {
        let mut session = self.get_session(session_id).await?;
        let todos = self.todo_state(&session).await;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let tool_ctx = ToolContext::with_canonical_workspace(self.workspace.clone(), session_id)
            .with_cancel(cancel.clone())
            .with_todos(todos);
        let run = RunContext::new(tool_ctx, tx);

        {
            let mut active = self.active.write().await;
            if active.contains_key(session_id) {
                return Err(CodeError::AgentBusy(session_id.to_string()));
            }
            active.insert(
                session_id.to_string(),
                ActiveRun {
                    cancel: cancel.clone(),
                    state: run.subscribe_state(),
                },
            );
        }

        if session.title.trim().is_empty() {
            session.title = title_from_prompt(prompt);
            session.touch();
            if let Err(e) = self.store.update_session(&session).await {
                self.active.write().await.remove(session_id);
                return Err(e);
            }
        }
        // A persisted flag enables the gate; a process-only grant is left alone
        if session.auto_approve {
            self.gate.set_auto_approve(session_id, true).await;
        }

        let agent = self.agent.clone();
        let active = self.active.clone();
        let id = session_id.to_string();
        let prompt = prompt.to_string();
        let handle = tokio::spawn(async move {
            let result = agent.execute(&run, &prompt, &attachments).await;
            active.write().await.remove(&id);
            result
        });

        Ok(RunHandle {
            session_id: session_id.to_string(),
            events: rx,
            handle,
            cancel,
        })
    }

    /// Cancel the session's active run. Returns `false` if none is active.
    pub async fn cancel(&self, session_id: &str) -> bool {
        match self.active.read().await.get(session_id) {
            Some(run) => {
                tracing::info!(session_id, "Cancelling run");
                run.cancel.cancel();
                true
            }
            None => {
                tracing::debug!(session_id, "No active run to cancel");
                false
            }
        }
    }

    async fn todo_state(&self, session: &Session) -> TodoState {
        if let Some(state) = self.todos.read().await.get(&session.id) {
            return state.clone();
        }
        self.todos
            .write()
            .await
            .entry(session.id.clone())
            .or_insert_with(|| {
                TodoState::from_parts(session.todos.clone(), session.continuation_count)
            })
            .clone()
    }
}

fn title_from_prompt(prompt: &str) -> String {
    let line = prompt.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let mut title: String = line.chars().take(MAX_TITLE_CHARS).collect();
    if line.chars().count() > MAX_TITLE_CHARS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::{MockLlmClient, MockStep};
    use crate::llm::{StreamEvent, ToolCall};
    use crate::store::{FileSessionStore, MemorySessionStore};
    use crate::todo::TodoStatus;
    use serde_json::json;

    fn manager(
        steps: Vec<MockStep>,
        store: Arc<dyn SessionStore>,
        workspace: &Path,
    ) -> SessionManager {
        SessionManager::new(
            Arc::new(MockLlmClient::new(steps)),
            Arc::new(ToolRegistry::builtin()),
            Arc::new(PermissionGate::default()),
            store,
            AgentConfig::default(),
            workspace,
        )
    }

    #[test]
    fn test_title_from_prompt() {
        assert_eq!(title_from_prompt("\n  fix the parser \nthen tests"), "fix the parser");
        let long = "x".repeat(80);
        assert_eq!(title_from_prompt(&long).chars().count(), MAX_TITLE_CHARS + 3);
        assert_eq!(title_from_prompt(""), "");
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(
            vec![MockLlmClient::text("hi")],
            Arc::new(MemorySessionStore::new()),
            dir.path(),
        );
        let session = mgr.create_session("").await.unwrap();

        let mut handle = mgr.run(&session.id, "say hi\nplease", Vec::new()).await.unwrap();
        let mut saw_end = false;
        while let Some(event) = handle.next_event().await {
            if let AgentEvent::RunEnd { state, .. } = event {
                assert_eq!(state, RunState::Completed);
                saw_end = true;
            }
        }
        assert!(saw_end);
        assert_eq!(handle.wait().await.unwrap().text, "hi");

        assert!(!mgr.is_running(&session.id).await);
        assert_eq!(mgr.run_state(&session.id).await, RunState::Idle);
        let stored = mgr.get_session(&session.id).await.unwrap();
        assert_eq!(stored.title, "say hi");
        assert_eq!(stored.usage.total_tokens, 15);
        assert_eq!(mgr.messages(&session.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_run_is_busy_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(
            vec![
                MockStep::Stall(vec![StreamEvent::TextDelta("thinking".to_string())]),
                MockLlmClient::text("fresh"),
            ],
            Arc::new(MemorySessionStore::new()),
            dir.path(),
        );
        let session = mgr.create_session("busy").await.unwrap();

        let mut first = mgr.run(&session.id, "one", Vec::new()).await.unwrap();
        assert!(mgr.is_running(&session.id).await);
        let err = mgr.run(&session.id, "two", Vec::new()).await.err().unwrap();
        assert!(matches!(err, CodeError::AgentBusy(ref id) if *id == session.id));

        // Wait until streaming has started, then cancel
        while let Some(event) = first.next_event().await {
            if matches!(event, AgentEvent::TextDelta { .. }) {
                break;
            }
        }
        assert!(mgr.cancel(&session.id).await);
        assert!(matches!(first.wait().await, Err(CodeError::Cancelled)));
        assert!(!mgr.cancel(&session.id).await);

        let second = mgr.run(&session.id, "three", Vec::new()).await.unwrap();
        assert_eq!(second.wait().await.unwrap().text, "fresh");

        // Partial text from the cancelled run stays in history
        let texts: Vec<String> = mgr
            .messages(&session.id)
            .await
            .unwrap()
            .iter()
            .map(Message::text)
            .collect();
        assert_eq!(texts, vec!["one", "thinking", "three", "fresh"]);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(Vec::new(), Arc::new(MemorySessionStore::new()), dir.path());
        let err = mgr.run("missing", "hi", Vec::new()).await.err().unwrap();
        assert!(matches!(err, CodeError::SessionNotFound(_)));
        assert!(!mgr.is_running("missing").await);
    }

    #[tokio::test]
    async fn test_todos_survive_restart() {
        let workspace = tempfile::tempdir().unwrap();
        let sessions = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> =
            Arc::new(FileSessionStore::new(sessions.path()).await.unwrap());
        let mgr = manager(
            vec![
                MockLlmClient::tools(vec![ToolCall::new(
                    "t1",
                    "todo_write",
                    json!({"todos": [{"id": "1", "content": "ship", "status": "completed"}]}),
                )]),
                MockLlmClient::text("done"),
            ],
            store,
            workspace.path(),
        );
        let session = mgr.create_session("todos").await.unwrap();
        mgr.run(&session.id, "plan", Vec::new())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        drop(mgr);

        let store: Arc<dyn SessionStore> =
            Arc::new(FileSessionStore::new(sessions.path()).await.unwrap());
        let reopened = manager(Vec::new(), store, workspace.path());
        let todos = reopened.todos(&session.id).await.unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].status, TodoStatus::Completed);
        assert_eq!(reopened.messages(&session.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_auto_approve_persisted_and_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(Vec::new(), Arc::new(MemorySessionStore::new()), dir.path());
        let session = mgr.create_session("yolo").await.unwrap();

        mgr.set_auto_approve(&session.id, true).await.unwrap();
        assert!(mgr.get_session(&session.id).await.unwrap().auto_approve);
        assert!(mgr.gate().is_auto_approved(&session.id).await);
    }

    #[tokio::test]
    async fn test_gate_only_auto_approve_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(
            vec![
                MockLlmClient::tools(vec![ToolCall::new(
                    "w1",
                    "write",
                    json!({"path": "out.txt", "content": "x"}),
                )]),
                MockLlmClient::text("written"),
            ],
            Arc::new(MemorySessionStore::new()),
            dir.path(),
        );
        let session = mgr.create_session("one-shot").await.unwrap();

        mgr.gate().set_auto_approve(&session.id, true).await;
        let outcome = mgr
            .run(&session.id, "write it", Vec::new())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.text, "written");
        assert!(dir.path().join("out.txt").exists());
        assert!(!mgr.get_session(&session.id).await.unwrap().auto_approve);
    }

    #[tokio::test]
    async fn test_workspace_canonicalized_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mgr = manager(
            Vec::new(),
            Arc::new(MemorySessionStore::new()),
            &dir.path().join("sub").join(".."),
        );
        assert_eq!(mgr.workspace().to_path_buf(), dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_delete_session() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(Vec::new(), Arc::new(MemorySessionStore::new()), dir.path());
        let session = mgr.create_session("gone").await.unwrap();

        assert!(mgr.delete_session(&session.id).await.unwrap());
        assert!(!mgr.delete_session(&session.id).await.unwrap());
        assert!(matches!(
            mgr.get_session(&session.id).await,
            Err(CodeError::SessionNotFound(_))
        ));
    }
}
