//! Permission gate for mutating tools
//!
//! Gated tool calls park on a `oneshot` until a user decision arrives, the
//! run is cancelled, or the optional approval timeout fires. Requests and
//! resolutions are broadcast so any front-end can render and answer them.
//!
//! Bypasses, checked in order before a request is created:
//! - tools listed in `always_allow`
//! - sessions in auto-approve (yolo) mode
//! - session-scoped grants recorded by an earlier `ApprovalScope::Session`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{CodeError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Action to take when a request is not answered in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Deny,
    Approve,
}

/// Permission settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Tools that never prompt
    pub always_allow: Vec<String>,
    /// Resolve unanswered requests after this many seconds (`None` waits forever)
    pub approval_timeout_secs: Option<u64>,
    pub timeout_action: TimeoutAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Approve,
    Deny,
}

/// How long an approval lasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    /// This call only
    #[default]
    Once,
    /// This tool for the rest of the session
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Pending,
    Approved,
    Denied,
}

/// A pending ask for the user's consent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub call_id: String,
    /// Human-readable summary of what the tool is about to do
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub state: PermissionState,
}

/// Result of a permission check as seen by the agent loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    Approved,
    Denied { reason: Option<String> },
}

impl PermissionOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, PermissionOutcome::Approved)
    }
}

/// Broadcast to subscribers whenever the gate changes state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PermissionEvent {
    Requested(PermissionRequest),
    Resolved {
        request_id: String,
        session_id: String,
        tool_name: String,
        call_id: String,
        state: PermissionState,
        scope: ApprovalScope,
        /// Resolved by the approval timeout rather than a user
        timed_out: bool,
    },
    Cancelled {
        request_id: String,
        session_id: String,
    },
}

struct Resolution {
    decision: PermissionDecision,
    reason: Option<String>,
}

struct PendingRequest {
    request: PermissionRequest,
    response_tx: oneshot::Sender<Resolution>,
}

/// Gate shared by all sessions of one process
pub struct PermissionGate {
    config: PermissionConfig,
    pending: RwLock<HashMap<String, PendingRequest>>,
    auto_approve: RwLock<HashSet<String>>,
    /// session id -> tools granted for the session
    grants: RwLock<HashMap<String, HashSet<String>>>,
    event_tx: broadcast::Sender<PermissionEvent>,
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new(PermissionConfig::default())
    }
}

impl PermissionGate {
    pub fn new(config: PermissionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            pending: RwLock::new(HashMap::new()),
            auto_approve: RwLock::new(HashSet::new()),
            grants: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn config(&self) -> &PermissionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PermissionEvent> {
        self.event_tx.subscribe()
    }

    pub async fn set_auto_approve(&self, session_id: &str, enabled: bool) {
        let mut sessions = self.auto_approve.write().await;
        if enabled {
            sessions.insert(session_id.to_string());
        } else {
            sessions.remove(session_id);
        }
    }

    pub async fn is_auto_approved(&self, session_id: &str) -> bool {
        self.auto_approve.read().await.contains(session_id)
    }

    /// Whether a call would pass without asking
    pub async fn is_preapproved(&self, session_id: &str, tool_name: &str) -> bool {
        if self.config.always_allow.iter().any(|t| t == tool_name) {
            return true;
        }
        if self.is_auto_approved(session_id).await {
            return true;
        }
        self.grants
            .read()
            .await
            .get(session_id)
            .is_some_and(|tools| tools.contains(tool_name))
    }

    /// Ask for permission and wait for the answer.
    ///
    /// Returns `Err(CodeError::Cancelled)` when `cancel` fires first.
    pub async fn request(
        &self,
        session_id: &str,
        tool_name: &str,
        call_id: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<PermissionOutcome> {
        if self.is_preapproved(session_id, tool_name).await {
            tracing::debug!(session_id, tool_name, "Permission pre-approved");
            return Ok(PermissionOutcome::Approved);
        }
        if cancel.is_cancelled() {
            return Err(CodeError::Cancelled);
        }

        let request = PermissionRequest {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            call_id: call_id.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            state: PermissionState::Pending,
        };
        let request_id = request.id.clone();

        let (tx, mut rx) = oneshot::channel();
        self.pending.write().await.insert(
            request_id.clone(),
            PendingRequest {
                request: request.clone(),
                response_tx: tx,
            },
        );
        tracing::info!(session_id, tool_name, call_id, request_id = %request_id, "Permission requested");
        let _ = self.event_tx.send(PermissionEvent::Requested(request));

        let timeout = self.config.approval_timeout_secs.map(Duration::from_secs);
        let expired = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            resolution = &mut rx => match resolution {
                Ok(r) => Ok(Self::outcome(r)),
                // Sender dropped: the session was cleared underneath us
                Err(_) => Err(CodeError::Cancelled),
            },
            _ = cancel.cancelled() => {
                if self.pending.write().await.remove(&request_id).is_some() {
                    let _ = self.event_tx.send(PermissionEvent::Cancelled {
                        request_id,
                        session_id: session_id.to_string(),
                    });
                }
                Err(CodeError::Cancelled)
            }
            _ = expired => {
                let decision = match self.config.timeout_action {
                    TimeoutAction::Approve => PermissionDecision::Approve,
                    TimeoutAction::Deny => PermissionDecision::Deny,
                };
                if self.finish(&request_id, decision, ApprovalScope::Once, true, Some("approval timed out".to_string())).await {
                    tracing::warn!(session_id, tool_name, ?decision, "Permission request timed out");
                }
                // Either we resolved it just now or a user answer raced in
                match rx.await {
                    Ok(r) => Ok(Self::outcome(r)),
                    Err(_) => Err(CodeError::Cancelled),
                }
            }
        }
    }

    /// Answer a pending request. Returns `false` when the id is unknown or
    /// was already resolved.
    pub async fn resolve(
        &self,
        request_id: &str,
        decision: PermissionDecision,
        scope: ApprovalScope,
    ) -> bool {
        let reason = match decision {
            PermissionDecision::Approve => None,
            PermissionDecision::Deny => Some("denied by user".to_string()),
        };
        self.finish(request_id, decision, scope, false, reason).await
    }

    async fn finish(
        &self,
        request_id: &str,
        decision: PermissionDecision,
        scope: ApprovalScope,
        timed_out: bool,
        reason: Option<String>,
    ) -> bool {
        let Some(pending) = self.pending.write().await.remove(request_id) else {
            return false;
        };
        let request = pending.request;

        if decision == PermissionDecision::Approve && scope == ApprovalScope::Session {
            self.grants
                .write()
                .await
                .entry(request.session_id.clone())
                .or_default()
                .insert(request.tool_name.clone());
        }

        let state = match decision {
            PermissionDecision::Approve => PermissionState::Approved,
            PermissionDecision::Deny => PermissionState::Denied,
        };
        tracing::info!(
            session_id = %request.session_id,
            tool_name = %request.tool_name,
            request_id,
            ?state,
            ?scope,
            "Permission resolved"
        );
        let _ = self.event_tx.send(PermissionEvent::Resolved {
            request_id: request_id.to_string(),
            session_id: request.session_id,
            tool_name: request.tool_name,
            call_id: request.call_id,
            state,
            scope,
            timed_out,
        });
        let _ = pending.response_tx.send(Resolution { decision, reason });
        true
    }

    fn outcome(resolution: Resolution) -> PermissionOutcome {
        match resolution.decision {
            PermissionDecision::Approve => PermissionOutcome::Approved,
            PermissionDecision::Deny => PermissionOutcome::Denied {
                reason: resolution.reason,
            },
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Pending requests of one session, oldest first
    pub async fn pending_requests(&self, session_id: &str) -> Vec<PermissionRequest> {
        let mut requests: Vec<_> = self
            .pending
            .read()
            .await
            .values()
            .filter(|p| p.request.session_id == session_id)
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Forget everything about a session and abandon its pending requests
    pub async fn clear_session(&self, session_id: &str) {
        self.auto_approve.write().await.remove(session_id);
        self.grants.write().await.remove(session_id);

        let abandoned: Vec<String> = {
            let mut pending = self.pending.write().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.request.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                pending.remove(id);
            }
            ids
        };
        for request_id in abandoned {
            let _ = self.event_tx.send(PermissionEvent::Cancelled {
                request_id,
                session_id: session_id.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn next_request(rx: &mut broadcast::Receiver<PermissionEvent>) -> PermissionRequest {
        loop {
            if let PermissionEvent::Requested(r) = rx.recv().await.unwrap() {
                return r;
            }
        }
    }

    fn spawn_request(
        gate: &Arc<PermissionGate>,
        session: &str,
        tool: &str,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<PermissionOutcome>> {
        let gate = gate.clone();
        let session = session.to_string();
        let tool = tool.to_string();
        tokio::spawn(async move {
            gate.request(&session, &tool, "call-1", "run it", &cancel)
                .await
        })
    }

    #[tokio::test]
    async fn test_approve_once() {
        let gate = Arc::new(PermissionGate::default());
        let mut events = gate.subscribe();
        let handle = spawn_request(&gate, "s1", "bash", CancellationToken::new());

        let request = next_request(&mut events).await;
        assert_eq!(request.tool_name, "bash");
        assert_eq!(request.state, PermissionState::Pending);
        assert!(gate.resolve(&request.id, PermissionDecision::Approve, ApprovalScope::Once).await);

        assert_eq!(handle.await.unwrap().unwrap(), PermissionOutcome::Approved);
        assert_eq!(gate.pending_count().await, 0);
        // Once scope does not grant future calls
        assert!(!gate.is_preapproved("s1", "bash").await);
    }

    #[tokio::test]
    async fn test_deny_carries_reason() {
        let gate = Arc::new(PermissionGate::default());
        let mut events = gate.subscribe();
        let handle = spawn_request(&gate, "s1", "write", CancellationToken::new());

        let request = next_request(&mut events).await;
        gate.resolve(&request.id, PermissionDecision::Deny, ApprovalScope::Once).await;

        match handle.await.unwrap().unwrap() {
            PermissionOutcome::Denied { reason } => assert_eq!(reason.as_deref(), Some("denied by user")),
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_scope_grants_tool() {
        let gate = Arc::new(PermissionGate::default());
        let mut events = gate.subscribe();
        let handle = spawn_request(&gate, "s1", "bash", CancellationToken::new());

        let request = next_request(&mut events).await;
        gate.resolve(&request.id, PermissionDecision::Approve, ApprovalScope::Session).await;
        handle.await.unwrap().unwrap();

        // Second call for the same tool passes without a request
        let outcome = gate
            .request("s1", "bash", "call-2", "again", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_approved());
        assert_eq!(gate.pending_count().await, 0);

        // Other tools and other sessions still need asking
        assert!(!gate.is_preapproved("s1", "write").await);
        assert!(!gate.is_preapproved("s2", "bash").await);
    }

    #[tokio::test]
    async fn test_auto_approve_emits_nothing() {
        let gate = PermissionGate::default();
        let mut events = gate.subscribe();
        gate.set_auto_approve("s1", true).await;

        let outcome = gate
            .request("s1", "bash", "c", "ls", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_approved());
        assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

        gate.set_auto_approve("s1", false).await;
        assert!(!gate.is_auto_approved("s1").await);
    }

    #[tokio::test]
    async fn test_always_allow_config() {
        let gate = PermissionGate::new(PermissionConfig {
            always_allow: vec!["fetch".to_string()],
            ..Default::default()
        });
        assert!(gate.is_preapproved("any", "fetch").await);
        assert!(!gate.is_preapproved("any", "bash").await);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let gate = Arc::new(PermissionGate::default());
        let mut events = gate.subscribe();
        let handle = spawn_request(&gate, "s1", "edit", CancellationToken::new());

        let request = next_request(&mut events).await;
        assert!(gate.resolve(&request.id, PermissionDecision::Deny, ApprovalScope::Once).await);
        assert!(!gate.resolve(&request.id, PermissionDecision::Approve, ApprovalScope::Session).await);
        assert!(!gate.resolve("unknown", PermissionDecision::Approve, ApprovalScope::Once).await);

        // First decision stands
        assert!(!handle.await.unwrap().unwrap().is_approved());
        assert!(!gate.is_preapproved("s1", "edit").await);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let gate = Arc::new(PermissionGate::default());
        let mut events = gate.subscribe();
        let cancel = CancellationToken::new();
        let handle = spawn_request(&gate, "s1", "bash", cancel.clone());

        let request = next_request(&mut events).await;
        cancel.cancel();

        assert!(matches!(handle.await.unwrap(), Err(CodeError::Cancelled)));
        assert_eq!(gate.pending_count().await, 0);
        assert!(!gate.resolve(&request.id, PermissionDecision::Approve, ApprovalScope::Once).await);
        match events.recv().await.unwrap() {
            PermissionEvent::Cancelled { request_id, .. } => assert_eq!(request_id, request.id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_already_cancelled_token() {
        let gate = PermissionGate::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = gate.request("s1", "bash", "c", "x", &cancel).await;
        assert!(matches!(result, Err(CodeError::Cancelled)));
        assert_eq!(gate.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_action() {
        let gate = PermissionGate::new(PermissionConfig {
            approval_timeout_secs: Some(5),
            timeout_action: TimeoutAction::Deny,
            ..Default::default()
        });
        let outcome = gate
            .request("s1", "bash", "c", "x", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PermissionOutcome::Denied {
                reason: Some("approval timed out".to_string())
            }
        );

        let approving = PermissionGate::new(PermissionConfig {
            approval_timeout_secs: Some(5),
            timeout_action: TimeoutAction::Approve,
            ..Default::default()
        });
        let outcome = approving
            .request("s1", "bash", "c", "x", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_approved());
    }

    #[tokio::test]
    async fn test_clear_session_abandons_pending() {
        let gate = Arc::new(PermissionGate::default());
        let mut events = gate.subscribe();
        gate.set_auto_approve("other", true).await;
        let handle = spawn_request(&gate, "s1", "bash", CancellationToken::new());
        let request = next_request(&mut events).await;

        assert_eq!(gate.pending_requests("s1").await.len(), 1);
        gate.clear_session("s1").await;

        assert!(matches!(handle.await.unwrap(), Err(CodeError::Cancelled)));
        assert!(!gate.resolve(&request.id, PermissionDecision::Approve, ApprovalScope::Once).await);
        assert!(gate.is_auto_approved("other").await);
    }
}
