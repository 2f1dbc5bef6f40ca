//! Agent loop
//!
//! Turns one user prompt into as many provider round-trips as it takes:
//!
//! ```text
//! append user message
//! loop:
//!   stream round-trip (text deltas, tool calls)
//!   tool calls queued?  -> gate + execute, append results in request order, loop
//!   stop                -> continuation? append directive, loop : Completed
//!   length / error      -> Failed
//! ```
//!
//! Every message is persisted through the [`SessionStore`] as soon as it is
//! complete, so a cancelled or failed run leaves a replayable history: each
//! recorded tool call is answered by exactly one tool result.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::config::AgentSettings;
use crate::continuation::{AgentKind, ContinuationConfig, ContinuationController};
use crate::error::{CodeError, ProviderErrorKind, Result};
use crate::llm::{
    ChatRequest, FinishReason, LlmClient, Message, Part, StreamEvent, TokenUsage, ToolArguments,
    ToolCall, ToolDefinition,
};
use crate::permission::{PermissionGate, PermissionOutcome};
use crate::prompts;
use crate::store::SessionStore;
use crate::telemetry::{self, ModelPricing};
use crate::todo::TodoItem;
use crate::tools::{ToolContext, ToolRegistry};

/// Maximum number of provider round-trips per run
const MAX_TOOL_ROUNDS: usize = 50;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Replaces the built-in system prompt
    pub system_prompt: Option<String>,
    pub max_tool_rounds: usize,
    pub provider_timeout: Option<Duration>,
    pub tool_timeout: Option<Duration>,
    pub kind: AgentKind,
    pub continuation: ContinuationConfig,
    /// Overrides the built-in price table for the active model
    pub pricing: Option<ModelPricing>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_tool_rounds: MAX_TOOL_ROUNDS,
            provider_timeout: None,
            tool_timeout: None,
            kind: AgentKind::Coder,
            continuation: ContinuationConfig::default(),
            pricing: None,
        }
    }
}

impl AgentConfig {
    pub fn from_settings(settings: &AgentSettings, continuation: &ContinuationConfig) -> Self {
        Self {
            system_prompt: settings.system_prompt.clone(),
            max_tool_rounds: settings.max_tool_rounds.max(1),
            provider_timeout: settings.provider_timeout_secs.map(Duration::from_secs),
            tool_timeout: settings.tool_timeout_secs.map(Duration::from_secs),
            continuation: continuation.clone(),
            ..Default::default()
        }
    }

    pub fn with_pricing(mut self, pricing: Option<ModelPricing>) -> Self {
        self.pricing = pricing;
        self
    }
}

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    WaitingOnTools,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Running | RunState::WaitingOnTools)
    }
}

/// Events emitted during a run, in order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    RunStart {
        session_id: String,
        prompt: String,
    },
    RoundStart {
        round: usize,
    },
    TextDelta {
        text: String,
    },
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallArgsDelta {
        id: String,
        fragment: String,
    },
    /// Arguments are fully reconstructed; `error` is set when they never
    /// formed valid JSON
    ToolCallComplete {
        id: String,
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    PermissionDenied {
        call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Usage {
        usage: TokenUsage,
        cost_usd: f64,
    },
    RoundEnd {
        round: usize,
        finish_reason: FinishReason,
    },
    /// A continuation directive was injected
    Continuation {
        count: u32,
        prompt: String,
    },
    TodosUpdated {
        todos: Vec<TodoItem>,
    },
    RunEnd {
        state: RunState,
        text: String,
        usage: TokenUsage,
        cost_usd: f64,
    },
    Error {
        code: String,
        message: String,
    },
}

/// A text file rendered into the user message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content: String,
}

impl Attachment {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            CodeError::InvalidArguments {
                tool: "attachment".to_string(),
                reason: format!("cannot read {}: {}", path.display(), e),
            }
        })?;
        Ok(Self::new(path.display().to_string(), content))
    }

    fn to_part(&self) -> Part {
        Part::Text {
            text: format!(
                "<attachment name=\"{}\">\n{}\n</attachment>",
                self.name,
                self.content.trim_end()
            ),
        }
    }
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub final_message: Message,
    pub text: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub rounds: usize,
    pub continuations: u32,
}

/// Per-run plumbing: the tool context (session, workspace, cancel token,
/// todos), the event channel and the observable run state.
pub struct RunContext {
    pub tool_ctx: ToolContext,
    events: mpsc::Sender<AgentEvent>,
    state: watch::Sender<RunState>,
}

impl RunContext {
    pub fn new(tool_ctx: ToolContext, events: mpsc::Sender<AgentEvent>) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            tool_ctx,
            events,
            state,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.tool_ctx.session_id
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn transition(&self, next: RunState) {
        tracing::debug!(session_id = %self.tool_ctx.session_id, state = ?next, "Run state");
        self.state.send_replace(next);
    }

    async fn emit(&self, event: AgentEvent) {
        self.events.send(event).await.ok();
    }
}

#[derive(Debug, Default)]
struct RunStats {
    usage: TokenUsage,
    cost_usd: f64,
    rounds: usize,
    continuations: u32,
}

/// How a round-trip ended
enum Ending {
    Finished {
        reason: FinishReason,
        detail: Option<String>,
    },
    /// Cancelled, timed out, or the stream broke before `Done`
    Interrupted(CodeError),
}

struct Round {
    message: Message,
    calls: Vec<ToolCall>,
    usage: TokenUsage,
    end: Ending,
}

struct CallResult {
    part: Part,
    cancelled: bool,
}

/// Agent loop executor
pub struct AgentLoop {
    client: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    store: Arc<dyn SessionStore>,
    controller: ContinuationController,
    config: AgentConfig,
}

impl AgentLoop {
    pub fn new(
        client: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        store: Arc<dyn SessionStore>,
        config: AgentConfig,
    ) -> Self {
        let controller = ContinuationController::new(config.continuation.clone(), config.kind);
        Self {
            client,
            registry,
            gate,
            store,
            controller,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    /// Run one user prompt to a terminal state.
    ///
    /// Usage, cost and todo state are written back to the session record
    /// whatever the outcome.
    pub async fn execute(
        &self,
        run: &RunContext,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<RunOutcome> {
        let span = tracing::info_span!(
            telemetry::SPAN_AGENT_EXECUTE,
            a3s.session.id = %run.session_id(),
            a3s.agent.tool_calls_count = tracing::field::Empty,
            a3s.llm.total_tokens = tracing::field::Empty,
        );
        self.execute_in_span(run, prompt, attachments)
            .instrument(span)
            .await
    }

    async fn execute_in_span(
        &self,
        run: &RunContext,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<RunOutcome> {
        let mut stats = RunStats::default();
        run.transition(RunState::Running);
        run.emit(AgentEvent::RunStart {
            session_id: run.session_id().to_string(),
            prompt: prompt.to_string(),
        })
        .await;

        let result = self.execute_loop(run, prompt, attachments, &mut stats).await;

        if let Err(e) = self.record_session(run, &stats).await {
            tracing::warn!(session_id = %run.session_id(), "Failed to update session record: {}", e);
        }
        tracing::Span::current().record(telemetry::ATTR_LLM_TOTAL_TOKENS, stats.usage.total_tokens as i64);

        let (state, text) = match &result {
            Ok(outcome) => (RunState::Completed, outcome.text.clone()),
            Err(CodeError::Cancelled) => (RunState::Cancelled, String::new()),
            Err(_) => (RunState::Failed, String::new()),
        };
        if let Err(e) = &result {
            tracing::info!(session_id = %run.session_id(), error = %e, "Run ended with error");
            run.emit(AgentEvent::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            })
            .await;
        }
        run.transition(state);
        run.emit(AgentEvent::RunEnd {
            state,
            text,
            usage: stats.usage,
            cost_usd: stats.cost_usd,
        })
        .await;
        result
    }

    async fn execute_loop(
        &self,
        run: &RunContext,
        prompt: &str,
        attachments: &[Attachment],
        stats: &mut RunStats,
    ) -> Result<RunOutcome> {
        let ctx = &run.tool_ctx;
        let session_id = ctx.session_id.as_str();

        // A fresh user prompt restarts the continuation budget
        self.controller.reset(&ctx.todos).await;

        let mut history = self.store.list_messages(session_id).await?;
        let mut user = Message::user(prompt);
        user.parts.extend(attachments.iter().map(Attachment::to_part));
        self.commit(session_id, &mut history, user).await?;

        let system = match &self.config.system_prompt {
            Some(prompt) => prompt.clone(),
            None => prompts::system_prompt(&ctx.workspace.display().to_string()),
        };
        let tools = self.registry.definitions();
        let mut tool_calls_count = 0usize;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(CodeError::Cancelled);
            }
            if stats.rounds >= self.config.max_tool_rounds {
                return Err(CodeError::MaxRoundsExceeded(self.config.max_tool_rounds));
            }
            stats.rounds += 1;
            let round = stats.rounds;

            let turn_span = tracing::info_span!(
                telemetry::SPAN_AGENT_TURN,
                a3s.agent.turn_number = round as i64,
                a3s.llm.total_tokens = tracing::field::Empty,
            );
            run.transition(RunState::Running);
            run.emit(AgentEvent::RoundStart { round }).await;
            tracing::info!(
                round,
                max_rounds = self.config.max_tool_rounds,
                "Agent round started"
            );

            let reminder = self.controller.todo_reminder(session_id, &ctx.todos).await;
            let llm_span = tracing::info_span!(
                parent: &turn_span,
                telemetry::SPAN_LLM_COMPLETION,
                a3s.llm.provider = self.client.provider(),
                a3s.llm.model = self.client.model(),
                a3s.llm.prompt_tokens = tracing::field::Empty,
                a3s.llm.completion_tokens = tracing::field::Empty,
                a3s.llm.total_tokens = tracing::field::Empty,
                a3s.llm.stop_reason = tracing::field::Empty,
            );
            let outcome = self
                .stream_round(run, &history, &tools, &system, reminder.as_deref())
                .instrument(llm_span)
                .await;
            let Round {
                mut message,
                calls,
                usage,
                end,
            } = match outcome {
                Ok(round) => round,
                Err(e) => {
                    tracing::warn!(round, "Provider request failed: {}", e);
                    return Err(e);
                }
            };

            turn_span.record(telemetry::ATTR_LLM_TOTAL_TOKENS, usage.total_tokens as i64);
            let cost = telemetry::cost_for(self.client.model(), &usage, self.config.pricing.as_ref());
            stats.usage.add(&usage);
            stats.cost_usd += cost;
            if usage != TokenUsage::default() {
                run.emit(AgentEvent::Usage {
                    usage,
                    cost_usd: cost,
                })
                .await;
            }

            let (reason, detail) = match end {
                Ending::Interrupted(err) => {
                    // Keep what was streamed and answer every recorded call
                    if !message.is_empty() {
                        self.commit(session_id, &mut history, message).await?;
                    }
                    if !calls.is_empty() {
                        let content = err.to_string();
                        let parts = calls
                            .iter()
                            .map(|call| error_result(&call.id, &content))
                            .collect();
                        self.commit(session_id, &mut history, Message::tool_results(parts))
                            .await?;
                    }
                    return Err(err);
                }
                Ending::Finished { reason, detail } => (reason, detail),
            };

            message.finish_reason = Some(reason);
            let final_message = message.clone();
            self.commit(session_id, &mut history, message).await?;
            run.emit(AgentEvent::RoundEnd {
                round,
                finish_reason: reason,
            })
            .await;

            if !calls.is_empty() {
                tool_calls_count += calls.len();
                tracing::Span::current()
                    .record(telemetry::ATTR_TOOL_CALLS_COUNT, tool_calls_count as i64);
                run.transition(RunState::WaitingOnTools);
                let results = self
                    .execute_calls(run, &calls)
                    .instrument(turn_span)
                    .await;
                let cancelled = results.iter().any(|r| r.cancelled);
                let parts = results.into_iter().map(|r| r.part).collect();
                self.commit(session_id, &mut history, Message::tool_results(parts))
                    .await?;
                if cancelled || ctx.cancel.is_cancelled() {
                    return Err(CodeError::Cancelled);
                }
                continue;
            }

            match reason {
                FinishReason::Stop | FinishReason::ToolUse => {
                    if reason == FinishReason::ToolUse {
                        tracing::warn!(round, "Model finished with tool_use but requested no tools");
                    }
                    if self
                        .controller
                        .should_continue(session_id, &ctx.todos, FinishReason::Stop, &ctx.cancel)
                        .await
                    {
                        let count = self.controller.increment(&ctx.todos).await;
                        let directive = self
                            .controller
                            .build_continuation_prompt(session_id, &ctx.todos)
                            .await;
                        stats.continuations = count;
                        tracing::info!(session_id, count, "Injecting todo continuation");
                        run.emit(AgentEvent::Continuation {
                            count,
                            prompt: directive.clone(),
                        })
                        .await;
                        self.commit(session_id, &mut history, Message::user(&directive))
                            .await?;
                        continue;
                    }

                    self.controller.reset(&ctx.todos).await;
                    tracing::info!(
                        rounds = stats.rounds,
                        tool_calls_count,
                        total_tokens = stats.usage.total_tokens,
                        "Agent run completed"
                    );
                    return Ok(RunOutcome {
                        text: final_message.text(),
                        final_message,
                        usage: stats.usage,
                        cost_usd: stats.cost_usd,
                        rounds: stats.rounds,
                        continuations: stats.continuations,
                    });
                }
                FinishReason::Length | FinishReason::Error => {
                    return Err(CodeError::AbnormalFinish {
                        reason,
                        detail: detail.unwrap_or_else(|| reason.to_string()),
                    });
                }
            }
        }
    }

    /// One streaming round-trip. Request-level failures are errors; anything
    /// that goes wrong after streaming began is reported as
    /// [`Ending::Interrupted`] alongside the partial message.
    async fn stream_round(
        &self,
        run: &RunContext,
        history: &[Message],
        tools: &[ToolDefinition],
        system: &str,
        reminder: Option<&str>,
    ) -> Result<Round> {
        let ctx = &run.tool_ctx;
        let round_cancel = ctx.cancel.child_token();
        let request = ChatRequest {
            messages: history,
            tools,
            system: Some(system),
            reminder,
        };

        let limit = self.config.provider_timeout;
        let expired = async move {
            match limit {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);
        let timeout_error = || {
            CodeError::Timeout(format!(
                "provider round-trip exceeded {:?}",
                limit.unwrap_or_default()
            ))
        };

        let mut round = Round {
            message: Message::assistant(),
            calls: Vec::new(),
            usage: TokenUsage::default(),
            end: Ending::Interrupted(CodeError::Cancelled),
        };

        let started = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            _ = &mut expired => {
                round_cancel.cancel();
                round.end = Ending::Interrupted(timeout_error());
                return Ok(round);
            }
            rx = self.client.stream(request, round_cancel.clone()) => Some(rx?),
        };
        let Some(mut rx) = started else {
            round_cancel.cancel();
            return Ok(round);
        };

        round.end = loop {
            let event = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    round_cancel.cancel();
                    break Ending::Interrupted(CodeError::Cancelled);
                }
                _ = &mut expired => {
                    round_cancel.cancel();
                    break Ending::Interrupted(timeout_error());
                }
                event = rx.recv() => event,
            };

            match event {
                Some(StreamEvent::TextDelta(text)) => {
                    round.message.push_text(&text);
                    run.emit(AgentEvent::TextDelta { text }).await;
                }
                Some(StreamEvent::ToolCallStart { id, name }) => {
                    run.emit(AgentEvent::ToolCallStart { id, name }).await;
                }
                Some(StreamEvent::ToolCallArgsDelta { id, fragment }) => {
                    run.emit(AgentEvent::ToolCallArgsDelta { id, fragment }).await;
                }
                Some(StreamEvent::ToolCallComplete(call)) => {
                    let (input, error) = match &call.arguments {
                        ToolArguments::Parsed(value) => (value.clone(), None),
                        ToolArguments::Malformed { error } => (Value::Null, Some(error.clone())),
                    };
                    round.message.parts.push(call.to_part());
                    run.emit(AgentEvent::ToolCallComplete {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input,
                        error,
                    })
                    .await;
                    round.calls.push(call);
                }
                // Providers report a running total; the last one wins
                Some(StreamEvent::Usage(usage)) => round.usage = usage,
                Some(StreamEvent::Done { reason, detail }) => {
                    break Ending::Finished { reason, detail };
                }
                None => {
                    break Ending::Interrupted(CodeError::Provider {
                        status: None,
                        kind: ProviderErrorKind::Stream,
                        message: "stream ended without a finish event".to_string(),
                    });
                }
            }
        };

        let stop_reason = match &round.end {
            Ending::Finished { reason, .. } => Some(reason.as_str()),
            Ending::Interrupted(_) => None,
        };
        telemetry::record_llm_usage(&round.usage, stop_reason);
        Ok(round)
    }

    /// Execute queued calls and return one result per call, in request order.
    ///
    /// Runs of consecutive ungated calls execute concurrently; gated calls
    /// wait for permission one at a time. Once the run is cancelled the
    /// remaining calls are answered without executing.
    async fn execute_calls(&self, run: &RunContext, calls: &[ToolCall]) -> Vec<CallResult> {
        let ctx = &run.tool_ctx;
        let mut results = Vec::with_capacity(calls.len());
        let mut i = 0;
        while i < calls.len() {
            if ctx.cancel.is_cancelled() {
                break;
            }
            if self.is_gated(&calls[i]) {
                results.push(self.execute_gated(run, &calls[i]).await);
                i += 1;
                continue;
            }
            let end = calls[i..]
                .iter()
                .position(|call| self.is_gated(call))
                .map_or(calls.len(), |offset| i + offset);
            let batch = join_all(calls[i..end].iter().map(|call| self.execute_call(run, call))).await;
            results.extend(batch);
            i = end;
        }

        for call in &calls[results.len()..] {
            let part = error_result(&call.id, &CodeError::Cancelled.to_string());
            run.emit(result_event(call, &part)).await;
            results.push(CallResult {
                part,
                cancelled: true,
            });
        }
        results
    }

    fn is_gated(&self, call: &ToolCall) -> bool {
        matches!(call.arguments, ToolArguments::Parsed(_))
            && self.registry.requires_permission(&call.name)
    }

    async fn execute_gated(&self, run: &RunContext, call: &ToolCall) -> CallResult {
        let ctx = &run.tool_ctx;
        let args = match &call.arguments {
            ToolArguments::Parsed(args) => args,
            ToolArguments::Malformed { .. } => return self.execute_call(run, call).await,
        };
        let description = self.registry.summarize(&call.name, args);
        let outcome = self
            .gate
            .request(&ctx.session_id, &call.name, &call.id, &description, &ctx.cancel)
            .await;

        let content = match outcome {
            Ok(PermissionOutcome::Approved) => return self.execute_call(run, call).await,
            Ok(PermissionOutcome::Denied { reason }) => {
                tracing::info!(tool_name = %call.name, call_id = %call.id, "Tool call denied");
                run.emit(AgentEvent::PermissionDenied {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    reason: reason.clone(),
                })
                .await;
                CodeError::PermissionDenied {
                    tool: call.name.clone(),
                    reason,
                }
                .to_string()
            }
            Err(e) => e.to_string(),
        };
        let cancelled = ctx.cancel.is_cancelled();
        let part = error_result(&call.id, &content);
        run.emit(result_event(call, &part)).await;
        CallResult { part, cancelled }
    }

    async fn execute_call(&self, run: &RunContext, call: &ToolCall) -> CallResult {
        let ctx = &run.tool_ctx;
        let args = match &call.arguments {
            ToolArguments::Parsed(args) => args,
            ToolArguments::Malformed { error } => {
                tracing::warn!(tool_name = %call.name, call_id = %call.id, "Malformed tool arguments from model");
                let err = CodeError::MalformedToolCall {
                    call_id: call.id.clone(),
                    error: error.clone(),
                };
                let part = error_result(&call.id, &err.to_string());
                run.emit(result_event(call, &part)).await;
                return CallResult {
                    part,
                    cancelled: false,
                };
            }
        };

        let tool_cancel = ctx.cancel.child_token();
        let tool_ctx = ctx.clone().with_cancel(tool_cancel.clone());
        let execution = self.registry.execute(&call.name, args, &tool_ctx);
        let result = match self.config.tool_timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(result) => result,
                Err(_) => {
                    tool_cancel.cancel();
                    Err(CodeError::Timeout(format!(
                        "tool '{}' did not finish within {:?}",
                        call.name, limit
                    )))
                }
            },
            None => execution.await,
        };

        let (part, cancelled) = match result {
            Ok(output) => (
                Part::ToolResult {
                    call_id: call.id.clone(),
                    content: output.content,
                    is_error: output.is_error,
                },
                false,
            ),
            Err(CodeError::Cancelled) => (error_result(&call.id, &CodeError::Cancelled.to_string()), true),
            Err(e) => (error_result(&call.id, &e.to_string()), false),
        };

        run.emit(result_event(call, &part)).await;
        if call.name == "todo_write" && matches!(part, Part::ToolResult { is_error: false, .. }) {
            run.emit(AgentEvent::TodosUpdated {
                todos: ctx.todos.todos().await,
            })
            .await;
        }
        CallResult { part, cancelled }
    }

    async fn commit(
        &self,
        session_id: &str,
        history: &mut Vec<Message>,
        message: Message,
    ) -> Result<()> {
        self.store.append_message(session_id, &message).await?;
        history.push(message);
        Ok(())
    }

    /// Fold run totals and todo state into the session record
    async fn record_session(&self, run: &RunContext, stats: &RunStats) -> Result<()> {
        let session_id = run.session_id();
        let Some(mut session) = self.store.get_session(session_id).await? else {
            return Err(CodeError::SessionNotFound(session_id.to_string()));
        };
        let todos = run.tool_ctx.todos.snapshot().await;
        session.usage.add(&stats.usage);
        session.cost_usd += stats.cost_usd;
        session.todos = todos.todos;
        session.continuation_count = todos.continuation_count;
        session.touch();
        self.store.update_session(&session).await
    }
}

fn error_result(call_id: &str, content: &str) -> Part {
    Part::ToolResult {
        call_id: call_id.to_string(),
        content: content.to_string(),
        is_error: true,
    }
}

fn result_event(call: &ToolCall, part: &Part) -> AgentEvent {
    let (content, is_error) = match part {
        Part::ToolResult {
            content, is_error, ..
        } => (content.clone(), *is_error),
        _ => (String::new(), true),
    };
    AgentEvent::ToolResult {
        call_id: call.id.clone(),
        name: call.name.clone(),
        content,
        is_error,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{MockLlmClient, MockStep};
    use super::*;
    use crate::permission::{ApprovalScope, PermissionConfig, PermissionDecision, PermissionEvent};
    use crate::store::MemorySessionStore;
    use crate::todo::{TodoPriority, TodoState, TodoStatus};
    use crate::tools::{Tool, ToolOutput};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        client: Arc<MockLlmClient>,
        gate: Arc<PermissionGate>,
        store: Arc<MemorySessionStore>,
        agent: AgentLoop,
        session_id: String,
        todos: TodoState,
    }

    async fn harness(steps: Vec<MockStep>, config: AgentConfig) -> Harness {
        harness_with(steps, config, ToolRegistry::builtin()).await
    }

    async fn harness_with(
        steps: Vec<MockStep>,
        config: AgentConfig,
        registry: ToolRegistry,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MockLlmClient::new(steps));
        let gate = Arc::new(PermissionGate::new(PermissionConfig::default()));
        let store = Arc::new(MemorySessionStore::new());
        let session = store.create_session("test").await.unwrap();
        let agent = AgentLoop::new(
            client.clone(),
            Arc::new(registry),
            gate.clone(),
            store.clone(),
            config,
        );
        Harness {
            dir,
            client,
            gate,
            store,
            agent,
            session_id: session.id,
            todos: TodoState::new(),
        }
    }

    impl Harness {
        fn run_context(&self) -> (RunContext, mpsc::Receiver<AgentEvent>) {
            let (tx, rx) = mpsc::channel(256);
            let ctx = ToolContext::new(self.dir.path(), &self.session_id)
                .with_todos(self.todos.clone());
            (RunContext::new(ctx, tx), rx)
        }

        async fn run(&self, prompt: &str) -> (Result<RunOutcome>, Vec<AgentEvent>) {
            let (run, mut rx) = self.run_context();
            let result = self.agent.execute(&run, prompt, &[]).await;
            drop(run);
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            (result, events)
        }

        async fn history(&self) -> Vec<Message> {
            self.store.list_messages(&self.session_id).await.unwrap()
        }
    }

    /// Every recorded tool call has exactly one result, in call order
    fn assert_calls_answered(history: &[Message]) {
        for (idx, msg) in history.iter().enumerate() {
            let calls = msg.tool_call_ids();
            if calls.is_empty() {
                continue;
            }
            let next = history.get(idx + 1).expect("tool calls must be answered");
            assert_eq!(next.tool_result_ids(), calls);
        }
    }

    fn result_parts(msg: &Message) -> Vec<(String, String, bool)> {
        msg.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolResult {
                    call_id,
                    content,
                    is_error,
                } => Some((call_id.clone(), content.clone(), *is_error)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_agent_config_default() {
        let config = AgentConfig::default();
        assert!(config.system_prompt.is_none());
        assert_eq!(config.max_tool_rounds, MAX_TOOL_ROUNDS);
        assert_eq!(config.kind, AgentKind::Coder);
    }

    #[test]
    fn test_agent_config_from_settings() {
        let settings = AgentSettings {
            max_tool_rounds: 0,
            tool_timeout_secs: Some(5),
            ..Default::default()
        };
        let config = AgentConfig::from_settings(&settings, &ContinuationConfig::default());
        assert_eq!(config.max_tool_rounds, 1);
        assert_eq!(config.tool_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.provider_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = AgentEvent::RoundEnd {
            round: 2,
            finish_reason: FinishReason::ToolUse,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "round_end");
        assert_eq!(value["finish_reason"], "tool_use");
    }

    #[tokio::test]
    async fn test_simple_text_response() {
        let h = harness(vec![MockLlmClient::text("Hello there")], AgentConfig::default()).await;
        let (result, events) = h.run("Hi").await;
        let outcome = result.unwrap();

        assert_eq!(outcome.text, "Hello there");
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.usage, TokenUsage::new(10, 5));
        assert_eq!(outcome.final_message.finish_reason, Some(FinishReason::Stop));

        let history = h.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "Hi");
        assert!(matches!(events.first(), Some(AgentEvent::RunStart { .. })));
        assert!(matches!(
            events.last(),
            Some(AgentEvent::RunEnd {
                state: RunState::Completed,
                ..
            })
        ));

        let session = h.store.get_session(&h.session_id).await.unwrap().unwrap();
        assert_eq!(session.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn test_read_only_tool_runs_without_permission() {
        let h = harness(
            vec![
                MockLlmClient::tools(vec![ToolCall::new("call-1", "ls", json!({}))]),
                MockLlmClient::text("There is one file."),
            ],
            AgentConfig::default(),
        )
        .await;
        std::fs::write(h.dir.path().join("notes.txt"), "x").unwrap();
        let mut permission_rx = h.gate.subscribe();

        let (result, events) = h.run("list files").await;
        assert_eq!(result.unwrap().text, "There is one file.");
        assert!(permission_rx.try_recv().is_err());

        let history = h.history().await;
        assert_eq!(history.len(), 4);
        let results = result_parts(&history[2]);
        assert_eq!(results[0].0, "call-1");
        assert!(results[0].1.contains("notes.txt"));
        assert!(!results[0].2);
        assert_calls_answered(&history);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolResult { call_id, .. } if call_id == "call-1")));
    }

    #[tokio::test]
    async fn test_denied_write_is_not_executed() {
        let h = harness(
            vec![
                MockLlmClient::tools(vec![ToolCall::new(
                    "call-w",
                    "write",
                    json!({"path": "out.txt", "content": "data"}),
                )]),
                MockLlmClient::text("Understood, I will not write the file."),
            ],
            AgentConfig::default(),
        )
        .await;

        let gate = h.gate.clone();
        let mut permission_rx = gate.subscribe();
        let approver = tokio::spawn(async move {
            if let Ok(PermissionEvent::Requested(request)) = permission_rx.recv().await {
                assert_eq!(request.tool_name, "write");
                assert_eq!(request.call_id, "call-w");
                gate.resolve(&request.id, PermissionDecision::Deny, ApprovalScope::Once)
                    .await;
            }
        });

        let (result, events) = h.run("write a file").await;
        approver.await.unwrap();
        assert!(result.is_ok());
        assert!(!h.dir.path().join("out.txt").exists());

        let history = h.history().await;
        let results = result_parts(&history[2]);
        assert!(results[0].2);
        assert!(results[0].1.starts_with("Permission denied for tool 'write'"));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::PermissionDenied { tool_name, .. } if tool_name == "write")));
        assert_calls_answered(&history);
    }

    #[tokio::test]
    async fn test_auto_approved_session_writes() {
        let h = harness(
            vec![
                MockLlmClient::tools(vec![ToolCall::new(
                    "c1",
                    "write",
                    json!({"path": "out.txt", "content": "data"}),
                )]),
                MockLlmClient::text("Done."),
            ],
            AgentConfig::default(),
        )
        .await;
        h.gate.set_auto_approve(&h.session_id, true).await;

        let (result, _) = h.run("write").await;
        assert!(result.is_ok());
        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("out.txt")).unwrap(),
            "data"
        );
    }

    #[tokio::test]
    async fn test_continuation_mentions_next_todo() {
        let h = harness(
            vec![
                MockLlmClient::text("I looked around."),
                MockLlmClient::tools(vec![ToolCall::new(
                    "t1",
                    "todo_write",
                    json!({"todos": [{"id": "1", "content": "task A", "status": "completed", "priority": "high"}]}),
                )]),
                MockLlmClient::text("All done."),
            ],
            AgentConfig::default(),
        )
        .await;
        h.todos
            .set_todos(vec![TodoItem::new("1", "task A").with_priority(TodoPriority::High)])
            .await;

        let (result, events) = h.run("start").await;
        let outcome = result.unwrap();
        assert_eq!(outcome.text, "All done.");
        assert_eq!(outcome.continuations, 1);
        assert_eq!(h.client.calls(), 3);

        let seen = h.client.seen();
        let directive = seen[1].messages.last().unwrap();
        assert_eq!(directive.role, crate::llm::Role::User);
        assert!(directive.text().contains("task A"));
        assert!(directive.text().contains("1 incomplete item(s)"));

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Continuation { count: 1, .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::TodosUpdated { todos } if todos[0].status == TodoStatus::Completed
        )));

        // Normal completion resets the counter and persists the list
        let session = h.store.get_session(&h.session_id).await.unwrap().unwrap();
        assert_eq!(session.continuation_count, 0);
        assert_eq!(session.todos[0].status, TodoStatus::Completed);
    }

    #[tokio::test]
    async fn test_continuation_stops_at_max() {
        let config = AgentConfig {
            continuation: ContinuationConfig {
                max_continuations: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let h = harness(
            vec![
                MockLlmClient::text("one"),
                MockLlmClient::text("two"),
                MockLlmClient::text("three"),
            ],
            config,
        )
        .await;
        h.todos.set_todos(vec![TodoItem::new("1", "never finished")]).await;

        let (result, _) = h.run("go").await;
        let outcome = result.unwrap();
        assert_eq!(outcome.text, "three");
        assert_eq!(outcome.continuations, 2);
        assert_eq!(h.client.calls(), 3);
        assert_eq!(h.todos.todos().await[0].status, TodoStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_partial_text() {
        let h = harness(
            vec![MockStep::Stall(vec![StreamEvent::TextDelta(
                "Partial answ".to_string(),
            )])],
            AgentConfig::default(),
        )
        .await;
        let (run, mut rx) = h.run_context();
        let cancel = run.tool_ctx.cancel.clone();

        let canceller = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, AgentEvent::TextDelta { .. }) {
                    cancel.cancel();
                }
            }
        });

        let result = h.agent.execute(&run, "explain", &[]).await;
        assert!(matches!(result, Err(CodeError::Cancelled)));
        assert_eq!(run.state(), RunState::Cancelled);
        drop(run);
        canceller.await.unwrap();

        let history = h.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text(), "Partial answ");
        assert_eq!(history[1].finish_reason, None);
    }

    #[tokio::test]
    async fn test_cancel_answers_recorded_calls() {
        let h = harness(
            vec![MockStep::Stall(vec![StreamEvent::ToolCallComplete(
                ToolCall::new("c1", "ls", json!({})),
            )])],
            AgentConfig::default(),
        )
        .await;
        let (run, mut rx) = h.run_context();
        let cancel = run.tool_ctx.cancel.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, AgentEvent::ToolCallComplete { .. }) {
                    cancel.cancel();
                }
            }
        });

        let result = h.agent.execute(&run, "list", &[]).await;
        assert!(matches!(result, Err(CodeError::Cancelled)));

        let history = h.history().await;
        assert_calls_answered(&history);
        let results = result_parts(&history[2]);
        assert_eq!(results[0].1, "Operation cancelled");
        assert!(results[0].2);
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_permission() {
        let h = harness(
            vec![MockLlmClient::tools(vec![
                ToolCall::new("w1", "write", json!({"path": "a.txt", "content": "a"})),
                ToolCall::new("w2", "write", json!({"path": "b.txt", "content": "b"})),
            ])],
            AgentConfig::default(),
        )
        .await;
        let (run, _rx) = h.run_context();
        let cancel = run.tool_ctx.cancel.clone();
        let mut permission_rx = h.gate.subscribe();
        let canceller = tokio::spawn(async move {
            if let Ok(PermissionEvent::Requested(request)) = permission_rx.recv().await {
                assert_eq!(request.call_id, "w1");
                cancel.cancel();
            }
        });

        let result = h.agent.execute(&run, "write two files", &[]).await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(CodeError::Cancelled)));
        assert_eq!(run.state(), RunState::Cancelled);
        assert_eq!(h.gate.pending_count().await, 0);
        assert!(!h.dir.path().join("a.txt").exists());
        assert!(!h.dir.path().join("b.txt").exists());

        let history = h.history().await;
        assert_calls_answered(&history);
        let results = result_parts(&history[2]);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, content, is_error)| *is_error && content == "Operation cancelled"));
    }

    #[tokio::test]
    async fn test_session_approval_skips_later_prompt() {
        let h = harness(
            vec![
                MockLlmClient::tools(vec![ToolCall::new(
                    "w1",
                    "write",
                    json!({"path": "a.txt", "content": "a"}),
                )]),
                MockLlmClient::tools(vec![ToolCall::new(
                    "w2",
                    "write",
                    json!({"path": "b.txt", "content": "b"}),
                )]),
                MockLlmClient::text("Both written."),
            ],
            AgentConfig::default(),
        )
        .await;

        let gate = h.gate.clone();
        let mut approver_rx = gate.subscribe();
        let mut observer_rx = gate.subscribe();
        let approver = tokio::spawn(async move {
            if let Ok(PermissionEvent::Requested(request)) = approver_rx.recv().await {
                gate.resolve(&request.id, PermissionDecision::Approve, ApprovalScope::Session)
                    .await;
            }
        });

        let (result, _events) = h.run("write both").await;
        approver.await.unwrap();
        assert_eq!(result.unwrap().text, "Both written.");
        assert!(h.dir.path().join("a.txt").exists());
        assert!(h.dir.path().join("b.txt").exists());

        let mut requested = Vec::new();
        while let Ok(event) = observer_rx.try_recv() {
            if let PermissionEvent::Requested(request) = event {
                requested.push(request.call_id);
            }
        }
        assert_eq!(requested, vec!["w1".to_string()]);
        assert_calls_answered(&h.history().await);
    }

    struct SleepyTool {
        name: &'static str,
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for SleepyTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Sleeps, then reports its name"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        fn requires_permission(&self) -> bool {
            false
        }

        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(ToolOutput::success(self.name))
        }
    }

    fn sleepy_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::builtin();
        registry.register(Arc::new(SleepyTool {
            name: "slow",
            delay_ms: 200,
        }));
        registry.register(Arc::new(SleepyTool {
            name: "fast",
            delay_ms: 1,
        }));
        registry
    }

    #[tokio::test]
    async fn test_results_follow_request_order() {
        let h = harness_with(
            vec![
                MockLlmClient::tools(vec![
                    ToolCall::new("a", "slow", json!({})),
                    ToolCall::new("b", "fast", json!({})),
                ]),
                MockLlmClient::text("ok"),
            ],
            AgentConfig::default(),
            sleepy_registry(),
        )
        .await;

        let (result, events) = h.run("go").await;
        assert!(result.is_ok());

        let history = h.history().await;
        let results = result_parts(&history[2]);
        assert_eq!(results[0], ("a".to_string(), "slow".to_string(), false));
        assert_eq!(results[1], ("b".to_string(), "fast".to_string(), false));

        // The fast tool finished first
        let finished: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_tool_timeout_becomes_error_result() {
        let config = AgentConfig {
            tool_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let h = harness_with(
            vec![
                MockLlmClient::tools(vec![ToolCall::new("a", "slow", json!({}))]),
                MockLlmClient::text("that was slow"),
            ],
            config,
            sleepy_registry(),
        )
        .await;

        let (result, _) = h.run("go").await;
        assert!(result.is_ok());
        let results = result_parts(&h.history().await[2]);
        assert!(results[0].2);
        assert!(results[0].1.starts_with("Operation timed out"));
    }

    #[tokio::test]
    async fn test_malformed_call_isolated() {
        let malformed = ToolCall {
            id: "bad".to_string(),
            name: "write".to_string(),
            raw_arguments: "{\"path\": \"x".to_string(),
            arguments: ToolArguments::Malformed {
                error: "EOF while parsing a string".to_string(),
            },
        };
        let h = harness(
            vec![
                MockLlmClient::tools(vec![malformed, ToolCall::new("good", "todo_read", json!({}))]),
                MockLlmClient::text("retrying"),
            ],
            AgentConfig::default(),
        )
        .await;

        let (result, _) = h.run("go").await;
        assert!(result.is_ok());
        let results = result_parts(&h.history().await[2]);
        assert!(results[0].2);
        assert!(results[0].1.starts_with("Malformed arguments for tool call 'bad'"));
        assert_eq!(results[1], ("good".to_string(), "No todos.".to_string(), false));
    }

    #[tokio::test]
    async fn test_unknown_tool_reported_to_model() {
        let h = harness(
            vec![
                MockLlmClient::tools(vec![ToolCall::new("x", "teleport", json!({}))]),
                MockLlmClient::text("sorry"),
            ],
            AgentConfig::default(),
        )
        .await;
        let (result, _) = h.run("go").await;
        assert!(result.is_ok());
        let results = result_parts(&h.history().await[2]);
        assert_eq!(results[0].1, "Unknown tool: teleport");
    }

    #[tokio::test]
    async fn test_length_finish_fails_with_upstream_reason() {
        let h = harness(
            vec![MockStep::Events(vec![
                StreamEvent::TextDelta("cut".to_string()),
                StreamEvent::Done {
                    reason: FinishReason::Length,
                    detail: Some("max_tokens".to_string()),
                },
            ])],
            AgentConfig::default(),
        )
        .await;

        let (result, events) = h.run("go").await;
        match result {
            Err(CodeError::AbnormalFinish { reason, detail }) => {
                assert_eq!(reason, FinishReason::Length);
                assert_eq!(detail, "max_tokens");
            }
            other => panic!("unexpected {:?}", other.map(|o| o.text)),
        }
        assert!(matches!(
            events.last(),
            Some(AgentEvent::RunEnd {
                state: RunState::Failed,
                ..
            })
        ));
        assert_eq!(h.history().await[1].finish_reason, Some(FinishReason::Length));
    }

    #[tokio::test]
    async fn test_max_rounds_exceeded() {
        let config = AgentConfig {
            max_tool_rounds: 2,
            ..Default::default()
        };
        let h = harness(
            vec![
                MockLlmClient::tools(vec![ToolCall::new("1", "todo_read", json!({}))]),
                MockLlmClient::tools(vec![ToolCall::new("2", "todo_read", json!({}))]),
                MockLlmClient::text("never reached"),
            ],
            config,
        )
        .await;

        let (result, _) = h.run("loop").await;
        assert!(matches!(result, Err(CodeError::MaxRoundsExceeded(2))));
        assert_eq!(h.client.calls(), 2);
        assert_calls_answered(&h.history().await);
    }

    #[tokio::test]
    async fn test_provider_error_fails_run_and_keeps_prompt() {
        let h = harness(
            vec![MockStep::Fail(CodeError::Provider {
                status: Some(401),
                kind: ProviderErrorKind::Authentication,
                message: "bad key".to_string(),
            })],
            AgentConfig::default(),
        )
        .await;

        let (result, events) = h.run("hello").await;
        assert!(matches!(result, Err(CodeError::Provider { status: Some(401), .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Error { code, .. } if code == "provider_error")));
        let history = h.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), "hello");
    }

    #[tokio::test]
    async fn test_provider_timeout() {
        let config = AgentConfig {
            provider_timeout: Some(Duration::from_millis(30)),
            ..Default::default()
        };
        let h = harness(vec![MockStep::Stall(Vec::new())], config).await;
        let (result, _) = h.run("hello").await;
        assert!(matches!(result, Err(CodeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_reminder_sent_only_without_todos() {
        let h = harness(
            vec![MockLlmClient::text("a"), MockLlmClient::text("b")],
            AgentConfig::default(),
        )
        .await;
        h.run("first").await.0.unwrap();
        h.todos.set_todos(vec![TodoItem::new("1", "x").with_status(TodoStatus::Completed)]).await;
        h.run("second").await.0.unwrap();

        let seen = h.client.seen();
        assert!(seen[0].reminder.as_deref().unwrap().contains("todo_write"));
        assert!(seen[1].reminder.is_none());
        assert!(seen[0].tool_count >= 10);
        // History carries over between runs
        assert_eq!(seen[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_plain_agent_gets_no_reminder() {
        let config = AgentConfig {
            kind: AgentKind::Plain,
            ..Default::default()
        };
        let h = harness(vec![MockLlmClient::text("a")], config).await;
        h.run("first").await.0.unwrap();
        assert!(h.client.seen()[0].reminder.is_none());
    }

    #[tokio::test]
    async fn test_attachments_rendered_into_user_message() {
        let h = harness(vec![MockLlmClient::text("seen")], AgentConfig::default()).await;
        let (run, _rx) = h.run_context();
        h.agent
            .execute(&run, "review", &[Attachment::new("main.rs", "fn main() {}\n")])
            .await
            .unwrap();

        let user = &h.history().await[0];
        assert_eq!(user.parts.len(), 2);
        assert_eq!(
            user.text(),
            "review<attachment name=\"main.rs\">\nfn main() {}\n</attachment>"
        );
    }
}
