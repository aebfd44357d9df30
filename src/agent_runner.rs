//! Agent Runner (C7) — drives the Agent FSM: calls the LLM, dispatches
//! tool calls via the Tool Registry and Tool Execution Manager, and
//! honours abort signalled through the Abort Registry.
//!
//! This is the one place the LLM↔tool loop lives. Permission prompting is
//! deliberately left to a caller-supplied [`PermissionGate`] — the Agent
//! Service wires that to its own resolver map (§4.9); the runner only
//! knows it gets back a granted/denied bool that wakes on abort.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::abort_registry::AbortRegistry;
use crate::adapter::ExecutionAdapter;
use crate::agent_fsm::{transition, AgentEvent, AgentState};
use crate::config::PermissionMode;
use crate::db::{ContentPart, ConversationEntry, PersistenceGateway, Role};
use crate::error::{CoreError, CoreResult};
use crate::llm::{ContentBlock, LlmMessage, LlmRequest, LlmService, MessageRole, SystemContent};
use crate::session::SessionManager;
use crate::tool_execution::{PermissionRequest, ToolError, ToolExecutionManager};
use crate::tool_registry::{PermissionFacade, ToolContext, ToolRegistry};

/// Waits on a single permission decision, racing against turn cancellation.
/// Implemented by the Agent Service using its resolver map; test code can
/// implement it directly for a scripted decision.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn await_grant(&self, request: &PermissionRequest, abort: &CancellationToken) -> bool;
}

/// What `processQuery` returns to its caller.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: String,
    pub tool_results: Vec<Value>,
    pub aborted: bool,
}

pub struct AgentRunner {
    abort_registry: Arc<AbortRegistry>,
    sessions: Arc<SessionManager>,
    executions: Arc<ToolExecutionManager>,
    tools: Arc<ToolRegistry>,
    llm: Arc<dyn LlmService>,
    persistence: Arc<dyn PersistenceGateway>,
}

fn to_llm_messages(conversation: &[ConversationEntry]) -> Vec<LlmMessage> {
    conversation
        .iter()
        .map(|entry| LlmMessage {
            role: match entry.role {
                Role::User => MessageRole::User,
                Role::Assistant => MessageRole::Assistant,
            },
            content: entry
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
                    ContentPart::ToolUse { id, tool_name, args } => ContentBlock::ToolUse {
                        id: id.clone(),
                        name: tool_name.clone(),
                        input: args.clone(),
                    },
                    ContentPart::ToolResult {
                        tool_use_id,
                        value,
                        error,
                        aborted,
                        ..
                    } => ContentBlock::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: if *aborted {
                            "aborted".to_string()
                        } else {
                            error
                                .clone()
                                .or_else(|| value.as_ref().map(|v| v.to_string()))
                                .unwrap_or_default()
                        },
                        is_error: error.is_some(),
                    },
                })
                .collect(),
        })
        .collect()
}

fn parameter_summary(args: &Value) -> String {
    let rendered = args.to_string();
    if rendered.len() > 200 {
        format!("{}…", &rendered[..200])
    } else {
        rendered
    }
}

impl AgentRunner {
    pub fn new(
        abort_registry: Arc<AbortRegistry>,
        sessions: Arc<SessionManager>,
        executions: Arc<ToolExecutionManager>,
        tools: Arc<ToolRegistry>,
        llm: Arc<dyn LlmService>,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> Arc<Self> {
        Arc::new(Self {
            abort_registry,
            sessions,
            executions,
            tools,
            llm,
            persistence,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn process_query(
        &self,
        session_id: &str,
        query: &str,
        adapter: Arc<dyn ExecutionAdapter>,
        working_dir: PathBuf,
        permission_facade: Arc<dyn PermissionFacade>,
        permission_gate: Arc<dyn PermissionGate>,
        iteration_cap: usize,
    ) -> CoreResult<TurnOutcome> {
        self.sessions.begin_processing(session_id)?;
        self.abort_registry.clear(session_id);

        let outcome = self
            .run_turn(
                session_id,
                query,
                adapter,
                working_dir,
                permission_facade,
                permission_gate,
                iteration_cap,
            )
            .await;

        self.sessions.end_processing(session_id);
        self.executions.save_session_data(session_id).await;
        if let Ok(session) = self.sessions.get(session_id) {
            let _ = self
                .persistence
                .persist_messages(session_id, session.conversation.clone())
                .await;
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_turn(
        &self,
        session_id: &str,
        query: &str,
        adapter: Arc<dyn ExecutionAdapter>,
        working_dir: PathBuf,
        permission_facade: Arc<dyn PermissionFacade>,
        permission_gate: Arc<dyn PermissionGate>,
        iteration_cap: usize,
    ) -> CoreResult<TurnOutcome> {
        if self.abort_registry.is_aborted(session_id) {
            return Ok(TurnOutcome {
                response: String::new(),
                tool_results: vec![],
                aborted: true,
            });
        }

        let cancellation = CancellationToken::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        {
            let cancellation = cancellation.clone();
            let abort_registry = self.abort_registry.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = abort_registry.aborted(&session_id) => cancellation.cancel(),
                    _ = done_rx => {}
                }
            });
        }
        let _guard = scopeguard(|| {
            let _ = done_tx.send(());
        });

        let start_hook = self.tools.on_start(|id, _args, _ctx| {
            tracing::debug!(tool = id, "tool starting");
        });
        let complete_hook = self.tools.on_complete(|id, _args, output, duration_ms| {
            tracing::debug!(tool = id, success = output.success, duration_ms, "tool finished");
        });
        let error_hook = self.tools.on_error(|id, _args, error| {
            tracing::warn!(tool = id, error = %error, "tool errored");
        });
        let _hooks_guard = scopeguard(move || {
            start_hook.unregister();
            complete_hook.unregister();
            error_hook.unregister();
        });

        self.sessions.mutate_conversation(session_id, |conv| {
            conv.push(ConversationEntry {
                role: Role::User,
                content: vec![ContentPart::Text { text: query.to_string() }],
            });
        })?;

        let mut state = transition(AgentState::Idle, &AgentEvent::UserMessage)?;
        let mut tool_results: Vec<Value> = Vec::new();
        let mut iterations = 0usize;

        loop {
            if cancellation.is_cancelled() {
                transition(state, &AgentEvent::AbortRequested)?;
                return Ok(TurnOutcome {
                    response: String::new(),
                    tool_results,
                    aborted: true,
                });
            }

            iterations += 1;
            if iterations > iteration_cap {
                return Ok(TurnOutcome {
                    response: format!(
                        "stopped after {iteration_cap} tool-call rounds without a final answer"
                    ),
                    tool_results,
                    aborted: false,
                });
            }

            let session = self.sessions.get(session_id)?;
            let request = LlmRequest {
                system: vec![SystemContent::new(
                    "You are a coding agent with access to filesystem and shell tools.",
                )],
                messages: to_llm_messages(&session.conversation),
                tools: self
                    .tools
                    .definitions()
                    .into_iter()
                    .map(|def| crate::llm::ToolDefinition {
                        name: def.id,
                        description: def.description,
                        input_schema: def.parameters,
                    })
                    .collect(),
                max_tokens: None,
            };

            let response = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    transition(state, &AgentEvent::AbortRequested)?;
                    return Ok(TurnOutcome { response: String::new(), tool_results, aborted: true });
                }
                result = self.llm.complete(&request) => result.map_err(|e| {
                    CoreError::ToolExecution(format!("model call failed: {e}"))
                })?,
            };

            if response.has_tool_use() {
                let calls: Vec<(String, String, Value)> = response
                    .tool_uses()
                    .into_iter()
                    .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                    .collect();

                let tool_use_parts: Vec<ContentPart> = calls
                    .iter()
                    .map(|(id, name, args)| ContentPart::ToolUse {
                        id: id.clone(),
                        tool_name: name.clone(),
                        args: args.clone(),
                    })
                    .collect();
                self.sessions.mutate_conversation(session_id, |conv| {
                    conv.push(ConversationEntry {
                        role: Role::Assistant,
                        content: tool_use_parts,
                    });
                })?;

                let mut result_parts: Vec<ContentPart> = Vec::new();
                let mut round_aborted = false;

                for (tool_use_id, tool_id, args) in &calls {
                    if cancellation.is_cancelled() {
                        round_aborted = true;
                        break;
                    }

                    state = transition(
                        state,
                        &AgentEvent::ModelToolCall {
                            tool_use_id: tool_use_id.clone(),
                        },
                    )?;

                    let (part, turn_should_abort) = self
                        .run_one_tool_call(
                            session_id,
                            tool_use_id,
                            tool_id,
                            args.clone(),
                            &session,
                            adapter.clone(),
                            working_dir.clone(),
                            permission_facade.clone(),
                            permission_gate.clone(),
                            &cancellation,
                        )
                        .await?;

                    tool_results.push(json!({
                        "toolUseId": tool_use_id,
                        "toolId": tool_id,
                    }));
                    result_parts.push(part);
                    state = transition(state, &AgentEvent::ToolFinished)?;

                    if turn_should_abort {
                        round_aborted = true;
                        break;
                    }
                }

                if round_aborted {
                    let paired: HashSet<&str> = result_parts
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::ToolResult { tool_use_id, .. } => {
                                Some(tool_use_id.as_str())
                            }
                            _ => None,
                        })
                        .collect();
                    for (tool_use_id, _, _) in &calls {
                        if !paired.contains(tool_use_id.as_str()) {
                            result_parts.push(ContentPart::ToolResult {
                                id: Uuid::new_v4().to_string(),
                                tool_use_id: tool_use_id.clone(),
                                value: None,
                                error: None,
                                aborted: true,
                            });
                        }
                    }
                    self.sessions.mutate_conversation(session_id, |conv| {
                        conv.push(ConversationEntry {
                            role: Role::User,
                            content: result_parts,
                        });
                    })?;
                    transition(state, &AgentEvent::AbortRequested)?;
                    return Ok(TurnOutcome {
                        response: String::new(),
                        tool_results,
                        aborted: true,
                    });
                }

                self.sessions.mutate_conversation(session_id, |conv| {
                    conv.push(ConversationEntry {
                        role: Role::User,
                        content: result_parts,
                    });
                })?;
            } else {
                let text = response.text();
                state = transition(state, &AgentEvent::ModelFinal)?;
                debug_assert!(state.is_terminal());
                self.sessions.mutate_conversation(session_id, |conv| {
                    conv.push(ConversationEntry {
                        role: Role::Assistant,
                        content: vec![ContentPart::Text { text: text.clone() }],
                    });
                })?;
                return Ok(TurnOutcome {
                    response: text,
                    tool_results,
                    aborted: false,
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_tool_call(
        &self,
        session_id: &str,
        tool_use_id: &str,
        tool_id: &str,
        args: Value,
        session: &crate::session::Session,
        adapter: Arc<dyn ExecutionAdapter>,
        working_dir: PathBuf,
        permission_facade: Arc<dyn PermissionFacade>,
        permission_gate: Arc<dyn PermissionGate>,
        cancellation: &CancellationToken,
    ) -> CoreResult<(ContentPart, bool)> {
        let exec = self.executions.create(
            session_id,
            tool_id,
            tool_id,
            args.clone(),
            Some(parameter_summary(&args)),
        );

        let Some(known_tool) = self.tools.get(tool_id) else {
            self.executions.start(&exec.execution_id)?;
            self.executions.fail(
                &exec.execution_id,
                ToolError {
                    message: format!("unknown tool: {tool_id}"),
                    stack: None,
                },
            )?;
            return Ok((
                ContentPart::ToolResult {
                    id: Uuid::new_v4().to_string(),
                    tool_use_id: tool_use_id.to_string(),
                    value: None,
                    error: Some(format!("unknown tool: {tool_id}")),
                    aborted: false,
                },
                false,
            ));
        };
        let requires_permission = known_tool.requires_permission();
        let always_requires_permission = known_tool.always_require_permission();

        let pre_allowed = session
            .config
            .pre_allowed_tool_ids
            .iter()
            .any(|id| id == tool_id);
        let fast_edit_covers_it = session.config.fast_edit_mode && !always_requires_permission;
        let needs_permission = requires_permission
            && session.config.permission_mode != PermissionMode::Auto
            && !pre_allowed
            && !fast_edit_covers_it;

        if needs_permission {
            let request = self.executions.request_permission(&exec.execution_id, args.clone())?;
            let granted = permission_gate.await_grant(&request, cancellation).await;
            self.executions.resolve_permission(&request.id, granted)?;
            if !granted {
                return Ok((
                    ContentPart::ToolResult {
                        id: Uuid::new_v4().to_string(),
                        tool_use_id: tool_use_id.to_string(),
                        value: None,
                        error: None,
                        aborted: true,
                    },
                    cancellation.is_cancelled(),
                ));
            }
        } else {
            self.executions.start(&exec.execution_id)?;
        }

        if cancellation.is_cancelled() {
            self.executions.abort(&exec.execution_id)?;
            return Ok((
                ContentPart::ToolResult {
                    id: Uuid::new_v4().to_string(),
                    tool_use_id: tool_use_id.to_string(),
                    value: None,
                    error: None,
                    aborted: true,
                },
                true,
            ));
        }

        let _ = &known_tool;

        let ctx = ToolContext::new(
            session_id,
            working_dir,
            adapter,
            permission_facade,
            cancellation.clone(),
            self.tools.clone(),
        );

        let start = Instant::now();
        let part = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                self.executions.abort(&exec.execution_id)?;
                return Ok((ContentPart::ToolResult {
                    id: Uuid::new_v4().to_string(),
                    tool_use_id: tool_use_id.to_string(),
                    value: None,
                    error: None,
                    aborted: true,
                }, true));
            }
            result = self.tools.execute(tool_id, args.clone(), &ctx) => {
                let duration_ms = start.elapsed().as_millis() as i64;
                match result {
                    Ok(output) if output.success => {
                        self.executions.complete(&exec.execution_id, json!(output.output), duration_ms)?;
                        ContentPart::ToolResult {
                            id: Uuid::new_v4().to_string(),
                            tool_use_id: tool_use_id.to_string(),
                            value: Some(json!(output.output)),
                            error: None,
                            aborted: false,
                        }
                    }
                    Ok(output) => {
                        self.executions.fail(&exec.execution_id, ToolError { message: output.output.clone(), stack: None })?;
                        ContentPart::ToolResult {
                            id: Uuid::new_v4().to_string(),
                            tool_use_id: tool_use_id.to_string(),
                            value: None,
                            error: Some(output.output),
                            aborted: false,
                        }
                    }
                    Err(CoreError::AbortError) => {
                        self.executions.abort(&exec.execution_id)?;
                        return Ok((ContentPart::ToolResult {
                            id: Uuid::new_v4().to_string(),
                            tool_use_id: tool_use_id.to_string(),
                            value: None,
                            error: None,
                            aborted: true,
                        }, true));
                    }
                    Err(other) => {
                        self.executions.fail(&exec.execution_id, ToolError { message: other.to_string(), stack: None })?;
                        ContentPart::ToolResult {
                            id: Uuid::new_v4().to_string(),
                            tool_use_id: tool_use_id.to_string(),
                            value: None,
                            error: Some(other.to_string()),
                            aborted: false,
                        }
                    }
                }
            }
        };

        Ok((part, false))
    }
}

/// Minimal RAII scope guard: runs its closure on drop, including on early
/// `return`/`?`. Used for the runner's two "finally" cleanups (stopping the
/// abort watcher, unregistering tool hooks) so they fire on every exit path.
struct ScopeGuard<F: FnOnce()>(Option<F>);
impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}
fn scopeguard<F: FnOnce()>(f: F) -> ScopeGuard<F> {
    ScopeGuard(Some(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::InMemoryPersistence;
    use crate::llm::{ContentBlock, LlmError, LlmResponse, Usage};
    use crate::tool_registry::{PermissionFacade, Tool, ToolOutput};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn id(&self) -> &str {
            "echo"
        }
        fn description(&self) -> String {
            "echoes its input".to_string()
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        fn required_parameters(&self) -> &'static [&'static str] {
            &["text"]
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, CoreError> {
            Ok(ToolOutput::success(args["text"].as_str().unwrap_or("").to_string()))
        }
    }

    struct GatedTool;

    #[async_trait]
    impl Tool for GatedTool {
        fn id(&self) -> &str {
            "gated"
        }
        fn description(&self) -> String {
            "requires permission".to_string()
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn requires_permission(&self) -> bool {
            true
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, CoreError> {
            Ok(ToolOutput::success("ran"))
        }
    }

    struct AutoApprove;
    #[async_trait]
    impl PermissionFacade for AutoApprove {
        async fn confirm(&self, _prompt: &str) -> bool {
            true
        }
    }

    struct ScriptedGate(bool);
    #[async_trait]
    impl PermissionGate for ScriptedGate {
        async fn await_grant(&self, _request: &PermissionRequest, _abort: &CancellationToken) -> bool {
            self.0
        }
    }

    struct ScriptedLlm {
        responses: std::sync::Mutex<Vec<LlmResponse>>,
    }

    #[async_trait]
    impl LlmService for ScriptedLlm {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(self.responses.lock().unwrap().remove(0))
        }
        fn model_id(&self) -> &str {
            "scripted"
        }
        fn context_window(&self) -> usize {
            100_000
        }
        fn max_image_dimension(&self) -> Option<u32> {
            None
        }
    }

    fn final_text(text: &str) -> LlmResponse {
        LlmResponse {
            content: vec![ContentBlock::text(text)],
            end_turn: true,
            usage: Usage::default(),
        }
    }

    fn tool_call(tool: &str, args: Value) -> LlmResponse {
        LlmResponse {
            content: vec![ContentBlock::tool_use("call-1", tool, args)],
            end_turn: false,
            usage: Usage::default(),
        }
    }

    /// Wires a runner with an in-process session/registry/persistence stack,
    /// mirroring what the Agent Service assembles in `AgentService::new`.
    fn harness(
        tools: Vec<Arc<dyn Tool>>,
        responses: Vec<LlmResponse>,
    ) -> (Arc<AgentRunner>, crate::session::Session) {
        let config = Config::default();
        let abort_registry = Arc::new(AbortRegistry::new());
        let sessions = SessionManager::new(&config, abort_registry.clone());
        let persistence: Arc<dyn PersistenceGateway> = Arc::new(InMemoryPersistence::new());
        let executions = ToolExecutionManager::new(persistence.clone());
        let registry = Arc::new(ToolRegistry::new(tools));
        let llm: Arc<dyn LlmService> = Arc::new(ScriptedLlm {
            responses: std::sync::Mutex::new(responses),
        });
        let runner = AgentRunner::new(abort_registry, sessions.clone(), executions, registry, llm, persistence);
        let session = sessions.create(&config, None);
        (runner, session)
    }

    #[tokio::test]
    async fn happy_path_round_trips_a_tool_call() {
        let (runner, session) = harness(
            vec![Arc::new(EchoTool)],
            vec![tool_call("echo", json!({"text": "hi"})), final_text("done")],
        );
        let adapter: Arc<dyn ExecutionAdapter> =
            Arc::new(crate::adapter::LocalAdapter::new(std::env::temp_dir()));
        let outcome = runner
            .process_query(
                &session.id,
                "use echo",
                adapter,
                std::env::temp_dir(),
                Arc::new(AutoApprove),
                Arc::new(ScriptedGate(true)),
                10,
            )
            .await
            .unwrap();

        assert_eq!(outcome.response, "done");
        assert!(!outcome.aborted);
        assert_eq!(outcome.tool_results.len(), 1);
    }

    #[tokio::test]
    async fn denied_permission_short_circuits_without_running_the_tool() {
        let (runner, session) = harness(
            vec![Arc::new(GatedTool)],
            vec![tool_call("gated", json!({})), final_text("done")],
        );
        let adapter: Arc<dyn ExecutionAdapter> =
            Arc::new(crate::adapter::LocalAdapter::new(std::env::temp_dir()));
        let outcome = runner
            .process_query(
                &session.id,
                "use gated",
                adapter,
                std::env::temp_dir(),
                Arc::new(AutoApprove),
                Arc::new(ScriptedGate(false)),
                10,
            )
            .await
            .unwrap();

        // The tool itself never ran; the model still got a paired result
        // and produced its final answer on the next turn.
        assert_eq!(outcome.response, "done");
        assert!(!outcome.aborted);
    }

    #[tokio::test]
    async fn unknown_tool_name_yields_an_error_result_not_a_hard_failure() {
        let (runner, session) = harness(vec![], vec![tool_call("nope", json!({})), final_text("done")]);
        let adapter: Arc<dyn ExecutionAdapter> =
            Arc::new(crate::adapter::LocalAdapter::new(std::env::temp_dir()));
        let outcome = runner
            .process_query(
                &session.id,
                "use nope",
                adapter,
                std::env::temp_dir(),
                Arc::new(AutoApprove),
                Arc::new(ScriptedGate(true)),
                10,
            )
            .await
            .unwrap();

        assert_eq!(outcome.response, "done");
        assert!(!outcome.aborted);
    }

    #[tokio::test]
    async fn iteration_cap_stops_an_endless_tool_loop() {
        let responses = (0..5).map(|_| tool_call("echo", json!({"text": "x"}))).collect();
        let (runner, session) = harness(vec![Arc::new(EchoTool)], responses);
        let adapter: Arc<dyn ExecutionAdapter> =
            Arc::new(crate::adapter::LocalAdapter::new(std::env::temp_dir()));
        let outcome = runner
            .process_query(
                &session.id,
                "loop forever",
                adapter,
                std::env::temp_dir(),
                Arc::new(AutoApprove),
                Arc::new(ScriptedGate(true)),
                3,
            )
            .await
            .unwrap();

        assert!(outcome.response.contains("stopped after"));
        assert!(!outcome.aborted);
    }
}
