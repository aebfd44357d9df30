//! Agent Service (C9) — the per-session facade layered on top of the
//! Session Manager (C8) and Agent Runner (C7). Owns the pending-permission
//! resolver map, the session-to-adapter index, and re-emits the Tool
//! Execution Manager's (C5) events on its own bus, normalised into the
//! shape transports expect (§4.9).
//!
//! Per §9's note on Session Manager / Agent Service cycles, this is the
//! side that depends on the other: `SessionManager` knows nothing of this
//! type, it only subscribes to the manager's events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::abort_registry::AbortRegistry;
use crate::adapter::{ContainerAdapter, ExecutionAdapter, LocalAdapter, RemoteAdapter};
use crate::agent_runner::{AgentRunner, PermissionGate, TurnOutcome};
use crate::config::{AdapterKind, Config};
use crate::core_tools::built_in_tools;
use crate::db::{ConversationEntry, PersistenceGateway, SessionSummary};
use crate::error::{CoreError, CoreResult};
use crate::event_bus::EventBus;
use crate::llm::LlmService;
use crate::preview::PreviewManager;
use crate::session::{Session, SessionConfig, SessionManager, SessionPatch};
use crate::tool_execution::{PermissionRequest, ToolExecutionManager};
use crate::tool_registry::{PermissionFacade, ToolRegistry};

/// Routes a tool's permission prompt through the service's resolver map.
/// Registered per call so `resolvePermission`/`resolveByExecutionId` can
/// find the waiter by permission id.
struct ResolverGate {
    resolvers: Arc<Mutex<HashMap<String, oneshot::Sender<bool>>>>,
}

#[async_trait]
impl PermissionGate for ResolverGate {
    async fn await_grant(&self, request: &PermissionRequest, abort: &CancellationToken) -> bool {
        let (tx, rx) = oneshot::channel();
        self.resolvers.lock().expect("resolver map poisoned").insert(request.id.clone(), tx);

        let granted = tokio::select! {
            biased;
            () = abort.cancelled() => false,
            result = rx => result.unwrap_or(false),
        };

        self.resolvers
            .lock()
            .expect("resolver map poisoned")
            .remove(&request.id);
        granted
    }
}

/// Auto-approving permission facade for tools' own mid-execution prompts,
/// used when the session's permission mode is `Auto`.
struct AutoApprovePermissions;

#[async_trait]
impl PermissionFacade for AutoApprovePermissions {
    async fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Permission facade that always denies, used only as a safe default when
/// a session has no other facade wired; tools whose own `confirm` calls
/// matter should be driven from the transport layer instead.
struct DenyPermissions;

#[async_trait]
impl PermissionFacade for DenyPermissions {
    async fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

fn build_permission_facade(mode: crate::config::PermissionMode) -> Arc<dyn PermissionFacade> {
    match mode {
        crate::config::PermissionMode::Auto => Arc::new(AutoApprovePermissions),
        crate::config::PermissionMode::Interactive => Arc::new(DenyPermissions),
    }
}

fn build_adapter(config: &Config, session: &Session) -> Arc<dyn ExecutionAdapter> {
    match session.config.adapter_kind {
        AdapterKind::Local => Arc::new(LocalAdapter::new(session.config.working_dir.clone())),
        AdapterKind::Container => {
            let sandbox_id = session.config.sandbox_id.clone().unwrap_or_default();
            ContainerAdapter::new(sandbox_id, session.config.working_dir.clone())
        }
        AdapterKind::Remote => {
            let sandbox_id = session.config.sandbox_id.clone().unwrap_or_default();
            RemoteAdapter::new(config.remote_sandbox_base_url.clone(), sandbox_id)
        }
    }
}

/// Per-session facade: starts turns, serialises permission resolution,
/// re-emits C5 events on its own bus. Holds the active-processing set
/// (delegated to C8's own check-and-set), the pending-permission resolver
/// map, and a session-id -> adapter index.
pub struct AgentService {
    config: Config,
    abort_registry: Arc<AbortRegistry>,
    sessions: Arc<SessionManager>,
    executions: Arc<ToolExecutionManager>,
    previews: Arc<PreviewManager>,
    tools: Arc<ToolRegistry>,
    runner: Arc<AgentRunner>,
    persistence: Arc<dyn PersistenceGateway>,
    adapters: Mutex<HashMap<String, Arc<dyn ExecutionAdapter>>>,
    resolvers: Arc<Mutex<HashMap<String, oneshot::Sender<bool>>>>,
    pub events: EventBus,
}

impl AgentService {
    pub fn new(config: Config, llm: Arc<dyn LlmService>, persistence: Arc<dyn PersistenceGateway>) -> Arc<Self> {
        let abort_registry = Arc::new(AbortRegistry::new());
        let sessions = SessionManager::new(&config, abort_registry.clone());
        let executions = ToolExecutionManager::new(persistence.clone());
        let previews = PreviewManager::new();
        let tools = Arc::new(ToolRegistry::new(built_in_tools()));
        let runner = AgentRunner::new(
            abort_registry.clone(),
            sessions.clone(),
            executions.clone(),
            tools.clone(),
            llm,
            persistence.clone(),
        );

        let service = Arc::new(Self {
            config,
            abort_registry,
            sessions,
            executions,
            previews,
            tools,
            runner,
            persistence,
            adapters: Mutex::new(HashMap::new()),
            resolvers: Arc::new(Mutex::new(HashMap::new())),
            events: EventBus::new(),
        });
        service.wire_event_bridge();
        service
    }

    /// Subscribes to the Tool Execution Manager's bus once, for the
    /// process's lifetime, re-emitting each event under the transport-facing
    /// topic names from spec §6 with a normalised payload.
    fn wire_event_bridge(self: &Arc<Self>) {
        for (source_topic, target_topic) in [
            ("CREATED", "tool:execution:created"),
            ("UPDATED", "tool:execution:started"),
            ("COMPLETED", "tool:execution:completed"),
            ("ERROR", "tool:execution:error"),
            ("ABORTED", "tool:execution:aborted"),
        ] {
            let weak = Arc::downgrade(self);
            self.executions.events.on(source_topic, move |payload| {
                if let Some(service) = weak.upgrade() {
                    service.reemit_execution_event(target_topic, payload);
                }
            });
        }

        for (source_topic, target_topic) in [
            ("PERMISSION_REQUESTED", "permission:requested"),
            ("PERMISSION_RESOLVED", "permission:resolved"),
        ] {
            let weak = Arc::downgrade(self);
            self.executions.events.on(source_topic, move |payload| {
                if let Some(service) = weak.upgrade() {
                    service.reemit_permission_event(target_topic, payload);
                }
            });
        }
    }

    fn reemit_execution_event(&self, topic: &str, execution: &Value) {
        let normalized = self.normalize_execution(execution);
        self.events.emit(topic, normalized.clone());
        if topic == "tool:execution:completed" {
            // Legacy alias kept for transports still on the old topic name.
            self.events.emit("tool:execution", normalized);
        }
    }

    fn reemit_permission_event(&self, topic: &str, payload: &Value) {
        let execution = payload.get("execution").cloned().unwrap_or(Value::Null);
        let permission = payload.get("permission").cloned().unwrap_or(Value::Null);
        let mut normalized = self.normalize_execution(&execution);
        if let Some(obj) = normalized.as_object_mut() {
            obj.insert("permission".to_string(), permission);
        }
        self.events.emit(topic, normalized);
    }

    fn normalize_execution(&self, execution: &Value) -> Value {
        let execution_id = execution
            .get("execution_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let session_id = execution
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let preview = self.previews.get_for_execution(execution_id);

        json!({
            "sessionId": session_id,
            "tool": {
                "executionId": execution.get("execution_id"),
                "toolId": execution.get("tool_id"),
                "toolName": execution.get("tool_name"),
                "status": execution.get("status"),
                "parameterSummary": execution.get("parameter_summary"),
                "result": execution.get("result"),
                "error": execution.get("error"),
            },
            "preview": preview,
            "startTime": execution.get("start_time"),
            "endTime": execution.get("end_time"),
        })
    }

    /// Creates a session via C8, fires-and-forgets adapter construction
    /// and persisted-data restoration, and returns immediately.
    pub fn start_session(self: &Arc<Self>, overrides: Option<SessionConfig>) -> Session {
        let session = self.sessions.create(&self.config, overrides);
        self.spawn_adapter_construction(&session);
        self.spawn_data_restore(session.id.clone());
        session
    }

    /// Convenience for transports that only want to override the working
    /// directory a session's adapter resolves paths against.
    pub fn start_session_with_cwd(self: &Arc<Self>, cwd: Option<std::path::PathBuf>) -> Session {
        let overrides = cwd.map(|working_dir| SessionConfig {
            working_dir,
            ..SessionConfig::defaults(&self.config)
        });
        self.start_session(overrides)
    }

    fn spawn_adapter_construction(self: &Arc<Self>, session: &Session) {
        let service = Arc::clone(self);
        let session_id = session.id.clone();
        let config = self.config.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let adapter = build_adapter(&config, &session);
            let mut status_rx = adapter.subscribe_status();
            service
                .adapters
                .lock()
                .expect("adapter index poisoned")
                .insert(session_id.clone(), adapter);

            let bridge_service = Arc::clone(&service);
            let bridge_session_id = session_id.clone();
            tokio::spawn(async move {
                while let Ok(status) = status_rx.recv().await {
                    bridge_service.events.emit(
                        "environment_status_changed",
                        json!({ "sessionId": bridge_session_id, "status": status }),
                    );
                }
            });
        });
    }

    fn spawn_data_restore(self: &Arc<Self>, session_id: String) {
        let executions = self.executions.clone();
        let previews = self.previews.clone();
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            executions.load_session_data(&session_id).await;
            if let Ok(Some(data)) = persistence.load_session(&session_id).await {
                previews.load_session_data(data.previews);
            }
        });
    }

    fn adapter_for(&self, session_id: &str) -> CoreResult<Arc<dyn ExecutionAdapter>> {
        self.adapters
            .lock()
            .expect("adapter index poisoned")
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::AdapterUnavailable(format!("adapter not ready for session {session_id}")))
    }

    /// Enforces the busy rule (via C8's atomic check-and-set inside the
    /// runner), wires a permission-UI handler that routes prompts through
    /// this service's resolver map, and delegates to C7.
    pub async fn process_query(&self, session_id: &str, query: &str) -> CoreResult<TurnOutcome> {
        let session = self.sessions.get(session_id)?;
        if session.processing {
            // The runner's own `begin_processing` is the real atomic guard;
            // this is just an early exit so a known-busy session never gets
            // a spurious `processing:started` with no matching completion.
            return Err(CoreError::AgentBusy);
        }
        let adapter = self.adapter_for(session_id)?;
        let permission_facade = build_permission_facade(session.config.permission_mode);
        let permission_gate = Arc::new(ResolverGate {
            resolvers: self.resolvers.clone(),
        });

        self.events.emit("processing:started", json!({ "sessionId": session_id }));

        let outcome = self
            .runner
            .process_query(
                session_id,
                query,
                adapter,
                session.config.working_dir.clone(),
                permission_facade,
                permission_gate,
                self.config.iteration_cap,
            )
            .await;

        self.previews.save_session_data(session_id, self.persistence.as_ref()).await;

        match &outcome {
            Ok(turn) if turn.aborted => {
                let timestamp = self.abort_registry.abort_timestamp(session_id);
                self.events.emit(
                    "processing:aborted",
                    json!({ "sessionId": session_id, "abortTimestamp": timestamp }),
                );
            }
            Ok(turn) => {
                self.events.emit(
                    "processing:completed",
                    json!({ "sessionId": session_id, "response": turn.response }),
                );
            }
            Err(error) => {
                self.events.emit(
                    "processing:error",
                    json!({ "sessionId": session_id, "message": error.to_string(), "kind": error.kind() }),
                );
            }
        }

        outcome
    }

    /// Looks up the pending resolver for `permission_id`, wakes it, and
    /// removes it from the map. The runner itself persists the resolution
    /// into C5 once `await_grant` returns — calling `resolve_permission`
    /// here too would double-resolve and trip C5's terminal-write guard.
    pub fn resolve_permission(&self, permission_id: &str, granted: bool) -> CoreResult<()> {
        let resolver = self
            .resolvers
            .lock()
            .expect("resolver map poisoned")
            .remove(permission_id)
            .ok_or_else(|| CoreError::ToolExecution(format!("no pending permission: {permission_id}")))?;
        let _ = resolver.send(granted);
        Ok(())
    }

    pub fn resolve_by_execution_id(&self, execution_id: &str, granted: bool) -> CoreResult<()> {
        let permission = self
            .executions
            .permission_for_execution(execution_id)
            .ok_or_else(|| {
                CoreError::ToolExecution(format!("no pending permission for execution {execution_id}"))
            })?;
        self.resolve_permission(&permission.id, granted)
    }

    /// Marks the session aborted, aborts each of its non-terminal tool
    /// executions, flips it out of `processing`, and emits
    /// `processing:aborted` with the mark's timestamp.
    pub fn abort_operation(&self, session_id: &str) -> CoreResult<()> {
        let timestamp = self.abort_registry.mark_aborted(session_id);

        for execution in self.executions.executions_for_session(session_id) {
            if !execution.status.is_terminal() {
                let _ = self.executions.abort(&execution.execution_id);
            }
        }

        let _ = self.sessions.update(
            session_id,
            SessionPatch {
                processing: Some(false),
                ..Default::default()
            },
        );

        self.events.emit(
            "processing:aborted",
            json!({ "sessionId": session_id, "abortTimestamp": timestamp }),
        );
        Ok(())
    }

    pub fn toggle_fast_edit_mode(&self, session_id: &str, enabled: bool) -> CoreResult<Session> {
        let session = self.sessions.update(
            session_id,
            SessionPatch {
                fast_edit_mode: Some(enabled),
                ..Default::default()
            },
        )?;
        self.events.emit(
            if enabled { "fast_edit_mode_enabled" } else { "fast_edit_mode_disabled" },
            json!({ "sessionId": session_id }),
        );
        Ok(session)
    }

    pub fn set_adapter_kind(&self, session_id: &str, kind: AdapterKind) -> CoreResult<Session> {
        let session = self.sessions.update(
            session_id,
            SessionPatch {
                adapter_kind: Some(kind),
                ..Default::default()
            },
        )?;
        self.adapters.lock().expect("adapter index poisoned").remove(session_id);
        Ok(session)
    }

    pub fn set_sandbox_id(&self, session_id: &str, sandbox_id: Option<String>) -> CoreResult<Session> {
        let session = self.sessions.update(
            session_id,
            SessionPatch {
                sandbox_id: Some(sandbox_id),
                ..Default::default()
            },
        )?;
        self.adapters.lock().expect("adapter index poisoned").remove(session_id);
        Ok(session)
    }

    pub fn get_history(&self, session_id: &str) -> CoreResult<Vec<ConversationEntry>> {
        Ok(self.sessions.get(session_id)?.conversation)
    }

    pub fn is_processing(&self, session_id: &str) -> CoreResult<bool> {
        Ok(self.sessions.get(session_id)?.processing)
    }

    pub async fn list_persisted_sessions(&self) -> CoreResult<Vec<SessionSummary>> {
        self.persistence
            .list_sessions()
            .await
            .map_err(|e| CoreError::Persistence(e.to_string()))
    }

    pub async fn delete_session(&self, session_id: &str) -> CoreResult<()> {
        self.sessions.delete(session_id)?;
        self.adapters.lock().expect("adapter index poisoned").remove(session_id);
        self.executions.delete_session_data(session_id).await;
        self.previews.clear_session_data(session_id);
        Ok(())
    }
}
