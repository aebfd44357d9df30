//! Tool Execution Manager (C5) — owns `ToolExecution` and
//! `PermissionRequest` entities, their state machines, and persistence.
//!
//! This is the one authoritative place tracking "what tools are in
//! flight"; per spec §9 the transport layer may keep its own cache of
//! active tools, but C5 is the source of truth and that cache's
//! reconciliation is out of scope here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::db::PersistenceGateway;
use crate::event_bus::EventBus;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolExecutionStatus {
    Created,
    Running,
    AwaitingPermission,
    Completed,
    Error,
    Aborted,
}

impl ToolExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub execution_id: String,
    pub session_id: String,
    pub tool_id: String,
    pub tool_name: String,
    pub status: ToolExecutionStatus,
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_id: Option<String>,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub execution_id: String,
    pub tool_id: String,
    pub tool_name: String,
    pub args: Value,
    pub request_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted: Option<bool>,
}

impl PermissionRequest {
    pub fn is_resolved(&self) -> bool {
        self.granted.is_some()
    }
}

#[derive(Default)]
struct SessionData {
    executions: HashMap<String, ToolExecution>,
    permissions: HashMap<String, PermissionRequest>,
    // execution id -> permission id, for resolveByExecutionId / at-most-one-pending
    permission_by_execution: HashMap<String, String>,
}

pub struct ToolExecutionManager {
    sessions: Mutex<HashMap<String, SessionData>>,
    persistence: Arc<dyn PersistenceGateway>,
    pub events: EventBus,
}

impl ToolExecutionManager {
    pub fn new(persistence: Arc<dyn PersistenceGateway>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            persistence,
            events: EventBus::new(),
        })
    }

    fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionData) -> R) -> R {
        let mut sessions = self.sessions.lock().expect("tool execution manager poisoned");
        f(sessions.entry(session_id.to_string()).or_default())
    }

    pub fn create(
        &self,
        session_id: &str,
        tool_id: &str,
        tool_name: &str,
        args: Value,
        parameter_summary: Option<String>,
    ) -> ToolExecution {
        let execution = ToolExecution {
            execution_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool_id: tool_id.to_string(),
            tool_name: tool_name.to_string(),
            status: ToolExecutionStatus::Created,
            args,
            parameter_summary,
            result: None,
            error: None,
            preview_id: None,
            start_time: now_ms(),
            end_time: None,
            execution_time_ms: None,
        };
        self.with_session(session_id, |s| {
            s.executions
                .insert(execution.execution_id.clone(), execution.clone());
        });
        self.events.emit("CREATED", json!(execution));
        execution
    }

    fn mutate(
        &self,
        execution_id: &str,
        expected: &[ToolExecutionStatus],
        apply: impl FnOnce(&mut ToolExecution),
    ) -> CoreResult<ToolExecution> {
        let mut sessions = self.sessions.lock().expect("tool execution manager poisoned");
        for session in sessions.values_mut() {
            if let Some(execution) = session.executions.get_mut(execution_id) {
                if execution.status.is_terminal() {
                    return Err(CoreError::InvalidTransition(format!(
                        "execution {execution_id} is already terminal ({:?})",
                        execution.status
                    )));
                }
                if !expected.is_empty() && !expected.contains(&execution.status) {
                    return Err(CoreError::InvalidTransition(format!(
                        "execution {execution_id} not in expected state(s) {expected:?}, was {:?}",
                        execution.status
                    )));
                }
                apply(execution);
                return Ok(execution.clone());
            }
        }
        Err(CoreError::ToolExecution(format!(
            "no such execution: {execution_id}"
        )))
    }

    pub fn start(&self, execution_id: &str) -> CoreResult<ToolExecution> {
        let execution = self.mutate(
            execution_id,
            &[ToolExecutionStatus::Created, ToolExecutionStatus::AwaitingPermission],
            |e| e.status = ToolExecutionStatus::Running,
        )?;
        self.events.emit("UPDATED", json!(execution));
        Ok(execution)
    }

    pub fn complete(
        &self,
        execution_id: &str,
        result: Value,
        duration_ms: i64,
    ) -> CoreResult<ToolExecution> {
        let execution = self.mutate(execution_id, &[ToolExecutionStatus::Running], |e| {
            e.status = ToolExecutionStatus::Completed;
            e.result = Some(result);
            e.end_time = Some(now_ms());
            e.execution_time_ms = Some(duration_ms);
        })?;
        self.events.emit("COMPLETED", json!(execution));
        Ok(execution)
    }

    pub fn fail(&self, execution_id: &str, error: ToolError) -> CoreResult<ToolExecution> {
        let execution = self.mutate(execution_id, &[ToolExecutionStatus::Running], |e| {
            e.status = ToolExecutionStatus::Error;
            e.error = Some(error);
            e.end_time = Some(now_ms());
        })?;
        self.events.emit("ERROR", json!(execution));
        Ok(execution)
    }

    pub fn abort(&self, execution_id: &str) -> CoreResult<ToolExecution> {
        let execution = self.mutate(execution_id, &[], |e| {
            e.status = ToolExecutionStatus::Aborted;
            e.end_time = Some(now_ms());
        })?;
        self.events.emit("ABORTED", json!(execution));
        Ok(execution)
    }

    /// Moves `CREATED|RUNNING -> AWAITING_PERMISSION`; fails if a
    /// permission request is already pending for this execution.
    pub fn request_permission(
        &self,
        execution_id: &str,
        args: Value,
    ) -> CoreResult<PermissionRequest> {
        let execution = self.mutate(
            execution_id,
            &[ToolExecutionStatus::Created, ToolExecutionStatus::Running],
            |e| e.status = ToolExecutionStatus::AwaitingPermission,
        )?;

        let request = PermissionRequest {
            id: Uuid::new_v4().to_string(),
            session_id: execution.session_id.clone(),
            execution_id: execution_id.to_string(),
            tool_id: execution.tool_id.clone(),
            tool_name: execution.tool_name.clone(),
            args,
            request_time: now_ms(),
            resolved_time: None,
            granted: None,
        };

        self.with_session(&execution.session_id, |s| {
            if let Some(existing_id) = s.permission_by_execution.get(execution_id) {
                if let Some(existing) = s.permissions.get(existing_id) {
                    if !existing.is_resolved() {
                        return Err(CoreError::InvalidTransition(format!(
                            "permission already pending for execution {execution_id}"
                        )));
                    }
                }
            }
            s.permission_by_execution
                .insert(execution_id.to_string(), request.id.clone());
            s.permissions.insert(request.id.clone(), request.clone());
            Ok(())
        })?;

        self.events.emit(
            "PERMISSION_REQUESTED",
            json!({ "execution": execution, "permission": request }),
        );
        Ok(request)
    }

    fn resolve_internal(
        &self,
        session_id: &str,
        permission_id: &str,
        granted: bool,
    ) -> CoreResult<(PermissionRequest, ToolExecution)> {
        let request = self.with_session(session_id, |s| -> CoreResult<PermissionRequest> {
            let request = s
                .permissions
                .get_mut(permission_id)
                .ok_or_else(|| CoreError::ToolExecution(format!("no such permission: {permission_id}")))?;
            if request.is_resolved() {
                return Err(CoreError::InvalidTransition(format!(
                    "permission {permission_id} already resolved"
                )));
            }
            request.granted = Some(granted);
            request.resolved_time = Some(now_ms());
            Ok(request.clone())
        })?;

        let execution = if granted {
            self.mutate(&request.execution_id, &[ToolExecutionStatus::AwaitingPermission], |e| {
                e.status = ToolExecutionStatus::Running;
            })?
        } else {
            // An in-flight abort may have already moved this execution to a
            // terminal state (see `ToolExecutionManager::abort`) between the
            // gate waking up and this resolution running. That race isn't an
            // error: the execution already landed where a denial would have
            // put it, so fall back to its current state instead of bailing.
            match self.mutate(&request.execution_id, &[], |e| {
                e.status = ToolExecutionStatus::Aborted;
                e.end_time = Some(now_ms());
            }) {
                Ok(execution) => execution,
                Err(CoreError::InvalidTransition(_)) => self
                    .find_execution(&request.execution_id)
                    .ok_or_else(|| {
                        CoreError::ToolExecution(format!(
                            "no such execution: {}",
                            request.execution_id
                        ))
                    })?,
                Err(e) => return Err(e),
            }
        };

        self.events.emit(
            "PERMISSION_RESOLVED",
            json!({ "execution": execution, "permission": request }),
        );
        Ok((request, execution))
    }

    pub fn resolve_permission(
        &self,
        permission_id: &str,
        granted: bool,
    ) -> CoreResult<(PermissionRequest, ToolExecution)> {
        let session_id = {
            let sessions = self.sessions.lock().expect("tool execution manager poisoned");
            sessions
                .iter()
                .find(|(_, s)| s.permissions.contains_key(permission_id))
                .map(|(id, _)| id.clone())
                .ok_or_else(|| CoreError::ToolExecution(format!("no such permission: {permission_id}")))?
        };
        self.resolve_internal(&session_id, permission_id, granted)
    }

    pub fn resolve_by_execution_id(
        &self,
        execution_id: &str,
        granted: bool,
    ) -> CoreResult<(PermissionRequest, ToolExecution)> {
        let (session_id, permission_id) = {
            let sessions = self.sessions.lock().expect("tool execution manager poisoned");
            sessions
                .iter()
                .find_map(|(sid, s)| {
                    s.permission_by_execution
                        .get(execution_id)
                        .map(|pid| (sid.clone(), pid.clone()))
                })
                .ok_or_else(|| {
                    CoreError::ToolExecution(format!("no pending permission for execution {execution_id}"))
                })?
        };
        self.resolve_internal(&session_id, &permission_id, granted)
    }

    fn find_execution(&self, execution_id: &str) -> Option<ToolExecution> {
        let sessions = self.sessions.lock().expect("tool execution manager poisoned");
        sessions
            .values()
            .find_map(|s| s.executions.get(execution_id))
            .cloned()
    }

    pub fn executions_for_session(&self, session_id: &str) -> Vec<ToolExecution> {
        self.with_session(session_id, |s| {
            let mut v: Vec<_> = s.executions.values().cloned().collect();
            v.sort_by_key(|e| e.start_time);
            v
        })
    }

    pub fn permission_for_execution(&self, execution_id: &str) -> Option<PermissionRequest> {
        let sessions = self.sessions.lock().expect("tool execution manager poisoned");
        sessions.values().find_map(|s| {
            s.permission_by_execution
                .get(execution_id)
                .and_then(|pid| s.permissions.get(pid))
                .cloned()
        })
    }

    /// Merges in-memory executions/permissions for `session_id` into any
    /// existing persisted record, preserving unrelated fields, then writes
    /// atomically. I/O errors are logged and swallowed.
    pub async fn save_session_data(&self, session_id: &str) {
        let (executions, permissions) = self.with_session(session_id, |s| {
            (
                s.executions.values().cloned().collect::<Vec<_>>(),
                s.permissions.values().cloned().collect::<Vec<_>>(),
            )
        });

        if let Err(e) = self
            .persistence
            .merge_tool_data(session_id, executions, permissions)
            .await
        {
            tracing::warn!(session_id, error = %e, "failed to persist tool execution data");
        }
    }

    pub async fn load_session_data(&self, session_id: &str) {
        match self.persistence.load_session(session_id).await {
            Ok(Some(data)) => {
                self.with_session(session_id, |s| {
                    for execution in data.tool_executions {
                        s.executions.insert(execution.execution_id.clone(), execution);
                    }
                    for request in data.permission_requests {
                        s.permission_by_execution
                            .insert(request.execution_id.clone(), request.id.clone());
                        s.permissions.insert(request.id.clone(), request);
                    }
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(session_id, error = %e, "failed to load tool execution data"),
        }
    }

    pub async fn delete_session_data(&self, session_id: &str) {
        self.clear_session_data(session_id);
        if let Err(e) = self.persistence.delete_session(session_id).await {
            tracing::warn!(session_id, error = %e, "failed to delete persisted session data");
        }
    }

    pub fn clear_session_data(&self, session_id: &str) {
        self.sessions
            .lock()
            .expect("tool execution manager poisoned")
            .remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryPersistence;

    fn manager() -> Arc<ToolExecutionManager> {
        ToolExecutionManager::new(Arc::new(InMemoryPersistence::new()))
    }

    #[test]
    fn lifecycle_happy_path() {
        let m = manager();
        let exec = m.create("s1", "bash", "bash", json!({}), None);
        m.start(&exec.execution_id).unwrap();
        let done = m.complete(&exec.execution_id, json!("ok"), 12).unwrap();
        assert_eq!(done.status, ToolExecutionStatus::Completed);
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let m = manager();
        let exec = m.create("s1", "bash", "bash", json!({}), None);
        m.start(&exec.execution_id).unwrap();
        m.complete(&exec.execution_id, json!("ok"), 1).unwrap();
        let err = m.start(&exec.execution_id).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[test]
    fn permission_denied_aborts_execution() {
        let m = manager();
        let exec = m.create("s1", "write", "write", json!({}), None);
        let request = m.request_permission(&exec.execution_id, json!({})).unwrap();
        let (resolved, execution) = m.resolve_permission(&request.id, false).unwrap();
        assert_eq!(resolved.granted, Some(false));
        assert_eq!(execution.status, ToolExecutionStatus::Aborted);
    }

    #[test]
    fn permission_granted_resumes_running() {
        let m = manager();
        let exec = m.create("s1", "write", "write", json!({}), None);
        let request = m.request_permission(&exec.execution_id, json!({})).unwrap();
        let (_resolved, execution) = m.resolve_permission(&request.id, true).unwrap();
        assert_eq!(execution.status, ToolExecutionStatus::Running);
    }

    #[test]
    fn only_one_pending_permission_per_execution() {
        let m = manager();
        let exec = m.create("s1", "write", "write", json!({}), None);
        m.request_permission(&exec.execution_id, json!({})).unwrap();
        let err = m.request_permission(&exec.execution_id, json!({})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[test]
    fn resolve_by_execution_id_looks_up_the_pending_request() {
        let m = manager();
        let exec = m.create("s1", "write", "write", json!({}), None);
        m.request_permission(&exec.execution_id, json!({})).unwrap();
        let (request, execution) = m.resolve_by_execution_id(&exec.execution_id, true).unwrap();
        assert!(request.is_resolved());
        assert_eq!(execution.status, ToolExecutionStatus::Running);
    }
}
