//! Tool Registry (C3) — holds tool definitions and dispatches calls with
//! callback hooks for start/complete/error observability.
//!
//! The callback triple from the source (`onStart`/`onComplete`/`onError`)
//! is kept as three subscription lists rather than collapsed into a single
//! tagged channel: it is the tool layer's own notification mechanism, not
//! the conversation-wide event bus (C10) — see [`crate::event_bus`] for
//! that one. Each subscribe call returns an unregister handle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::adapter::ExecutionAdapter;
use crate::error::CoreError;

/// Result from a tool execution. `success = false` pairs into the
/// conversation as a tool-result error rather than being thrown.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_data: Option<Value>,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            display_data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            display_data: None,
        }
    }

    pub fn with_display(mut self, data: Value) -> Self {
        self.display_data = Some(data);
        self
    }
}

/// Facade a tool uses to request a confirmation prompt for its own call,
/// independent of the registry-level `requiresPermission` gate the runner
/// applies before dispatch. Most tools never touch this; it exists for
/// tools that need a second, finer-grained confirmation mid-execution.
#[async_trait]
pub trait PermissionFacade: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Everything a tool call needs, created fresh per invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub working_dir: PathBuf,
    pub adapter: Arc<dyn ExecutionAdapter>,
    pub permissions: Arc<dyn PermissionFacade>,
    pub abort: CancellationToken,
    pub registry: Arc<ToolRegistry>,
}

impl ToolContext {
    pub fn new(
        session_id: impl Into<String>,
        working_dir: PathBuf,
        adapter: Arc<dyn ExecutionAdapter>,
        permissions: Arc<dyn PermissionFacade>,
        abort: CancellationToken,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            working_dir,
            adapter,
            permissions,
            abort,
            registry,
        }
    }
}

/// Validation result for a tool's custom validator.
pub struct ValidationError(pub String);

/// A tool is `{id, name, description, parameters, requiredParameters,
/// requiresPermission, alwaysRequirePermission?, validate, execute}`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;
    fn display_name(&self) -> &str {
        self.id()
    }
    fn description(&self) -> String;
    fn parameters(&self) -> Value;
    fn required_parameters(&self) -> &'static [&'static str] {
        &[]
    }
    fn requires_permission(&self) -> bool {
        false
    }
    fn always_require_permission(&self) -> bool {
        false
    }

    /// Custom validation beyond the required-argument check the registry
    /// already performs.
    fn validate(&self, _args: &Value) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Must observe `ctx.abort` at sensible checkpoints; if raised during
    /// execution it should return `Err(CoreError::AbortError)`.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, CoreError>;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDefinition {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub parameters: Value,
    pub required_parameters: Vec<String>,
    pub requires_permission: bool,
    pub always_require_permission: bool,
}

type StartHook = Arc<dyn Fn(&str, &Value, &ToolContext) + Send + Sync>;
type CompleteHook = Arc<dyn Fn(&str, &Value, &ToolOutput, u128) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str, &Value, &CoreError) + Send + Sync>;

struct Subscriptions {
    start: Vec<(u64, StartHook)>,
    complete: Vec<(u64, CompleteHook)>,
    error: Vec<(u64, ErrorHook)>,
}

impl Subscriptions {
    fn new() -> Self {
        Self {
            start: Vec::new(),
            complete: Vec::new(),
            error: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HookKind {
    Start,
    Complete,
    Error,
}

/// Handle returned from `on_start`/`on_complete`/`on_error`.
pub struct CallbackHandle {
    id: u64,
    kind: HookKind,
    subs: Arc<Mutex<Subscriptions>>,
}

impl CallbackHandle {
    pub fn unregister(self) {
        let mut subs = self.subs.lock().expect("tool registry hooks poisoned");
        match self.kind {
            HookKind::Start => subs.start.retain(|(id, _)| *id != self.id),
            HookKind::Complete => subs.complete.retain(|(id, _)| *id != self.id),
            HookKind::Error => subs.error.retain(|(id, _)| *id != self.id),
        }
    }
}

/// Holds tool definitions, keyed by id; dispatches calls through the
/// validate -> start -> execute -> complete/error pipeline.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    subs: Arc<Mutex<Subscriptions>>,
    next_id: AtomicU64,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            tools,
            subs: Arc::new(Mutex::new(Subscriptions::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.id() == id).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                id: t.id().to_string(),
                display_name: t.display_name().to_string(),
                description: t.description(),
                parameters: t.parameters(),
                required_parameters: t
                    .required_parameters()
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                requires_permission: t.requires_permission(),
                always_require_permission: t.always_require_permission(),
            })
            .collect()
    }

    pub fn on_start<F>(&self, f: F) -> CallbackHandle
    where
        F: Fn(&str, &Value, &ToolContext) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs
            .lock()
            .expect("tool registry hooks poisoned")
            .start
            .push((id, Arc::new(f)));
        CallbackHandle {
            id,
            kind: HookKind::Start,
            subs: self.subs.clone(),
        }
    }

    pub fn on_complete<F>(&self, f: F) -> CallbackHandle
    where
        F: Fn(&str, &Value, &ToolOutput, u128) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs
            .lock()
            .expect("tool registry hooks poisoned")
            .complete
            .push((id, Arc::new(f)));
        CallbackHandle {
            id,
            kind: HookKind::Complete,
            subs: self.subs.clone(),
        }
    }

    pub fn on_error<F>(&self, f: F) -> CallbackHandle
    where
        F: Fn(&str, &Value, &CoreError) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs
            .lock()
            .expect("tool registry hooks poisoned")
            .error
            .push((id, Arc::new(f)));
        CallbackHandle {
            id,
            kind: HookKind::Error,
            subs: self.subs.clone(),
        }
    }

    /// Validates required args and the tool's own validator, invokes
    /// `onStart`, runs the executor, then invokes `onComplete` or
    /// `onError` before propagating the result.
    pub async fn execute(
        &self,
        id: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, CoreError> {
        let tool = self
            .get(id)
            .ok_or_else(|| CoreError::ToolValidation(format!("unknown tool: {id}")))?;

        for required in tool.required_parameters() {
            if args.get(required).is_none() {
                return Err(CoreError::ToolValidation(format!(
                    "missing required parameter: {required}"
                )));
            }
        }
        if let Err(ValidationError(reason)) = tool.validate(&args) {
            return Err(CoreError::ToolValidation(reason));
        }

        self.run_start_hooks(id, &args, ctx);

        let start = std::time::Instant::now();
        match tool.execute(args.clone(), ctx).await {
            Ok(output) => {
                self.run_complete_hooks(id, &args, &output, start.elapsed().as_millis());
                Ok(output)
            }
            Err(error) => {
                self.run_error_hooks(id, &args, &error);
                Err(error)
            }
        }
    }

    fn run_start_hooks(&self, id: &str, args: &Value, ctx: &ToolContext) {
        let hooks: Vec<StartHook> = {
            let subs = self.subs.lock().expect("tool registry hooks poisoned");
            subs.start.iter().map(|(_, h)| h.clone()).collect()
        };
        for hook in hooks {
            hook(id, args, ctx);
        }
    }

    fn run_complete_hooks(&self, id: &str, args: &Value, output: &ToolOutput, duration_ms: u128) {
        let hooks: Vec<CompleteHook> = {
            let subs = self.subs.lock().expect("tool registry hooks poisoned");
            subs.complete.iter().map(|(_, h)| h.clone()).collect()
        };
        for hook in hooks {
            hook(id, args, output, duration_ms);
        }
    }

    fn run_error_hooks(&self, id: &str, args: &Value, error: &CoreError) {
        let hooks: Vec<ErrorHook> = {
            let subs = self.subs.lock().expect("tool registry hooks poisoned");
            subs.error.iter().map(|(_, h)| h.clone()).collect()
        };
        for hook in hooks {
            hook(id, args, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LocalAdapter;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

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
            Ok(ToolOutput::success(args["text"].as_str().unwrap_or("")))
        }
    }

    struct AutoApprove;
    #[async_trait]
    impl PermissionFacade for AutoApprove {
        async fn confirm(&self, _prompt: &str) -> bool {
            true
        }
    }

    fn test_ctx(registry: Arc<ToolRegistry>) -> ToolContext {
        ToolContext::new(
            "s1",
            std::env::temp_dir(),
            Arc::new(LocalAdapter::new(std::env::temp_dir())),
            Arc::new(AutoApprove),
            CancellationToken::new(),
            registry,
        )
    }

    #[tokio::test]
    async fn missing_required_arg_fails_validation() {
        let registry = Arc::new(ToolRegistry::new(vec![Arc::new(EchoTool)]));
        let ctx = test_ctx(registry.clone());
        let err = registry.execute("echo", json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, CoreError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn hooks_fire_in_order_around_a_successful_call() {
        let registry = Arc::new(ToolRegistry::new(vec![Arc::new(EchoTool)]));
        let ctx = test_ctx(registry.clone());

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let _h1 = registry.on_start(move |_, _, _| o1.lock().unwrap().push("start"));
        let o2 = order.clone();
        let _h2 = registry.on_complete(move |_, _, _, _| o2.lock().unwrap().push("complete"));

        let output = registry
            .execute("echo", json!({"text": "hi"}), &ctx)
            .await
            .unwrap();
        assert_eq!(output.output, "hi");
        assert_eq!(*order.lock().unwrap(), vec!["start", "complete"]);
    }

    #[tokio::test]
    async fn unregistered_hook_does_not_fire() {
        let registry = Arc::new(ToolRegistry::new(vec![Arc::new(EchoTool)]));
        let ctx = test_ctx(registry.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = registry.on_start(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        handle.unregister();
        registry
            .execute("echo", json!({"text": "hi"}), &ctx)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
