//! The concrete tool set dispatched through the Tool Registry (C3) —
//! bash, file read/write/edit, directory listing, glob, directory map,
//! and repository info — each a thin [`Tool`] wrapper delegating its
//! actual I/O to the session's [`ExecutionAdapter`] (C2).
//!
//! None of these tools touch the filesystem or a shell directly: that
//! split is what lets the same tool definitions run against a local
//! process, a container, or a remote sandbox unchanged.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::GlobOptions;
use crate::error::CoreError;
use crate::tool_registry::{Tool, ToolContext, ToolOutput};

fn adapter_err(err: crate::adapter::AdapterError) -> CoreError {
    CoreError::ToolExecution(err.message)
}

pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn id(&self) -> &str {
        "bash"
    }
    fn display_name(&self) -> &str {
        "Bash"
    }
    fn description(&self) -> String {
        "Runs a shell command in the session's working directory.".to_string()
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
            },
        })
    }
    fn required_parameters(&self) -> &'static [&'static str] {
        &["command"]
    }
    fn requires_permission(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, CoreError> {
        let command = args["command"].as_str().unwrap_or_default();
        let result = ctx
            .adapter
            .execute_command(command, None)
            .await
            .map_err(adapter_err)?;

        let combined = if !result.stderr.is_empty() && !result.stdout.is_empty() {
            format!("{}{}", result.stdout, result.stderr)
        } else if !result.stderr.is_empty() {
            result.stderr
        } else {
            result.stdout
        };

        if result.exit_code == 0 {
            Ok(ToolOutput::success(combined))
        } else {
            Ok(ToolOutput::error(format!(
                "[exit code {}]\n{combined}",
                result.exit_code
            )))
        }
    }
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn id(&self) -> &str {
        "read_file"
    }
    fn display_name(&self) -> &str {
        "Read File"
    }
    fn description(&self) -> String {
        "Reads a file, optionally a line range, from the working directory.".to_string()
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "line_offset": {"type": "integer"},
                "line_count": {"type": "integer"},
            },
        })
    }
    fn required_parameters(&self) -> &'static [&'static str] {
        &["path"]
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, CoreError> {
        let path = args["path"].as_str().unwrap_or_default();
        let line_offset = args["line_offset"].as_u64().map(|v| v as usize);
        let line_count = args["line_count"].as_u64().map(|v| v as usize);

        let result = ctx
            .adapter
            .read_file(path, None, line_offset, line_count)
            .await
            .map_err(adapter_err)?;

        Ok(ToolOutput::success(result.content).with_display(json!({
            "path": result.display_path,
            "size": result.size,
            "pagination": result.pagination,
        })))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn id(&self) -> &str {
        "write_file"
    }
    fn display_name(&self) -> &str {
        "Write File"
    }
    fn description(&self) -> String {
        "Writes (overwriting) a file's full contents.".to_string()
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"},
            },
        })
    }
    fn required_parameters(&self) -> &'static [&'static str] {
        &["path", "content"]
    }
    fn requires_permission(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, CoreError> {
        let path = args["path"].as_str().unwrap_or_default();
        let content = args["content"].as_str().unwrap_or_default();
        ctx.adapter
            .write_file(path, content)
            .await
            .map_err(adapter_err)?;
        Ok(ToolOutput::success(format!("wrote {path}")))
    }
}

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn id(&self) -> &str {
        "edit_file"
    }
    fn display_name(&self) -> &str {
        "Edit File"
    }
    fn description(&self) -> String {
        "Replaces the unique occurrence of a search string with a replacement.".to_string()
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "search": {"type": "string"},
                "replace": {"type": "string"},
            },
        })
    }
    fn required_parameters(&self) -> &'static [&'static str] {
        &["path", "search", "replace"]
    }
    fn always_require_permission(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, CoreError> {
        let path = args["path"].as_str().unwrap_or_default();
        let search = args["search"].as_str().unwrap_or_default();
        let replace = args["replace"].as_str().unwrap_or_default();

        let result = ctx
            .adapter
            .edit_file(path, search, replace)
            .await
            .map_err(adapter_err)?;

        Ok(ToolOutput::success(format!("edited {}", result.display_path)).with_display(json!({
            "path": result.display_path,
            "original_content": result.original_content,
            "new_content": result.new_content,
        })))
    }
}

pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn id(&self) -> &str {
        "list_directory"
    }
    fn display_name(&self) -> &str {
        "List Directory"
    }
    fn description(&self) -> String {
        "Lists the entries of a directory.".to_string()
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "show_hidden": {"type": "boolean"},
            },
        })
    }
    fn required_parameters(&self) -> &'static [&'static str] {
        &["path"]
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, CoreError> {
        let path = args["path"].as_str().unwrap_or_default();
        let show_hidden = args["show_hidden"].as_bool().unwrap_or(false);

        let result = ctx
            .adapter
            .list_directory(path, show_hidden)
            .await
            .map_err(adapter_err)?;

        let rendered = result
            .entries
            .iter()
            .map(|e| format!("{}{}", e.name, if e.is_dir { "/" } else { "" }))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutput::success(rendered).with_display(json!({
            "path": result.path,
            "count": result.count,
        })))
    }
}

pub struct GlobFilesTool;

#[async_trait]
impl Tool for GlobFilesTool {
    fn id(&self) -> &str {
        "glob"
    }
    fn display_name(&self) -> &str {
        "Glob"
    }
    fn description(&self) -> String {
        "Finds files matching a glob pattern, honouring ignore files.".to_string()
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string"},
                "base_dir": {"type": "string"},
                "include_hidden": {"type": "boolean"},
            },
        })
    }
    fn required_parameters(&self) -> &'static [&'static str] {
        &["pattern"]
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, CoreError> {
        let pattern = args["pattern"].as_str().unwrap_or_default();
        let options = GlobOptions {
            base_dir: args["base_dir"].as_str().map(str::to_string),
            include_hidden: args["include_hidden"].as_bool().unwrap_or(false),
        };

        let matches = ctx
            .adapter
            .glob_files(pattern, options)
            .await
            .map_err(adapter_err)?;

        Ok(ToolOutput::success(matches.join("\n")).with_display(json!({ "count": matches.len() })))
    }
}

pub struct DirectoryMapTool;

#[async_trait]
impl Tool for DirectoryMapTool {
    fn id(&self) -> &str {
        "directory_map"
    }
    fn display_name(&self) -> &str {
        "Directory Map"
    }
    fn description(&self) -> String {
        "Renders a depth-bounded tree of the working directory.".to_string()
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "root_path": {"type": "string"},
                "max_depth": {"type": "integer"},
            },
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, CoreError> {
        let root_path = args["root_path"].as_str().unwrap_or(".");
        let max_depth = args["max_depth"].as_u64().unwrap_or(3) as usize;

        let map = ctx
            .adapter
            .generate_directory_map(root_path, max_depth)
            .await
            .map_err(adapter_err)?;

        Ok(ToolOutput::success(map))
    }
}

pub struct RepositoryInfoTool;

#[async_trait]
impl Tool for RepositoryInfoTool {
    fn id(&self) -> &str {
        "repository_info"
    }
    fn display_name(&self) -> &str {
        "Repository Info"
    }
    fn description(&self) -> String {
        "Reports the current branch, default branch, status, and recent commits.".to_string()
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, ctx: &ToolContext) -> Result<ToolOutput, CoreError> {
        match ctx.adapter.get_repository_info().await {
            Some(info) => Ok(ToolOutput::success(format!(
                "branch: {}\ndefault branch: {}\nstatus:\n{}\nrecent commits:\n{}",
                info.branch,
                info.default_branch,
                info.status,
                info.recent_commits.join("\n"),
            ))
            .with_display(json!(info))),
            None => Ok(ToolOutput::error("not a git repository")),
        }
    }
}

/// The fixed concrete tool set SPEC_FULL.md registers against the
/// Execution Adapter. Order is display order, not a dispatch contract.
pub fn built_in_tools() -> Vec<std::sync::Arc<dyn Tool>> {
    vec![
        std::sync::Arc::new(BashTool),
        std::sync::Arc::new(ReadFileTool),
        std::sync::Arc::new(WriteFileTool),
        std::sync::Arc::new(EditFileTool),
        std::sync::Arc::new(ListDirectoryTool),
        std::sync::Arc::new(GlobFilesTool),
        std::sync::Arc::new(DirectoryMapTool),
        std::sync::Arc::new(RepositoryInfoTool),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LocalAdapter;
    use crate::tool_registry::{PermissionFacade, ToolRegistry};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct AutoApprove;
    #[async_trait]
    impl PermissionFacade for AutoApprove {
        async fn confirm(&self, _prompt: &str) -> bool {
            true
        }
    }

    fn ctx(working_dir: std::path::PathBuf, registry: Arc<ToolRegistry>) -> ToolContext {
        ToolContext::new(
            "s1",
            working_dir.clone(),
            Arc::new(LocalAdapter::new(working_dir)),
            Arc::new(AutoApprove),
            CancellationToken::new(),
            registry,
        )
    }

    #[tokio::test]
    async fn bash_echoes_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(built_in_tools()));
        let c = ctx(dir.path().to_path_buf(), registry.clone());
        let out = registry
            .execute("bash", json!({"command": "echo hi"}), &c)
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.output.trim(), "hi");
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(built_in_tools()));
        let c = ctx(dir.path().to_path_buf(), registry.clone());

        registry
            .execute("write_file", json!({"path": "a.txt", "content": "hello"}), &c)
            .await
            .unwrap();
        let out = registry
            .execute("read_file", json!({"path": "a.txt"}), &c)
            .await
            .unwrap();
        assert_eq!(out.output, "hello");
    }

    #[tokio::test]
    async fn edit_replaces_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(built_in_tools()));
        let c = ctx(dir.path().to_path_buf(), registry.clone());

        registry
            .execute("write_file", json!({"path": "a.txt", "content": "a\nb\nc\n"}), &c)
            .await
            .unwrap();
        let out = registry
            .execute(
                "edit_file",
                json!({"path": "a.txt", "search": "b", "replace": "BB"}),
                &c,
            )
            .await
            .unwrap();
        assert!(out.success);
        let read = registry
            .execute("read_file", json!({"path": "a.txt"}), &c)
            .await
            .unwrap();
        assert_eq!(read.output, "a\nBB\nc\n");
    }

    #[tokio::test]
    async fn list_directory_reports_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), "x").unwrap();
        let registry = Arc::new(ToolRegistry::new(built_in_tools()));
        let c = ctx(dir.path().to_path_buf(), registry.clone());
        let out = registry
            .execute("list_directory", json!({"path": "."}), &c)
            .await
            .unwrap();
        assert!(out.output.contains("x.txt"));
    }

    #[tokio::test]
    async fn glob_finds_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.rs"), "").unwrap();
        std::fs::write(dir.path().join("y.txt"), "").unwrap();
        let registry = Arc::new(ToolRegistry::new(built_in_tools()));
        let c = ctx(dir.path().to_path_buf(), registry.clone());
        let out = registry
            .execute("glob", json!({"pattern": "*.rs"}), &c)
            .await
            .unwrap();
        assert!(out.output.contains("x.rs"));
        assert!(!out.output.contains("y.txt"));
    }

    #[tokio::test]
    async fn repository_info_reports_not_a_repo_outside_git() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(built_in_tools()));
        let c = ctx(dir.path().to_path_buf(), registry.clone());
        let out = registry
            .execute("repository_info", json!({}), &c)
            .await
            .unwrap();
        assert!(!out.success);
    }
}
