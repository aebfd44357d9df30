//! Execution Adapter (C2) — uniform filesystem/shell contract with
//! pluggable backends (local process, managed container, remote sandbox).
//!
//! All operations fail with a structured [`AdapterError`]; they never raise
//! on expected errors (missing file, ambiguous edit, unreachable backend).
//! Backends share behaviour by composition rather than inheritance: the
//! path-safety check and the repository-info helper below are free
//! functions every backend calls into, matching the "no shared base class"
//! guidance for this family of adapters.

mod container;
mod git_info;
mod local;
mod remote;

pub use container::ContainerAdapter;
pub use local::LocalAdapter;
pub use remote::RemoteAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[error("{message}")]
pub struct AdapterError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn not_found() -> Self {
        Self::new("not found")
    }

    pub fn ambiguous() -> Self {
        Self::new("ambiguous")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub line_offset: usize,
    pub line_count: usize,
    pub total_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileResult {
    pub path: String,
    pub display_path: String,
    pub content: String,
    pub size: u64,
    pub encoding: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditFileResult {
    pub path: String,
    pub display_path: String,
    pub original_content: String,
    pub new_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDirectoryResult {
    pub path: String,
    pub entries: Vec<DirEntry>,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<String>,
    pub include_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub branch: String,
    pub default_branch: String,
    pub status: String,
    pub recent_commits: Vec<String>,
}

/// `{environmentType, status, isReady, error?}`, emitted on construction and
/// on relevant transitions, with duplicate-suppression applied by the
/// wrapping [`StatusEmitter`] rather than by each backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EnvironmentStatusKind {
    Initializing,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub environment_type: String,
    pub status: EnvironmentStatusKind,
    pub is_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The uniform filesystem/shell capability surface. Backends: local
/// process, managed container, remote sandbox — interchangeable at session
/// creation time.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn execute_command(
        &self,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<CommandResult, AdapterError>;

    async fn read_file(
        &self,
        path: &str,
        max_size: Option<u64>,
        line_offset: Option<usize>,
        line_count: Option<usize>,
    ) -> Result<ReadFileResult, AdapterError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), AdapterError>;

    async fn edit_file(
        &self,
        path: &str,
        search_code: &str,
        replace_code: &str,
    ) -> Result<EditFileResult, AdapterError>;

    async fn list_directory(
        &self,
        path: &str,
        show_hidden: bool,
    ) -> Result<ListDirectoryResult, AdapterError>;

    async fn glob_files(
        &self,
        pattern: &str,
        options: GlobOptions,
    ) -> Result<Vec<String>, AdapterError>;

    async fn generate_directory_map(
        &self,
        root_path: &str,
        max_depth: usize,
    ) -> Result<String, AdapterError>;

    async fn get_repository_info(&self) -> Option<RepositoryInfo>;

    /// Subscribe to environment-status transitions for this adapter.
    fn subscribe_status(&self) -> broadcast::Receiver<EnvironmentStatus>;

    fn environment_type(&self) -> &'static str;
}

#[async_trait]
impl<T: ExecutionAdapter + ?Sized> ExecutionAdapter for std::sync::Arc<T> {
    async fn execute_command(
        &self,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<CommandResult, AdapterError> {
        (**self).execute_command(command, working_dir).await
    }

    async fn read_file(
        &self,
        path: &str,
        max_size: Option<u64>,
        line_offset: Option<usize>,
        line_count: Option<usize>,
    ) -> Result<ReadFileResult, AdapterError> {
        (**self)
            .read_file(path, max_size, line_offset, line_count)
            .await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), AdapterError> {
        (**self).write_file(path, content).await
    }

    async fn edit_file(
        &self,
        path: &str,
        search_code: &str,
        replace_code: &str,
    ) -> Result<EditFileResult, AdapterError> {
        (**self).edit_file(path, search_code, replace_code).await
    }

    async fn list_directory(
        &self,
        path: &str,
        show_hidden: bool,
    ) -> Result<ListDirectoryResult, AdapterError> {
        (**self).list_directory(path, show_hidden).await
    }

    async fn glob_files(
        &self,
        pattern: &str,
        options: GlobOptions,
    ) -> Result<Vec<String>, AdapterError> {
        (**self).glob_files(pattern, options).await
    }

    async fn generate_directory_map(
        &self,
        root_path: &str,
        max_depth: usize,
    ) -> Result<String, AdapterError> {
        (**self).generate_directory_map(root_path, max_depth).await
    }

    async fn get_repository_info(&self) -> Option<RepositoryInfo> {
        (**self).get_repository_info().await
    }

    fn subscribe_status(&self) -> broadcast::Receiver<EnvironmentStatus> {
        (**self).subscribe_status()
    }

    fn environment_type(&self) -> &'static str {
        (**self).environment_type()
    }
}

/// Shared path-safety helper: refuses any `path` that resolves (lexically,
/// without requiring the path to exist) outside `root`. Returns the
/// absolute path plus a root-relative display path.
///
/// Composition, not inheritance: every sandboxed backend calls this rather
/// than subclassing a shared adapter base.
pub fn resolve_within_root(root: &Path, path: &str) -> Result<(PathBuf, String), AdapterError> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let normalized = normalize_lexically(&joined);
    let normalized_root = normalize_lexically(root);

    if !normalized.starts_with(&normalized_root) {
        return Err(AdapterError::new(format!(
            "path escapes working root: {path}"
        ))
        .with_path(path));
    }

    let display = normalized
        .strip_prefix(&normalized_root)
        .unwrap_or(&normalized)
        .to_string_lossy()
        .to_string();

    Ok((normalized, display))
}

/// Lexical `..`/`.` resolution without touching the filesystem (the target
/// may not exist yet, e.g. a file about to be written).
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// CRLF -> LF normalization applied to both file content and the search
/// pattern before edit-matching, per the edit semantics in §4.2.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Finds the unique byte-offset match of `needle` in `haystack`.
///
/// Zero matches -> `not found`; more than one -> `ambiguous`. This is the
/// exact-match-only contract; no fuzzy dedent/trimmed-line fallback.
pub fn find_unique_match(haystack: &str, needle: &str) -> Result<usize, AdapterError> {
    if needle.is_empty() {
        return Err(AdapterError::new("search pattern must not be empty"));
    }
    let mut offsets = haystack.match_indices(needle).map(|(i, _)| i);
    let first = offsets.next().ok_or_else(AdapterError::not_found)?;
    if offsets.next().is_some() {
        return Err(AdapterError::ambiguous());
    }
    Ok(first)
}

/// Applies `editFile`'s search/replace over already CRLF-normalized
/// content, preserving every byte outside the match.
pub fn apply_unique_replacement(
    content: &str,
    search: &str,
    replace: &str,
) -> Result<String, AdapterError> {
    let offset = find_unique_match(content, search)?;
    let mut out = String::with_capacity(content.len() - search.len() + replace.len());
    out.push_str(&content[..offset]);
    out.push_str(replace);
    out.push_str(&content[offset + search.len()..]);
    Ok(out)
}

/// Coalesces consecutive-duplicate and illegal `initializing` status
/// events for a single adapter, per spec §4.2 / invariant 6 in §8.
///
/// Wraps a broadcast sender; every backend constructs one of these and
/// calls `emit` instead of sending on the channel directly.
pub struct StatusEmitter {
    environment_type: &'static str,
    last: Mutex<Option<EnvironmentStatusKind>>,
    tx: broadcast::Sender<EnvironmentStatus>,
}

impl StatusEmitter {
    pub fn new(environment_type: &'static str) -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self {
            environment_type,
            last: Mutex::new(None),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnvironmentStatus> {
        self.tx.subscribe()
    }

    /// Emits `kind`, suppressing it if identical to the last-emitted kind,
    /// or if it is `Initializing` following any state other than
    /// `Disconnected | Error | <none yet>`.
    pub fn emit(&self, kind: EnvironmentStatusKind, error: Option<String>) {
        let mut last = self.last.lock().expect("status emitter lock poisoned");

        if last.as_ref() == Some(&kind) {
            return;
        }
        if kind == EnvironmentStatusKind::Initializing {
            if let Some(prev) = last.as_ref() {
                if !matches!(
                    prev,
                    EnvironmentStatusKind::Disconnected | EnvironmentStatusKind::Error
                ) {
                    return;
                }
            }
        }

        let is_ready = kind == EnvironmentStatusKind::Connected;
        *last = Some(kind.clone());
        drop(last);

        let _ = self.tx.send(EnvironmentStatus {
            environment_type: self.environment_type.to_string(),
            status: kind,
            is_ready,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_match_ok() {
        assert_eq!(find_unique_match("a\nb\nc\n", "b").unwrap(), 2);
    }

    #[test]
    fn zero_matches_is_not_found() {
        let err = find_unique_match("a\nb\nc\n", "zzz").unwrap_err();
        assert_eq!(err.message, "not found");
    }

    #[test]
    fn multiple_matches_is_ambiguous() {
        let err = find_unique_match("x\nx\n", "x").unwrap_err();
        assert_eq!(err.message, "ambiguous");
    }

    #[test]
    fn replacement_preserves_bytes_outside_match() {
        let out = apply_unique_replacement("a\nb\nc\n", "b", "BB").unwrap();
        assert_eq!(out, "a\nBB\nc\n");
    }

    #[test]
    fn noop_replace_is_byte_identical() {
        let content = "a\nb\nc\n";
        let out = apply_unique_replacement(content, "b", "b").unwrap();
        assert_eq!(out, content);
    }

    #[test]
    fn crlf_normalized_before_matching() {
        let content = normalize_newlines("a\r\nb\r\nc\r\n");
        assert_eq!(content, "a\nb\nc\n");
    }

    #[test]
    fn path_escape_is_rejected() {
        let root = Path::new("/work/project");
        assert!(resolve_within_root(root, "../../etc/passwd").is_err());
    }

    #[test]
    fn relative_path_resolves_under_root() {
        let root = Path::new("/work/project");
        let (resolved, display) = resolve_within_root(root, "src/main.rs").unwrap();
        assert_eq!(resolved, Path::new("/work/project/src/main.rs"));
        assert_eq!(display, "src/main.rs");
    }

    #[test]
    fn status_emitter_suppresses_duplicates() {
        let emitter = StatusEmitter::new("local");
        let mut rx = emitter.subscribe();
        emitter.emit(EnvironmentStatusKind::Connected, None);
        emitter.emit(EnvironmentStatusKind::Connected, None);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn status_emitter_suppresses_initializing_after_connected() {
        let emitter = StatusEmitter::new("local");
        let mut rx = emitter.subscribe();
        emitter.emit(EnvironmentStatusKind::Connected, None);
        emitter.emit(EnvironmentStatusKind::Initializing, None);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn status_emitter_allows_initializing_after_disconnected() {
        let emitter = StatusEmitter::new("local");
        let mut rx = emitter.subscribe();
        emitter.emit(EnvironmentStatusKind::Connected, None);
        emitter.emit(EnvironmentStatusKind::Disconnected, None);
        emitter.emit(EnvironmentStatusKind::Initializing, None);
        assert!(rx.try_recv().is_ok()); // connected
        assert!(rx.try_recv().is_ok()); // disconnected
        assert!(rx.try_recv().is_ok()); // initializing
    }
}
