//! Local process adapter — runs commands and touches the filesystem
//! directly under `working_dir`, the simplest of the three backends.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::time::timeout;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

use super::{
    apply_unique_replacement, normalize_newlines, resolve_within_root, AdapterError,
    CommandResult, DirEntry, EditFileResult, EnvironmentStatus, EnvironmentStatusKind,
    ExecutionAdapter, GlobOptions, ListDirectoryResult, Pagination, ReadFileResult,
    RepositoryInfo, StatusEmitter,
};

const MAX_OUTPUT_LENGTH: usize = 128 * 1024;
const SNIP_SIZE: usize = 4 * 1024;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

pub struct LocalAdapter {
    working_dir: PathBuf,
    status: StatusEmitter,
}

impl LocalAdapter {
    pub fn new(working_dir: PathBuf) -> Self {
        let status = StatusEmitter::new("local");
        // A local process is immediately usable; no handshake needed.
        status.emit(EnvironmentStatusKind::Initializing, None);
        status.emit(EnvironmentStatusKind::Connected, None);
        Self {
            working_dir,
            status,
        }
    }

    fn truncate_output(output: &str) -> String {
        if output.len() <= MAX_OUTPUT_LENGTH {
            return output.to_string();
        }
        let start = &output[..SNIP_SIZE];
        let end = &output[output.len() - SNIP_SIZE..];
        format!(
            "[output truncated in middle: got {} bytes, max is {} bytes]\n{}\n\n[snip]\n\n{}",
            output.len(),
            MAX_OUTPUT_LENGTH,
            start,
            end
        )
    }
}

#[async_trait]
impl ExecutionAdapter for LocalAdapter {
    async fn execute_command(
        &self,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<CommandResult, AdapterError> {
        let dir = match working_dir {
            Some(w) => resolve_within_root(&self.working_dir, w)?.0,
            None => self.working_dir.clone(),
        };

        let mut cmd = Command::new("bash");
        cmd.args(["-c", command])
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                    .ok();
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| AdapterError::new(format!("failed to spawn process: {e}")))?;
        let pid = child.id();

        match timeout(COMMAND_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandResult {
                stdout: Self::truncate_output(&String::from_utf8_lossy(&output.stdout)),
                stderr: Self::truncate_output(&String::from_utf8_lossy(&output.stderr)),
                exit_code: output.status.code().unwrap_or(-1),
            }),
            Ok(Err(e)) => Err(AdapterError::new(format!("command execution failed: {e}"))),
            Err(_) => {
                if let Some(pid) = pid {
                    #[cfg(unix)]
                    {
                        use nix::sys::signal::{killpg, Signal};
                        use nix::unistd::Pid;
                        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    }
                    #[cfg(not(unix))]
                    let _ = pid;
                }
                Err(AdapterError::new(format!(
                    "command timed out after {COMMAND_TIMEOUT:?}"
                )))
            }
        }
    }

    async fn read_file(
        &self,
        path: &str,
        max_size: Option<u64>,
        line_offset: Option<usize>,
        line_count: Option<usize>,
    ) -> Result<ReadFileResult, AdapterError> {
        let (resolved, display) = resolve_within_root(&self.working_dir, path)?;
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| AdapterError::new(format!("{e}")).with_path(path))?;

        if let Some(max) = max_size {
            if metadata.len() > max {
                return Err(AdapterError::new(format!(
                    "file too large: {} bytes (max {max})",
                    metadata.len()
                ))
                .with_path(path));
            }
        }

        let raw = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| AdapterError::new(format!("{e}")).with_path(path))?;
        let content = normalize_newlines(&raw);

        let (content, pagination) = match (line_offset, line_count) {
            (None, None) => (content, None),
            (offset, count) => {
                let offset = offset.unwrap_or(0);
                let lines: Vec<&str> = content.lines().collect();
                let total_lines = lines.len();
                let end = count.map(|c| offset + c).unwrap_or(total_lines).min(total_lines);
                let start = offset.min(total_lines);
                let slice = lines[start..end].join("\n");
                (
                    slice,
                    Some(Pagination {
                        line_offset: start,
                        line_count: end - start,
                        total_lines,
                    }),
                )
            }
        };

        Ok(ReadFileResult {
            path: resolved.to_string_lossy().to_string(),
            display_path: display,
            content,
            size: metadata.len(),
            encoding: "utf-8".to_string(),
            pagination,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), AdapterError> {
        let (resolved, _display) = resolve_within_root(&self.working_dir, path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AdapterError::new(format!("{e}")).with_path(path))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| AdapterError::new(format!("{e}")).with_path(path))?;

        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| AdapterError::new(format!("{e}")).with_path(path))?;
        if metadata.len() != content.len() as u64 {
            return Err(AdapterError::new(format!(
                "write verification failed: wrote {} bytes, found {} on disk",
                content.len(),
                metadata.len()
            ))
            .with_path(path));
        }
        Ok(())
    }

    async fn edit_file(
        &self,
        path: &str,
        search_code: &str,
        replace_code: &str,
    ) -> Result<EditFileResult, AdapterError> {
        let (resolved, display) = resolve_within_root(&self.working_dir, path)?;
        let raw = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| AdapterError::new(format!("{e}")).with_path(path))?;

        let original_content = normalize_newlines(&raw);
        let search = normalize_newlines(search_code);
        let replace = normalize_newlines(replace_code);

        let new_content = apply_unique_replacement(&original_content, &search, &replace)
            .map_err(|e| e.with_path(path))?;

        tokio::fs::write(&resolved, &new_content)
            .await
            .map_err(|e| AdapterError::new(format!("{e}")).with_path(path))?;

        Ok(EditFileResult {
            path: resolved.to_string_lossy().to_string(),
            display_path: display,
            original_content,
            new_content,
        })
    }

    async fn list_directory(
        &self,
        path: &str,
        show_hidden: bool,
    ) -> Result<ListDirectoryResult, AdapterError> {
        let (resolved, display) = resolve_within_root(&self.working_dir, path)?;
        let mut read_dir = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| AdapterError::new(format!("{e}")).with_path(path))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| AdapterError::new(format!("{e}")).with_path(path))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !show_hidden && name.starts_with('.') {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| AdapterError::new(format!("{e}")))?;
            let size = if file_type.is_file() {
                entry.metadata().await.ok().map(|m| m.len())
            } else {
                None
            };
            entries.push(DirEntry {
                name,
                is_dir: file_type.is_dir(),
                size,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ListDirectoryResult {
            path: display,
            count: entries.len(),
            entries,
        })
    }

    async fn glob_files(
        &self,
        pattern: &str,
        options: GlobOptions,
    ) -> Result<Vec<String>, AdapterError> {
        let base = match &options.base_dir {
            Some(b) => resolve_within_root(&self.working_dir, b)?.0,
            None => self.working_dir.clone(),
        };

        let glob = globset::Glob::new(pattern)
            .map_err(|e| AdapterError::new(format!("invalid glob pattern: {e}")))?
            .compile_matcher();

        let mut matches = Vec::new();
        let mut builder = ignore::WalkBuilder::new(&base);
        builder.hidden(!options.include_hidden);
        for entry in builder.build() {
            let Ok(entry) = entry else { continue };
            let rel = entry
                .path()
                .strip_prefix(&base)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            if glob.is_match(&rel) {
                matches.push(rel);
            }
        }
        matches.sort();
        Ok(matches)
    }

    async fn generate_directory_map(
        &self,
        root_path: &str,
        max_depth: usize,
    ) -> Result<String, AdapterError> {
        let (resolved, _display) = resolve_within_root(&self.working_dir, root_path)?;
        let mut output = String::new();
        let mut builder = ignore::WalkBuilder::new(&resolved);
        builder.max_depth(Some(max_depth)).hidden(true);

        for entry in builder.build() {
            let Ok(entry) = entry else { continue };
            let depth = entry.depth();
            if depth == 0 {
                continue;
            }
            let indent = "  ".repeat(depth - 1);
            let name = entry.file_name().to_string_lossy();
            let suffix = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                "/"
            } else {
                ""
            };
            output.push_str(&format!("{indent}{name}{suffix}\n"));
        }
        Ok(output)
    }

    async fn get_repository_info(&self) -> Option<RepositoryInfo> {
        super::git_info::collect(&self.working_dir).await
    }

    fn subscribe_status(&self) -> broadcast::Receiver<EnvironmentStatus> {
        self.status.subscribe()
    }

    fn environment_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let adapter = LocalAdapter::new(dir.path().to_path_buf());
        adapter.write_file("a.txt", "hello\n").await.unwrap();
        let result = adapter.read_file("a.txt", None, None, None).await.unwrap();
        assert_eq!(result.content, "hello\n");
        assert_eq!(result.display_path, "a.txt");
    }

    #[tokio::test]
    async fn write_rejects_path_outside_root() {
        let dir = tempdir().unwrap();
        let adapter = LocalAdapter::new(dir.path().to_path_buf());
        let result = adapter.write_file("../escape.txt", "x").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn edit_preserves_bytes_outside_match() {
        let dir = tempdir().unwrap();
        let adapter = LocalAdapter::new(dir.path().to_path_buf());
        adapter.write_file("f.txt", "a\nb\nc\n").await.unwrap();
        let result = adapter.edit_file("f.txt", "b", "BB").await.unwrap();
        assert_eq!(result.new_content, "a\nBB\nc\n");

        let on_disk = tokio::fs::read_to_string(dir.path().join("f.txt"))
            .await
            .unwrap();
        assert_eq!(on_disk, "a\nBB\nc\n");
    }

    #[tokio::test]
    async fn repeated_edit_after_success_is_not_found() {
        let dir = tempdir().unwrap();
        let adapter = LocalAdapter::new(dir.path().to_path_buf());
        adapter.write_file("f.txt", "a\nb\nc\n").await.unwrap();
        adapter.edit_file("f.txt", "b", "BB").await.unwrap();
        let err = adapter.edit_file("f.txt", "b", "BB").await.unwrap_err();
        assert_eq!(err.message, "not found");
    }

    #[tokio::test]
    async fn ambiguous_edit_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let adapter = LocalAdapter::new(dir.path().to_path_buf());
        adapter.write_file("f.txt", "x\nx\n").await.unwrap();
        let err = adapter.edit_file("f.txt", "x", "y").await.unwrap_err();
        assert_eq!(err.message, "ambiguous");
        let on_disk = tokio::fs::read_to_string(dir.path().join("f.txt"))
            .await
            .unwrap();
        assert_eq!(on_disk, "x\nx\n");
    }

    #[tokio::test]
    async fn execute_command_runs_in_working_dir() {
        let dir = tempdir().unwrap();
        let adapter = LocalAdapter::new(dir.path().to_path_buf());
        let result = adapter.execute_command("pwd", None).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.trim().ends_with(
            dir.path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .as_ref()
        ));
    }

    #[tokio::test]
    async fn list_directory_hides_dotfiles_by_default() {
        let dir = tempdir().unwrap();
        let adapter = LocalAdapter::new(dir.path().to_path_buf());
        adapter.write_file(".hidden", "x").await.unwrap();
        adapter.write_file("visible.txt", "x").await.unwrap();
        let result = adapter.list_directory(".", false).await.unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.entries[0].name, "visible.txt");
    }
}
