//! Container adapter — drives a `docker exec`'d shell as the filesystem
//! and command surface. Initializes eagerly in the background on
//! construction (`initializing -> connected|error`); on a transient
//! command failure that looks like "the container is gone" it emits
//! `disconnected`, attempts one restart, and resumes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::broadcast;

use super::{
    apply_unique_replacement, normalize_newlines, resolve_within_root, AdapterError,
    CommandResult, DirEntry, EditFileResult, EnvironmentStatus, EnvironmentStatusKind,
    ExecutionAdapter, GlobOptions, ListDirectoryResult, ReadFileResult, RepositoryInfo,
    StatusEmitter,
};

pub struct ContainerAdapter {
    container_id: String,
    working_dir: PathBuf,
    status: Arc<StatusEmitter>,
    restarted: AtomicBool,
}

impl ContainerAdapter {
    /// Starts eager background initialization immediately; the adapter is
    /// usable right away (commands queue behind the readiness handshake
    /// implicitly through normal `docker exec` failures until then).
    pub fn new(container_id: String, working_dir: PathBuf) -> Arc<Self> {
        let status = Arc::new(StatusEmitter::new("container"));
        let adapter = Arc::new(Self {
            container_id,
            working_dir,
            status: status.clone(),
            restarted: AtomicBool::new(false),
        });

        let probe = adapter.clone();
        tokio::spawn(async move {
            probe.status.emit(EnvironmentStatusKind::Initializing, None);
            match probe.probe().await {
                Ok(()) => probe.status.emit(EnvironmentStatusKind::Connected, None),
                Err(e) => probe
                    .status
                    .emit(EnvironmentStatusKind::Error, Some(e.message)),
            }
        });

        adapter
    }

    async fn probe(&self) -> Result<(), AdapterError> {
        self.raw_exec(&["true"]).await.map(|_| ())
    }

    fn looks_like_container_gone(stderr: &str) -> bool {
        let needle = stderr.to_lowercase();
        needle.contains("no such container")
            || needle.contains("is not running")
            || needle.contains("cannot connect to the docker daemon")
    }

    async fn raw_exec(&self, args: &[&str]) -> Result<std::process::Output, AdapterError> {
        Command::new("docker")
            .arg("exec")
            .arg(&self.container_id)
            .args(args)
            .output()
            .await
            .map_err(|e| AdapterError::new(format!("failed to run docker exec: {e}")))
    }

    /// Runs `args` inside the container, retrying exactly once through a
    /// restart if the failure looks like the container disappeared.
    async fn exec_with_recovery(
        &self,
        args: &[&str],
    ) -> Result<std::process::Output, AdapterError> {
        match self.raw_exec(args).await {
            Ok(output) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if Self::looks_like_container_gone(&stderr)
                    && !self.restarted.swap(true, Ordering::SeqCst)
                {
                    self.status.emit(EnvironmentStatusKind::Disconnected, None);
                    let _ = Command::new("docker")
                        .args(["restart", &self.container_id])
                        .output()
                        .await;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    match self.raw_exec(args).await {
                        Ok(retried) => {
                            self.status.emit(EnvironmentStatusKind::Connected, None);
                            Ok(retried)
                        }
                        Err(e) => {
                            self.status
                                .emit(EnvironmentStatusKind::Error, Some(e.message.clone()));
                            Err(e)
                        }
                    }
                } else {
                    Ok(output)
                }
            }
            other => other,
        }
    }

    /// Resolves `path` against the container's working root, refusing to
    /// leave it the same way the local backend does.
    fn resolved_path(&self, path: &str) -> Result<String, AdapterError> {
        let (resolved, _display) = resolve_within_root(&self.working_dir, path)?;
        Ok(resolved.display().to_string())
    }

    fn display_path(&self, resolved: &str) -> String {
        resolved
            .strip_prefix(&format!("{}/", self.working_dir.display()))
            .unwrap_or(resolved)
            .to_string()
    }
}

#[async_trait]
impl ExecutionAdapter for ContainerAdapter {
    async fn execute_command(
        &self,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<CommandResult, AdapterError> {
        let dir = match working_dir {
            Some(w) => self.resolved_path(w)?,
            None => self.working_dir.display().to_string(),
        };
        let wrapped = format!("cd {} && {}", shell_quote(&dir), command);
        let output = self.exec_with_recovery(&["bash", "-c", &wrapped]).await?;
        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn read_file(
        &self,
        path: &str,
        max_size: Option<u64>,
        line_offset: Option<usize>,
        line_count: Option<usize>,
    ) -> Result<ReadFileResult, AdapterError> {
        let resolved = self.resolved_path(path)?;
        let size_out = self
            .exec_with_recovery(&["stat", "-c", "%s", &resolved])
            .await?;
        if !size_out.status.success() {
            return Err(AdapterError::not_found().with_path(path));
        }
        let size: u64 = String::from_utf8_lossy(&size_out.stdout)
            .trim()
            .parse()
            .unwrap_or(0);
        if let Some(max) = max_size {
            if size > max {
                return Err(
                    AdapterError::new(format!("file too large: {size} bytes (max {max})"))
                        .with_path(path),
                );
            }
        }

        let out = self.exec_with_recovery(&["cat", &resolved]).await?;
        let content = normalize_newlines(&String::from_utf8_lossy(&out.stdout));

        let (content, pagination) = match (line_offset, line_count) {
            (None, None) => (content, None),
            (offset, count) => {
                let offset = offset.unwrap_or(0);
                let lines: Vec<&str> = content.lines().collect();
                let total_lines = lines.len();
                let end = count.map(|c| offset + c).unwrap_or(total_lines).min(total_lines);
                let start = offset.min(total_lines);
                (
                    lines[start..end].join("\n"),
                    Some(super::Pagination {
                        line_offset: start,
                        line_count: end - start,
                        total_lines,
                    }),
                )
            }
        };

        Ok(ReadFileResult {
            path: resolved.clone(),
            display_path: self.display_path(&resolved),
            content,
            size,
            encoding: "utf-8".to_string(),
            pagination,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), AdapterError> {
        let resolved = self.resolved_path(path)?;
        let parent = resolved.rsplit_once('/').map(|(p, _)| p).unwrap_or("/");
        self.exec_with_recovery(&["mkdir", "-p", parent]).await?;

        write_hex_encoded(self, &resolved, content).await?;

        let verify = self
            .exec_with_recovery(&["stat", "-c", "%s", &resolved])
            .await?;
        let size: u64 = String::from_utf8_lossy(&verify.stdout)
            .trim()
            .parse()
            .unwrap_or(0);
        if size != content.len() as u64 {
            return Err(AdapterError::new(format!(
                "write verification failed: wrote {} bytes, found {size} on disk",
                content.len()
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
        let resolved = self.resolved_path(path)?;
        let out = self.exec_with_recovery(&["cat", &resolved]).await?;
        if !out.status.success() {
            return Err(AdapterError::not_found().with_path(path));
        }
        let original_content = normalize_newlines(&String::from_utf8_lossy(&out.stdout));
        let search = normalize_newlines(search_code);
        let replace = normalize_newlines(replace_code);

        // Matching happens in-process (not via a shell-side scan); only the
        // resulting content crosses the shell boundary, and it does so
        // hex-encoded so no byte sequence can be misinterpreted by bash.
        let new_content = apply_unique_replacement(&original_content, &search, &replace)
            .map_err(|e| e.with_path(path))?;

        write_hex_encoded(self, &resolved, &new_content).await?;

        Ok(EditFileResult {
            path: resolved.clone(),
            display_path: self.display_path(&resolved),
            original_content,
            new_content,
        })
    }

    async fn list_directory(
        &self,
        path: &str,
        show_hidden: bool,
    ) -> Result<ListDirectoryResult, AdapterError> {
        let resolved = self.resolved_path(path)?;
        let flag = if show_hidden { "-A" } else { "" };
        let args: Vec<&str> = if show_hidden {
            vec!["ls", flag, &resolved]
        } else {
            vec!["ls", &resolved]
        };
        let out = self.exec_with_recovery(&args).await?;
        if !out.status.success() {
            return Err(AdapterError::new("directory not found").with_path(path));
        }

        let mut entries = Vec::new();
        for name in String::from_utf8_lossy(&out.stdout).lines() {
            let entry_path = format!("{resolved}/{name}");
            let type_out = self
                .exec_with_recovery(&["test", "-d", &entry_path])
                .await?;
            entries.push(DirEntry {
                name: name.to_string(),
                is_dir: type_out.status.success(),
                size: None,
            });
        }

        Ok(ListDirectoryResult {
            path: self.display_path(&resolved),
            count: entries.len(),
            entries,
        })
    }

    async fn glob_files(
        &self,
        pattern: &str,
        options: GlobOptions,
    ) -> Result<Vec<String>, AdapterError> {
        let base = match options.base_dir.as_deref() {
            Some(b) => self.resolved_path(b)?,
            None => self.working_dir.display().to_string(),
        };
        let out = self
            .exec_with_recovery(&["find", &base, "-type", "f"])
            .await?;
        let glob = globset::Glob::new(pattern)
            .map_err(|e| AdapterError::new(format!("invalid glob pattern: {e}")))?
            .compile_matcher();

        let mut matches: Vec<String> = String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| line.strip_prefix(&format!("{base}/")).map(str::to_string))
            .filter(|rel| glob.is_match(rel))
            .collect();
        matches.sort();
        Ok(matches)
    }

    async fn generate_directory_map(
        &self,
        root_path: &str,
        max_depth: usize,
    ) -> Result<String, AdapterError> {
        let resolved = self.resolved_path(root_path)?;
        let depth = max_depth.to_string();
        let out = self
            .exec_with_recovery(&["find", &resolved, "-maxdepth", &depth])
            .await?;
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    async fn get_repository_info(&self) -> Option<RepositoryInfo> {
        let out = self
            .exec_with_recovery(&[
                "git",
                "-C",
                &self.working_dir.display().to_string(),
                "rev-parse",
                "--abbrev-ref",
                "HEAD",
            ])
            .await
            .ok()?;
        if !out.status.success() {
            return None;
        }
        Some(RepositoryInfo {
            branch: String::from_utf8_lossy(&out.stdout).trim().to_string(),
            default_branch: "main".to_string(),
            status: String::new(),
            recent_commits: Vec::new(),
        })
    }

    fn subscribe_status(&self) -> broadcast::Receiver<EnvironmentStatus> {
        self.status.subscribe()
    }

    fn environment_type(&self) -> &'static str {
        "container"
    }
}

/// Writes `content` into `resolved` inside the container without ever
/// interpolating raw file bytes into a shell command string.
async fn write_hex_encoded(
    adapter: &ContainerAdapter,
    resolved: &str,
    content: &str,
) -> Result<(), AdapterError> {
    let encoded = hex::encode(content.as_bytes());
    let script = format!("printf '%s' {} | xxd -r -p > {}", shell_quote(&encoded), shell_quote(resolved));
    let out = adapter.exec_with_recovery(&["bash", "-c", &script]).await?;
    if !out.status.success() {
        return Err(AdapterError::new(format!(
            "write failed: {}",
            String::from_utf8_lossy(&out.stderr)
        )));
    }
    Ok(())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
