//! Remote sandbox adapter — delegates every operation to a remote sandbox
//! service over HTTP. The wire protocol of that service is a vendor detail
//! outside this core's scope; this adapter only fixes the shape of the
//! request/response envelope its methods need.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;

use super::{
    AdapterError, CommandResult, DirEntry, EditFileResult, EnvironmentStatus,
    EnvironmentStatusKind, ExecutionAdapter, GlobOptions, ListDirectoryResult, ReadFileResult,
    RepositoryInfo, StatusEmitter,
};

pub struct RemoteAdapter {
    base_url: String,
    sandbox_id: String,
    client: Client,
    status: Arc<StatusEmitter>,
}

impl RemoteAdapter {
    pub fn new(base_url: String, sandbox_id: String) -> Arc<Self> {
        let status = Arc::new(StatusEmitter::new("remote"));
        let adapter = Arc::new(Self {
            base_url,
            sandbox_id,
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            status: status.clone(),
        });

        let probe = adapter.clone();
        tokio::spawn(async move {
            probe
                .status
                .emit(EnvironmentStatusKind::Initializing, None);
            probe.status.emit(EnvironmentStatusKind::Connecting, None);
            match probe.health_check().await {
                Ok(()) => probe.status.emit(EnvironmentStatusKind::Connected, None),
                Err(e) => probe
                    .status
                    .emit(EnvironmentStatusKind::Error, Some(e.message)),
            }
        });

        adapter
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        self.client
            .get(format!(
                "{}/sandboxes/{}/health",
                self.base_url, self.sandbox_id
            ))
            .send()
            .await
            .map_err(|e| AdapterError::new(format!("remote sandbox unreachable: {e}")))?
            .error_for_status()
            .map_err(|e| AdapterError::new(format!("remote sandbox unhealthy: {e}")))?;
        Ok(())
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        op: &str,
        body: &Req,
    ) -> Result<Resp, AdapterError> {
        let response = self
            .client
            .post(format!(
                "{}/sandboxes/{}/{op}",
                self.base_url, self.sandbox_id
            ))
            .json(body)
            .send()
            .await
            .map_err(|e| AdapterError::new(format!("remote sandbox request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::new(format!(
                "remote sandbox returned {status}: {body}"
            )));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| AdapterError::new(format!("malformed remote sandbox response: {e}")))
    }
}

#[async_trait]
impl ExecutionAdapter for RemoteAdapter {
    async fn execute_command(
        &self,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<CommandResult, AdapterError> {
        self.post(
            "exec",
            &serde_json::json!({ "command": command, "workingDir": working_dir }),
        )
        .await
    }

    async fn read_file(
        &self,
        path: &str,
        max_size: Option<u64>,
        line_offset: Option<usize>,
        line_count: Option<usize>,
    ) -> Result<ReadFileResult, AdapterError> {
        self.post(
            "read_file",
            &serde_json::json!({
                "path": path,
                "maxSize": max_size,
                "lineOffset": line_offset,
                "lineCount": line_count,
            }),
        )
        .await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), AdapterError> {
        self.post(
            "write_file",
            &serde_json::json!({ "path": path, "content": content }),
        )
        .await
    }

    async fn edit_file(
        &self,
        path: &str,
        search_code: &str,
        replace_code: &str,
    ) -> Result<EditFileResult, AdapterError> {
        self.post(
            "edit_file",
            &serde_json::json!({
                "path": path,
                "searchCode": search_code,
                "replaceCode": replace_code,
            }),
        )
        .await
    }

    async fn list_directory(
        &self,
        path: &str,
        show_hidden: bool,
    ) -> Result<ListDirectoryResult, AdapterError> {
        #[derive(serde::Deserialize)]
        struct Wire {
            path: String,
            entries: Vec<DirEntry>,
        }
        let wire: Wire = self
            .post(
                "list_directory",
                &serde_json::json!({ "path": path, "showHidden": show_hidden }),
            )
            .await?;
        Ok(ListDirectoryResult {
            count: wire.entries.len(),
            path: wire.path,
            entries: wire.entries,
        })
    }

    async fn glob_files(
        &self,
        pattern: &str,
        options: GlobOptions,
    ) -> Result<Vec<String>, AdapterError> {
        self.post(
            "glob",
            &serde_json::json!({ "pattern": pattern, "options": options }),
        )
        .await
    }

    async fn generate_directory_map(
        &self,
        root_path: &str,
        max_depth: usize,
    ) -> Result<String, AdapterError> {
        #[derive(serde::Deserialize)]
        struct Wire {
            map: String,
        }
        let wire: Wire = self
            .post(
                "directory_map",
                &serde_json::json!({ "rootPath": root_path, "maxDepth": max_depth }),
            )
            .await?;
        Ok(wire.map)
    }

    async fn get_repository_info(&self) -> Option<RepositoryInfo> {
        self.post::<_, RepositoryInfo>("repository_info", &serde_json::json!({}))
            .await
            .ok()
    }

    fn subscribe_status(&self) -> broadcast::Receiver<EnvironmentStatus> {
        self.status.subscribe()
    }

    fn environment_type(&self) -> &'static str {
        "remote"
    }
}
