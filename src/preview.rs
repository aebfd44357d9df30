//! Preview Manager (C4) — generates and stores display-oriented previews
//! keyed by execution id.
//!
//! Storage only: actual preview content is produced by an external preview
//! service consulted after tool completion or at permission-request time.
//! A missing preview never blocks a state transition (§9); this manager
//! just holds whatever was produced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preview {
    pub id: String,
    pub session_id: String,
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_id: Option<String>,
    pub content_type: String,
    pub brief: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Default)]
struct Store {
    by_execution: HashMap<String, Preview>,
}

/// Storage-only component; keyed by execution id with an index for lookups.
pub struct PreviewManager {
    store: Mutex<Store>,
}

impl PreviewManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(Store::default()),
        })
    }

    pub fn create_preview(
        &self,
        session_id: &str,
        execution_id: &str,
        content_type: &str,
        brief: &str,
        full: Option<String>,
        metadata: HashMap<String, Value>,
    ) -> Preview {
        let preview = Preview {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            execution_id: execution_id.to_string(),
            permission_id: None,
            content_type: content_type.to_string(),
            brief: brief.to_string(),
            full,
            metadata,
        };
        self.store
            .lock()
            .expect("preview manager lock poisoned")
            .by_execution
            .insert(execution_id.to_string(), preview.clone());
        preview
    }

    pub fn create_permission_preview(
        &self,
        session_id: &str,
        execution_id: &str,
        permission_id: &str,
        content_type: &str,
        brief: &str,
        full: Option<String>,
        metadata: HashMap<String, Value>,
    ) -> Preview {
        let preview = Preview {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            execution_id: execution_id.to_string(),
            permission_id: Some(permission_id.to_string()),
            content_type: content_type.to_string(),
            brief: brief.to_string(),
            full,
            metadata,
        };
        self.store
            .lock()
            .expect("preview manager lock poisoned")
            .by_execution
            .insert(execution_id.to_string(), preview.clone());
        preview
    }

    pub fn get_for_execution(&self, execution_id: &str) -> Option<Preview> {
        self.store
            .lock()
            .expect("preview manager lock poisoned")
            .by_execution
            .get(execution_id)
            .cloned()
    }

    /// Session-scoped snapshot for the persistence gateway to serialize
    /// alongside the rest of a session's data set.
    pub fn for_session(&self, session_id: &str) -> Vec<Preview> {
        self.store
            .lock()
            .expect("preview manager lock poisoned")
            .by_execution
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn load_session_data(&self, previews: Vec<Preview>) {
        let mut store = self.store.lock().expect("preview manager lock poisoned");
        for preview in previews {
            store.by_execution.insert(preview.execution_id.clone(), preview);
        }
    }

    /// Persists this session's previews through the gateway, merging into
    /// whatever record already exists. I/O errors are logged and swallowed,
    /// matching the Tool Execution Manager's best-effort save contract.
    pub async fn save_session_data(
        &self,
        session_id: &str,
        persistence: &dyn crate::db::PersistenceGateway,
    ) {
        let previews = self.for_session(session_id);
        if let Err(e) = persistence.merge_previews(session_id, previews).await {
            tracing::warn!(session_id, error = %e, "failed to persist preview data");
        }
    }

    pub fn clear_session_data(&self, session_id: &str) {
        self.store
            .lock()
            .expect("preview manager lock poisoned")
            .by_execution
            .retain(|_, p| p.session_id != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PersistenceGateway as _;

    #[test]
    fn create_and_fetch_by_execution() {
        let manager = PreviewManager::new();
        manager.create_preview("s1", "e1", "diff", "brief", None, HashMap::new());
        let preview = manager.get_for_execution("e1").unwrap();
        assert_eq!(preview.brief, "brief");
        assert!(preview.permission_id.is_none());
    }

    #[test]
    fn missing_preview_returns_none_not_error() {
        let manager = PreviewManager::new();
        assert!(manager.get_for_execution("missing").is_none());
    }

    #[test]
    fn permission_preview_carries_permission_id() {
        let manager = PreviewManager::new();
        let preview =
            manager.create_permission_preview("s1", "e1", "p1", "diff", "brief", None, HashMap::new());
        assert_eq!(preview.permission_id.as_deref(), Some("p1"));
    }

    #[test]
    fn clear_session_data_only_removes_that_session() {
        let manager = PreviewManager::new();
        manager.create_preview("s1", "e1", "diff", "b", None, HashMap::new());
        manager.create_preview("s2", "e2", "diff", "b", None, HashMap::new());
        manager.clear_session_data("s1");
        assert!(manager.get_for_execution("e1").is_none());
        assert!(manager.get_for_execution("e2").is_some());
    }

    #[tokio::test]
    async fn save_session_data_persists_through_the_gateway() {
        let manager = PreviewManager::new();
        manager.create_preview("s1", "e1", "diff", "brief", None, HashMap::new());
        let persistence = crate::db::InMemoryPersistence::new();

        manager.save_session_data("s1", &persistence).await;

        let data = persistence.load_session("s1").await.unwrap().unwrap();
        assert_eq!(data.previews.len(), 1);
        assert_eq!(data.previews[0].execution_id, "e1");
    }

    #[tokio::test]
    async fn save_session_data_only_writes_that_session_previews() {
        let manager = PreviewManager::new();
        manager.create_preview("s1", "e1", "diff", "b", None, HashMap::new());
        manager.create_preview("s2", "e2", "diff", "b", None, HashMap::new());
        let persistence = crate::db::InMemoryPersistence::new();

        manager.save_session_data("s1", &persistence).await;
        manager.save_session_data("s2", &persistence).await;

        let s1 = persistence.load_session("s1").await.unwrap().unwrap();
        let s2 = persistence.load_session("s2").await.unwrap().unwrap();
        assert_eq!(s1.previews.len(), 1);
        assert_eq!(s2.previews.len(), 1);
        assert_eq!(s1.previews[0].execution_id, "e1");
        assert_eq!(s2.previews[0].execution_id, "e2");
    }
}
