//! Session Manager (C8) — session CRUD, bounded cache with LRU eviction,
//! idle-timeout sweeper.
//!
//! Knows nothing of the Agent Service: it owns Sessions and nothing else.
//! Per §9's note on cyclic references, the Service composes this manager
//! and subscribes to its events rather than the manager reaching upward.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::task::JoinHandle;

use crate::abort_registry::AbortRegistry;
use crate::config::{AdapterKind, Config, PermissionMode};
use crate::db::{ConversationEntry, Role};
use crate::event_bus::EventBus;
use crate::error::{CoreError, CoreResult};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub caching_enabled: bool,
    pub permission_mode: PermissionMode,
    pub pre_allowed_tool_ids: Vec<String>,
    pub fast_edit_mode: bool,
    pub adapter_kind: AdapterKind,
    pub sandbox_id: Option<String>,
    /// Root directory the session's execution adapter resolves paths
    /// against, mirroring the teacher's `ConvContext::working_dir`.
    pub working_dir: PathBuf,
}

impl SessionConfig {
    /// Defaults derived from the process-wide `Config`, the same starting
    /// point `SessionManager::create` uses when a caller doesn't supply
    /// its own overrides.
    pub fn defaults(config: &Config) -> Self {
        Self::from_core_config(config)
    }

    fn from_core_config(config: &Config) -> Self {
        Self {
            model: config.default_model.clone(),
            caching_enabled: config.caching_enabled,
            permission_mode: config.permission_mode,
            pre_allowed_tool_ids: config.pre_allowed_tool_ids.clone(),
            fast_edit_mode: false,
            adapter_kind: config.default_adapter_kind,
            sandbox_id: None,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: i64,
    pub last_active: i64,
    pub processing: bool,
    pub conversation: Vec<ConversationEntry>,
    pub config: SessionConfig,
}

impl Session {
    fn new(id: String, config: SessionConfig) -> Self {
        let now = now_ms();
        Self {
            id,
            created_at: now,
            last_active: now,
            processing: false,
            conversation: Vec::new(),
            config,
        }
    }

    pub fn push_user_message(&mut self, text: &str) {
        self.conversation.push(ConversationEntry {
            role: Role::User,
            content: vec![crate::db::ContentPart::Text {
                text: text.to_string(),
            }],
        });
    }
}

/// Partial update applied by `update`; every call bumps `last_active`
/// regardless of which fields are set.
#[derive(Default)]
pub struct SessionPatch {
    pub processing: Option<bool>,
    pub fast_edit_mode: Option<bool>,
    pub adapter_kind: Option<AdapterKind>,
    pub sandbox_id: Option<Option<String>>,
}

struct Store {
    sessions: HashMap<String, Session>,
    /// Least-recently-active ordering, front = least recent.
    lru: Vec<String>,
}

impl Store {
    fn touch(&mut self, id: &str) {
        self.lru.retain(|s| s != id);
        self.lru.push(id.to_string());
    }

    fn remove(&mut self, id: &str) {
        self.lru.retain(|s| s != id);
        self.sessions.remove(id);
    }
}

pub struct SessionManager {
    store: Mutex<Store>,
    max_sessions: usize,
    session_timeout_secs: u64,
    abort_registry: Arc<AbortRegistry>,
    pub events: EventBus,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(config: &Config, abort_registry: Arc<AbortRegistry>) -> Arc<Self> {
        let manager = Arc::new(Self {
            store: Mutex::new(Store {
                sessions: HashMap::new(),
                lru: Vec::new(),
            }),
            max_sessions: config.max_sessions,
            session_timeout_secs: config.session_timeout.as_secs(),
            abort_registry,
            events: EventBus::new(),
            sweeper: Mutex::new(None),
        });

        if config.cleanup_enabled {
            let weak = Arc::downgrade(&manager);
            let interval = config.cleanup_interval;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    match weak.upgrade() {
                        Some(manager) => manager.sweep(),
                        None => return,
                    }
                }
            });
            *manager.sweeper.lock().expect("session manager poisoned") = Some(handle);
        }

        manager
    }

    pub fn create(&self, config: &Config, overrides: Option<SessionConfig>) -> Session {
        let session_config = overrides.unwrap_or_else(|| SessionConfig::from_core_config(config));
        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), session_config);
        self.add(session.clone());
        session
    }

    /// Inserts a session as-is, for restoration from persistence.
    pub fn add(&self, session: Session) {
        let mut store = self.store.lock().expect("session manager poisoned");
        let id = session.id.clone();
        store.sessions.insert(id.clone(), session);
        store.touch(&id);
        self.evict_over_capacity(&mut store);
    }

    fn evict_over_capacity(&self, store: &mut Store) {
        while store.lru.len() > self.max_sessions {
            // The least-recently-active session is at the front, but a
            // processing session must never be swept out from under a
            // turn; skip forward to the first evictable one.
            let victim = store
                .lru
                .iter()
                .find(|id| {
                    store
                        .sessions
                        .get(*id)
                        .map(|s| !s.processing)
                        .unwrap_or(true)
                })
                .cloned();
            match victim {
                Some(id) => {
                    store.remove(&id);
                    self.abort_registry.clear(&id);
                    self.events.emit("session:removed", json!({ "sessionId": id }));
                }
                None => break,
            }
        }
    }

    pub fn get(&self, id: &str) -> CoreResult<Session> {
        self.store
            .lock()
            .expect("session manager poisoned")
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    pub fn update(&self, id: &str, patch: SessionPatch) -> CoreResult<Session> {
        let mut store = self.store.lock().expect("session manager poisoned");
        let session = store
            .sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;

        if let Some(processing) = patch.processing {
            session.processing = processing;
        }
        if let Some(fast_edit) = patch.fast_edit_mode {
            session.config.fast_edit_mode = fast_edit;
        }
        if let Some(kind) = patch.adapter_kind {
            session.config.adapter_kind = kind;
        }
        if let Some(sandbox_id) = patch.sandbox_id {
            session.config.sandbox_id = sandbox_id;
        }
        session.last_active = now_ms();
        let result = session.clone();
        store.touch(id);
        Ok(result)
    }

    /// Atomic check-and-set: fails `AgentBusy` if the session is already
    /// processing, otherwise marks it processing in the same critical
    /// section. This is what makes single-flight-per-session race-free
    /// against concurrent `processQuery` calls (§5).
    pub fn begin_processing(&self, id: &str) -> CoreResult<()> {
        let mut store = self.store.lock().expect("session manager poisoned");
        let session = store
            .sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
        if session.processing {
            return Err(CoreError::AgentBusy);
        }
        session.processing = true;
        session.last_active = now_ms();
        store.touch(id);
        Ok(())
    }

    pub fn end_processing(&self, id: &str) {
        let mut store = self.store.lock().expect("session manager poisoned");
        if let Some(session) = store.sessions.get_mut(id) {
            session.processing = false;
            session.last_active = now_ms();
        }
    }

    pub fn mutate_conversation(
        &self,
        id: &str,
        f: impl FnOnce(&mut Vec<ConversationEntry>),
    ) -> CoreResult<()> {
        let mut store = self.store.lock().expect("session manager poisoned");
        let session = store
            .sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
        f(&mut session.conversation);
        session.last_active = now_ms();
        store.touch(id);
        Ok(())
    }

    pub fn delete(&self, id: &str) -> CoreResult<()> {
        let mut store = self.store.lock().expect("session manager poisoned");
        if !store.sessions.contains_key(id) {
            return Err(CoreError::SessionNotFound(id.to_string()));
        }
        store.remove(id);
        drop(store);
        self.abort_registry.clear(id);
        self.events.emit("session:removed", json!({ "sessionId": id }));
        Ok(())
    }

    pub fn all(&self) -> Vec<Session> {
        self.store
            .lock()
            .expect("session manager poisoned")
            .sessions
            .values()
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.store
            .lock()
            .expect("session manager poisoned")
            .sessions
            .keys()
            .cloned()
            .collect()
    }

    fn sweep(&self) {
        let now = now_ms();
        let timeout_ms = (self.session_timeout_secs as i64) * 1000;
        let mut store = self.store.lock().expect("session manager poisoned");
        let expired: Vec<String> = store
            .sessions
            .values()
            .filter(|s| !s.processing && now - s.last_active > timeout_ms)
            .map(|s| s.id.clone())
            .collect();

        for id in expired {
            store.remove(&id);
            self.abort_registry.clear(&id);
            self.events.emit("session:removed", json!({ "sessionId": id }));
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().expect("session manager poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_cap(cap: usize) -> Arc<SessionManager> {
        let mut config = Config::default();
        config.max_sessions = cap;
        config.cleanup_enabled = false;
        SessionManager::new(&config, Arc::new(AbortRegistry::new()))
    }

    #[test]
    fn create_then_get_round_trips() {
        let manager = manager_with_cap(10);
        let session = manager.create(&Config::default(), None);
        let fetched = manager.get(&session.id).unwrap();
        assert_eq!(fetched.id, session.id);
    }

    #[test]
    fn get_missing_fails_session_not_found() {
        let manager = manager_with_cap(10);
        let err = manager.get("nope").unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(_)));
    }

    #[test]
    fn lru_eviction_drops_least_recently_active() {
        let manager = manager_with_cap(3);
        let s1 = manager.create(&Config::default(), None);
        let _s2 = manager.create(&Config::default(), None);
        let _s3 = manager.create(&Config::default(), None);
        let _s4 = manager.create(&Config::default(), None);

        assert!(manager.get(&s1.id).is_err());
        assert_eq!(manager.all().len(), 3);
    }

    #[test]
    fn touching_a_session_protects_it_from_eviction() {
        let manager = manager_with_cap(2);
        let s1 = manager.create(&Config::default(), None);
        let _s2 = manager.create(&Config::default(), None);
        manager.update(&s1.id, SessionPatch::default()).unwrap();
        let _s3 = manager.create(&Config::default(), None);

        assert!(manager.get(&s1.id).is_ok());
    }

    #[test]
    fn processing_session_is_skipped_during_eviction() {
        let manager = manager_with_cap(1);
        let s1 = manager.create(&Config::default(), None);
        manager
            .update(&s1.id, SessionPatch { processing: Some(true), ..Default::default() })
            .unwrap();
        let _s2 = manager.create(&Config::default(), None);

        assert!(manager.get(&s1.id).is_ok());
    }

    #[test]
    fn begin_processing_twice_fails_agent_busy() {
        let manager = manager_with_cap(10);
        let session = manager.create(&Config::default(), None);
        manager.begin_processing(&session.id).unwrap();
        let err = manager.begin_processing(&session.id).unwrap_err();
        assert!(matches!(err, CoreError::AgentBusy));
        manager.end_processing(&session.id);
        assert!(manager.begin_processing(&session.id).is_ok());
    }

    #[test]
    fn delete_clears_abort_entry_and_emits_removed() {
        let manager = manager_with_cap(10);
        let session = manager.create(&Config::default(), None);
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        manager.events.on("session:removed", move |_| {
            *c.lock().unwrap() += 1;
        });
        manager.delete(&session.id).unwrap();
        assert!(manager.get(&session.id).is_err());
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
