//! Core-visible configuration surface, plus the ambient fields a runnable
//! binary needs (DB path, port, LLM credentials). Read from the environment
//! with sane defaults, the same way the LLM registry configures itself.

use std::time::Duration;

/// Permission mode for interactive tool confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// All tools auto-approved regardless of `requiresPermission`.
    Auto,
    /// Tools marked `requiresPermission` block on operator confirmation,
    /// unless fast-edit mode is enabled for the session and the tool isn't
    /// marked `alwaysRequirePermission`.
    Interactive,
}

/// Execution-adapter backend kind, chosen per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Local,
    Container,
    Remote,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Container => "container",
            Self::Remote => "remote",
        }
    }
}

/// Core configuration surface (spec §6), plus the ambient fields needed to
/// run a real process: persistence path, listen port, and LLM credentials.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_sessions: usize,
    pub session_timeout: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_enabled: bool,
    pub default_adapter_kind: AdapterKind,
    pub permission_mode: PermissionMode,
    pub pre_allowed_tool_ids: Vec<String>,
    pub caching_enabled: bool,
    pub default_model: String,
    pub iteration_cap: usize,

    pub db_path: String,
    pub port: u16,
    /// Base URL of the remote sandbox service, used when a session's
    /// adapter kind is `Remote`. Empty when no remote backend is configured.
    pub remote_sandbox_base_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        let db_path = std::env::var("AGENTCORE_DB_PATH").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.agentcore/agentcore.db")
        });

        let port: u16 = std::env::var("AGENTCORE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);

        let max_sessions: usize = std::env::var("AGENTCORE_MAX_SESSIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let session_timeout_secs: u64 = std::env::var("AGENTCORE_SESSION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30 * 60);

        let cleanup_interval_secs: u64 = std::env::var("AGENTCORE_CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5 * 60);

        let cleanup_enabled = std::env::var("AGENTCORE_CLEANUP_ENABLED")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        let permission_mode = match std::env::var("AGENTCORE_PERMISSION_MODE").as_deref() {
            Ok("auto") => PermissionMode::Auto,
            _ => PermissionMode::Interactive,
        };

        let default_model =
            std::env::var("AGENTCORE_DEFAULT_MODEL").unwrap_or_else(|_| "claude-sonnet-4".into());

        let iteration_cap: usize = std::env::var("AGENTCORE_ITERATION_CAP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let remote_sandbox_base_url =
            std::env::var("AGENTCORE_REMOTE_SANDBOX_URL").unwrap_or_default();

        Self {
            max_sessions,
            session_timeout: Duration::from_secs(session_timeout_secs),
            cleanup_interval: Duration::from_secs(cleanup_interval_secs),
            cleanup_enabled,
            default_adapter_kind: AdapterKind::Local,
            permission_mode,
            pre_allowed_tool_ids: Vec::new(),
            caching_enabled: true,
            default_model,
            iteration_cap,
            db_path,
            port,
            remote_sandbox_base_url,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            session_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            cleanup_enabled: true,
            default_adapter_kind: AdapterKind::Local,
            permission_mode: PermissionMode::Interactive,
            pre_allowed_tool_ids: Vec::new(),
            caching_enabled: true,
            default_model: "claude-sonnet-4".to_string(),
            iteration_cap: 10,
            db_path: ":memory:".to_string(),
            port: 8000,
            remote_sandbox_base_url: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bounds() {
        let config = Config::default();
        assert_eq!(config.max_sessions, 10);
        assert_eq!(config.iteration_cap, 10);
        assert_eq!(config.permission_mode, PermissionMode::Interactive);
    }
}
