//! Config schema types (manager settings, server descriptors, fallback bindings).
use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolhostConfig {
    pub manager: ManagerSettings,
    pub servers: Vec<ServerDescriptor>,
    pub fallback: FallbackConfig,
}

impl ToolhostConfig {
    /// Empty configuration with the manager switched off.
    ///
    /// Used in place of a configuration whose global section failed validation.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            manager: ManagerSettings {
                enabled: false,
                ..ManagerSettings::default()
            },
            servers: Vec::new(),
            fallback: FallbackConfig::default(),
        }
    }

    /// Look up a server descriptor by name.
    pub fn server(&self, name: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// When local substitutes replace provider tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// Never substitute.
    Disabled,
    /// Substitute only while the owning server is down.
    #[default]
    Graceful,
    /// Substitute unconditionally, whether or not the server is up.
    Always,
}

impl std::fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Graceful => write!(f, "graceful"),
            Self::Always => write!(f, "always"),
        }
    }
}

/// Global connection-manager parameters.
///
/// Retry and timeout values are independent knobs: the generic request
/// timeout, the tool-call timeout and the ping timeout do not derive from
/// one another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Master switch. A disabled manager starts no servers.
    pub enabled: bool,
    /// Reconnect attempts after the first failed connection.
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    /// Upper bound on a single backoff sleep.
    pub max_retry_delay_ms: u64,
    /// Upper bound on the random jitter added to each backoff sleep.
    pub max_jitter_ms: u64,
    /// Budget for spawn + handshake of one connection attempt.
    pub connection_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub tool_call_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    /// Restart a server whose health-check ping fails.
    pub auto_restart: bool,
    /// Pause between stop and start during a restart.
    pub restart_settle_ms: u64,
    /// Time a provider gets to exit after stdin closes before it is killed.
    pub shutdown_grace_ms: u64,
    pub fallback_mode: FallbackMode,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            max_jitter_ms: 1_000,
            connection_timeout_ms: 30_000,
            request_timeout_ms: 30_000,
            tool_call_timeout_ms: 60_000,
            ping_timeout_ms: 5_000,
            health_check_interval_ms: 30_000,
            auto_restart: true,
            restart_settle_ms: 1_000,
            shutdown_grace_ms: 5_000,
            fallback_mode: FallbackMode::default(),
        }
    }
}

impl ManagerSettings {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_call_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_true() -> bool {
    true
}

/// Launch description of a single tool-provider process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server name; also the tool namespace.
    #[serde(default)]
    pub name: String,
    /// Executable to spawn (stdio transport).
    #[serde(default)]
    pub command: String,
    /// Arguments to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables set for the process, on top of the inherited ones.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, alias = "workingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true", alias = "autoStart")]
    pub auto_start: bool,
    /// Tool names the server is expected to advertise.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Resource URIs the server is expected to expose.
    #[serde(default)]
    pub resources: Vec<String>,
}

impl Default for ServerDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            enabled: true,
            auto_start: true,
            tools: Vec::new(),
            resources: Vec::new(),
        }
    }
}

impl ServerDescriptor {
    /// Convenience constructor used by hosts that build descriptors in code.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Static fallback bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub bindings: Vec<FallbackBindingEntry>,
}

/// Maps a provider tool onto a built-in local implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackBindingEntry {
    pub server: String,
    pub tool: String,
    /// Built-in implementation key, e.g. `local_read_file`.
    pub implementation: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = ManagerSettings::default();
        assert!(settings.enabled);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.max_retry_delay(), Duration::from_secs(30));
        assert_eq!(settings.max_jitter(), Duration::from_secs(1));
        assert_eq!(settings.fallback_mode, FallbackMode::Graceful);
    }

    #[test]
    fn parses_descriptor_list_from_toml() {
        let toml = r#"
[manager]
max_retries = 2
fallback_mode = "always"

[[servers]]
name = "filesystem"
command = "mcp-server-filesystem"
args = ["/tmp"]
autoStart = false

[servers.env]
LOG = "debug"

[[fallback.bindings]]
server = "filesystem"
tool = "read_file"
implementation = "local_read_file"
"#;
        let cfg: ToolhostConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.manager.max_retries, 2);
        assert_eq!(cfg.manager.fallback_mode, FallbackMode::Always);
        assert_eq!(cfg.manager.base_retry_delay_ms, 1_000);
        let fs = cfg.server("filesystem").unwrap();
        assert_eq!(fs.args, vec!["/tmp"]);
        assert!(fs.enabled);
        assert!(!fs.auto_start);
        assert_eq!(fs.env["LOG"], "debug");
        assert_eq!(cfg.fallback.bindings.len(), 1);
    }

    #[test]
    fn disabled_config_is_empty() {
        let cfg = ToolhostConfig::disabled();
        assert!(!cfg.manager.enabled);
        assert!(cfg.servers.is_empty());
    }

    #[test]
    fn fallback_mode_display_matches_serde() {
        for mode in [
            FallbackMode::Disabled,
            FallbackMode::Graceful,
            FallbackMode::Always,
        ] {
            let json = serde_json::to_value(mode).unwrap();
            assert_eq!(json, serde_json::Value::String(mode.to_string()));
        }
    }
}
