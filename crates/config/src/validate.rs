//! Configuration validation engine.
//!
//! Checks the server-descriptor list and global manager settings before they
//! reach the connection manager: duplicate names, required fields, command
//! and working-directory reachability, unknown/misspelled keys, and fallback
//! bindings that point nowhere.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use crate::schema::{ServerDescriptor, ToolhostConfig};

/// Built-in fallback implementation keys known to the manager.
pub const KNOWN_FALLBACK_IMPLEMENTATIONS: &[&str] = &[
    "local_read_file",
    "local_list_directory",
    "local_search_text",
];

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "duplicate-name",
    /// "missing-field", "invalid-command", "unreachable-command",
    /// "invalid-working-dir", "invalid-setting", "fallback"
    pub category: &'static str,
    /// Dotted path, e.g. "servers[1].command"
    pub path: String,
    /// Index into `servers` when the diagnostic concerns a single server.
    pub server: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    fn global(severity: Severity, category: &'static str, path: &str, message: String) -> Self {
        Self {
            severity,
            category,
            path: path.to_string(),
            server: None,
            message,
        }
    }

    fn server(
        severity: Severity,
        category: &'static str,
        index: usize,
        field: &str,
        message: String,
    ) -> Self {
        Self {
            severity,
            category,
            path: format!("servers[{index}].{field}"),
            server: Some(index),
            message,
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{} [{}]: {}", self.severity, self.category, self.message)
        } else {
            write!(
                f,
                "{} [{}] {}: {}",
                self.severity, self.category, self.path, self.message
            )
        }
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Returns `true` if an error concerns global settings rather than one server.
    #[must_use]
    pub fn has_global_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error && d.server.is_none())
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn rejected_servers(&self) -> HashSet<usize> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .filter_map(|d| d.server)
            .collect()
    }
}

// ── Known keys for unknown-field detection ──────────────────────────────────

const TOP_LEVEL_KEYS: &[&str] = &["manager", "servers", "fallback"];

const MANAGER_KEYS: &[&str] = &[
    "enabled",
    "max_retries",
    "base_retry_delay_ms",
    "max_retry_delay_ms",
    "max_jitter_ms",
    "connection_timeout_ms",
    "request_timeout_ms",
    "tool_call_timeout_ms",
    "ping_timeout_ms",
    "health_check_interval_ms",
    "auto_restart",
    "restart_settle_ms",
    "shutdown_grace_ms",
    "fallback_mode",
];

const SERVER_KEYS: &[&str] = &[
    "name",
    "command",
    "args",
    "env",
    "working_dir",
    "workingDir",
    "enabled",
    "auto_start",
    "autoStart",
    "tools",
    "resources",
];

const FALLBACK_KEYS: &[&str] = &["bindings"];

const BINDING_KEYS: &[&str] = &["server", "tool", "implementation"];

// ── Levenshtein distance ────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Closest candidate within `max_distance` edits, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a TOML document: syntax, unknown keys, types, then semantics.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::global(
                Severity::Error,
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            ));
            return ValidationResult { diagnostics };
        },
    };

    check_unknown_fields(&toml_value, &mut diagnostics);

    match toml::from_str::<ToolhostConfig>(toml_str) {
        Ok(config) => diagnostics.extend(validate_config(&config).diagnostics),
        Err(e) => diagnostics.push(Diagnostic::global(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult { diagnostics }
}

/// Validate an already-parsed configuration.
#[must_use]
pub fn validate_config(config: &ToolhostConfig) -> ValidationResult {
    let mut diagnostics = Vec::new();
    check_manager_settings(config, &mut diagnostics);

    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (index, server) in config.servers.iter().enumerate() {
        if !server.name.is_empty() {
            if let Some(first) = seen.get(server.name.as_str()) {
                diagnostics.push(Diagnostic::server(
                    Severity::Error,
                    "duplicate-name",
                    index,
                    "name",
                    format!(
                        "server name \"{}\" already used by servers[{first}]",
                        server.name
                    ),
                ));
            } else {
                seen.insert(&server.name, index);
            }
        }
        check_server(index, server, &mut diagnostics);
    }

    check_fallback_bindings(config, &mut diagnostics);
    ValidationResult { diagnostics }
}

/// Drop what failed validation.
///
/// A global error invalidates everything and yields the empty, disabled
/// configuration; a per-server error removes only that server.
#[must_use]
pub fn sanitize(config: ToolhostConfig, result: &ValidationResult) -> ToolhostConfig {
    if result.has_global_errors() {
        return ToolhostConfig::disabled();
    }
    let rejected = result.rejected_servers();
    let servers = config
        .servers
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !rejected.contains(i))
        .map(|(_, s)| s)
        .collect();
    ToolhostConfig { servers, ..config }
}

fn check_unknown_fields(value: &toml::Value, diagnostics: &mut Vec<Diagnostic>) {
    let Some(root) = value.as_table() else {
        return;
    };
    check_table(root, TOP_LEVEL_KEYS, "", diagnostics);

    if let Some(manager) = root.get("manager").and_then(|v| v.as_table()) {
        check_table(manager, MANAGER_KEYS, "manager", diagnostics);
    }
    if let Some(servers) = root.get("servers").and_then(|v| v.as_array()) {
        for (i, server) in servers.iter().enumerate() {
            if let Some(table) = server.as_table() {
                check_table(table, SERVER_KEYS, &format!("servers[{i}]"), diagnostics);
            }
        }
    }
    if let Some(fallback) = root.get("fallback").and_then(|v| v.as_table()) {
        check_table(fallback, FALLBACK_KEYS, "fallback", diagnostics);
        if let Some(bindings) = fallback.get("bindings").and_then(|v| v.as_array()) {
            for (i, binding) in bindings.iter().enumerate() {
                if let Some(table) = binding.as_table() {
                    let prefix = format!("fallback.bindings[{i}]");
                    check_table(table, BINDING_KEYS, &prefix, diagnostics);
                }
            }
        }
    }
}

fn check_table(
    table: &toml::map::Map<String, toml::Value>,
    known: &[&str],
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for key in table.keys() {
        if known.contains(&key.as_str()) {
            continue;
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let message = match suggest(key, known, 3) {
            Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
            None => "unknown field".to_string(),
        };
        diagnostics.push(Diagnostic::global(
            Severity::Warning,
            "unknown-field",
            &path,
            message,
        ));
    }
}

fn check_manager_settings(config: &ToolhostConfig, diagnostics: &mut Vec<Diagnostic>) {
    let m = &config.manager;
    let required_nonzero = [
        ("health_check_interval_ms", m.health_check_interval_ms),
        ("connection_timeout_ms", m.connection_timeout_ms),
        ("request_timeout_ms", m.request_timeout_ms),
        ("tool_call_timeout_ms", m.tool_call_timeout_ms),
        ("ping_timeout_ms", m.ping_timeout_ms),
    ];
    for (field, value) in required_nonzero {
        if value == 0 {
            diagnostics.push(Diagnostic::global(
                Severity::Error,
                "invalid-setting",
                &format!("manager.{field}"),
                "must be greater than zero".into(),
            ));
        }
    }

    if m.base_retry_delay_ms > m.max_retry_delay_ms {
        diagnostics.push(Diagnostic::global(
            Severity::Warning,
            "invalid-setting",
            "manager.base_retry_delay_ms",
            format!(
                "base retry delay ({}ms) exceeds the cap ({}ms); every retry waits the cap",
                m.base_retry_delay_ms, m.max_retry_delay_ms
            ),
        ));
    }
}

fn check_server(index: usize, server: &ServerDescriptor, diagnostics: &mut Vec<Diagnostic>) {
    if server.name.trim().is_empty() {
        diagnostics.push(Diagnostic::server(
            Severity::Error,
            "missing-field",
            index,
            "name",
            "server name is required".into(),
        ));
    }

    if server.command.trim().is_empty() {
        diagnostics.push(Diagnostic::server(
            Severity::Error,
            "missing-field",
            index,
            "command",
            "command is required".into(),
        ));
    } else if server.command.contains(char::is_whitespace) {
        diagnostics.push(Diagnostic::server(
            Severity::Error,
            "invalid-command",
            index,
            "command",
            "command must be an executable name or path only; put flags in `args`".into(),
        ));
    } else if !command_reachable(&server.command) {
        diagnostics.push(Diagnostic::server(
            Severity::Warning,
            "unreachable-command",
            index,
            "command",
            format!("\"{}\" was not found", server.command),
        ));
    }

    if let Some(dir) = &server.working_dir
        && !dir.is_dir()
    {
        let message = if dir.exists() {
            format!("{} is not a directory", dir.display())
        } else {
            format!("{} does not exist", dir.display())
        };
        diagnostics.push(Diagnostic::server(
            Severity::Warning,
            "invalid-working-dir",
            index,
            "working_dir",
            message,
        ));
    }
}

fn command_reachable(command: &str) -> bool {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.is_file();
    }
    which::which(command).is_ok()
}

fn check_fallback_bindings(config: &ToolhostConfig, diagnostics: &mut Vec<Diagnostic>) {
    for (i, binding) in config.fallback.bindings.iter().enumerate() {
        if !KNOWN_FALLBACK_IMPLEMENTATIONS.contains(&binding.implementation.as_str()) {
            let hint = suggest(&binding.implementation, KNOWN_FALLBACK_IMPLEMENTATIONS, 4)
                .map(|s| format!(" (did you mean \"{s}\"?)"))
                .unwrap_or_default();
            diagnostics.push(Diagnostic::global(
                Severity::Warning,
                "fallback",
                &format!("fallback.bindings[{i}].implementation"),
                format!(
                    "unknown fallback implementation \"{}\"{hint}",
                    binding.implementation
                ),
            ));
        }
        if config.server(&binding.server).is_none() {
            diagnostics.push(Diagnostic::global(
                Severity::Warning,
                "fallback",
                &format!("fallback.bindings[{i}].server"),
                format!("no server named \"{}\" is configured", binding.server),
            ));
        }
    }
}
