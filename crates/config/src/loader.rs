use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::expand_server_env, schema::ToolhostConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "toolhost.toml",
    "toolhost.yaml",
    "toolhost.yml",
    "toolhost.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<ToolhostConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let mut config = parse_config(&raw, path)?;
    expand_server_env(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./toolhost.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/toolhost/toolhost.{toml,yaml,yml,json}` (user-global)
///
/// Returns `ToolhostConfig::default()` if no config file is found, and the
/// disabled configuration if the file cannot be loaded.
pub fn discover_and_load() -> ToolhostConfig {
    match find_config_file() {
        Some(path) => load_or_disabled(&path),
        None => {
            debug!("no config file found, using defaults");
            ToolhostConfig::default()
        },
    }
}

/// Load `path`, or fall back to the empty, disabled configuration when it
/// cannot be read or parsed.
pub fn load_or_disabled(path: &Path) -> ToolhostConfig {
    debug!(path = %path.display(), "loading config");
    match load_config(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "failed to load config, tool providers disabled"
            );
            ToolhostConfig::disabled()
        },
    }
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let config_dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/toolhost/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "toolhost").map(|d| d.config_dir().to_path_buf())
}

pub(crate) fn parse_config(raw: &str, path: &Path) -> anyhow::Result<ToolhostConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
