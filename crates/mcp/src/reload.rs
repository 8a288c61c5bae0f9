//! Applying a new configuration to a running manager.

use std::{collections::BTreeSet, sync::Arc};

use {
    toolhost_config::ToolhostConfig,
    tracing::{info, warn},
};

use crate::{
    fallback::FallbackRegistry,
    manager::{ConnectionManager, checked_config},
};

/// What a configuration change requires of the running manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    Unchanged,
    /// Global settings, fallbacks, the server set or enablement changed:
    /// stop everything and start again.
    Full,
    /// Only these servers' launch parameters changed (sorted).
    PerServer(Vec<String>),
}

/// Classify the difference between two configurations.
pub fn diff_configs(old: &ToolhostConfig, new: &ToolhostConfig) -> ConfigChange {
    if old == new {
        return ConfigChange::Unchanged;
    }
    if old.manager != new.manager || old.fallback != new.fallback {
        return ConfigChange::Full;
    }

    let old_names: BTreeSet<&str> = old.servers.iter().map(|s| s.name.as_str()).collect();
    let new_names: BTreeSet<&str> = new.servers.iter().map(|s| s.name.as_str()).collect();
    if old_names != new_names {
        return ConfigChange::Full;
    }

    let mut changed = Vec::new();
    for server in &new.servers {
        let Some(previous) = old.server(&server.name) else {
            return ConfigChange::Full;
        };
        if previous.enabled != server.enabled || previous.auto_start != server.auto_start {
            return ConfigChange::Full;
        }
        if previous != server {
            changed.push(server.name.clone());
        }
    }

    if changed.is_empty() {
        // Only the order of servers moved.
        ConfigChange::Unchanged
    } else {
        changed.sort();
        ConfigChange::PerServer(changed)
    }
}

impl ConnectionManager {
    /// Validate `config` and move the manager onto it, restarting as little
    /// as the change allows.
    pub async fn apply_config(self: &Arc<Self>, config: ToolhostConfig) -> ConfigChange {
        let (config, _) = checked_config(config);
        let change = {
            let inner = self.inner.read().await;
            diff_configs(&inner.config, &config)
        };

        match &change {
            ConfigChange::Unchanged => {
                self.inner.write().await.config = config;
                info!("configuration unchanged");
            },
            ConfigChange::Full => {
                info!("configuration changed, restarting all providers");
                self.stop().await;
                let fallbacks = FallbackRegistry::from_config(
                    &config.fallback,
                    config.manager.fallback_mode,
                    Arc::clone(&self.bridge),
                );
                {
                    let mut inner = self.inner.write().await;
                    inner.config = config;
                    inner.fallbacks = Arc::new(fallbacks);
                }
                self.start().await;
            },
            ConfigChange::PerServer(names) => {
                info!(servers = ?names, "configuration changed, restarting affected providers");
                let live: Vec<String> = {
                    let mut inner = self.inner.write().await;
                    inner.config = config;
                    names
                        .iter()
                        .filter(|name| inner.connections.contains_key(name.as_str()))
                        .cloned()
                        .collect()
                };
                for name in live {
                    if let Err(e) = self.restart_server(&name).await {
                        warn!(server = %name, error = %e, "restart after config change failed");
                    }
                }
            },
        }
        change
    }
}
