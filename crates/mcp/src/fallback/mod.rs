//! Local substitutes for provider tools.
//!
//! A binding maps a provider tool `(server, tool)` to a built-in
//! implementation. When the registry activates a server's bindings, each one
//! is registered on the bridge as `fallback__<server>__<tool>` and answers
//! with degraded output carrying the implementation's limitations.

pub mod builtin;

use std::{collections::HashMap, sync::Arc};

use {
    async_trait::async_trait,
    serde_json::Value,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use {
    crate::{
        error::{Error, Result},
        tool_bridge::{BridgedTool, ToolBridge, ToolOutput, fallback_name},
    },
    toolhost_config::{FallbackConfig, FallbackMode},
};

/// Failure of a substitute implementation.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Unsupported(String),
}

impl From<serde_json::Error> for FallbackError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidArguments(e.to_string())
    }
}

/// A built-in local implementation standing in for a provider tool.
#[async_trait]
pub trait FallbackTool: Send + Sync {
    /// Identifier used in configuration bindings.
    fn implementation(&self) -> &str;
    fn description(&self) -> &str;
    /// What the substitute cannot do compared to a provider.
    fn limitations(&self) -> &[String];
    fn parameters_schema(&self) -> Value;
    async fn invoke(&self, params: Value) -> std::result::Result<Value, FallbackError>;
}

/// Provider tool `(server, tool)` served by `implementation` when degraded.
#[derive(Clone)]
pub struct FallbackBinding {
    pub server: String,
    pub tool: String,
    pub implementation: Arc<dyn FallbackTool>,
}

impl std::fmt::Debug for FallbackBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackBinding")
            .field("server", &self.server)
            .field("tool", &self.tool)
            .field("implementation", &self.implementation.implementation())
            .finish()
    }
}

/// Bridge adapter registering one binding under its fallback name.
struct FallbackProxy {
    name: String,
    description: String,
    binding: FallbackBinding,
}

impl FallbackProxy {
    fn new(binding: FallbackBinding) -> Self {
        Self {
            name: fallback_name(&binding.server, &binding.tool),
            description: format!(
                "{} (local fallback for '{}' on '{}')",
                binding.implementation.description(),
                binding.tool,
                binding.server
            ),
            binding,
        }
    }
}

#[async_trait]
impl BridgedTool for FallbackProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.binding.implementation.parameters_schema()
    }

    async fn invoke(&self, params: Value) -> ToolOutput {
        let implementation = &self.binding.implementation;
        let output = match implementation.invoke(params).await {
            Ok(value) => ToolOutput::success(value),
            Err(e) => {
                debug!(tool = %self.name, error = %e, "fallback tool failed");
                ToolOutput::error(e.to_string())
            },
        };
        output.degraded(implementation.limitations())
    }
}

/// Static bindings plus the set of servers whose fallbacks are registered.
pub struct FallbackRegistry {
    mode: FallbackMode,
    bindings: Vec<FallbackBinding>,
    bridge: Arc<dyn ToolBridge>,
    /// Server name -> fallback tool names currently registered.
    active: Mutex<HashMap<String, Vec<String>>>,
}

impl FallbackRegistry {
    pub fn new(mode: FallbackMode, bridge: Arc<dyn ToolBridge>) -> Self {
        Self {
            mode,
            bindings: Vec::new(),
            bridge,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve configured bindings against the built-in implementations.
    /// Unknown implementations are skipped with a warning.
    pub fn from_config(
        config: &FallbackConfig,
        mode: FallbackMode,
        bridge: Arc<dyn ToolBridge>,
    ) -> Self {
        let mut registry = Self::new(mode, bridge);
        for entry in &config.bindings {
            if let Err(e) = registry.bind(&entry.server, &entry.tool, &entry.implementation) {
                warn!(
                    server = %entry.server,
                    tool = %entry.tool,
                    error = %e,
                    "skipping fallback binding"
                );
            }
        }
        registry
    }

    /// Bind `(server, tool)` to a built-in implementation by name.
    pub fn bind(&mut self, server: &str, tool: &str, implementation: &str) -> Result<()> {
        let implementation = builtin::lookup(implementation).ok_or_else(|| Error::Fallback {
            tool: format!("{server}/{tool}"),
            reason: format!("unknown implementation '{implementation}'"),
        })?;
        self.bind_tool(server, tool, implementation);
        Ok(())
    }

    /// Bind `(server, tool)` to any implementation. A later binding for the
    /// same pair replaces the earlier one.
    pub fn bind_tool(&mut self, server: &str, tool: &str, implementation: Arc<dyn FallbackTool>) {
        self.bindings
            .retain(|b| !(b.server == server && b.tool == tool));
        self.bindings.push(FallbackBinding {
            server: server.to_string(),
            tool: tool.to_string(),
            implementation,
        });
    }

    pub fn mode(&self) -> FallbackMode {
        self.mode
    }

    pub fn bindings(&self) -> &[FallbackBinding] {
        &self.bindings
    }

    pub fn bindings_for(&self, server: &str) -> impl Iterator<Item = &FallbackBinding> {
        self.bindings.iter().filter(move |b| b.server == server)
    }

    pub fn is_bound(&self, server: &str, tool: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.server == server && b.tool == tool)
    }

    /// Register every binding of `server` on the bridge. Returns the number
    /// of tools registered; zero when the mode is `disabled`, the server has
    /// no bindings, or its fallbacks are already active.
    pub async fn register_fallback_tools(&self, server: &str) -> usize {
        if self.mode == FallbackMode::Disabled {
            return 0;
        }
        let mut active = self.active.lock().await;
        if active.contains_key(server) {
            return 0;
        }

        let mut names = Vec::new();
        for binding in self.bindings_for(server) {
            let proxy = FallbackProxy::new(binding.clone());
            names.push(proxy.name.clone());
            self.bridge.register(Arc::new(proxy)).await;
        }
        if names.is_empty() {
            return 0;
        }

        info!(server = %server, count = names.len(), "fallback tools activated");
        let count = names.len();
        active.insert(server.to_string(), names);
        count
    }

    /// Remove `server`'s fallback tools from the bridge. Returns how many
    /// were removed.
    pub async fn unregister_fallback_tools(&self, server: &str) -> usize {
        let Some(names) = self.active.lock().await.remove(server) else {
            return 0;
        };
        for name in &names {
            self.bridge.unregister(name).await;
        }
        info!(server = %server, count = names.len(), "fallback tools deactivated");
        names.len()
    }

    /// Remove every active fallback tool. Returns `(server, count)` per
    /// deactivated server.
    pub async fn unregister_all(&self) -> Vec<(String, usize)> {
        let drained: Vec<(String, Vec<String>)> = self.active.lock().await.drain().collect();
        let mut removed = Vec::with_capacity(drained.len());
        for (server, names) in drained {
            for name in &names {
                self.bridge.unregister(name).await;
            }
            info!(server = %server, count = names.len(), "fallback tools deactivated");
            removed.push((server, names.len()));
        }
        removed
    }

    pub async fn is_active(&self, server: &str) -> bool {
        self.active.lock().await.contains_key(server)
    }

    /// Number of fallback tools currently registered.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.values().map(Vec::len).sum()
    }

    /// Registered fallback name for `(server, tool)`, if active.
    pub async fn active_name(&self, server: &str, tool: &str) -> Option<String> {
        let name = fallback_name(server, tool);
        self.active
            .lock()
            .await
            .get(server)
            .and_then(|names| names.contains(&name).then_some(name))
    }
}
