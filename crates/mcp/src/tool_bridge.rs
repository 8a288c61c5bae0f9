//! Exposing provider tools (and their substitutes) to the host's tool
//! registry.

use std::{collections::HashMap, sync::Arc};

use {
    async_trait::async_trait,
    serde::Serialize,
    serde_json::Value,
    tokio::sync::RwLock,
    tracing::{debug, warn},
};

use crate::{
    client::ServerProcessClient,
    types::{ToolContent, ToolDescriptor, ToolsCallResult},
};

/// Result of a tool invocation. Failures are values, never `Err`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub content: Value,
    pub is_error: bool,
    /// Served by a local substitute instead of the provider.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub limitations: Vec<String>,
}

impl ToolOutput {
    pub fn success(content: Value) -> Self {
        Self {
            content,
            is_error: false,
            degraded: false,
            limitations: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Value::String(message.into()),
            is_error: true,
            degraded: false,
            limitations: Vec::new(),
        }
    }

    #[must_use]
    pub fn degraded(mut self, limitations: &[String]) -> Self {
        self.degraded = true;
        self.limitations = limitations.to_vec();
        self
    }
}

/// A tool the host can call.
#[async_trait]
pub trait BridgedTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn invoke(&self, params: Value) -> ToolOutput;
}

/// The host's tool registry as seen from the connection manager.
#[async_trait]
pub trait ToolBridge: Send + Sync {
    /// Register a tool, replacing any tool of the same name.
    async fn register(&self, tool: Arc<dyn BridgedTool>);
    /// Remove a tool. Returns whether it was registered.
    async fn unregister(&self, name: &str) -> bool;
    /// Call a registered tool; `None` when no tool has that name.
    async fn invoke(&self, name: &str, params: Value) -> Option<ToolOutput>;
    async fn names(&self) -> Vec<String>;
}

/// Name of a provider tool in the host registry: `mcp__<server>__<tool>`.
pub fn namespaced_name(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

/// Name of a substitute tool in the host registry:
/// `fallback__<server>__<tool>`.
pub fn fallback_name(server: &str, tool: &str) -> String {
    format!("fallback__{server}__{tool}")
}

/// Registry kept in memory; what the CLI hands to the manager.
#[derive(Default)]
pub struct InMemoryToolBridge {
    tools: RwLock<HashMap<String, Arc<dyn BridgedTool>>>,
}

impl InMemoryToolBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered tools sorted by name.
    pub async fn tools(&self) -> Vec<Arc<dyn BridgedTool>> {
        let mut tools: Vec<_> = self.tools.read().await.values().cloned().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }
}

#[async_trait]
impl ToolBridge for InMemoryToolBridge {
    async fn register(&self, tool: Arc<dyn BridgedTool>) {
        debug!(tool = %tool.name(), "registering tool");
        self.tools.write().await.insert(tool.name().to_string(), tool);
    }

    async fn unregister(&self, name: &str) -> bool {
        let removed = self.tools.write().await.remove(name).is_some();
        if removed {
            debug!(tool = %name, "unregistered tool");
        }
        removed
    }

    async fn invoke(&self, name: &str, params: Value) -> Option<ToolOutput> {
        let tool = self.tools.read().await.get(name).cloned()?;
        Some(tool.invoke(params).await)
    }

    async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Forwards calls of one provider tool to its client.
pub struct ProviderToolProxy {
    /// `mcp__<server>__<tool>`.
    name: String,
    tool: String,
    server: String,
    description: String,
    input_schema: Value,
    client: Arc<ServerProcessClient>,
}

impl ProviderToolProxy {
    pub fn new(client: Arc<ServerProcessClient>, tool: &ToolDescriptor) -> Self {
        Self {
            name: namespaced_name(&tool.server, &tool.name),
            tool: tool.name.clone(),
            server: tool.server.clone(),
            description: if tool.description.is_empty() {
                format!("Provider tool: {}", tool.name)
            } else {
                tool.description.clone()
            },
            input_schema: tool.input_shape.to_json_schema(),
            client,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }
}

#[async_trait]
impl BridgedTool for ProviderToolProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn invoke(&self, params: Value) -> ToolOutput {
        match self.client.call_tool(&self.tool, params).await {
            Ok(result) if result.is_error => ToolOutput::error(result.text()),
            Ok(result) => ToolOutput::success(flatten_content(&result)),
            Err(e) => {
                warn!(
                    server = %self.server,
                    tool = %self.tool,
                    error = %e,
                    "provider tool call failed"
                );
                ToolOutput::error(format!("tool '{}' failed: {e}", self.tool))
            },
        }
    }
}

/// Single text item: parsed as JSON when possible, else a string. Several
/// items: `{"content": [texts]}`.
fn flatten_content(result: &ToolsCallResult) -> Value {
    let texts: Vec<&str> = result
        .content
        .iter()
        .filter_map(|c| match c {
            ToolContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();

    match texts.as_slice() {
        [single] => serde_json::from_str(single)
            .unwrap_or_else(|_| Value::String((*single).to_string())),
        _ => serde_json::json!({ "content": texts }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::{
            client::ConnectionSettings,
            testing::{Script, ScriptedLauncher, fast_settings},
        },
        serde_json::json,
        toolhost_config::ServerDescriptor,
    };

    struct Constant(&'static str);

    #[async_trait]
    impl BridgedTool for Constant {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "constant"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn invoke(&self, _params: Value) -> ToolOutput {
            ToolOutput::success(json!(self.0))
        }
    }

    #[test]
    fn names_use_double_underscore() {
        assert_eq!(
            namespaced_name("filesystem", "read_file"),
            "mcp__filesystem__read_file"
        );
        assert_eq!(fallback_name("fs", "read"), "fallback__fs__read");
        let name = namespaced_name("my-server", "read_file");
        let parts: Vec<&str> = name.splitn(3, "__").collect();
        assert_eq!(parts, vec!["mcp", "my-server", "read_file"]);
    }

    #[tokio::test]
    async fn in_memory_bridge_registers_and_invokes() {
        let bridge = InMemoryToolBridge::new();
        bridge.register(Arc::new(Constant("b"))).await;
        bridge.register(Arc::new(Constant("a"))).await;
        assert_eq!(bridge.names().await, vec!["a", "b"]);

        let out = bridge.invoke("a", json!({})).await.unwrap();
        assert_eq!(out.content, json!("a"));
        assert!(bridge.invoke("missing", json!({})).await.is_none());

        assert!(bridge.unregister("a").await);
        assert!(!bridge.unregister("a").await);
        assert_eq!(bridge.names().await, vec!["b"]);
    }

    #[test]
    fn flattens_text_content() {
        let one_json: ToolsCallResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "{\"ok\":true}"}]
        }))
        .unwrap();
        assert_eq!(flatten_content(&one_json), json!({"ok": true}));

        let one_text: ToolsCallResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "plain"}]
        }))
        .unwrap();
        assert_eq!(flatten_content(&one_text), json!("plain"));

        let many: ToolsCallResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]
        }))
        .unwrap();
        assert_eq!(flatten_content(&many), json!({"content": ["a", "b"]}));
    }

    #[tokio::test]
    async fn proxy_turns_every_failure_into_an_error_output() {
        let script = Script::with_tools(&["echo", "fail"]);
        let client = ServerProcessClient::new(
            ServerDescriptor::new("scripted", "scripted-provider"),
            ConnectionSettings::from(&fast_settings()),
            Arc::new(ScriptedLauncher::new().with("scripted", script)),
        );
        let descriptor = |name: &str| ToolDescriptor {
            name: name.into(),
            description: String::new(),
            input_shape: crate::types::InputShape::Any,
            server: "scripted".into(),
        };
        let echo = ProviderToolProxy::new(Arc::clone(&client), &descriptor("echo"));
        let fail = ProviderToolProxy::new(Arc::clone(&client), &descriptor("fail"));
        assert_eq!(echo.name(), "mcp__scripted__echo");

        // Not connected yet.
        let out = echo.invoke(json!({"text": "hi"})).await;
        assert!(out.is_error);
        assert!(!out.degraded);

        client.connect().await.unwrap();
        let out = echo.invoke(json!({"text": "hi"})).await;
        assert_eq!(out, ToolOutput::success(json!("hi")));

        let out = fail.invoke(json!({})).await;
        assert!(out.is_error);
        assert_eq!(out.content, json!("tool failed"));
        client.disconnect().await;
    }
}
