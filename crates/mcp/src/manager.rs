//! ConnectionManager: lifecycle of every configured provider, tool
//! registration and fallback activation.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use {
    chrono::{DateTime, Utc},
    futures::future::join_all,
    serde::Serialize,
    serde_json::Value,
    tokio::{
        sync::{RwLock, mpsc},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    crate::{
        client::{ClientEvent, ClientState, ConnectionSettings, ServerProcessClient},
        error::{Error, ManagerError, Result},
        events::EventHub,
        fallback::FallbackRegistry,
        launcher::ProviderLauncher,
        tool_bridge::{BridgedTool, ProviderToolProxy, ToolBridge, ToolOutput, namespaced_name},
        types::ToolDescriptor,
    },
    toolhost_config::{
        FallbackMode, ServerDescriptor, Severity, ToolhostConfig, ValidationResult, sanitize,
        validate_config,
    },
};

/// Runtime status of a configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Error,
    Disconnected,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Snapshot of one server for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusReport {
    pub name: String,
    pub status: ServerStatus,
    pub enabled: bool,
    pub auto_start: bool,
    pub command: String,
    pub args: Vec<String>,
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<String>,
    pub fallback_active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerTotals {
    pub running_servers: usize,
    pub real_tools: usize,
    pub fallback_tools: usize,
}

/// Manager-level notifications, delivered in order to every subscriber.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    ServerStatusChanged {
        server: String,
        status: ServerStatus,
        error: Option<String>,
    },
    FallbackActivated {
        server: String,
        tools: usize,
    },
    FallbackDeactivated {
        server: String,
        tools: usize,
    },
    /// No provider is usable; emitted at most once per manager.
    SetupAdvisory {
        message: String,
    },
}

/// One live connection, created by `start_server` and dropped by
/// `stop_server`.
pub(crate) struct ServerConnection {
    pub(crate) status: ServerStatus,
    pub(crate) client: Arc<ServerProcessClient>,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    pub(crate) last_heartbeat: Option<DateTime<Utc>>,
    tools: Vec<ToolDescriptor>,
    /// Real proxy names currently registered on the bridge.
    registered: Vec<String>,
    supervisor: Option<JoinHandle<()>>,
}

/// Mutable state behind the single `RwLock` on [`ConnectionManager`].
pub(crate) struct ManagerInner {
    pub(crate) config: ToolhostConfig,
    pub(crate) connections: HashMap<String, ServerConnection>,
    pub(crate) fallbacks: Arc<FallbackRegistry>,
    pub(crate) health: Option<CancellationToken>,
}

/// Supervises every configured provider.
///
/// Constructed once and shared as `Arc<ConnectionManager>`; background tasks
/// (supervisors, health loop) hold weak references back to it.
pub struct ConnectionManager {
    pub(crate) inner: RwLock<ManagerInner>,
    pub(crate) bridge: Arc<dyn ToolBridge>,
    launcher: Arc<dyn ProviderLauncher>,
    restarting: Arc<Mutex<HashSet<String>>>,
    advisory_issued: AtomicBool,
    /// Consecutive health passes in which no provider answered.
    pub(crate) outage_passes: AtomicU32,
    pub(crate) events: EventHub<ManagerEvent>,
}

/// Claim on a server's restart; released on drop.
pub(crate) struct RestartGuard {
    set: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for RestartGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

impl ConnectionManager {
    pub fn new(
        config: ToolhostConfig,
        bridge: Arc<dyn ToolBridge>,
        fallbacks: FallbackRegistry,
        launcher: Arc<dyn ProviderLauncher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(ManagerInner {
                config,
                connections: HashMap::new(),
                fallbacks: Arc::new(fallbacks),
                health: None,
            }),
            bridge,
            launcher,
            restarting: Arc::new(Mutex::new(HashSet::new())),
            advisory_issued: AtomicBool::new(false),
            outage_passes: AtomicU32::new(0),
            events: EventHub::default(),
        })
    }

    /// Validate `config`, drop what cannot be used, and build the manager
    /// with fallbacks resolved from the configuration. A global error yields
    /// an empty, disabled manager.
    pub fn from_config(
        config: ToolhostConfig,
        bridge: Arc<dyn ToolBridge>,
        launcher: Arc<dyn ProviderLauncher>,
    ) -> (Arc<Self>, ValidationResult) {
        let (config, result) = checked_config(config);
        let fallbacks = FallbackRegistry::from_config(
            &config.fallback,
            config.manager.fallback_mode,
            Arc::clone(&bridge),
        );
        (Self::new(config, bridge, fallbacks, launcher), result)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub async fn config(&self) -> ToolhostConfig {
        self.inner.read().await.config.clone()
    }

    pub async fn fallbacks(&self) -> Arc<FallbackRegistry> {
        Arc::clone(&self.inner.read().await.fallbacks)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start every enabled auto-start server concurrently, then the health
    /// loop. Individual failures are logged, not returned.
    pub async fn start(self: &Arc<Self>) {
        let (names, bound_servers) = {
            let inner = self.inner.read().await;
            if !inner.config.manager.enabled {
                info!("connection manager disabled, not starting providers");
                return;
            }
            let names: Vec<String> = inner
                .config
                .servers
                .iter()
                .filter(|s| s.enabled && s.auto_start)
                .map(|s| s.name.clone())
                .collect();
            let bound: Vec<String> = inner
                .config
                .servers
                .iter()
                .map(|s| s.name.clone())
                .filter(|name| inner.fallbacks.bindings_for(name).next().is_some())
                .collect();
            (names, bound)
        };

        // Substitutes are in place before any provider connects.
        for server in &bound_servers {
            self.activate_fallbacks(server).await;
        }

        info!(count = names.len(), "starting providers");
        let results = join_all(names.iter().map(|name| self.start_server(name))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                warn!(server = %name, error = %e, "failed to start provider");
            }
        }

        self.start_health_loop().await;

        let running = self.totals().await.running_servers;
        info!(running, configured = names.len(), "providers started");
        if running == 0 {
            self.issue_setup_advisory(if names.is_empty() {
                "no tool providers are configured; add servers to toolhost.toml"
            } else {
                "no tool provider could be started; check the commands in toolhost.toml"
            });
        }
    }

    /// Stop health checks, disconnect every provider and remove every
    /// registered tool, real or fallback.
    pub async fn stop(&self) {
        let connections: Vec<(String, ServerConnection)> = {
            let mut inner = self.inner.write().await;
            if let Some(health) = inner.health.take() {
                health.cancel();
            }
            inner.connections.drain().collect()
        };

        join_all(
            connections
                .into_iter()
                .map(|(name, conn)| self.teardown(name, conn)),
        )
        .await;

        let fallbacks = self.fallbacks().await;
        for (server, tools) in fallbacks.unregister_all().await {
            self.events
                .emit(ManagerEvent::FallbackDeactivated { server, tools });
        }
        info!("connection manager stopped");
    }

    async fn teardown(&self, name: String, mut conn: ServerConnection) {
        if let Some(supervisor) = conn.supervisor.take() {
            supervisor.abort();
        }
        conn.client.disconnect().await;
        for tool in &conn.registered {
            self.bridge.unregister(tool).await;
        }
        self.events.emit(ManagerEvent::ServerStatusChanged {
            server: name,
            status: ServerStatus::Stopped,
            error: None,
        });
    }

    /// Start one server. No-op when it is already running or another call
    /// is starting it.
    pub async fn start_server(self: &Arc<Self>, name: &str) -> Result<()> {
        // Check and claim under one write lock so concurrent starts spawn
        // a single provider.
        let (client, stale) = {
            let mut inner = self.inner.write().await;
            if !inner.config.manager.enabled {
                return Err(ManagerError::ManagerDisabled.into());
            }
            let descriptor = inner.config.server(name).cloned().ok_or_else(|| {
                ManagerError::ServerNotFound {
                    server: name.to_string(),
                }
            })?;
            if !descriptor.enabled {
                return Err(ManagerError::ServerDisabled {
                    server: name.to_string(),
                }
                .into());
            }
            if let Some(conn) = inner.connections.get(name)
                && matches!(conn.status, ServerStatus::Running | ServerStatus::Starting)
            {
                debug!(server = %name, status = %conn.status, "provider already up");
                return Ok(());
            }

            let settings = ConnectionSettings::from(&inner.config.manager);
            let client = ServerProcessClient::new(descriptor, settings, Arc::clone(&self.launcher));
            let supervisor = tokio::spawn(supervise(
                Arc::downgrade(self),
                name.to_string(),
                Arc::clone(&client),
                client.subscribe(),
            ));
            // A stale connection (error, disconnected) is replaced.
            let stale = inner.connections.insert(name.to_string(), ServerConnection {
                status: ServerStatus::Starting,
                client: Arc::clone(&client),
                last_error: None,
                started_at: None,
                last_heartbeat: None,
                tools: Vec::new(),
                registered: Vec::new(),
                supervisor: Some(supervisor),
            });
            (client, stale)
        };
        if let Some(conn) = stale {
            self.teardown(name.to_string(), conn).await;
        }

        self.activate_fallbacks(name).await;
        self.emit_status(name, ServerStatus::Starting, None);

        let connected = match client.connect().await {
            Ok(()) => self.activate_real_tools(name, &client).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &connected {
            warn!(server = %name, error = %e, "provider failed to start");
            self.mark_down(name, &client, ServerStatus::Error, Some(e.to_string()))
                .await;
            return connected;
        }
        self.settle_after_start(name, &client).await;
        connected
    }

    /// The supervisor ignores client events while a start is in flight, so a
    /// provider lost between the handshake and registration is caught here.
    async fn settle_after_start(&self, name: &str, client: &Arc<ServerProcessClient>) {
        if self.connection_status(name, client).await != Some(ServerStatus::Running) {
            return;
        }
        match client.state() {
            ClientState::Connected => {},
            ClientState::Error => {
                self.mark_down(
                    name,
                    client,
                    ServerStatus::Error,
                    Some("provider failed right after starting".to_string()),
                )
                .await;
            },
            ClientState::Disconnected | ClientState::Connecting => {
                self.mark_down(
                    name,
                    client,
                    ServerStatus::Disconnected,
                    Some("provider exited right after starting".to_string()),
                )
                .await;
            },
        }
    }

    /// Stop one server and drop its connection. Stopping a configured but
    /// idle server is a no-op.
    pub async fn stop_server(&self, name: &str) -> Result<()> {
        let conn = {
            let mut inner = self.inner.write().await;
            if inner.config.server(name).is_none() && !inner.connections.contains_key(name) {
                return Err(ManagerError::ServerNotFound {
                    server: name.to_string(),
                }
                .into());
            }
            inner.connections.remove(name)
        };
        let Some(conn) = conn else {
            return Ok(());
        };

        info!(server = %name, "stopping provider");
        self.teardown(name.to_string(), conn).await;
        self.activate_fallbacks(name).await;
        Ok(())
    }

    /// Stop, wait the settle delay, start. Concurrent restarts of the same
    /// server collapse into the one already running.
    pub async fn restart_server(self: &Arc<Self>, name: &str) -> Result<()> {
        let Some(guard) = self.claim_restart(name) else {
            debug!(server = %name, "restart already in progress");
            return Ok(());
        };
        self.restart_claimed(guard).await
    }

    pub(crate) fn claim_restart(&self, name: &str) -> Option<RestartGuard> {
        let mut set = self
            .restarting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        set.insert(name.to_string()).then(|| RestartGuard {
            set: Arc::clone(&self.restarting),
            name: name.to_string(),
        })
    }

    pub(crate) fn is_restarting(&self, name: &str) -> bool {
        self.restarting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    pub(crate) async fn restart_claimed(self: &Arc<Self>, guard: RestartGuard) -> Result<()> {
        let name = guard.name.clone();
        info!(server = %name, "restarting provider");
        self.stop_server(&name).await?;
        let settle = self.inner.read().await.config.manager.restart_settle();
        tokio::time::sleep(settle).await;
        let result = self.start_server(&name).await;
        drop(guard);
        result
    }

    // ── Registration ────────────────────────────────────────────────

    /// Fetch the provider's tools and register a proxy for each. In graceful
    /// mode the server's fallbacks are removed first; in always mode bound
    /// tools keep their fallback and get no real proxy.
    async fn activate_real_tools(
        &self,
        name: &str,
        client: &Arc<ServerProcessClient>,
    ) -> Result<()> {
        let tools = client.list_tools().await?;
        let fallbacks = self.fallbacks().await;

        if fallbacks.mode() == FallbackMode::Graceful {
            self.deactivate_fallbacks(&fallbacks, name).await;
        }

        let mut registered = Vec::new();
        for tool in &tools {
            if fallbacks.mode() == FallbackMode::Always && fallbacks.is_bound(name, &tool.name) {
                debug!(server = %name, tool = %tool.name, "bound tool stays on its fallback");
                continue;
            }
            let proxy = ProviderToolProxy::new(Arc::clone(client), tool);
            registered.push(proxy.name().to_string());
            self.bridge.register(Arc::new(proxy)).await;
        }

        let stale = {
            let mut inner = self.inner.write().await;
            match inner.connections.get_mut(name) {
                Some(conn) if Arc::ptr_eq(&conn.client, client) => {
                    let now = Utc::now();
                    conn.status = ServerStatus::Running;
                    conn.last_error = None;
                    conn.started_at = conn.started_at.or(Some(now));
                    conn.last_heartbeat = Some(now);
                    conn.tools = tools;
                    let previous = std::mem::replace(&mut conn.registered, registered.clone());
                    previous
                        .into_iter()
                        .filter(|n| !registered.contains(n))
                        .collect()
                },
                // The connection was stopped or replaced meanwhile.
                _ => registered,
            }
        };
        for tool in &stale {
            self.bridge.unregister(tool).await;
        }

        let count = self.registered_count(name).await;
        info!(server = %name, tools = count, "provider running");
        self.emit_status(name, ServerStatus::Running, None);
        Ok(())
    }

    async fn registered_count(&self, name: &str) -> usize {
        self.inner
            .read()
            .await
            .connections
            .get(name)
            .map_or(0, |c| c.registered.len())
    }

    /// Unregister the server's real tools, record the new status and, in
    /// graceful mode, activate its fallbacks. Ignored when `client` no
    /// longer owns the connection.
    pub(crate) async fn mark_down(
        &self,
        name: &str,
        client: &Arc<ServerProcessClient>,
        status: ServerStatus,
        error: Option<String>,
    ) {
        let registered = {
            let mut inner = self.inner.write().await;
            let Some(conn) = inner.connections.get_mut(name) else {
                return;
            };
            if !Arc::ptr_eq(&conn.client, client) {
                return;
            }
            conn.status = status;
            conn.last_error.clone_from(&error);
            conn.tools.clear();
            std::mem::take(&mut conn.registered)
        };
        for tool in &registered {
            self.bridge.unregister(tool).await;
        }
        self.activate_fallbacks(name).await;
        self.emit_status(name, status, error);
    }

    async fn activate_fallbacks(&self, name: &str) {
        let fallbacks = self.fallbacks().await;
        let tools = fallbacks.register_fallback_tools(name).await;
        if tools > 0 {
            self.events.emit(ManagerEvent::FallbackActivated {
                server: name.to_string(),
                tools,
            });
        }
    }

    async fn deactivate_fallbacks(&self, fallbacks: &FallbackRegistry, name: &str) {
        let tools = fallbacks.unregister_fallback_tools(name).await;
        if tools > 0 {
            self.events.emit(ManagerEvent::FallbackDeactivated {
                server: name.to_string(),
                tools,
            });
        }
    }

    fn emit_status(&self, name: &str, status: ServerStatus, error: Option<String>) {
        self.events.emit(ManagerEvent::ServerStatusChanged {
            server: name.to_string(),
            status,
            error,
        });
    }

    pub(crate) fn issue_setup_advisory(&self, message: &str) {
        if self.advisory_issued.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(advisory = %message, "tool providers unavailable");
        self.events.emit(ManagerEvent::SetupAdvisory {
            message: message.to_string(),
        });
    }

    async fn connection_status(
        &self,
        name: &str,
        client: &Arc<ServerProcessClient>,
    ) -> Option<ServerStatus> {
        self.inner
            .read()
            .await
            .connections
            .get(name)
            .filter(|c| Arc::ptr_eq(&c.client, client))
            .map(|c| c.status)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn status(&self, name: &str) -> Option<ServerStatusReport> {
        let fallbacks = self.fallbacks().await;
        let inner = self.inner.read().await;
        let descriptor = inner.config.server(name)?;
        Some(report(descriptor, inner.connections.get(name), &fallbacks).await)
    }

    /// Every configured server, in configuration order.
    pub async fn status_all(&self) -> Vec<ServerStatusReport> {
        let fallbacks = self.fallbacks().await;
        let inner = self.inner.read().await;
        let mut reports = Vec::with_capacity(inner.config.servers.len());
        for descriptor in &inner.config.servers {
            let conn = inner.connections.get(&descriptor.name);
            reports.push(report(descriptor, conn, &fallbacks).await);
        }
        reports
    }

    pub async fn totals(&self) -> ManagerTotals {
        let fallbacks = self.fallbacks().await;
        let (running_servers, real_tools) = {
            let inner = self.inner.read().await;
            let running = inner
                .connections
                .values()
                .filter(|c| c.status == ServerStatus::Running)
                .count();
            let tools = inner.connections.values().map(|c| c.registered.len()).sum();
            (running, tools)
        };
        ManagerTotals {
            running_servers,
            real_tools,
            fallback_tools: fallbacks.active_count().await,
        }
    }

    /// Tools advertised by a running server; empty while it is down.
    pub async fn server_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>> {
        let inner = self.inner.read().await;
        if inner.config.server(name).is_none() {
            return Err(ManagerError::ServerNotFound {
                server: name.to_string(),
            }
            .into());
        }
        Ok(inner
            .connections
            .get(name)
            .map(|c| c.tools.clone())
            .unwrap_or_default())
    }

    /// Call a logical provider tool through whichever registration is
    /// active: the real proxy, else its fallback.
    pub async fn call_tool(&self, server: &str, tool: &str, args: Value) -> Result<ToolOutput> {
        let real = namespaced_name(server, tool);
        let resolved = {
            let inner = self.inner.read().await;
            if inner.config.server(server).is_none() {
                return Err(ManagerError::ServerNotFound {
                    server: server.to_string(),
                }
                .into());
            }
            inner
                .connections
                .get(server)
                .filter(|c| c.registered.contains(&real))
                .map(|_| real)
        };
        let name = match resolved {
            Some(name) => Some(name),
            None => self.fallbacks().await.active_name(server, tool).await,
        };

        let not_connected = || Error::NotConnected {
            server: server.to_string(),
        };
        let name = name.ok_or_else(not_connected)?;
        self.bridge.invoke(&name, args).await.ok_or_else(not_connected)
    }
}

async fn report(
    descriptor: &ServerDescriptor,
    conn: Option<&ServerConnection>,
    fallbacks: &FallbackRegistry,
) -> ServerStatusReport {
    ServerStatusReport {
        name: descriptor.name.clone(),
        status: conn.map_or(ServerStatus::Stopped, |c| c.status),
        enabled: descriptor.enabled,
        auto_start: descriptor.auto_start,
        command: descriptor.command.clone(),
        args: descriptor.args.clone(),
        tools: conn
            .map(|c| c.tools.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default(),
        last_error: conn.and_then(|c| c.last_error.clone()),
        started_at: conn.and_then(|c| c.started_at),
        last_heartbeat: conn.and_then(|c| c.last_heartbeat),
        server_info: conn
            .and_then(|c| c.client.server_info())
            .map(|info| match info.server_info.version {
                Some(version) => format!("{} {version}", info.server_info.name),
                None => info.server_info.name,
            }),
        fallback_active: fallbacks.is_active(&descriptor.name).await,
    }
}

/// Run the validator, log its diagnostics and sanitize.
pub(crate) fn checked_config(config: ToolhostConfig) -> (ToolhostConfig, ValidationResult) {
    let result = validate_config(&config);
    for diagnostic in &result.diagnostics {
        match diagnostic.severity {
            Severity::Error => warn!(%diagnostic, "invalid configuration"),
            Severity::Warning => warn!(%diagnostic, "configuration warning"),
            Severity::Info => info!(%diagnostic, "configuration note"),
        }
    }
    (sanitize(config, &result), result)
}

/// Keeps a connection's status and registrations in step with its client.
async fn supervise(
    manager: Weak<ConnectionManager>,
    name: String,
    client: Arc<ServerProcessClient>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let Some(status) = manager.connection_status(&name, &client).await else {
            break;
        };
        // `start_server` owns the connection until its first connect settles.
        if status == ServerStatus::Starting && !matches!(event, ClientEvent::Notification { .. }) {
            continue;
        }

        match event {
            ClientEvent::Connected if status == ServerStatus::Running => {},
            ClientEvent::Connected => {
                if let Err(e) = manager.activate_real_tools(&name, &client).await {
                    warn!(server = %name, error = %e, "failed to register tools after reconnect");
                }
            },
            ClientEvent::Disconnected { reason }
                if !reason.is_explicit() && status == ServerStatus::Running =>
            {
                manager
                    .mark_down(
                        &name,
                        &client,
                        ServerStatus::Disconnected,
                        Some(format!("provider exited ({reason:?})")),
                    )
                    .await;
            },
            ClientEvent::Disconnected { .. } => {},
            ClientEvent::Reconnecting { attempt, delay } => {
                debug!(
                    server = %name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "provider reconnecting"
                );
            },
            ClientEvent::Failed { .. } if status == ServerStatus::Error => {},
            ClientEvent::Failed { error } => {
                manager
                    .mark_down(&name, &client, ServerStatus::Error, Some(error))
                    .await;
            },
            ClientEvent::Notification { method, .. } => {
                if method == "notifications/tools/list_changed" && status == ServerStatus::Running {
                    info!(server = %name, "provider tool list changed, refreshing");
                    if let Err(e) = manager.activate_real_tools(&name, &client).await {
                        warn!(server = %name, error = %e, "failed to refresh tools");
                    }
                }
            },
        }
    }
}
