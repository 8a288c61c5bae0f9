//! Client for one provider process: handshake, requests, and the
//! reconnect/backoff state machine.

use std::{
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    rand::Rng,
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
        error::{Error, Result},
        events::EventHub,
        launcher::ProviderLauncher,
        transport::{DisconnectReason, NotificationSink, StdioTransport},
        types::{
            ClientCapabilities, ClientInfo, InitializeParams, InitializeResult,
            JsonRpcNotification, PROTOCOL_VERSION, ResourceDef, ResourceReadResult,
            ResourcesListResult, ToolDescriptor, ToolsCallParams, ToolsCallResult,
            ToolsListResult,
        },
    },
    toolhost_config::{ManagerSettings, ServerDescriptor},
};

/// Connection state of a [`ServerProcessClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exhausted. Only an explicit `connect` leaves this state.
    Error,
}

/// Lifecycle and protocol events of one client, delivered in order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    Reconnecting { attempt: u32, delay: Duration },
    Failed { error: String },
    Notification { method: String, params: Option<Value> },
}

/// Retry and timeout knobs of a client.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_jitter: Duration,
    pub connection_timeout: Duration,
    pub request_timeout: Duration,
    pub tool_call_timeout: Duration,
    pub ping_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl From<&ManagerSettings> for ConnectionSettings {
    fn from(s: &ManagerSettings) -> Self {
        Self {
            max_retries: s.max_retries,
            base_retry_delay: s.base_retry_delay(),
            max_retry_delay: s.max_retry_delay(),
            max_jitter: s.max_jitter(),
            connection_timeout: s.connection_timeout(),
            request_timeout: s.request_timeout(),
            tool_call_timeout: s.tool_call_timeout(),
            ping_timeout: s.ping_timeout(),
            shutdown_grace: s.shutdown_grace(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ManagerSettings::default())
    }
}

impl ConnectionSettings {
    /// Exponential backoff before retry number `attempt` (1-based), without
    /// jitter: `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.base_retry_delay.checked_mul(factor))
            .map_or(self.max_retry_delay, |d| d.min(self.max_retry_delay))
    }

    /// Backoff plus random jitter, still capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        (self.backoff(attempt) + jitter).min(self.max_retry_delay)
    }
}

/// Client for a single provider process.
///
/// Owns the current transport and restarts the provider with exponential
/// backoff when it goes away unexpectedly. Held in an `Arc`: the reconnect
/// watcher keeps a weak reference back to it.
pub struct ServerProcessClient {
    descriptor: ServerDescriptor,
    settings: ConnectionSettings,
    launcher: Arc<dyn ProviderLauncher>,
    state: Mutex<ClientState>,
    transport: RwLock<Option<Arc<StdioTransport>>>,
    server_info: Mutex<Option<InitializeResult>>,
    spawn_attempts: AtomicU32,
    retry_count: AtomicU32,
    cancel: Mutex<CancellationToken>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect sequences (explicit and reconnect).
    connecting: tokio::sync::Mutex<()>,
    events: EventHub<ClientEvent>,
}

impl ServerProcessClient {
    pub fn new(
        descriptor: ServerDescriptor,
        settings: ConnectionSettings,
        launcher: Arc<dyn ProviderLauncher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            settings,
            launcher,
            state: Mutex::new(ClientState::Disconnected),
            transport: RwLock::new(None),
            server_info: Mutex::new(None),
            spawn_attempts: AtomicU32::new(0),
            retry_count: AtomicU32::new(0),
            cancel: Mutex::new(CancellationToken::new()),
            watcher: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            events: EventHub::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Number of processes launched over the client's lifetime.
    pub fn spawn_attempts(&self) -> u32 {
        self.spawn_attempts.load(Ordering::SeqCst)
    }

    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.events.subscribe()
    }

    fn set_state(&self, next: ClientState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!(server = %self.descriptor.name, from = ?*state, to = ?next, "client state");
            *state = next;
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connect, retrying with backoff. No-op when already connected.
    ///
    /// Returns the last attempt's error once retries are exhausted, or
    /// [`Error::ConnectionClosed`] when `disconnect` interrupts the sequence.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let _sequence = self.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let token = {
            let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            cancel.clone()
        };
        self.retry_count.store(0, Ordering::SeqCst);
        self.run_attempts(&token, false).await
    }

    async fn run_attempts(
        self: &Arc<Self>,
        token: &CancellationToken,
        backoff_first: bool,
    ) -> Result<()> {
        let mut backoff = backoff_first;
        loop {
            if backoff {
                let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = self.settings.retry_delay(attempt);
                info!(
                    server = %self.descriptor.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying provider connection"
                );
                self.set_state(ClientState::Connecting);
                self.events.emit(ClientEvent::Reconnecting { attempt, delay });
                tokio::select! {
                    () = tokio::time::sleep(delay) => {},
                    () = token.cancelled() => return Err(Error::ConnectionClosed),
                }
            }
            backoff = true;

            self.set_state(ClientState::Connecting);
            let err = match self.attempt_connection(token).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if token.is_cancelled() {
                return Err(Error::ConnectionClosed);
            }

            let failures = self.retry_count.load(Ordering::SeqCst);
            warn!(
                server = %self.descriptor.name,
                error = %err,
                failures,
                max_retries = self.settings.max_retries,
                "provider connection attempt failed"
            );
            if failures >= self.settings.max_retries {
                self.set_state(ClientState::Error);
                self.events.emit(ClientEvent::Failed {
                    error: err.to_string(),
                });
                return Err(err);
            }
        }
    }

    /// One spawn + handshake, bounded by the connection timeout.
    async fn attempt_connection(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        let name = &self.descriptor.name;
        self.spawn_attempts.fetch_add(1, Ordering::SeqCst);
        let io = self.launcher.launch(&self.descriptor).await?;
        let transport = StdioTransport::start(name, io, self.notification_sink());

        let timeout = self.settings.connection_timeout;
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.handshake(&transport)) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::connection(
                    name,
                    format!("handshake timed out after {}ms", timeout.as_millis()),
                )),
            },
            () = token.cancelled() => Err(Error::ConnectionClosed),
        };

        let info = match outcome {
            Ok(info) => info,
            Err(e) => {
                transport.shutdown(Duration::ZERO).await;
                return Err(e);
            },
        };

        {
            let mut slot = self.transport.write().await;
            if token.is_cancelled() {
                drop(slot);
                transport.shutdown(Duration::ZERO).await;
                return Err(Error::ConnectionClosed);
            }
            *slot = Some(Arc::clone(&transport));
        }
        *self
            .server_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(info);
        self.retry_count.store(0, Ordering::SeqCst);
        self.set_state(ClientState::Connected);
        self.events.emit(ClientEvent::Connected);
        self.watch_transport(transport, token.clone());
        Ok(())
    }

    async fn handshake(&self, transport: &StdioTransport) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "toolhost".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let value = transport
            .request(
                "initialize",
                Some(serde_json::to_value(&params)?),
                self.settings.request_timeout,
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid initialize result: {e}")))?;

        if result.protocol_version != PROTOCOL_VERSION {
            warn!(
                server = %self.descriptor.name,
                ours = PROTOCOL_VERSION,
                theirs = %result.protocol_version,
                "provider speaks a different protocol version"
            );
        }
        info!(
            server = %self.descriptor.name,
            protocol = %result.protocol_version,
            provider = %result.server_info.name,
            "provider initialized"
        );

        transport.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    fn notification_sink(self: &Arc<Self>) -> NotificationSink {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |notification: JsonRpcNotification| {
            if let Some(client) = weak.upgrade() {
                client.events.emit(ClientEvent::Notification {
                    method: notification.method,
                    params: notification.params,
                });
            }
        })
    }

    /// Wait for the transport to close; an unexpected close starts a single
    /// reconnect sequence.
    fn watch_transport(self: &Arc<Self>, transport: Arc<StdioTransport>, token: CancellationToken) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let reason = transport.closed().await;
            drop(transport);
            if reason.is_explicit() || token.is_cancelled() {
                return;
            }
            let Some(client) = weak.upgrade() else {
                return;
            };

            warn!(server = %client.descriptor.name, reason = ?reason, "provider connection lost");
            client.transport.write().await.take();
            client.set_state(ClientState::Disconnected);
            client.events.emit(ClientEvent::Disconnected { reason });

            let _sequence = client.connecting.lock().await;
            if token.is_cancelled() || client.is_connected() {
                return;
            }
            if let Err(e) = client.run_attempts(&token, true).await {
                debug!(server = %client.descriptor.name, error = %e, "reconnect sequence ended");
            }
        });

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the provider and cancel any scheduled reconnect. Leaves the
    /// client `Disconnected`.
    pub async fn disconnect(&self) {
        self.current_token().cancel();
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }

        let transport = self.transport.write().await.take();
        if let Some(transport) = &transport {
            info!(server = %self.descriptor.name, "stopping provider");
            transport.shutdown(self.settings.shutdown_grace).await;
        }
        self.set_state(ClientState::Disconnected);
        if transport.is_some() {
            self.events.emit(ClientEvent::Disconnected {
                reason: DisconnectReason::ExplicitStop,
            });
        }
    }

    async fn connected_transport(&self) -> Result<Arc<StdioTransport>> {
        let not_connected = || Error::NotConnected {
            server: self.descriptor.name.clone(),
        };
        if !self.is_connected() {
            return Err(not_connected());
        }
        self.transport.read().await.clone().ok_or_else(not_connected)
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let transport = self.connected_transport().await?;
        let value = transport
            .request("tools/list", None, self.settings.request_timeout)
            .await?;
        let result: ToolsListResult = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid tools/list result: {e}")))?;

        debug!(
            server = %self.descriptor.name,
            count = result.tools.len(),
            "fetched provider tools"
        );
        Ok(result
            .tools
            .iter()
            .map(|def| ToolDescriptor::from_def(&self.descriptor.name, def))
            .collect())
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolsCallResult> {
        let transport = self.connected_transport().await?;
        let params = ToolsCallParams {
            name: name.into(),
            arguments,
        };
        let value = transport
            .request(
                "tools/call",
                Some(serde_json::to_value(&params)?),
                self.settings.tool_call_timeout,
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid tools/call result: {e}")))
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDef>> {
        let transport = self.connected_transport().await?;
        let value = transport
            .request("resources/list", None, self.settings.request_timeout)
            .await?;
        let result: ResourcesListResult = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid resources/list result: {e}")))?;
        Ok(result.resources)
    }

    pub async fn get_resource(&self, uri: &str) -> Result<ResourceReadResult> {
        let transport = self.connected_transport().await?;
        let value = transport
            .request(
                "resources/read",
                Some(serde_json::json!({ "uri": uri })),
                self.settings.request_timeout,
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid resources/read result: {e}")))
    }

    /// Liveness probe bounded by the ping timeout. Never errors.
    pub async fn ping(&self) -> bool {
        let Ok(transport) = self.connected_transport().await else {
            return false;
        };
        match transport
            .request("ping", None, self.settings.ping_timeout)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(server = %self.descriptor.name, error = %e, "ping failed");
                false
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::testing::{Script, ScriptedLauncher, fast_settings},
        rstest::rstest,
        serde_json::json,
    };

    fn client_for(script: &Script) -> Arc<ServerProcessClient> {
        let launcher = ScriptedLauncher::new().with("scripted", script.clone());
        ServerProcessClient::new(
            ServerDescriptor::new("scripted", "scripted-provider"),
            ConnectionSettings::from(&fast_settings()),
            Arc::new(launcher),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(4, 800)]
    #[case(5, 1_000)]
    #[case(64, 1_000)]
    fn backoff_doubles_and_caps(#[case] attempt: u32, #[case] millis: u64) {
        let settings = ConnectionSettings::from(&fast_settings());
        assert_eq!(settings.backoff(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let settings = ConnectionSettings {
            max_jitter: Duration::from_millis(50),
            ..ConnectionSettings::from(&fast_settings())
        };
        for _ in 0..100 {
            let delay = settings.retry_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn connects_and_lists_tools() {
        let script = Script::with_tools(&["echo", "fail"]);
        let client = client_for(&script);
        let mut events = client.subscribe();

        client.connect().await.unwrap();
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.server_info().unwrap().server_info.name, "scripted");
        assert!(matches!(events.recv().await, Some(ClientEvent::Connected)));

        let tools = client.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "fail"]);
        assert_eq!(tools[0].server, "scripted");

        // Already connected: no second spawn.
        client.connect().await.unwrap();
        assert_eq!(script.launches(), 1);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn tool_calls_and_resources() {
        let script = Script::with_tools(&["echo"]);
        let client = client_for(&script);
        client.connect().await.unwrap();

        let result = client
            .call_tool("echo", json!({"text": "hello"}))
            .await
            .unwrap();
        assert_eq!(result.text(), "hello");
        assert!(!result.is_error);

        let failed = client.call_tool("fail", json!({})).await.unwrap();
        assert!(failed.is_error);

        let unknown = client.call_tool("missing", json!({})).await.unwrap_err();
        assert!(matches!(unknown, Error::Rpc { code: -32602, .. }));

        let resources = client.list_resources().await.unwrap();
        assert_eq!(resources[0].uri, "file:///readme");
        let read = client.get_resource("file:///readme").await.unwrap();
        assert_eq!(read.contents[0].text.as_deref(), Some("hello"));
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_call_times_out() {
        let script = Script::with_tools(&["hang"]);
        let client = client_for(&script);
        client.connect().await.unwrap();

        let err = client.call_tool("hang", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }));
        // The connection survives a timed-out call.
        assert!(client.ping().await);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn requests_fail_fast_when_not_connected() {
        let client = client_for(&Script::with_tools(&[]));
        assert!(matches!(
            client.list_tools().await,
            Err(Error::NotConnected { .. })
        ));
        assert!(matches!(
            client.call_tool("echo", json!({})).await,
            Err(Error::NotConnected { .. })
        ));
        assert!(!client.ping().await);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_terminal() {
        let script = Script::with_tools(&[]);
        script.set_fail_launch(true);
        let client = client_for(&script);
        let mut events = client.subscribe();

        let started = tokio::time::Instant::now();
        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ClientState::Error);
        assert_eq!(script.launches(), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));

        let events = drain(&mut events);
        let delays: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::Reconnecting { delay, .. } => Some(delay.as_millis()),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![100, 200]);
        assert!(matches!(events.last(), Some(ClientEvent::Failed { .. })));

        // Terminal: nothing else is spawned.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(script.launches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_counts_as_failure() {
        let script = Script::with_tools(&[]);
        script.set_answer_initialize(false);
        let launcher = ScriptedLauncher::new().with("scripted", script.clone());
        let client = ServerProcessClient::new(
            ServerDescriptor::new("scripted", "scripted-provider"),
            ConnectionSettings {
                max_retries: 0,
                ..ConnectionSettings::from(&fast_settings())
            },
            Arc::new(launcher),
        );

        let err = client.connect().await.unwrap_err();
        assert!(err.is_connection_fault());
        assert_eq!(client.state(), ClientState::Error);
        assert_eq!(script.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_exit_starts_one_reconnect_sequence() {
        let script = Script::with_tools(&["echo"]);
        let client = client_for(&script);
        client.connect().await.unwrap();
        let mut events = client.subscribe();

        script.crash_all();
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Disconnected {
                reason: DisconnectReason::Crash
            })
        ));
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Reconnecting { attempt: 1, .. })
        ));
        assert!(matches!(events.recv().await, Some(ClientEvent::Connected)));
        assert_eq!(script.launches(), 2);
        assert!(client.is_connected());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(script.launches(), 2);
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_starts_no_reconnect() {
        let script = Script::with_tools(&[]);
        let client = client_for(&script);
        client.connect().await.unwrap();
        let mut events = client.subscribe();

        client.disconnect().await;
        assert_eq!(client.state(), ClientState::Disconnected);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(script.launches(), 1);
        let events = drain(&mut events);
        assert!(matches!(events.as_slice(), [ClientEvent::Disconnected {
            reason: DisconnectReason::ExplicitStop
        }]));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_scheduled_reconnect() {
        let script = Script::with_tools(&[]);
        let client = client_for(&script);
        client.connect().await.unwrap();
        let mut events = client.subscribe();

        script.crash_all();
        loop {
            if let Some(ClientEvent::Reconnecting { .. }) = events.recv().await {
                break;
            }
        }
        client.disconnect().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(script.launches(), 1);
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_exit_is_reported_and_reconnects() {
        let script = Script::with_tools(&[]);
        let client = client_for(&script);
        client.connect().await.unwrap();
        let mut events = client.subscribe();

        script.exit_all_clean();
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Disconnected {
                reason: DisconnectReason::CleanExit
            })
        ));
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Reconnecting { attempt: 1, .. })
        ));
        assert!(matches!(events.recv().await, Some(ClientEvent::Connected)));
        client.disconnect().await;
    }
}
