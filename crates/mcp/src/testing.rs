//! In-process providers for tests, built on `tokio::io::duplex`.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use {
    async_trait::async_trait,
    serde_json::{Value, json},
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines},
        sync::watch,
    },
};

use {
    crate::{
        error::{Error, Result},
        launcher::{ExitKind, ProcessIo, ProviderLauncher, ProviderProcess},
        types::PROTOCOL_VERSION,
    },
    toolhost_config::ServerDescriptor,
};

const PIPE_CAPACITY: usize = 64 * 1024;

type ExitSender = Arc<watch::Sender<Option<ExitKind>>>;

fn set_exit(exit: &watch::Sender<Option<ExitKind>>, kind: ExitKind) {
    exit.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(kind);
            true
        } else {
            false
        }
    });
}

/// Process handle backed by a watch channel.
pub struct FakeProcess {
    exit: ExitSender,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl ProviderProcess for FakeProcess {
    async fn wait(&mut self) -> std::io::Result<ExitKind> {
        let mut rx = self.exit.subscribe();
        let kind = rx
            .wait_for(Option::is_some)
            .await
            .map(|kind| kind.unwrap_or(ExitKind::Failure))
            .unwrap_or(ExitKind::Failure);
        Ok(kind)
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        set_exit(&self.exit, ExitKind::Failure);
        Ok(())
    }
}

/// Provider end driven line by line from the test body.
pub struct RawProvider {
    lines: Lines<BufReader<DuplexStream>>,
    writer: Option<DuplexStream>,
    exit: ExitSender,
    killed: Arc<AtomicBool>,
}

pub fn raw_provider() -> (ProcessIo, RawProvider) {
    let (client_stdin, provider_stdin) = tokio::io::duplex(PIPE_CAPACITY);
    let (provider_stdout, client_stdout) = tokio::io::duplex(PIPE_CAPACITY);
    let (exit_tx, _) = watch::channel(None);
    let exit = Arc::new(exit_tx);
    let killed = Arc::new(AtomicBool::new(false));

    let io = ProcessIo {
        stdin: Box::new(client_stdin),
        stdout: Box::new(client_stdout),
        stderr: None,
        process: Box::new(FakeProcess {
            exit: Arc::clone(&exit),
            killed: Arc::clone(&killed),
        }),
    };
    let provider = RawProvider {
        lines: BufReader::new(provider_stdin).lines(),
        writer: Some(provider_stdout),
        exit,
        killed,
    };
    (io, provider)
}

impl RawProvider {
    /// Next line written by the client, `None` once stdin is closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.next_line().await.ok().flatten()
    }

    pub async fn send(&mut self, message: &Value) {
        self.send_raw(&message.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.write_all(format!("{line}\n").as_bytes()).await;
            let _ = writer.flush().await;
        }
    }

    /// Exit with a failure status and close stdout.
    pub fn crash(&mut self) {
        set_exit(&self.exit, ExitKind::Failure);
        self.writer = None;
    }

    pub fn exit_clean(self) {
        set_exit(&self.exit, ExitKind::Success);
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Behaviour of a scripted provider. Cloning shares the state, so a test can
/// keep a handle and flip switches while the provider runs.
#[derive(Clone)]
pub struct Script {
    state: Arc<ScriptState>,
}

struct ScriptState {
    tools: Mutex<Vec<Value>>,
    answer_initialize: AtomicBool,
    answer_pings: AtomicBool,
    fail_launch: AtomicBool,
    exit_on_start: AtomicBool,
    exit_after_listing: AtomicBool,
    launches: AtomicU32,
    live: Mutex<Vec<ExitSender>>,
}

impl Script {
    /// A provider exposing the given tools. `echo` returns its `text`
    /// argument, `fail` reports a tool error and `hang` never answers.
    pub fn with_tools(names: &[&str]) -> Self {
        let tools = names
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("{name} tool"),
                    "inputSchema": {
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "required": ["text"]
                    }
                })
            })
            .collect();
        Self {
            state: Arc::new(ScriptState {
                tools: Mutex::new(tools),
                answer_initialize: AtomicBool::new(true),
                answer_pings: AtomicBool::new(true),
                fail_launch: AtomicBool::new(false),
                exit_on_start: AtomicBool::new(false),
                exit_after_listing: AtomicBool::new(false),
                launches: AtomicU32::new(0),
                live: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_answer_initialize(&self, on: bool) {
        self.state.answer_initialize.store(on, Ordering::SeqCst);
    }

    pub fn set_answer_pings(&self, on: bool) {
        self.state.answer_pings.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_launch(&self, on: bool) {
        self.state.fail_launch.store(on, Ordering::SeqCst);
    }

    /// Every launched provider exits with status zero right away.
    pub fn set_exit_on_start(&self, on: bool) {
        self.state.exit_on_start.store(on, Ordering::SeqCst);
    }

    /// The next provider to answer `tools/list` crashes right after the
    /// reply. Fires once.
    pub fn set_exit_after_listing(&self, on: bool) {
        self.state.exit_after_listing.store(on, Ordering::SeqCst);
    }

    pub fn launches(&self) -> u32 {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Make every running provider of this script exit with a failure.
    pub fn crash_all(&self) {
        for exit in self.state.live.lock().unwrap().drain(..) {
            set_exit(&exit, ExitKind::Failure);
        }
    }

    /// Make every running provider of this script exit with status zero.
    pub fn exit_all_clean(&self) {
        for exit in self.state.live.lock().unwrap().drain(..) {
            set_exit(&exit, ExitKind::Success);
        }
    }

    fn reply(&self, line: &str) -> Option<Value> {
        let msg: Value = serde_json::from_str(line).ok()?;
        let id = msg.get("id")?.clone();
        let method = msg.get("method")?.as_str()?;
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        let result = match method {
            "initialize" => {
                if !self.state.answer_initialize.load(Ordering::SeqCst) {
                    return None;
                }
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}, "resources": {}},
                    "serverInfo": {"name": "scripted", "version": "1.0.0"}
                })
            },
            "tools/list" => {
                let tools = self.state.tools.lock().unwrap().clone();
                json!({"tools": tools})
            },
            "tools/call" => match params["name"].as_str() {
                Some("echo") => json!({
                    "content": [{"type": "text", "text": params["arguments"]["text"]}]
                }),
                Some("fail") => json!({
                    "content": [{"type": "text", "text": "tool failed"}],
                    "isError": true
                }),
                Some("hang") => return None,
                _ => return Some(error_reply(id, -32602, "unknown tool")),
            },
            "resources/list" => json!({
                "resources": [{"uri": "file:///readme", "name": "readme"}]
            }),
            "resources/read" => json!({
                "contents": [{"uri": params["uri"], "text": "hello"}]
            }),
            "ping" => {
                if !self.state.answer_pings.load(Ordering::SeqCst) {
                    return None;
                }
                json!({})
            },
            _ => return Some(error_reply(id, -32601, "Method not found")),
        };
        Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }
}

fn error_reply(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

async fn serve(script: Script, stdin: DuplexStream, mut stdout: DuplexStream, exit: ExitSender) {
    if script.state.exit_on_start.load(Ordering::SeqCst) {
        set_exit(&exit, ExitKind::Success);
        return;
    }

    let mut lines = BufReader::new(stdin).lines();
    let mut exited = exit.subscribe();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(reply) = script.reply(&line) {
                        let out = format!("{reply}\n");
                        if stdout.write_all(out.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    if line.contains("\"tools/list\"")
                        && script.state.exit_after_listing.swap(false, Ordering::SeqCst)
                    {
                        set_exit(&exit, ExitKind::Failure);
                        break;
                    }
                },
                // stdin closed: exit cooperatively.
                _ => {
                    set_exit(&exit, ExitKind::Success);
                    break;
                },
            },
            () = async {
                let _ = exited.wait_for(Option::is_some).await;
            } => break,
        }
    }
}

/// Launcher serving scripted providers by server name.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, server: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(server.to_string(), script);
        self
    }
}

#[async_trait]
impl ProviderLauncher for ScriptedLauncher {
    async fn launch(&self, descriptor: &ServerDescriptor) -> Result<ProcessIo> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| Error::message(format!("no script for '{}'", descriptor.name)))?;

        script.state.launches.fetch_add(1, Ordering::SeqCst);
        if script.state.fail_launch.load(Ordering::SeqCst) {
            return Err(Error::connection(&descriptor.name, "launch refused"));
        }

        let (client_stdin, provider_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (provider_stdout, client_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, _) = watch::channel(None);
        let exit = Arc::new(exit_tx);
        script.state.live.lock().unwrap().push(Arc::clone(&exit));

        tokio::spawn(serve(
            script.clone(),
            provider_stdin,
            provider_stdout,
            Arc::clone(&exit),
        ));

        Ok(ProcessIo {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            stderr: None,
            process: Box::new(FakeProcess {
                exit,
                killed: Arc::new(AtomicBool::new(false)),
            }),
        })
    }
}

/// Settings with short, deterministic delays.
pub fn fast_settings() -> toolhost_config::ManagerSettings {
    toolhost_config::ManagerSettings {
        max_retries: 2,
        base_retry_delay_ms: 100,
        max_retry_delay_ms: 1_000,
        max_jitter_ms: 0,
        connection_timeout_ms: 1_000,
        request_timeout_ms: 1_000,
        tool_call_timeout_ms: 2_000,
        ping_timeout_ms: 500,
        health_check_interval_ms: 1_000,
        restart_settle_ms: 50,
        shutdown_grace_ms: 200,
        ..Default::default()
    }
}
