//! Spawning provider processes.
//!
//! The transport only needs three byte streams and a handle it can wait on or
//! kill, so spawning sits behind [`ProviderLauncher`]. [`CommandLauncher`]
//! is the real implementation; tests plug in in-memory providers.

use std::process::Stdio;

use {
    async_trait::async_trait,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        process::{Child, Command},
    },
    tracing::info,
};

use {
    crate::error::{Context, Error, Result},
    toolhost_config::ServerDescriptor,
};

/// How a provider process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit status zero.
    Success,
    /// Non-zero exit status or killed by a signal.
    Failure,
}

/// Handle to a running provider process.
#[async_trait]
pub trait ProviderProcess: Send {
    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> std::io::Result<ExitKind>;

    /// Force-terminate the process and reap it.
    async fn kill(&mut self) -> std::io::Result<()>;

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Streams and handle of a freshly launched provider.
pub struct ProcessIo {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub process: Box<dyn ProviderProcess>,
}

/// Starts provider processes from their descriptors.
#[async_trait]
pub trait ProviderLauncher: Send + Sync {
    async fn launch(&self, descriptor: &ServerDescriptor) -> Result<ProcessIo>;
}

/// Spawns the descriptor's command as a child process with piped stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

#[async_trait]
impl ProviderLauncher for CommandLauncher {
    async fn launch(&self, descriptor: &ServerDescriptor) -> Result<ProcessIo> {
        info!(
            server = %descriptor.name,
            command = %descriptor.command,
            args = ?descriptor.args,
            "spawning provider process"
        );

        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &descriptor.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::external(
                format!("failed to spawn provider '{}'", descriptor.command),
                e,
            )
        })?;

        let stdin = child.stdin.take().context("failed to capture stdin")?;
        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);

        Ok(ProcessIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            process: Box::new(ChildProcess(child)),
        })
    }
}

struct ChildProcess(Child);

#[async_trait]
impl ProviderProcess for ChildProcess {
    async fn wait(&mut self) -> std::io::Result<ExitKind> {
        let status = self.0.wait().await?;
        Ok(if status.success() {
            ExitKind::Success
        } else {
            ExitKind::Failure
        })
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }

    fn pid(&self) -> Option<u32> {
        self.0.id()
    }
}
