use std::{error::Error as StdError, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    /// Spawn, handshake or connect-timeout failure.
    #[error("connection to '{server}' failed: {reason}")]
    Connection { server: String, reason: String },
    /// Malformed or unexpected protocol payload.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request '{method}' timed out after {}ms", timeout.as_millis())]
    RequestTimeout { method: String, timeout: Duration },
    /// JSON-RPC error object returned by the provider.
    #[error("provider error on '{method}': code={code} message={message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("server '{server}' is not connected")]
    NotConnected { server: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A fallback implementation failed; there is no secondary fallback.
    #[error("fallback '{tool}' failed: {reason}")]
    Fallback { tool: String, reason: String },
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

/// Errors raised by per-server lifecycle operations on the manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("server '{server}' is not configured")]
    ServerNotFound { server: String },
    #[error("server '{server}' is disabled")]
    ServerDisabled { server: String },
    #[error("connection manager is disabled")]
    ManagerDisabled,
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn connection(server: &str, reason: impl Into<String>) -> Self {
        Self::Connection {
            server: server.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the failure was a connection-level fault rather than a
    /// provider answering with an error.
    #[must_use]
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::NotConnected { .. }
                | Self::ConnectionClosed
                | Self::RequestTimeout { .. }
                | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// `.context()` / `.with_context()` on `Result` and `Option`, producing
/// [`Error::Message`].
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        let ctx = context.into();
        self.map_err(|source| Error::message(format!("{ctx}: {source}")))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| Error::message(format!("{}: {source}", f().into())))
    }
}

impl<T> Context<T> for Option<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| Error::message(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::message(f()))
    }
}
