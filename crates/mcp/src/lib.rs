//! Tool-provider connection management for toolhost.
//!
//! This crate provides:
//! - JSON-RPC 2.0 over newline-delimited stdio (`codec`, `transport`)
//! - A per-server client with handshake, retries and reconnects (`client`)
//! - The host tool registry interface and provider proxies (`tool_bridge`)
//! - Local substitutes for unavailable provider tools (`fallback`)
//! - Lifecycle management of every configured server (`manager`, `health`,
//!   `reload`)

pub mod client;
pub mod codec;
pub mod error;
pub mod events;
pub mod fallback;
pub mod health;
pub mod launcher;
pub mod manager;
pub mod reload;
pub mod tool_bridge;
pub mod transport;
pub mod types;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod testing;

pub use {
    client::{ClientEvent, ClientState, ConnectionSettings, ServerProcessClient},
    error::{Context, Error, ManagerError, Result},
    fallback::{FallbackError, FallbackRegistry, FallbackTool},
    health::HealthCheck,
    launcher::{CommandLauncher, ProviderLauncher},
    manager::{ConnectionManager, ManagerEvent, ManagerTotals, ServerStatus, ServerStatusReport},
    reload::{ConfigChange, diff_configs},
    tool_bridge::{
        BridgedTool, InMemoryToolBridge, ProviderToolProxy, ToolBridge, ToolOutput,
        fallback_name, namespaced_name,
    },
    transport::DisconnectReason,
    types::{InputShape, ToolDescriptor},
};
