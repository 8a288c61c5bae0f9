//! Periodic health checks and auto-restart of unresponsive providers.

use std::sync::{Arc, atomic::Ordering};

use {
    chrono::Utc,
    futures::future::join_all,
    tokio::time::MissedTickBehavior,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::manager::{ConnectionManager, ServerStatus};

/// Consecutive passes in which every provider failed before the setup
/// advisory is issued.
const OUTAGE_PASSES_FOR_ADVISORY: u32 = 2;

/// Outcome of one health pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheck {
    pub healthy: Vec<String>,
    pub failed: Vec<String>,
    /// Skipped because a restart was already in progress.
    pub restarting: Vec<String>,
}

impl ConnectionManager {
    /// (Re)start the background health loop. The first check runs one full
    /// interval after start.
    pub(crate) async fn start_health_loop(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let interval = {
            let mut inner = self.inner.write().await;
            if let Some(previous) = inner.health.replace(token.clone()) {
                previous.cancel();
            }
            inner.config.manager.health_check_interval()
        };

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.check_health().await;
            }
            debug!("health loop stopped");
        });
        info!(interval_ms = interval.as_millis() as u64, "health loop started");
    }

    /// Ping every running provider concurrently. A failed ping restarts the
    /// server when `auto_restart` is set, otherwise marks it `error`.
    pub async fn check_health(self: &Arc<Self>) -> HealthCheck {
        let mut check = HealthCheck::default();
        let (targets, auto_restart) = {
            let inner = self.inner.read().await;
            let mut targets = Vec::new();
            for (name, conn) in &inner.connections {
                if conn.status != ServerStatus::Running {
                    continue;
                }
                if self.is_restarting(name) {
                    check.restarting.push(name.clone());
                    continue;
                }
                targets.push((name.clone(), Arc::clone(&conn.client)));
            }
            (targets, inner.config.manager.auto_restart)
        };

        let pings = join_all(targets.iter().map(|(_, client)| client.ping())).await;

        for ((name, client), alive) in targets.into_iter().zip(pings) {
            if alive {
                let mut inner = self.inner.write().await;
                if let Some(conn) = inner.connections.get_mut(&name)
                    && Arc::ptr_eq(&conn.client, &client)
                {
                    conn.last_heartbeat = Some(Utc::now());
                }
                check.healthy.push(name);
                continue;
            }

            warn!(server = %name, "health check failed");
            if !auto_restart {
                self.mark_down(
                    &name,
                    &client,
                    ServerStatus::Error,
                    Some("health check failed".into()),
                )
                .await;
            } else if let Some(guard) = self.claim_restart(&name) {
                let manager = Arc::clone(self);
                let server = name.clone();
                tokio::spawn(async move {
                    match manager.restart_claimed(guard).await {
                        Ok(()) => info!(server = %server, "provider auto-restarted"),
                        Err(e) => warn!(server = %server, error = %e, "auto-restart failed"),
                    }
                });
            }
            check.failed.push(name);
        }

        if !check.healthy.is_empty() {
            self.outage_passes.store(0, Ordering::SeqCst);
        } else if !check.failed.is_empty() {
            let passes = self.outage_passes.fetch_add(1, Ordering::SeqCst) + 1;
            if passes >= OUTAGE_PASSES_FOR_ADVISORY {
                self.issue_setup_advisory("no tool provider is responding to health checks");
            }
        }
        check
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::{
            manager::ManagerEvent,
            testing::{Script, ScriptedLauncher, fast_settings},
            tool_bridge::{InMemoryToolBridge, ToolBridge},
        },
        std::time::Duration,
        toolhost_config::{ManagerSettings, ServerDescriptor, ToolhostConfig},
    };

    fn manager(
        script: &Script,
        auto_restart: bool,
    ) -> (Arc<ConnectionManager>, Arc<InMemoryToolBridge>) {
        let config = ToolhostConfig {
            manager: ManagerSettings {
                auto_restart,
                ..fast_settings()
            },
            servers: vec![ServerDescriptor::new("fs", "scripted-provider")],
            ..Default::default()
        };
        let bridge = Arc::new(InMemoryToolBridge::new());
        let (manager, _) = ConnectionManager::from_config(
            config,
            bridge.clone(),
            Arc::new(ScriptedLauncher::new().with("fs", script.clone())),
        );
        (manager, bridge)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_ping_refreshes_heartbeat() {
        let script = Script::with_tools(&["echo"]);
        let (manager, _) = manager(&script, true);
        manager.start_server("fs").await.unwrap();
        let before = manager.status("fs").await.unwrap().last_heartbeat.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let check = manager.check_health().await;
        assert_eq!(check.healthy, vec!["fs"]);
        assert!(check.failed.is_empty());

        let after = manager.status("fs").await.unwrap().last_heartbeat.unwrap();
        assert!(after >= before);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_restarts_exactly_once() {
        let script = Script::with_tools(&["echo"]);
        let (manager, _) = manager(&script, true);
        manager.start_server("fs").await.unwrap();
        let mut events = manager.subscribe();

        script.set_answer_pings(false);
        let first = manager.check_health().await;
        assert_eq!(first.failed, vec!["fs"]);

        // A second tick while the restart is in flight must not add another.
        let second = manager.check_health().await;
        assert!(second.failed.is_empty());

        loop {
            match events.recv().await {
                Some(ManagerEvent::ServerStatusChanged {
                    status: ServerStatus::Running,
                    ..
                }) => break,
                Some(_) => {},
                None => panic!("event stream ended"),
            }
        }
        assert_eq!(script.launches(), 2);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_without_auto_restart_marks_error() {
        let script = Script::with_tools(&["echo"]);
        let (manager, bridge) = manager(&script, false);
        manager.start_server("fs").await.unwrap();
        assert_eq!(bridge.names().await, vec!["mcp__fs__echo"]);

        script.set_answer_pings(false);
        let check = manager.check_health().await;
        assert_eq!(check.failed, vec!["fs"]);

        let status = manager.status("fs").await.unwrap();
        assert_eq!(status.status, ServerStatus::Error);
        assert_eq!(status.last_error.as_deref(), Some("health check failed"));
        assert!(bridge.names().await.is_empty());
        assert_eq!(script.launches(), 1);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn health_loop_stops_with_manager() {
        let script = Script::with_tools(&["echo"]);
        let (manager, _) = manager(&script, true);
        manager.start().await;
        assert!(manager.inner.read().await.health.is_some());

        manager.stop().await;
        assert!(manager.inner.read().await.health.is_none());

        // A live loop would now fail its ping and relaunch.
        script.set_answer_pings(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(script.launches(), 1);
    }
}
