use std::{path::PathBuf, sync::Arc};

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    serde_json::Value,
    toolhost_config::ToolhostConfig,
    toolhost_mcp::{
        BridgedTool, CommandLauncher, ConnectionManager, InMemoryToolBridge, ManagerEvent,
        ServerStatusReport,
    },
    tracing::{info, warn},
};

#[derive(Subcommand)]
pub enum ServerAction {
    /// Start every configured provider and keep them running until Ctrl-C.
    Run,
    /// Start the providers once and print their status.
    Status {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Start the providers once and list the tools they expose.
    Tools,
    /// Call one provider tool and print its output.
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

pub async fn handle_servers(action: ServerAction, config_path: Option<PathBuf>) -> Result<()> {
    let config = load(config_path)?;
    let bridge = Arc::new(InMemoryToolBridge::new());
    let (manager, validation) =
        ConnectionManager::from_config(config, bridge.clone(), Arc::new(CommandLauncher));
    if validation.has_global_errors() {
        warn!("configuration rejected; run `toolhost config check` for details");
    }

    let events = log_events(&manager);
    manager.start().await;

    let outcome = match action {
        ServerAction::Run => run(&manager).await,
        ServerAction::Status { json } => {
            print_status(&manager.status_all().await, json)?;
            let totals = manager.totals().await;
            if !json {
                println!(
                    "\n{} running, {} provider tool(s), {} fallback tool(s)",
                    totals.running_servers, totals.real_tools, totals.fallback_tools
                );
            }
            Ok(())
        },
        ServerAction::Tools => {
            for tool in bridge.tools().await {
                println!("{:<40} {}", tool.name(), tool.description());
            }
            Ok(())
        },
        ServerAction::Call { server, tool, args } => {
            call(&manager, &server, &tool, &args).await
        },
    };

    manager.stop().await;
    events.abort();
    outcome
}

fn load(path: Option<PathBuf>) -> Result<ToolhostConfig> {
    match path {
        Some(path) => toolhost_config::load_config(&path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(toolhost_config::discover_and_load()),
    }
}

/// Mirror manager events into the log.
fn log_events(manager: &ConnectionManager) -> tokio::task::JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ManagerEvent::ServerStatusChanged {
                    server,
                    status,
                    error,
                } => match error {
                    Some(error) => {
                        warn!(server = %server, %status, error = %error, "status changed");
                    },
                    None => info!(server = %server, %status, "status changed"),
                },
                ManagerEvent::FallbackActivated { server, tools } => {
                    warn!(server = %server, tools, "serving local fallbacks");
                },
                ManagerEvent::FallbackDeactivated { server, tools } => {
                    info!(server = %server, tools, "fallbacks withdrawn");
                },
                ManagerEvent::SetupAdvisory { message } => {
                    eprintln!("toolhost: {message}");
                },
            }
        }
    })
}

async fn run(manager: &Arc<ConnectionManager>) -> Result<()> {
    print_status(&manager.status_all().await, false)?;
    info!("providers running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    Ok(())
}

async fn call(manager: &ConnectionManager, server: &str, tool: &str, args: &str) -> Result<()> {
    let args: Value = serde_json::from_str(args).context("--args must be valid JSON")?;
    let output = manager.call_tool(server, tool, args).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    if output.is_error {
        anyhow::bail!("tool '{tool}' returned an error");
    }
    Ok(())
}

fn print_status(reports: &[ServerStatusReport], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }
    if reports.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }
    println!("{:<20} {:<13} {:>5}  COMMAND", "SERVER", "STATUS", "TOOLS");
    for r in reports {
        let status = if r.fallback_active {
            format!("{} (fb)", r.status)
        } else {
            r.status.to_string()
        };
        println!(
            "{:<20} {:<13} {:>5}  {} {}",
            r.name,
            status,
            r.tools.len(),
            r.command,
            r.args.join(" ")
        );
        if let Some(error) = &r.last_error {
            println!("{:<20} last error: {error}", "");
        }
    }
    Ok(())
}
