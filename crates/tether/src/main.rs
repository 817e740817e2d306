//! # tether
//!
//! `tether serve` runs the bridge server. `tether agent` runs a diagnostic
//! client that answers `ping` and `echo`, useful for checking a deployment
//! end to end.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tether_client::{
    ActionDispatchTable, ActionHandler, AgentController, ControllerConfig, StaticPort,
    StaticWindows,
};
use tether_core::WindowId;
use tether_server::{BridgeServer, ServerConfig};
use tether_settings::TetherSettings;

/// Tether controller bridge.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Controller bridge between a dispatch server and browser agents")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge server.
    Serve {
        /// Host to bind.
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
        /// Don't install the Prometheus recorder.
        #[arg(long)]
        no_metrics: bool,
    },
    /// Run a diagnostic agent exposing `ping` and `echo`.
    Agent {
        /// Server host to dial.
        #[arg(long)]
        host: Option<String>,
        /// Server port to dial.
        #[arg(long)]
        port: Option<u16>,
        /// Window ids to claim (repeatable).
        #[arg(long = "window", value_name = "ID")]
        windows: Vec<WindowId>,
        /// Actions allowed to run at once.
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
}

impl Cli {
    /// Fold command-line flags over loaded settings.
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        match &self.command {
            Command::Serve { host, port, .. } => {
                if let Some(host) = host {
                    settings.server.host.clone_from(host);
                }
                if let Some(port) = port {
                    settings.server.port = *port;
                }
            }
            Command::Agent {
                host,
                port,
                max_concurrent,
                ..
            } => {
                if let Some(host) = host {
                    settings.link.host.clone_from(host);
                }
                if let Some(port) = port {
                    settings.server.port = *port;
                }
                if let Some(n) = max_concurrent {
                    settings.concurrency.max_concurrent = *n;
                }
            }
        }
    }
}

fn load(cli: &Cli) -> Result<TetherSettings> {
    let mut settings = match &cli.settings {
        Some(path) => tether_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => tether_settings::load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    if settings.logging.json {
        tether_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        tether_core::logging::init_subscriber(&settings.logging.level);
    }

    match cli.command {
        Command::Serve { no_metrics, .. } => serve(&settings, !no_metrics).await,
        Command::Agent { windows, .. } => agent(&settings, windows).await,
    }
}

async fn serve(settings: &TetherSettings, with_metrics: bool) -> Result<()> {
    let metrics = if with_metrics {
        match tether_server::metrics::install_recorder() {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "metrics recorder unavailable");
                None
            }
        }
    } else {
        None
    };

    let server = BridgeServer::new(ServerConfig::from(&settings.server), metrics);
    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind bridge server")?;

    tracing::info!(
        "tether bridge listening on ws://{addr}{}",
        server.config().path
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(server.bridge(), vec![handle], None)
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Echoes its payload back.
struct EchoAction;

#[async_trait]
impl ActionHandler for EchoAction {
    async fn handle(&self, payload: Value) -> Result<Value, String> {
        Ok(payload)
    }
}

fn diagnostic_actions() -> ActionDispatchTable {
    let mut table = ActionDispatchTable::new();
    table.register("echo", EchoAction);
    table.register_fn("ping", |_| async move {
        Ok::<Value, String>(json!({
            "pong": true,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    });
    table
}

async fn agent(settings: &TetherSettings, windows: Vec<WindowId>) -> Result<()> {
    let controller = AgentController::new(
        ControllerConfig::from(settings),
        Arc::new(StaticPort(settings.server.port)),
        Arc::new(StaticWindows(windows)),
        diagnostic_actions(),
    );

    if let Err(err) = controller.start().await {
        tracing::warn!(error = %err, "initial connection failed, retrying in background");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    controller.stop();
    let stats = serde_json::to_string(&controller.stats()).context("Failed to encode stats")?;
    tracing::info!(%stats, "agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_override_settings() {
        let cli = Cli::parse_from(["tether", "serve", "--port", "0", "--host", "0.0.0.0"]);
        let mut settings = TetherSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.link.host, "127.0.0.1");
    }

    #[test]
    fn agent_flags_override_settings() {
        let cli = Cli::parse_from([
            "tether",
            "agent",
            "--port",
            "9400",
            "--window",
            "1",
            "--window",
            "2",
            "--max-concurrent",
            "4",
            "--log-level",
            "debug",
        ]);
        let mut settings = TetherSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 9400);
        assert_eq!(settings.concurrency.max_concurrent, 4);
        assert_eq!(settings.logging.level, "debug");
        assert!(matches!(
            cli.command,
            Command::Agent { ref windows, .. } if windows == &[1, 2]
        ));
    }

    #[test]
    fn defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["tether", "serve"]);
        let mut settings = TetherSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 9300);
        assert!(!settings.logging.json);
    }

    #[test]
    fn malformed_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let path = path.to_str().unwrap();
        let cli = Cli::parse_from(["tether", "--settings", path, "serve"]);
        assert!(load(&cli).is_err());
    }

    #[test]
    fn settings_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"port":9500,"host":"0.0.0.0"}}"#).unwrap();
        let path = path.to_str().unwrap();
        let cli = Cli::parse_from(["tether", "--settings", path, "serve", "--port", "9600"]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 9600);
    }

    #[tokio::test]
    async fn diagnostic_actions_answer() {
        let table = diagnostic_actions();
        assert_eq!(table.actions(), vec!["echo", "ping"]);
        let echoed = table.dispatch("echo", json!({"a": 1})).await.unwrap();
        assert_eq!(echoed, json!({"a": 1}));
        let pong = table.dispatch("ping", Value::Null).await.unwrap();
        assert_eq!(pong["pong"], true);
    }
}
