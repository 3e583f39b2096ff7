//! okto - OKX perpetual-swap auto-trading engine entry point.
//!
//! The web dashboard is an external collaborator; this binary wires the
//! engine to a console event consumer, starts it, and shuts it down on
//! Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use okto_engine::{EngineConfig, EngineEvent, TradingSupervisor};
use tracing::{info, warn};

/// OKX perpetual-swap auto-trading engine
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via OKTO_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Start in passive monitoring mode (no entries, no exchange setup)
    #[arg(long)]
    passive: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .or_else(|| std::env::var("OKTO_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        EngineConfig::from_file(&config_path)
            .with_context(|| format!("loading config from {config_path}"))?
    } else {
        eprintln!("config file {config_path} not found, using defaults");
        EngineConfig::default()
    };

    okto_telemetry::init_logging(&config.log_level).context("initializing logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), config_path, "starting okto");

    let (engine, mut events) =
        TradingSupervisor::new(config, Some("analytics.json".into())).context("building engine")?;

    // Stand-in for the external UI layer: drain engine events to the log.
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                EngineEvent::ConsoleLog { level, message, .. } => match level.as_str() {
                    "error" | "critical" => warn!(target: "okto::ui", "{message}"),
                    _ => info!(target: "okto::ui", "{message}"),
                },
                EngineEvent::Notice { kind, message } => {
                    info!(target: "okto::ui", ?kind, "{message}");
                }
                other => {
                    if let Ok(payload) = serde_json::to_string(other) {
                        info!(target: "okto::ui", "{payload}");
                    }
                }
            }
        }
    });

    engine.start(args.passive).await?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown signal received");
    engine.shutdown();
    printer.abort();

    Ok(())
}
