//! Keel daemon - fleet orchestration and TLS edge routing
//!
//! The daemon provides:
//! - REST API for services, rollouts, hosts, routes and certificates
//! - Placement, health supervision and rolling updates
//! - HTTP/HTTPS edge listeners with per-domain certificates

use anyhow::Context;
use clap::Parser;
use keel_daemon::{DaemonConfig, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Keel daemon CLI
#[derive(Parser)]
#[command(name = "keeld")]
#[command(about = "Keel - Fleet topology orchestrator with a TLS edge router", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "KEEL_CONFIG")]
    config: Option<String>,

    /// API listen address
    #[arg(short, long, env = "KEEL_LISTEN_ADDR")]
    listen: Option<String>,

    /// Start from development defaults (unprivileged edge ports, three hosts)
    #[arg(long)]
    dev: bool,

    /// Log level
    #[arg(long, env = "KEEL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "KEEL_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let base = if cli.dev {
        DaemonConfig::development()
    } else {
        DaemonConfig::default()
    };
    let mut config =
        DaemonConfig::load_over(base, cli.config.as_deref()).context("loading configuration")?;

    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .with_context(|| format!("invalid listen address '{}'", listen))?;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    println!(
        r#"
  _  __         _
 | |/ /___  ___| |
 | ' // _ \/ _ \ |
 | . \  __/  __/ |
 |_|\_\___|\___|_|

  Fleet topology orchestrator
  Version: {}
  API:     {}
  Edge:    {} / {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.server.listen_addr,
        config.edge.http_addr,
        config.edge.https_addr,
    );

    let server = Server::new(config).await?;
    server.run().await?;
    Ok(())
}
