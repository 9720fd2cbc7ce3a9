//! peerlink-server: local WebRTC signaling relay.
//!
//! Accepts one trusted control client over TCP and, on its behalf, creates
//! WebRTC peer connections: `getInfo` produces a local offer plus gathered
//! ICE candidates, `connect` applies a remote party's offer and candidates.

mod config;
mod context;
mod engine;
mod notifier;
mod relay;
mod router;
mod server;

use clap::Parser;
use config::{CliOverrides, RelayConfig};
use context::RelayContext;
use engine::WebRtcEngineFactory;
use server::ControlGateway;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// peerlink-server: local WebRTC signaling relay
#[derive(Parser, Debug)]
#[command(name = "peerlink-server", version, about = "Local WebRTC signaling relay")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.peerlink/config.toml")]
    config: String,

    /// STUN server URL (repeatable; replaces the configured list)
    #[arg(long = "stun")]
    stun: Vec<String>,

    /// Seconds to wait for ICE gathering before replying with an error (0 waits forever)
    #[arg(long)]
    gathering_timeout: Option<u64>,

    /// Close sessions older than this many seconds (0 keeps them forever)
    #[arg(long)]
    session_ttl: Option<u64>,

    /// Close every session when the control client disconnects
    #[arg(long)]
    evict_on_disconnect: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting peerlink-server");

    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        stun_servers: cli.stun,
        gathering_timeout_secs: cli.gathering_timeout,
        session_ttl_secs: cli.session_ttl,
        evict_on_disconnect: cli.evict_on_disconnect,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match RelayConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let engine = match WebRtcEngineFactory::new(&config.stun_servers) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!(error = %e, "failed to initialize WebRTC engine");
            std::process::exit(1);
        }
    };

    info!(
        addr = %config.listen_addr(),
        stun = ?config.stun_servers,
        gathering_timeout = ?config.gathering_timeout,
        session_ttl = ?config.session_ttl,
        "relay configured"
    );

    let ctx = RelayContext::start(config, engine);
    let gateway = ControlGateway::new(ctx.clone());

    tokio::select! {
        result = gateway.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let closed = ctx.registry.evict_all().await;
    info!(sessions = closed, "peerlink-server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
