mod board;
mod button;
mod clock;
mod config;
mod context;
mod scheduler;
mod timer;
mod web;

use anyhow::{Context as _, Result};
use std::{env, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use board::Board;
use context::{Context, SharedContext};
use scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("relay_timer=info,tower_http=info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "timer.toml".to_string());
    let mut cfg = config::load_or_default(&config_path)?;
    if let Ok(port) = env::var("WEB_PORT") {
        cfg.web.port = port
            .parse()
            .with_context(|| format!("WEB_PORT is not a port number: {port:?}"))?;
        cfg.validate()?;
    }

    if cfg.network.ssid.is_empty() {
        warn!(hostname = %cfg.network.hostname, "no wifi ssid configured, using existing link");
    } else {
        info!(hostname = %cfg.network.hostname, ssid = %cfg.network.ssid, "network");
    }

    // ── Shared context + board ──────────────────────────────────────
    let ctx: SharedContext = Arc::new(Context::new(&cfg));
    let mut board = Board::new(&cfg.gpio)?;

    let isr_ctx = Arc::clone(&ctx);
    board.on_falling_edge(move || isr_ctx.on_falling_edge())?;

    // ── Scheduler ───────────────────────────────────────────────────
    let mut scheduler = Scheduler::new(
        Arc::clone(&ctx),
        board,
        cfg.timer.period(),
        Some(cfg.web.socket_addr()),
    );

    let result = tokio::select! {
        r = scheduler.run() => r,
        r = stop_signal() => r,
    };

    scheduler.shutdown();
    if let Err(e) = &result {
        error!("fatal: {e:#}");
    }
    result
}

/// Resolves on ctrl-c, or SIGTERM from a service manager.
async fn stop_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r.context("failed to listen for ctrl-c")?;
                info!("interrupt received");
            }
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        info!("interrupt received");
    }
    Ok(())
}
