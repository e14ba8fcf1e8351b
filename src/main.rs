use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use keygate::app_state::AppState;
use keygate::config::Config;
use keygate::proxy;

/// keygate routes each authenticated identity to its own upstream proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// config file (YAML); built-in defaults are used when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let state = AppState::new(&config);
    match &config.routes_file {
        Some(path) if path.exists() => {
            let count = state
                .routes
                .reload()
                .await
                .with_context(|| format!("loading routes from {}", path.display()))?;
            tracing::info!("loaded {} route(s) from {}", count, path.display());
        }
        Some(path) => {
            tracing::warn!(
                "routes file {} not found, starting with an empty table",
                path.display()
            );
        }
        None => {
            tracing::info!("no routes file configured, starting with an empty table");
        }
    }

    let socks5_listener = TcpListener::bind(&config.socks5_listen)
        .await
        .with_context(|| format!("binding SOCKS5 listener on {}", config.socks5_listen))?;
    let http_listener = TcpListener::bind(&config.http_listen)
        .await
        .with_context(|| format!("binding HTTP listener on {}", config.http_listen))?;
    tracing::info!("SOCKS5 proxy listening on {}", config.socks5_listen);
    tracing::info!("HTTP proxy listening on {}", config.http_listen);

    let socks5_shutdown = Arc::new(Notify::new());
    let http_shutdown = Arc::new(Notify::new());
    let socks5_task = tokio::spawn(proxy::socks5::serve(
        socks5_listener,
        state.clone(),
        socks5_shutdown.clone(),
    ));
    let http_task = tokio::spawn(proxy::http::serve(
        http_listener,
        state.clone(),
        http_shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received, closing listeners");
    socks5_shutdown.notify_one();
    http_shutdown.notify_one();
    let _ = tokio::join!(socks5_task, http_task);

    if state.sessions.drain(config.shutdown_grace()).await {
        tracing::info!("all sessions drained, bye");
    } else {
        tracing::warn!(
            "grace period expired with {} session(s) still active",
            state.sessions.active_count().await
        );
    }
    Ok(())
}
