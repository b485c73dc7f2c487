// src/main.rs

//! # dev-html-proxy entry point
//!
//! Loads configuration, sets up logging, binds the proxy and trigger listeners and
//! runs both servers until Ctrl-C.

use anyhow::Result;
use clap::CommandFactory;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dev_html_proxy::config::{AppConfig, CliArgs};
use dev_html_proxy::hub::BroadcastHub;
use dev_html_proxy::proxy::ProxyState;
use dev_html_proxy::web;

#[tokio::main]
async fn main() -> Result<()> {
    let app_config = match AppConfig::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            eprintln!("{}", CliArgs::command().render_help());
            std::process::exit(1);
        }
    };

    // Initialize tracing subscriber for logging with environment filter and max level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&app_config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr) // Log to stderr
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    tracing::debug!("dev-html-proxy starting with configuration: {:?}", app_config);

    let proxy_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, app_config.proxy_port));
    let trigger_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, app_config.trigger_port));

    // Either bind failure is fatal.
    let proxy_listener = web::bind(proxy_addr).await?;
    let trigger_listener = web::bind(trigger_addr).await?;

    let hub = Arc::new(BroadcastHub::new());
    let proxy_state = Arc::new(ProxyState::new(&app_config, Arc::clone(&hub)));

    // Shutdown signal channel for graceful shutdown of both servers.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();

    let proxy_shutdown_rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = web::serve_proxy(proxy_listener, proxy_state, proxy_shutdown_rx).await {
            tracing::error!("Proxy server exited with error: {}", e);
        }
    }));

    let trigger_shutdown_rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = web::serve_trigger(trigger_listener, hub, trigger_shutdown_rx).await {
            tracing::error!("Trigger server exited with error: {}", e);
        }
    }));

    println!("Dev HTTP Proxy");
    println!(
        "Listening on http://localhost:{} for proxy",
        app_config.proxy_port
    );
    println!("Forwarding requests to {}", app_config.target);
    println!(
        "Listening on http://localhost:{} for refresh requests",
        app_config.trigger_port
    );
    println!("Use the following curl command to trigger a refresh on all connected pages:");
    println!("curl http://localhost:{}/", app_config.trigger_port);

    // Wait for Ctrl-C signal to initiate shutdown.
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Ctrl-C received, initiating shutdown...");
        }
        Err(err) => {
            tracing::error!("Failed to listen for Ctrl-C signal: {}", err);
        }
    }

    if shutdown_tx.send(true).is_err() {
        tracing::error!("Failed to send shutdown signal");
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("A server task panicked or exited with error: {}", e);
        }
    }

    tracing::info!("dev-html-proxy shut down gracefully.");
    Ok(())
}
