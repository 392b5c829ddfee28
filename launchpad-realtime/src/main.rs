mod config;
mod fanout;
mod handlers;
mod heartbeat;
mod provider;
mod queue;
mod registry;
mod routes;
mod server;
mod service;
mod watcher;

use anyhow::{Context, Result};
use dotenv::dotenv;
use launchpad_common::{MetricsSink, NullMetricsSink, RedisMetricsSink, RedisPool};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};

use crate::config::RealtimeConfig;
use crate::fanout::{FanoutTransport, LocalFanout, RedisFanout};
use crate::provider::{ChainProvider, WsChainProvider};
use crate::service::RealtimeService;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration from environment
    let chain_ws_url = std::env::var("CHAIN_WS_URL").context("CHAIN_WS_URL must be set")?;
    let launchpad_contract =
        std::env::var("LAUNCHPAD_CONTRACT").context("LAUNCHPAD_CONTRACT must be set")?;

    let mut providers: Vec<(String, Arc<dyn ChainProvider>)> = vec![(
        chain_ws_url.clone(),
        Arc::new(WsChainProvider::new(
            "primary",
            chain_ws_url,
            launchpad_contract.clone(),
        )),
    )];
    if let Ok(backup_url) = std::env::var("CHAIN_WS_BACKUP_URL") {
        providers.push((
            backup_url.clone(),
            Arc::new(WsChainProvider::new(
                "backup",
                backup_url,
                launchpad_contract.clone(),
            )),
        ));
    }

    // Redis backs the cross-instance fanout and the metrics sink. Without
    // it the service still runs, delivering only to its own connections.
    let (transport, metrics): (Arc<dyn FanoutTransport>, Arc<dyn MetricsSink>) =
        match std::env::var("REDIS_URL") {
            Ok(redis_url) => {
                let pool = Arc::new(RedisPool::new(&redis_url).await?);
                (
                    Arc::new(RedisFanout::new(Arc::clone(&pool))),
                    Arc::new(RedisMetricsSink::new(pool)),
                )
            }
            Err(_) => {
                tracing::warn!("REDIS_URL not set; using in-process fanout only");
                (Arc::new(LocalFanout::new()), Arc::new(NullMetricsSink))
            }
        };

    let contracts: Vec<String> = std::env::var("WATCHED_CONTRACTS")
        .unwrap_or_else(|_| launchpad_contract.clone())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    let allowed_origins: Vec<String> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    let watcher_enabled = std::env::var("WATCHER_ENABLED")
        .map(|value| value != "false" && value != "0")
        .unwrap_or(true);

    let ws_port = std::env::var("REALTIME_WS_PORT")
        .unwrap_or_else(|_| "8081".to_string())
        .parse::<u16>()
        .context("REALTIME_WS_PORT must be a port number")?;
    let api_port = std::env::var("API_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .context("API_PORT must be a port number")?;

    let config = RealtimeConfig::new()
        .with_contracts(contracts)
        .with_allowed_origins(allowed_origins)
        .with_jwt_secret(std::env::var("JWT_SECRET").ok())
        .with_watcher_enabled(watcher_enabled)
        .with_ws_port(ws_port);

    // Create and start the realtime service
    let service = Arc::new(RealtimeService::new(config, providers, transport, metrics)?);
    service.start().await?;

    // Status API
    let app = routes::create_router(Arc::clone(&service));
    let addr = SocketAddr::from(([0, 0, 0, 0], api_port));
    let listener = TcpListener::bind(addr).await?;
    println!("Status API listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
            eprintln!("Server error: {}", e);
        }
    });

    // Handle shutdown signals
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            println!("Received Ctrl+C, initiating shutdown...");
        }
        _ = sigterm.recv() => {
            println!("Received termination signal, initiating shutdown...");
        }
    }

    // Graceful shutdown
    service.stop().await;
    println!("Service stopped. Goodbye!");

    Ok(())
}
