//! hypnosd - sleep/wake coordination daemon for a two-host LAN setup.
//!
//! The same binary runs on both machines. The "waker" issues Wake-on-LAN
//! and suspend commands and tracks sleeper liveness through heartbeats;
//! the "sleeper" executes systemctl on request and reports in on a fixed
//! period. Which role an instance plays is resolved from configuration at
//! startup.

mod checksum;
mod config;
mod error;
mod exec;
mod health;
mod heartbeat;
mod http;
mod models;
mod monitor;
mod state_machine;
mod wol;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Role;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::state_machine::SleeperStateMachine;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hypnosd=info")),
        )
        .init();

    let cfg = config::load().await.context("failed to load configuration")?;
    for problem in config::validate(&cfg) {
        warn!("config: {problem}");
    }

    let role = config::resolve_role(&cfg)?;
    let checksum = checksum::compute_config_checksum(&cfg)?;
    info!("starting as {role}, config checksum {checksum}");

    let cfg = Arc::new(cfg);
    let machine = Arc::new(SleeperStateMachine::from_config(&cfg.common));
    let checksum = Arc::new(checksum);

    match role {
        Role::Waker => monitor::spawn_timeout_checker(Arc::clone(&machine)),
        Role::Sleeper => heartbeat::spawn_heartbeat_sender(Arc::clone(&cfg), Arc::clone(&checksum)),
    }

    let http_client = reqwest::Client::builder()
        .timeout(cfg.common.request_timeout())
        .build()
        .context("failed to build HTTP client")?;

    let app = http::build_router(AppState {
        cfg: Arc::clone(&cfg),
        machine,
        checksum,
        health: HealthTracker::new(),
        role,
        http: http_client,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.common.port));
    info!("listening on http://{addr}");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("HTTP server exited")?;
    Ok(())
}
