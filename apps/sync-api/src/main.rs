//! # fieldsync sync-api
//!
//! HTTP server for device sync, CRM webhooks and operator status.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        sync-api Server                                  │
//! │                                                                         │
//! │  Devices ───► axum (8080) ───► Reconciler ───► SQLite                  │
//! │  CRM ───────►      │                              │                     │
//! │                    │                              ▼                     │
//! │                    └──── notify ───►  CrmDispatcher ───► CRM webhook   │
//! │                                                                         │
//! │  Liveness sweep (interval) ───► DeviceRegistry                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fieldsync_db::{Database, DbConfig};
use fieldsync_engine::{CrmDispatcher, DeviceRegistry, ReqwestSender, SyncConfig};
use fieldsync_sync_api::{app_router, AppState, JwtManager, ServerConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!("Starting fieldsync sync-api...");

    let server = ServerConfig::load()?;
    let config = Arc::new(SyncConfig::load(server.engine_config.clone())?);
    info!(
        bind = %server.bind_addr,
        database = %server.database_path.display(),
        environment = %config.environment.name,
        "Configuration loaded"
    );

    let db = Database::new(DbConfig::new(&server.database_path)).await?;
    info!("Database ready");

    // Outbound delivery runs only when a webhook URL is configured
    let dispatcher = match ReqwestSender::from_settings(&config.crm)? {
        Some(sender) => {
            let (dispatcher, handle) =
                CrmDispatcher::new(db.clone(), config.crm.clone(), Arc::new(sender));
            tokio::spawn(dispatcher.run());
            Some(handle)
        }
        None => {
            info!("CRM outbound delivery disabled");
            None
        }
    };

    let (sweep_stop_tx, sweep_stop_rx) = mpsc::channel(1);
    let registry = DeviceRegistry::new(db.clone(), config.stale_after());
    let sweep = tokio::spawn(run_liveness_sweep(
        registry,
        Duration::from_secs(config.sync.liveness_sweep_secs),
        sweep_stop_rx,
    ));

    let jwt = JwtManager::new(&server.jwt_secret, server.jwt_access_lifetime_secs);
    let state = AppState::new(db.clone(), config, jwt, dispatcher.clone());

    let listener = TcpListener::bind(&server.bind_addr).await?;
    info!(addr = %server.bind_addr, "Starting HTTP server");

    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = dispatcher {
        if let Err(e) = handle.shutdown().await {
            warn!(?e, "CRM dispatcher already stopped");
        }
    }
    let _ = sweep_stop_tx.send(()).await;
    if let Err(e) = sweep.await {
        warn!(?e, "Liveness sweep task ended abnormally");
    }
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Marks devices that have not been seen within the stale window.
async fn run_liveness_sweep(
    registry: DeviceRegistry,
    period: Duration,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = registry.sweep_stale(Utc::now()).await {
                    warn!(?e, "Liveness sweep failed");
                }
            }
            _ = stop_rx.recv() => break,
        }
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
