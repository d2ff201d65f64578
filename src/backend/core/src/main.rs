//! Caravel scheduler daemon.
//!
//! Startup order matters: the liveness listener comes up first so peers
//! can see this replica, then the process blocks in leader election.
//! Only the elected leader recovers the task catalog, subscribes to the
//! master, and serves the admin API.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

use caravel_core::{
    api::{self, AppState},
    config::Config,
    driver::SchedulerDriver,
    event_loop::{spawn_reconciler, EventLoop},
    ha::LeaderGate,
    storage,
    task::{RetryController, TaskRegistry, TaskStore},
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "caravel-scheduler", about = "Resource-offer cluster scheduler")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, env = "CARAVEL_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };
    let config = Arc::new(config);

    let metrics_handle = telemetry::init(&config.observability)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        framework = %config.framework.name,
        "Starting Caravel scheduler"
    );

    let store_backend = storage::from_config(&config.persistence)?;
    tracing::info!(backend = store_backend.name(), "Storage client ready");

    // Liveness listener first: peers must be able to watch this replica
    // whether or not it wins the election.
    let gate = Arc::new(LeaderGate::new(
        store_backend.clone(),
        config.leader.clone(),
    ));
    {
        let gate = gate.clone();
        tokio::spawn(async move {
            if let Err(e) = gate.serve().await {
                tracing::error!(error = %e, "Leader liveness listener exited");
            }
        });
    }

    tracing::info!("Entering leader election");
    gate.elect().await?;

    // Leader from here on.
    let task_store = TaskStore::new(store_backend.clone(), &config.persistence);
    let registry = Arc::new(TaskRegistry::new(task_store));
    let recovered = registry.recover().await?;
    tracing::info!(recovered, "Catalog recovery complete");

    let driver = Arc::new(SchedulerDriver::new(
        &config.master,
        config.framework_info(),
    )?);
    let retry = Arc::new(RetryController::new(registry.clone(), driver.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Admin API.
    if config.api.cert.is_some() || config.api.key.is_some() {
        tracing::warn!(
            "api.cert/api.key set; TLS termination is delegated to the fronting proxy"
        );
    }
    let app_state = AppState {
        registry: registry.clone(),
        driver: driver.clone(),
        retry: retry.clone(),
        config: config.clone(),
        metrics: metrics_handle,
    };
    let app = api::build_router(app_state);
    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    tracing::info!(address = %api_addr, "Admin API listening");
    {
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = axum::serve(api_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Admin API exited");
            }
        });
    }

    // Periodic reconciler.
    let reconciler = spawn_reconciler(
        registry.clone(),
        driver.clone(),
        config.master.reconcile_interval,
        shutdown_rx.clone(),
    );

    // Event loop until a termination signal arrives.
    let event_loop = EventLoop::new(
        driver,
        registry,
        retry,
        &config.master,
        shutdown_rx.clone(),
    );

    tokio::select! {
        result = event_loop.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Event loop exited with error");
            }
        }
        _ = shutdown_signal() => {}
    }

    // Clean exit: stop background work and release leadership so a
    // standby takes over immediately.
    let _ = shutdown_tx.send(true);
    reconciler.abort();
    if let Err(e) = gate.resign().await {
        tracing::warn!(error = %e, "Failed to release leader key");
    }
    tracing::info!("Scheduler shutdown complete");

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
