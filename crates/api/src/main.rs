use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tankalarm_api::background::{self, report::CoreReportSource};
use tankalarm_api::config::ServerConfig;
use tankalarm_api::router::build_app_router;
use tankalarm_api::state::AppState;
use tankalarm_core::server::ServerCore;
use tankalarm_db::FileBlobStore;
use tankalarm_events::{DailyReportScheduler, EventBus, NotificationDispatcher, TracingOutbox};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tankalarm_api=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Persistence and core ---
    let blobs = FileBlobStore::open(&config.data_dir)
        .with_context(|| format!("Failed to open data dir {}", config.data_dir.display()))?;
    let core = ServerCore::bootstrap(Box::new(blobs), config.bootstrap_pin.as_deref());
    if core.is_degraded() {
        tracing::warn!("Starting in degraded mode, state is held in memory only");
    }
    let (contacts, contacts_rx) = watch::channel(core.site_config().contacts.clone());
    let core = Arc::new(Mutex::new(core));

    // --- Event bus and subscribers ---
    let event_bus = Arc::new(EventBus::default());
    let services_cancel = CancellationToken::new();

    let dispatcher = NotificationDispatcher::new(Arc::new(TracingOutbox), contacts_rx);
    let dispatcher_handle = tokio::spawn(
        dispatcher.run(event_bus.subscribe(), services_cancel.clone()),
    );

    let scheduler = DailyReportScheduler::new(
        Arc::new(CoreReportSource::new(Arc::clone(&core))),
        Arc::clone(&event_bus),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(services_cancel.clone()));

    let liveness_handle = tokio::spawn(background::liveness::run(
        Arc::clone(&core),
        Arc::clone(&event_bus),
        Duration::from_secs(config.liveness_check_interval_secs),
        services_cancel.clone(),
    ));
    let overdue_handle = tokio::spawn(background::overdue::run(
        Arc::clone(&core),
        Arc::clone(&event_bus),
        Duration::from_secs(config.overdue_sweep_interval_secs),
        services_cancel.clone(),
    ));
    tracing::info!("Background services started");

    // --- App state ---
    let config = Arc::new(config);
    let state = AppState {
        core,
        config: Arc::clone(&config),
        event_bus,
        contacts: Arc::new(contacts),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(%addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    services_cancel.cancel();
    for handle in [
        dispatcher_handle,
        scheduler_handle,
        liveness_handle,
        overdue_handle,
    ] {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
