//! IP Manager - service registry and endpoint allocator

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ip_manager::{create_router, Args, Config, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("ip_manager={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };
    config.apply_args(&args);
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  IP Manager - service registry");
    info!("======================================");
    info!("Listen: {}", config.server.listen);
    info!("Config file: {}", args.config.display());
    info!("Service IP base: {}", config.allocation.service_ip_base);
    info!(
        "Default port range: {}-{}",
        config.allocation.default_port_range.start, config.allocation.default_port_range.end
    );
    info!("Strategy: {:?}", config.allocation.allocation_strategy);
    info!("Fallback mode: {}", config.allocation.fallback_mode);
    match &config.server.data_dir {
        Some(dir) => info!("Data dir: {}", dir.display()),
        None => info!("Data dir: none (in-memory registry)"),
    }
    info!("======================================");

    let registry = Arc::new(Registry::open(&config).await?);
    let tasks = registry.spawn_background_tasks();

    let app = create_router(Arc::clone(&registry));
    let listener = tokio::net::TcpListener::bind(config.server.listen).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background tasks");
    registry.shutdown();
    registry.drain(tasks).await;
    info!("IP Manager stopped");

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
