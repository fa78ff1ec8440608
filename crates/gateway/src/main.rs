//! Gateway service entry point.
//!
//! WebSocket gateway for real-time vehicle tracking and proximity
//! alerting.

use anyhow::Result;
use gateway::{create_router, AppState};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracker::{
    Engine, EngineConfig, InMemoryNotificationStore, NotificationStore, RedisNotificationStore,
    StaticFleet,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    // Read configuration from environment
    let http_port: u16 = env::var("HTTP_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .expect("HTTP_PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let proximity_threshold_m: f64 = env::var("PROXIMITY_THRESHOLD_M")
        .unwrap_or_else(|_| "500".to_string())
        .parse()
        .expect("PROXIMITY_THRESHOLD_M must be a number");
    let min_report_interval_ms: i64 = env::var("MIN_REPORT_INTERVAL_MS")
        .unwrap_or_else(|_| "1000".to_string())
        .parse()
        .expect("MIN_REPORT_INTERVAL_MS must be a number");
    let stale_timeout_ms: i64 = env::var("STALE_TIMEOUT_MS")
        .unwrap_or_else(|_| "120000".to_string())
        .parse()
        .expect("STALE_TIMEOUT_MS must be a number");
    let redis_url = env::var("REDIS_URL").ok();
    let fleet_file = env::var("FLEET_FILE").ok();

    info!("Configuration:");
    info!("  HTTP_PORT: {}", http_port);
    info!("  METRICS_PORT: {}", metrics_port);
    info!("  PROXIMITY_THRESHOLD_M: {}", proximity_threshold_m);
    info!("  MIN_REPORT_INTERVAL_MS: {}", min_report_interval_ms);
    info!("  STALE_TIMEOUT_MS: {}", stale_timeout_ms);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    // Route assignments and waypoints from the fleet collaborator
    let fleet = match fleet_file {
        Some(path) => {
            info!("Loading fleet seed from {}", path);
            let raw = std::fs::read_to_string(&path)?;
            Arc::new(StaticFleet::from_json(&raw)?)
        }
        None => {
            info!("No FLEET_FILE set; starting with an empty fleet directory");
            Arc::new(StaticFleet::new())
        }
    };

    // Durable notification history
    let store: Arc<dyn NotificationStore> = match redis_url {
        Some(url) => {
            info!("Persisting notifications to Redis at {}", url);
            Arc::new(RedisNotificationStore::new(&url)?)
        }
        None => {
            info!("No REDIS_URL set; notification history is in-memory");
            Arc::new(InMemoryNotificationStore::new())
        }
    };

    // Create and start the tracking engine
    let engine = Engine::new(
        EngineConfig {
            proximity_threshold_m,
            min_report_interval_ms,
        },
        fleet,
        store,
    );
    engine.start();

    // Periodic sweep of idle connections
    let sweeper = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut sweep_interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            sweep_interval.tick().await;
            let removed = sweeper.sweep_stale(stale_timeout_ms);
            if removed > 0 {
                info!("Swept {} stale connections", removed);
            }
        }
    });

    // Create application state and HTTP router
    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
    });
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down engine...");
    engine.stop().await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
