//! Database Kubernetes Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client,
//! registers the engines and runs the Database reconciliation loop.

use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use database_operator::{
    adapters::ConsulKvStore,
    config::OperatorConfig,
    controllers::{self, Context},
    engines::EngineRegistry,
    metrics,
    platform::{KubeBackend, PlatformClient},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::from_env();

    // Initialize tracing
    init_tracing(&config.log_format);

    info!("Starting Database Operator");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let platform = PlatformClient::new(Arc::new(KubeBackend::new(client.clone())));
    let registry = EngineRegistry::with_builtin_engines();
    info!(engines = ?registry.technologies(), "Registered engines");

    let metrics_port = config.metrics_port;
    let context = Arc::new(Context::new(
        platform,
        registry,
        Arc::new(ConsulKvStore::new()),
        config,
    ));

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);
    metrics::OPERATOR_HEALTH.set(1.0);

    let database_controller = controllers::run_database_controller(client, context);

    tokio::select! {
        _ = database_controller => {
            warn!("Database controller stopped");
        }
        result = metrics_handle => {
            error!(?result, "Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    metrics::OPERATOR_HEALTH.set(0.0);
    info!("Database Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber, JSON unless LOG_FORMAT=text
fn init_tracing(format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if format.eq_ignore_ascii_case("text") {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
