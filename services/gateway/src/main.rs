use loquilex_gateway::{build_router, GatewayConfig, GatewayState};
use loquilex_session_core::{SessionManager, SystemClock};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Arc::new(GatewayConfig::from_env());
    let manager = Arc::new(SessionManager::new(
        config.manager.clone(),
        Arc::new(SystemClock::new()),
    ));
    let state = GatewayState::new(manager.clone(), config.clone());
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .expect("server error");
    info!("gateway shut down gracefully");
}

async fn shutdown_signal(manager: Arc<SessionManager>) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }

    manager.shutdown().await;
}
