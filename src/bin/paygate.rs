use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paygate::{config::GatewayConfig, Components};

#[tokio::main]
async fn main() {
    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::load(&path),
        None => GatewayConfig::load("paygate.toml"),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("paygate={},tower_http=info", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let listen_addr = config.listen_addr.clone();
    let components = match Components::build(config) {
        Ok(components) => components,
        Err(e) => {
            tracing::error!(error = %e, "failed to start payment gateway");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %listen_addr, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(%listen_addr, "payment gateway listening");

    let app = components.create_protected_router();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server error");
    }

    components.shutdown().await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
