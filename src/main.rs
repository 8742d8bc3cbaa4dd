use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use routstr_proxy::{build_router, build_state, catalogue, config::Config, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    logging::init(&config.log_level, &config.log_format);

    let host = config.host.clone();
    let port = config.port;
    let state = build_state(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let oracle_task = state.oracle.clone().spawn_polling_task(shutdown_rx.clone());
    let catalogue_task = catalogue::spawn_refresh_task(state.catalogue.clone(), state.oracle.clone(), shutdown_rx);

    let app = build_router(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown_tx));
    server.await?;

    oracle_task.await.ok();
    catalogue_task.await.ok();
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
