use anyhow::Context;

use fintrack_infra::config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fintrack_observability::init();

    if let Err(e) = run().await {
        tracing::error!(error = ?e, "api failed");
        return Err(e);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = RuntimeConfig::from_env().context("loading configuration")?;
    let bind_addr = config.bind_addr;

    let services = std::sync::Arc::new(
        fintrack_api::app::services::build_services(config)
            .await
            .context("building services")?,
    );
    let app = fintrack_api::app::build_router(services.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    services.shutdown().await;
    tracing::info!("api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
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
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown signal received");
}
