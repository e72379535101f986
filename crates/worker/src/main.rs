use std::process::ExitCode;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use fintrack_infra::config::RuntimeConfig;

#[tokio::main]
async fn main() -> ExitCode {
    fintrack_observability::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "worker failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = RuntimeConfig::from_env().context("loading configuration")?;
    let backends = fintrack_worker::connect(&config).await?;
    let runtime = fintrack_worker::start(&config, backends).await?;
    tracing::info!(
        message_queues = ?config.message_queues,
        signal_channels = ?config.signal_channels,
        "worker running"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));
    shutdown.cancelled().await;

    let report = runtime.shutdown(&config).await;
    if report.is_clean() {
        tracing::info!(?report, "worker stopped");
    } else {
        tracing::warn!(?report, "worker stopped with jobs still running; their leases will expire");
    }
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
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
    tracing::info!("shutdown signal received; draining");
    shutdown.cancel();
}
