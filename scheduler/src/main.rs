// Deadline alert engine entry point

use anyhow::{Context, Result};
use common::bootstrap;
use common::config::Settings;
use common::scheduler::Scheduler;
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        timezone = %settings.alerts.timezone,
        sweep_cron = %settings.alerts.sweep_cron,
        dry_run = settings.smtp.dry_run,
        sweep_lease = settings.redis.is_some(),
        "Configuration loaded"
    );

    let engine = Arc::new(bootstrap::init_alert_engine(&settings).await?);

    let engine_for_shutdown = Arc::clone(&engine);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping alert engine");
        engine_for_shutdown.stop().await;
    });

    let result = engine.start().await;
    telemetry::shutdown_tracer();

    if let Err(e) = result {
        error!(error = %e, "Alert engine stopped with an error");
        return Err(e.into());
    }

    info!("Alert engine exited");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to listen for SIGTERM");
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
}
